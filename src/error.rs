//! Crate-wide error types and the proxy path's minimal HTTP error responses.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no free ports remaining")]
    PortsExhausted,

    #[error("failed to spawn instance: {0}")]
    Spawn(String),

    #[error("health check failed")]
    HealthCheck,

    #[error("upstream proxy error: {0}")]
    Upstream(String),

    #[error("no active instance for app {0:?}")]
    NoActiveInstance(String),

    #[error("unknown app {0:?}")]
    UnknownApp(String),
}

/// Empty-body response for "no active instance at admission" (spec §6).
pub fn no_active_instance_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .expect("valid response with static status")
}

/// Generic upstream failure: connect refused, read error mid-response, etc.
/// `Done()` must still be invoked by the caller regardless of this response.
pub fn upstream_error_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .expect("valid response with provided status")
}

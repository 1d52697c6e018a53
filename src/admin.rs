//! Minimal administrative RPC surface: the out-of-core-scope trigger for
//! `start`/`stop`/`status`, consumed by [`crate::bin::relaunchctl`].

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            auth_token: auth_token.map(Arc::new),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let auth_token = self.auth_token.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, supervisor, auth_token).await {
                                    debug!(%addr, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    auth_token: Option<Arc<String>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = Arc::clone(&supervisor);
        let auth_token = auth_token.clone();
        async move { handle_admin_request(req, supervisor, auth_token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("admin connection error: {e}"))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn authorized(req: &Request<hyper::body::Incoming>, auth_token: &Option<Arc<String>>) -> bool {
    match auth_token {
        Some(token) => check_auth(req, token),
        None => true,
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Arc<Supervisor>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "admin API request");

    if !authorized(&req, &auth_token) && !(method == Method::GET && (path == "/health" || path == "/version")) {
        warn!(%path, "unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let body = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/status") => {
            let status = supervisor.list_status();
            json_response(StatusCode::OK, serde_json::to_string(&status).unwrap_or_default())
        }

        (&Method::POST, path) if path.starts_with("/apps/") && path.ends_with("/start") => {
            let name = &path["/apps/".len()..path.len() - "/start".len()];
            match supervisor.start_instance(name) {
                Ok(id) => json_response(StatusCode::OK, serde_json::json!({ "instance_id": id }).to_string()),
                Err(crate::error::Error::UnknownApp(_)) => response(StatusCode::NOT_FOUND, "unknown app"),
                Err(crate::error::Error::PortsExhausted) => response(StatusCode::SERVICE_UNAVAILABLE, "ports exhausted"),
                Err(e) => {
                    error!(app = name, error = %e, "failed to start instance");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "failed to start instance")
                }
            }
        }

        (&Method::POST, path) if path.starts_with("/apps/") && path.ends_with("/stop") => {
            let name = &path["/apps/".len()..path.len() - "/stop".len()];
            match supervisor.stop_app(name) {
                Ok(()) => response(StatusCode::OK, "ok"),
                Err(_) => response(StatusCode::NOT_FOUND, "unknown app"),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(resp)
}

//! Health probing, kept as a concept distinct from [`crate::instance::Instance`]
//! so tests can substitute a deterministic prober.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Probes one instance's health endpoint. Implementations must not block
/// longer than `timeout`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16, path: &str, timeout: Duration) -> bool;
}

/// Issues a real HTTP GET and treats any 2xx response as healthy.
pub struct HttpHealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, host: &str, port: u16, path: &str, timeout: Duration) -> bool {
        let uri = match format!("http://{host}:{port}{path}").parse() {
            Ok(uri) => uri,
            Err(_) => return false,
        };

        let fut = self.client.get(uri);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Always returns a fixed verdict; used by instance/app unit tests.
    pub struct FixedProbe(AtomicBool);

    impl FixedProbe {
        pub fn always(healthy: bool) -> Self {
            Self(AtomicBool::new(healthy))
        }

        pub fn set(&self, healthy: bool) {
            self.0.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _host: &str, _port: u16, _path: &str, _timeout: Duration) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

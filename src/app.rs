//! Owns all instances of one application: the active-instance slot, the
//! external reverse-proxy listener, and the updater loop that promotes
//! newly-ready instances and retires the ones they replace.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::conn_pool::ConnectionPool;
use crate::error::{no_active_instance_response, upstream_error_response};
use crate::health::HealthProbe;
use crate::instance::{Instance, InstanceSpec, InstanceStatus};
use crate::port_pool::PortPool;

const UPDATER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: u32,
    pub port: u16,
    pub status: InstanceStatus,
    pub in_flight: u32,
    pub active: bool,
    /// Seconds since the last status transition, truncated like the
    /// reference reporter's `time.Since(...)` display.
    pub last_change_secs_ago: u64,
    pub uptime_secs: u64,
}

pub struct App {
    config: AppConfig,
    ports: Arc<PortPool>,
    pool: Arc<ConnectionPool>,
    probe: Arc<dyn HealthProbe>,
    instances: RwLock<Vec<Arc<Instance>>>,
    active: Mutex<Option<Arc<Instance>>>,
    next_id: AtomicU32,
}

impl App {
    pub fn new(
        config: AppConfig,
        ports: Arc<PortPool>,
        pool: Arc<ConnectionPool>,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ports,
            pool,
            probe,
            instances: RwLock::new(Vec::new()),
            active: Mutex::new(None),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn auto_start(&self) -> bool {
        self.config.auto_start
    }

    /// Spawns a new instance. Any instance currently `Starting` is aborted
    /// first — only one pending startup is meaningful at a time.
    pub fn start_new_instance(&self) -> Result<u32, crate::error::Error> {
        {
            let instances = self.instances.read();
            for instance in instances.iter() {
                if instance.status() == InstanceStatus::Starting {
                    instance.stop();
                }
            }
        }

        let port = self
            .ports
            .reserve()
            .map_err(|_| crate::error::Error::PortsExhausted)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let spec = InstanceSpec {
            command: self.config.command.clone(),
            internal_host: self.config.internal_host.clone(),
            healthcheck_path: self.config.healthcheck.clone(),
            stop_signal: self.config.stop_signal,
            max_retries: self.config.max_retries,
            start_timeout: self.config.start_timeout,
            stop_timeout: self.config.stop_timeout,
        };

        let instance = match Instance::spawn(id, port, spec, Arc::clone(&self.ports)) {
            Ok(instance) => instance,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        self.instances.write().push(Arc::clone(&instance));
        info!(app = %self.config.name, id, port, "new instance requested");
        Ok(id)
    }

    pub fn list_instances(&self) -> Vec<InstanceSnapshot> {
        let active_id = self.active.lock().as_ref().map(|i| i.id);
        self.instances
            .read()
            .iter()
            .map(|i| InstanceSnapshot {
                id: i.id,
                port: i.port,
                status: i.status(),
                in_flight: i.in_flight(),
                active: Some(i.id) == active_id,
                last_change_secs_ago: i.last_change().elapsed().as_secs(),
                uptime_secs: i.started_at().elapsed().as_secs(),
            })
            .collect()
    }

    /// Stops every instance, in no particular order, releasing their ports.
    pub fn stop_all(&self) {
        for instance in self.instances.read().iter() {
            instance.stop();
        }
        *self.active.lock() = None;
    }

    /// One background task per App, ticking the update/promotion loop.
    pub async fn run_updater(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(UPDATER_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        let snapshot: Vec<Arc<Instance>> = self.instances.read().clone();

        for instance in &snapshot {
            let status = instance.update_status(self.probe.as_ref()).await;

            match status {
                InstanceStatus::Serving => {
                    let is_active = self.active.lock().as_ref().map(|a| a.id) == Some(instance.id);
                    if !is_active {
                        let prior = {
                            let mut active = self.active.lock();
                            let prior = active.take();
                            *active = Some(Arc::clone(instance));
                            prior
                        };
                        info!(app = %self.config.name, id = instance.id, "instance promoted to active");
                        if let Some(prior) = prior {
                            prior.stop();
                        }
                    }
                }
                InstanceStatus::Exited => {
                    let mut active = self.active.lock();
                    if active.as_ref().map(|a| a.id) == Some(instance.id) {
                        warn!(app = %self.config.name, id = instance.id, "active instance exited unexpectedly");
                        *active = None;
                    }
                }
                _ => {}
            }
        }

        self.instances.write().retain(|i| !i.status().is_terminal());
    }

    /// Binds the app's external listener and serves the reverse-proxy path.
    pub async fn run_listener(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.external_host, self.config.external_port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(app = %self.config.name, %addr, "app listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let app = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = app.serve_connection(stream, peer).await {
                                    debug!(app = %app.config.name, %peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(app = %self.config.name, error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(app = %self.config.name, "listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let app = Arc::clone(&self);
            async move { app.handle_request(req, peer).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

        Ok(())
    }

    /// Pins the request to whichever instance was active at admission time.
    async fn handle_request(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let instance = {
            let active = self.active.lock();
            let instance = match active.as_ref() {
                Some(i) => Arc::clone(i),
                None => return Ok(no_active_instance_response()),
            };
            if instance.serve().is_err() {
                return Ok(no_active_instance_response());
            }
            instance
        };

        // Security: overwrite rather than append, since this proxy is the
        // first trusted hop.
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
            headers.insert("x-real-ip", value.clone());
            headers.insert("x-forwarded-for", value);
        }

        let result = self
            .pool
            .send_request(req, instance.internal_host(), instance.port)
            .await;

        instance.done();

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(app = %self.config.name, port = instance.port, error = %e, "failed to forward request");
                Ok(upstream_error_response(StatusCode::BAD_GATEWAY))
            }
        }
    }
}

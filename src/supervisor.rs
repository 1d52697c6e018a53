//! Owns the set of Apps and the shared Port Pool; exposes the operations
//! the administrative RPC surface triggers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::{App, InstanceSnapshot};
use crate::config::AppConfig;
use crate::conn_pool::{ConnectionPool, PoolConfig};
use crate::health::HealthProbe;
use crate::port_pool::PortPool;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub instances: Vec<InstanceSnapshot>,
}

pub struct Supervisor {
    apps: DashMap<String, Arc<App>>,
    ports: Arc<PortPool>,
}

impl Supervisor {
    pub fn new(
        apps: Vec<AppConfig>,
        port_range: (u16, u16),
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        let ports = Arc::new(PortPool::new(port_range.0, port_range.1));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));

        let map = DashMap::new();
        for config in apps {
            let name = config.name.clone();
            let app = App::new(config, Arc::clone(&ports), Arc::clone(&pool), Arc::clone(&probe));
            map.insert(name, app);
        }

        Arc::new(Self { apps: map, ports })
    }

    pub fn app(&self, name: &str) -> Option<Arc<App>> {
        self.apps.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn app_names(&self) -> Vec<String> {
        self.apps.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Delegates to `App::start_new_instance`.
    pub fn start_instance(&self, app_name: &str) -> Result<u32, crate::error::Error> {
        let app = self
            .app(app_name)
            .ok_or_else(|| crate::error::Error::UnknownApp(app_name.to_string()))?;
        app.start_new_instance()
    }

    /// Snapshot of every app and its instances.
    pub fn list_status(&self) -> Vec<AppStatus> {
        self.apps
            .iter()
            .map(|entry| AppStatus {
                name: entry.key().clone(),
                instances: entry.value().list_instances(),
            })
            .collect()
    }

    /// Stops every instance of one app, freeing their ports.
    pub fn stop_app(&self, app_name: &str) -> Result<(), crate::error::Error> {
        let app = self
            .app(app_name)
            .ok_or_else(|| crate::error::Error::UnknownApp(app_name.to_string()))?;
        app.stop_all();
        Ok(())
    }

    /// For each app configured with `auto_start`, issues one `start_instance`.
    pub fn bootstrap(&self) {
        for entry in self.apps.iter() {
            let app = entry.value();
            if app.auto_start() {
                if let Err(e) = app.start_new_instance() {
                    warn!(app = entry.key(), error = %e, "bootstrap failed to start instance");
                }
            }
        }
    }

    /// Spawns each app's updater loop and external listener.
    pub fn spawn_apps(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) {
        for entry in self.apps.iter() {
            let app = Arc::clone(entry.value());
            let updater_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                app.run_updater(updater_rx).await;
            });

            let app = Arc::clone(entry.value());
            let listener_rx = shutdown_rx.clone();
            let name = entry.key().clone();
            tokio::spawn(async move {
                if let Err(e) = app.run_listener(listener_rx).await {
                    tracing::error!(app = %name, error = %e, "app listener exited");
                }
            });
        }
    }

    /// Stops every instance of every app and waits (up to a hard timeout)
    /// for them to reach a terminal status.
    pub async fn shutdown(&self) {
        for entry in self.apps.iter() {
            entry.value().stop_all();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            let all_terminal = self.apps.iter().all(|entry| {
                entry
                    .value()
                    .list_instances()
                    .iter()
                    .all(|i| i.status.is_terminal())
            });
            if all_terminal || tokio::time::Instant::now() >= deadline {
                if !all_terminal {
                    warn!("shutdown timeout exceeded with instances still non-terminal");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("supervisor shutdown complete");
    }

    pub fn ports_exhausted(&self) -> bool {
        self.ports.is_empty()
    }
}

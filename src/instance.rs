//! One running child process serving one application, bound to one internal
//! port, and the state machine that drives it through a hitless restart.

use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::health::HealthProbe;
use crate::port_pool::PortPool;

/// Interval for polling in-flight drain status while stopping.
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Per-probe deadline during `Starting`, matching the App updater's tick
/// period so one slow health endpoint cannot stall a whole tick's worth of
/// other instances. `start_timeout`/`max_retries` bound how many ticks an
/// instance is allowed to spend in `Starting`, not any single probe call.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Serving,
    Stopping,
    Stopped,
    Failed,
    Exited,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Exited)
    }
}

/// The OS signal sent to ask a child to shut down gracefully.
#[derive(Debug, Clone, Copy)]
pub struct StopSignal(i32);

impl Default for StopSignal {
    fn default() -> Self {
        Self(libc::SIGTERM)
    }
}

impl FromStr for StopSignal {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let signal = match s.to_ascii_uppercase().as_str() {
            "SIGTERM" | "TERM" => libc::SIGTERM,
            "SIGINT" | "INT" => libc::SIGINT,
            "SIGHUP" | "HUP" => libc::SIGHUP,
            "SIGQUIT" | "QUIT" => libc::SIGQUIT,
            "SIGKILL" | "KILL" => libc::SIGKILL,
            other => {
                return Err(crate::error::Error::Config(format!(
                    "unknown stop_signal {other:?}"
                )))
            }
        };
        Ok(Self(signal))
    }
}

/// Everything a new instance needs to be spawned, independent of the
/// supervisor's own bookkeeping.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub command: String,
    pub internal_host: String,
    pub healthcheck_path: String,
    pub stop_signal: StopSignal,
    pub max_retries: u32,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

struct Inner {
    status: InstanceStatus,
    last_change: Instant,
    child: Option<Child>,
    probe_failures: u32,
}

/// One spawned worker process and the state machine governing it.
pub struct Instance {
    pub id: u32,
    pub port: u16,
    spec: InstanceSpec,
    inner: Mutex<Inner>,
    in_flight: AtomicU32,
    started_at: Instant,
    ports: Arc<PortPool>,
    port_released: AtomicBool,
    drain_notify: Notify,
}

impl Instance {
    /// Spawns the child process and returns bookkeeping for a new instance
    /// in `Starting`. `port` must already be reserved from `ports`.
    pub fn spawn(
        id: u32,
        port: u16,
        spec: InstanceSpec,
        ports: Arc<PortPool>,
    ) -> Result<Arc<Self>, crate::error::Error> {
        let args = shell_words::split(&spec.command)
            .map_err(|e| crate::error::Error::Spawn(format!("invalid command: {e}")))?;
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| crate::error::Error::Spawn("empty command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.env("PORT", port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| crate::error::Error::Spawn(e.to_string()))?;

        let pid = child.id().unwrap_or(0);
        info!(id, pid, port, "instance spawned");

        if let Some(stdout) = child.stdout.take() {
            spawn_log_forwarder(id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_forwarder(id, "stderr", stderr);
        }

        Ok(Arc::new(Self {
            id,
            port,
            spec,
            inner: Mutex::new(Inner {
                status: InstanceStatus::Starting,
                last_change: Instant::now(),
                child: Some(child),
                probe_failures: 0,
            }),
            in_flight: AtomicU32::new(0),
            started_at: Instant::now(),
            ports,
            port_released: AtomicBool::new(false),
            drain_notify: Notify::new(),
        }))
    }

    pub fn status(&self) -> InstanceStatus {
        self.inner.lock().status
    }

    pub fn last_change(&self) -> Instant {
        self.inner.lock().last_change
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn hostname(&self) -> String {
        format!("{}:{}", self.spec.internal_host, self.port)
    }

    pub fn internal_host(&self) -> &str {
        &self.spec.internal_host
    }

    /// Admits one request against this instance. Fails fast if not `Serving`.
    pub fn serve(&self) -> Result<(), crate::error::Error> {
        let inner = self.inner.lock();
        if inner.status != InstanceStatus::Serving {
            return Err(crate::error::Error::NoActiveInstance(self.hostname()));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Completes one request previously admitted by [`Instance::serve`].
    pub fn done(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "Done() called more times than Serve()");
        let status = self.inner.lock().status;
        if status == InstanceStatus::Stopping && self.in_flight.load(Ordering::SeqCst) == 0 {
            self.drain_notify.notify_one();
        }
    }

    /// Idempotent. Moves `Starting`/`Serving` into `Stopping` and arms the
    /// drain/stop-timeout/force-kill sequence as a background task.
    pub fn stop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            match inner.status {
                InstanceStatus::Starting | InstanceStatus::Serving => {
                    inner.status = InstanceStatus::Stopping;
                    inner.last_change = Instant::now();
                }
                _ => return,
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_stop_sequence().await });
    }

    async fn run_stop_sequence(self: Arc<Self>) {
        let deadline = Instant::now() + self.spec.stop_timeout;

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    id = self.id,
                    remaining_in_flight = self.in_flight.load(Ordering::SeqCst),
                    "stop-timeout exceeded while draining, proceeding"
                );
                break;
            }
            let poll = Duration::from_millis(DRAIN_POLL_INTERVAL_MS).min(remaining);
            tokio::select! {
                _ = self.drain_notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }

        let pid = {
            let inner = self.inner.lock();
            inner.child.as_ref().and_then(|c| c.id())
        };

        if let Some(pid) = pid {
            info!(id = self.id, pid, signal = self.spec.stop_signal.0, "sending stop signal");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, self.spec.stop_signal.0);
            }
            #[cfg(not(unix))]
            {
                let mut inner = self.inner.lock();
                if let Some(child) = inner.child.as_mut() {
                    let _ = child.start_kill();
                }
            }
        }

        let child = self.inner.lock().child.take();
        if let Some(mut child) = child {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(id = self.id, ?status, "instance exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(id = self.id, error = %e, "error waiting for instance to exit");
                }
                Err(_) => {
                    warn!(id = self.id, "stop-timeout exceeded, force-killing instance");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.status = InstanceStatus::Stopped;
        inner.last_change = Instant::now();
        drop(inner);
        self.release_port();
    }

    fn release_port(&self) {
        if self
            .port_released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.ports.release(self.port);
        }
    }

    /// Called once per updater tick. Drives health probing during `Starting`
    /// and detects an unsolicited child exit during `Serving`. Returns the
    /// (possibly just-updated) status.
    pub async fn update_status(self: &Arc<Self>, probe: &dyn HealthProbe) -> InstanceStatus {
        let status = self.inner.lock().status;

        match status {
            InstanceStatus::Starting => self.poll_starting(probe).await,
            InstanceStatus::Serving => self.poll_serving(),
            other => other,
        }
    }

    async fn poll_starting(self: &Arc<Self>, probe: &dyn HealthProbe) -> InstanceStatus {
        if let Some(exit) = self.try_reap() {
            warn!(id = self.id, ?exit, "instance exited before becoming ready");
            self.fail();
            return InstanceStatus::Failed;
        }

        if self.started_at.elapsed() > self.spec.start_timeout {
            error!(id = self.id, "instance start timeout exceeded");
            self.fail();
            return InstanceStatus::Failed;
        }

        let healthy = probe
            .probe(
                &self.spec.internal_host,
                self.port,
                &self.spec.healthcheck_path,
                PROBE_TIMEOUT,
            )
            .await;

        if healthy {
            let mut inner = self.inner.lock();
            if inner.status == InstanceStatus::Starting {
                inner.status = InstanceStatus::Serving;
                inner.last_change = Instant::now();
                inner.probe_failures = 0;
            }
            return inner.status;
        }

        let failures = {
            let mut inner = self.inner.lock();
            inner.probe_failures += 1;
            inner.probe_failures
        };

        if failures > self.spec.max_retries {
            error!(id = self.id, failures, "health probe retries exhausted");
            self.fail();
            return InstanceStatus::Failed;
        }

        InstanceStatus::Starting
    }

    fn poll_serving(&self) -> InstanceStatus {
        if let Some(exit) = self.try_reap() {
            info!(id = self.id, ?exit, "instance exited while serving");
            let mut inner = self.inner.lock();
            inner.status = InstanceStatus::Exited;
            inner.last_change = Instant::now();
            drop(inner);
            self.release_port();
            return InstanceStatus::Exited;
        }
        InstanceStatus::Serving
    }

    fn try_reap(&self) -> Option<std::process::ExitStatus> {
        let mut inner = self.inner.lock();
        match inner.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten(),
            None => None,
        }
    }

    fn fail(&self) {
        let mut inner = self.inner.lock();
        inner.status = InstanceStatus::Failed;
        inner.last_change = Instant::now();
        inner.child = None;
        drop(inner);
        self.release_port();
    }
}

fn spawn_log_forwarder(
    id: u32,
    stream: &'static str,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(id, stream, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::test_support::FixedProbe;

    fn spec(command: &str) -> InstanceSpec {
        InstanceSpec {
            command: command.to_string(),
            internal_host: "127.0.0.1".to_string(),
            healthcheck_path: "/health".to_string(),
            stop_signal: StopSignal::default(),
            max_retries: 1,
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn stop_signal_parses_known_names() {
        assert!("SIGTERM".parse::<StopSignal>().is_ok());
        assert!("sigterm".parse::<StopSignal>().is_ok());
        assert!("bogus".parse::<StopSignal>().is_err());
    }

    #[tokio::test]
    async fn serve_fails_fast_when_not_serving() {
        let ports = Arc::new(PortPool::new(41000, 41010));
        let port = ports.reserve().unwrap();
        let instance = Instance::spawn(1, port, spec("sleep 5"), ports).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert!(instance.serve().is_err());
        instance.stop();
    }

    #[tokio::test]
    async fn max_retries_zero_fails_on_first_probe_failure() {
        let ports = Arc::new(PortPool::new(41100, 41110));
        let port = ports.reserve().unwrap();
        let mut s = spec("sleep 5");
        s.max_retries = 0;
        let instance = Instance::spawn(1, port, s, ports).unwrap();
        let probe = FixedProbe::always(false);
        let status = instance.update_status(&probe).await;
        assert_eq!(status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn becomes_serving_once_probe_succeeds() {
        let ports = Arc::new(PortPool::new(41200, 41210));
        let port = ports.reserve().unwrap();
        let instance = Instance::spawn(1, port, spec("sleep 5"), ports).unwrap();
        let probe = FixedProbe::always(true);
        let status = instance.update_status(&probe).await;
        assert_eq!(status, InstanceStatus::Serving);
        instance.stop();
    }

    #[tokio::test]
    async fn in_flight_is_monotonic_and_stop_waits_for_drain() {
        let ports = Arc::new(PortPool::new(41300, 41310));
        let port = ports.reserve().unwrap();
        let instance = Instance::spawn(1, port, spec("sleep 5"), ports).unwrap();
        let probe = FixedProbe::always(true);
        instance.update_status(&probe).await;
        assert_eq!(instance.status(), InstanceStatus::Serving);

        instance.serve().unwrap();
        assert_eq!(instance.in_flight(), 1);
        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Stopping);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ne!(instance.status(), InstanceStatus::Stopped);
        instance.done();
        assert_eq!(instance.in_flight(), 0);
    }
}

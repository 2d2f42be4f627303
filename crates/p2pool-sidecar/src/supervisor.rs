//! Pool process supervisor - owns the child, its restart policy and the monitor.
//!
//! Locking:
//! - `control` serializes the public `start`/`stop`/`restart` calls. The monitor
//!   never takes it, so `stop` can hold it while waiting for the monitor to exit.
//! - `lifecycle` guards the child handle and last accepted config. Both the
//!   public operations and the monitor's restarts run under it.
//! - State, pid and counters are atomics so accessors never block.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{HealthPolicy, ProcessConfig, RestartPolicy, ShutdownPolicy};
use crate::health::{self, HealthProbe, HttpHealthProbe, TickFlow};
use crate::process::{self, LaunchSpec, ProcessHandle, ProcessLauncher, SpawnError, SystemLauncher};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    /// No child; initial state and the state after `stop`.
    Stopped,
    /// Spawning the first child of an episode.
    Starting,
    Running,
    /// Waiting out the backoff before a respawn.
    Restarting,
    /// Restart budget exhausted or a respawn failed; only an explicit `start` recovers.
    Failed,
}

impl SupervisorState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Restarting => 3,
            Self::Failed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Restarting,
            4 => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// `start` was given a config it cannot run; never retried.
    #[error("invalid pool configuration: {0}")]
    Config(String),
    /// The OS refused to create the child.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The restart that crossed the budget. The supervisor is now `Failed`.
    #[error("max restart attempts ({max_attempts}) reached, giving up")]
    RestartsExhausted { max_attempts: u32 },
    /// `restart` on a supervisor already in `Failed`.
    #[error("pool supervisor has failed, start it again to recover")]
    Failed,
    /// `restart` before any `start` accepted a config.
    #[error("no pool configuration accepted yet")]
    NotConfigured,
    /// A monitor-driven restart was cut short by `stop`.
    #[error("restart interrupted by stop")]
    Cancelled,
}

/// Supervisor settings plus its process and probe strategies.
pub struct SupervisorConfig {
    /// Child stdout/stderr are appended here.
    pub log_path: PathBuf,
    pub restart: RestartPolicy,
    pub health: HealthPolicy,
    /// Used by `stop`; its `reap_wait` also bounds forced kills during restarts.
    pub shutdown: ShutdownPolicy,
    /// How children are spawned. Defaults to real OS processes.
    pub launcher: Arc<dyn ProcessLauncher>,
    /// What the monitor calls each tick. Defaults to `GET /stats` on the local pool.
    pub probe: Arc<dyn HealthProbe>,
}

impl SupervisorConfig {
    /// Default policies, real processes and the local HTTP probe.
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            restart: RestartPolicy::default(),
            health: HealthPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            launcher: Arc::new(SystemLauncher),
            probe: Arc::new(HttpHealthProbe::local()),
        }
    }

    /// Replace the restart budget and backoff.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Replace the monitor interval and failure threshold.
    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    /// Replace the termination grace window and polling.
    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Spawn children through `launcher` instead of the OS directly.
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Check pool health with `probe` instead of the HTTP default.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }
}

/// Point-in-time view of the supervisor for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub restart_attempts: u32,
    /// Consecutive failed health probes.
    pub http_failures: u32,
    /// Same as [`ProcessSupervisor::is_healthy`].
    pub healthy: bool,
}

struct Lifecycle {
    child: Option<Box<dyn ProcessHandle>>,
    config: Option<ProcessConfig>,
}

struct Monitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone, Copy)]
struct Started {
    instant: Instant,
    at: DateTime<Utc>,
}

/// Starts, stops and auto-restarts the pool process.
///
/// One instance per host process, created at startup and shared by `Arc`.
/// Call [`stop`](Self::stop) at shutdown; dropping a running supervisor kills
/// the child without the grace window.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    control: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    monitor: StdMutex<Option<Monitor>>,
    state: AtomicU8,
    pid: AtomicU32,
    restart_attempts: AtomicU32,
    http_failures: AtomicU32,
    started: StdMutex<Option<Started>>,
}

impl ProcessSupervisor {
    /// A stopped supervisor; nothing is spawned until [`start`](Self::start).
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            control: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                child: None,
                config: None,
            }),
            monitor: StdMutex::new(None),
            state: AtomicU8::new(SupervisorState::Stopped.as_u8()),
            pid: AtomicU32::new(0),
            restart_attempts: AtomicU32::new(0),
            http_failures: AtomicU32::new(0),
            started: StdMutex::new(None),
        })
    }

    /// Validate `config`, spawn the pool and start the health monitor.
    ///
    /// Succeeds without side effects if the pool is already running.
    pub async fn start(self: &Arc<Self>, config: ProcessConfig) -> Result<(), SupervisorError> {
        let _control = self.control.lock().await;

        if self.is_running() {
            tracing::info!(pid = self.pid.load(Ordering::SeqCst), "Pool already running");
            return Ok(());
        }

        config.validate().map_err(|reason| {
            tracing::error!(%reason, "Refusing to start pool");
            SupervisorError::Config(reason)
        })?;

        // A monitor left over from a failed episode has exited or is about to.
        self.reap_monitor().await;

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(mut stale) = lifecycle.child.take() {
            process::force_kill(stale.as_mut(), self.config.shutdown.reap_wait).await;
        }

        self.set_state(SupervisorState::Starting);
        let child = match self.spawn(&config) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    binary = %config.binary_path.display(),
                    error = %e,
                    "Failed to spawn pool process"
                );
                self.set_state(SupervisorState::Stopped);
                return Err(e.into());
            }
        };

        let pid = child.pid();
        self.record_spawn(&mut lifecycle, child);
        lifecycle.config = Some(config);
        self.http_failures.store(0, Ordering::SeqCst);
        self.restart_attempts.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Running);
        drop(lifecycle);

        tracing::info!(pid, "Pool started");
        self.spawn_monitor();
        Ok(())
    }

    /// Stop the monitor, then terminate the child (graceful, then forceful).
    ///
    /// No-op if the pool is not running. Returns only after the monitor has
    /// exited, so no restart can fire afterwards.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;

        if !self.is_running() {
            return;
        }

        let pid = self.pid.load(Ordering::SeqCst);
        tracing::info!(pid, "Stopping pool");

        self.reap_monitor().await;

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(mut child) = lifecycle.child.take() {
            process::shutdown(child.as_mut(), &self.config.shutdown).await;
        }

        self.pid.store(0, Ordering::SeqCst);
        *lock(&self.started) = None;
        self.restart_attempts.store(0, Ordering::SeqCst);
        self.http_failures.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Stopped);

        tracing::info!(pid, "Pool stopped");
    }

    /// Respawn the pool with the last accepted config after the backoff delay.
    ///
    /// Counts against the restart budget. The call that exceeds it returns
    /// [`SupervisorError::RestartsExhausted`] and leaves the supervisor `Failed`.
    /// A `Failed` supervisor is never revived here: this returns
    /// [`SupervisorError::Failed`] without spawning until the next `start`.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _control = self.control.lock().await;

        if self.state() == SupervisorState::Failed {
            tracing::warn!("Restart requested on failed pool, ignoring");
            return Err(SupervisorError::Failed);
        }

        let result = {
            let mut lifecycle = self.lifecycle.lock().await;
            self.restart_locked(&mut lifecycle, None).await
        };

        if result.is_ok() && !self.monitor_active() {
            self.spawn_monitor();
        }
        result
    }

    /// Current lifecycle state. Lock-free; may be momentarily stale.
    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while a child is up or being restarted.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Running | SupervisorState::Restarting
        )
    }

    /// OS pid of the current child, if one is up.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Time since the current child was spawned; zero when not running.
    pub fn uptime(&self) -> Duration {
        if !self.is_running() {
            return Duration::ZERO;
        }
        lock(&self.started).map_or(Duration::ZERO, |s| s.instant.elapsed())
    }

    /// Wall-clock spawn time of the current child.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.started).map(|s| s.at)
    }

    /// Restarts in the current failure episode. Reset by a passing probe,
    /// `start` and `stop`.
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    /// Consecutive failed health probes.
    pub fn http_failures(&self) -> u32 {
        self.http_failures.load(Ordering::SeqCst)
    }

    /// Running with fewer consecutive probe failures than the threshold.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.http_failures() < self.config.health.failure_threshold
    }

    /// All accessors in one serializable value.
    pub fn report(&self) -> HealthReport {
        HealthReport {
            state: self.state(),
            pid: self.pid(),
            started_at: self.started_at(),
            uptime_secs: self.uptime().as_secs(),
            restart_attempts: self.restart_attempts(),
            http_failures: self.http_failures(),
            healthy: self.is_healthy(),
        }
    }

    /// One health-monitor tick: liveness first, HTTP probe only if alive.
    pub(crate) async fn monitor_tick(&self, cancel: &CancellationToken) -> TickFlow {
        if cancel.is_cancelled() || !self.is_running() {
            return TickFlow::Exit;
        }

        {
            let mut lifecycle = self.lifecycle.lock().await;
            let alive = lifecycle.child.as_mut().is_some_and(|c| c.is_alive());
            if !alive {
                if cancel.is_cancelled() {
                    return TickFlow::Exit;
                }
                tracing::warn!(
                    pid = self.pid.load(Ordering::SeqCst),
                    "Pool process died unexpectedly, attempting restart"
                );
                return match self.restart_locked(&mut lifecycle, Some(cancel)).await {
                    Ok(()) => TickFlow::Continue,
                    Err(e) => {
                        tracing::error!(error = %e, "Unable to restart pool, stopping monitor");
                        TickFlow::Exit
                    }
                };
            }
        }

        let healthy = match self.config.probe.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Health probe failed");
                false
            }
        };

        if cancel.is_cancelled() {
            return TickFlow::Exit;
        }

        if !self.record_probe(healthy).await {
            return TickFlow::Continue;
        }

        tracing::warn!(
            threshold = self.config.health.failure_threshold,
            "Too many failed health probes, restarting pool"
        );
        let result = {
            let mut lifecycle = self.lifecycle.lock().await;
            self.restart_locked(&mut lifecycle, Some(cancel)).await
        };
        self.http_failures.store(0, Ordering::SeqCst);

        match result {
            Ok(()) => TickFlow::Continue,
            Err(e) => {
                tracing::error!(error = %e, "Unable to restart pool, stopping monitor");
                TickFlow::Exit
            }
        }
    }

    /// Fold one probe outcome into the counters. Returns true when the failure
    /// threshold has been reached.
    ///
    /// A passing probe clears both the failure count and the restart budget.
    pub(crate) async fn record_probe(&self, healthy: bool) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let threshold = self.config.health.failure_threshold;

        if healthy {
            let previous = self.http_failures.swap(0, Ordering::SeqCst);
            if previous > 0 {
                tracing::info!(
                    failures = previous,
                    "Health probe passed, resetting failure count"
                );
            }
            self.restart_attempts.store(0, Ordering::SeqCst);
            return false;
        }

        let failures = self.http_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(failures, threshold, "Health probe failed");
        failures >= threshold
    }

    async fn restart_locked(
        &self,
        lifecycle: &mut Lifecycle,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), SupervisorError> {
        let Some(config) = lifecycle.config.clone() else {
            return Err(SupervisorError::NotConfigured);
        };

        let policy = self.config.restart;
        let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if attempt > policy.max_attempts {
            tracing::error!(
                max_attempts = policy.max_attempts,
                "Max restart attempts reached, giving up"
            );
            if let Some(mut stale) = lifecycle.child.take() {
                process::force_kill(stale.as_mut(), self.config.shutdown.reap_wait).await;
            }
            self.pid.store(0, Ordering::SeqCst);
            *lock(&self.started) = None;
            self.set_state(SupervisorState::Failed);
            return Err(SupervisorError::RestartsExhausted {
                max_attempts: policy.max_attempts,
            });
        }

        self.set_state(SupervisorState::Restarting);
        let backoff = policy.backoff(attempt);
        tracing::info!(
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = backoff.as_millis(),
            "Waiting before pool restart"
        );

        match cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(attempt, "Pool restart interrupted by stop");
                        return Err(SupervisorError::Cancelled);
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            None => tokio::time::sleep(backoff).await,
        }

        if let Some(mut stale) = lifecycle.child.take() {
            process::force_kill(stale.as_mut(), self.config.shutdown.reap_wait).await;
        }
        self.pid.store(0, Ordering::SeqCst);

        match self.spawn(&config) {
            Ok(child) => {
                let pid = child.pid();
                self.record_spawn(lifecycle, child);
                self.http_failures.store(0, Ordering::SeqCst);
                self.set_state(SupervisorState::Running);
                tracing::info!(pid, attempt, "Pool restarted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(attempt, error = %e, "Pool restart failed");
                *lock(&self.started) = None;
                self.set_state(SupervisorState::Failed);
                Err(e.into())
            }
        }
    }

    fn spawn(&self, config: &ProcessConfig) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let spec = LaunchSpec {
            program: config.binary_path.clone(),
            args: config.build_args(),
            log_path: self.config.log_path.clone(),
        };
        self.config.launcher.launch(&spec)
    }

    fn record_spawn(&self, lifecycle: &mut Lifecycle, child: Box<dyn ProcessHandle>) {
        self.pid.store(child.pid(), Ordering::SeqCst);
        *lock(&self.started) = Some(Started {
            instant: Instant::now(),
            at: Utc::now(),
        });
        lifecycle.child = Some(child);
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(health::run_monitor(
            Arc::downgrade(self),
            cancel.clone(),
            self.config.health.interval,
        ));
        *lock(&self.monitor) = Some(Monitor { cancel, task });
    }

    fn monitor_active(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .is_some_and(|m| !m.task.is_finished())
    }

    /// Cancel the monitor and wait for it to exit.
    async fn reap_monitor(&self) {
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                tracing::error!(error = %e, "Health monitor task failed");
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let monitor = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
        }

        if let Some(child) = self.lifecycle.get_mut().child.as_mut() {
            tracing::warn!(pid = child.pid(), "Supervisor dropped while pool running, killing");
            if let Err(e) = child.kill() {
                tracing::warn!(error = %e, "Kill failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::health::ProbeError;

    struct FakeChild {
        pid: u32,
        alive: Arc<AtomicBool>,
        terminations: Arc<AtomicU32>,
    }

    impl ProcessHandle for FakeChild {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn terminate(&mut self) -> io::Result<()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn kill(&mut self) -> io::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        specs: StdMutex<Vec<LaunchSpec>>,
        children: StdMutex<Vec<Arc<AtomicBool>>>,
        terminations: Arc<AtomicU32>,
        fail: AtomicBool,
    }

    impl FakeLauncher {
        fn launches(&self) -> usize {
            lock(&self.specs).len()
        }

        fn last_child(&self) -> Arc<AtomicBool> {
            Arc::clone(lock(&self.children).last().unwrap())
        }

        fn live_children(&self) -> usize {
            lock(&self.children)
                .iter()
                .filter(|c| c.load(Ordering::SeqCst))
                .count()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, SpawnError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SpawnError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "not executable",
                )));
            }
            let mut specs = lock(&self.specs);
            specs.push(spec.clone());
            let alive = Arc::new(AtomicBool::new(true));
            lock(&self.children).push(Arc::clone(&alive));
            Ok(Box::new(FakeChild {
                pid: 1000 + specs.len() as u32,
                alive,
                terminations: Arc::clone(&self.terminations),
            }))
        }
    }

    struct FakeProbe {
        healthy: AtomicBool,
        calls: AtomicU32,
        panic_on_first: bool,
    }

    impl FakeProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicU32::new(0),
                panic_on_first: false,
            })
        }

        /// Healthy, except the first call panics.
        fn panicking_once() -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(true),
                calls: AtomicU32::new(0),
                panic_on_first: true,
            })
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self) -> Result<(), ProbeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_first && call == 1 {
                panic!("health check blew up");
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProbeError::HttpStatus(500))
            }
        }
    }

    struct Fixture {
        supervisor: Arc<ProcessSupervisor>,
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeProbe>,
        config: ProcessConfig,
        _dir: TempDir,
    }

    fn fixture(interval: Duration, max_attempts: u32, healthy: bool) -> Fixture {
        let restart = RestartPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        };
        fixture_with(interval, restart, FakeProbe::new(healthy))
    }

    fn fixture_with(interval: Duration, restart: RestartPolicy, probe: Arc<FakeProbe>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("junocash-p2pool");
        std::fs::write(&binary, b"").unwrap();

        let launcher = Arc::new(FakeLauncher::default());

        let config = SupervisorConfig::new(dir.path().join("p2pool.log"))
            .with_launcher(Arc::clone(&launcher) as Arc<dyn ProcessLauncher>)
            .with_probe(Arc::clone(&probe) as Arc<dyn HealthProbe>)
            .with_restart_policy(restart)
            .with_health_policy(HealthPolicy {
                interval,
                failure_threshold: 3,
            })
            .with_shutdown_policy(ShutdownPolicy {
                grace: Duration::from_millis(20),
                poll_interval: Duration::from_millis(2),
                reap_wait: Duration::from_millis(5),
            });

        Fixture {
            supervisor: ProcessSupervisor::new(config),
            launcher,
            probe,
            config: ProcessConfig::new(binary, "jwallet1"),
            _dir: dir,
        }
    }

    /// Monitor effectively disabled.
    fn quiet_fixture() -> Fixture {
        fixture(Duration::from_secs(3600), 5, true)
    }

    async fn wait_for(cond: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let f = quiet_fixture();

        let no_wallet = ProcessConfig::new(f.config.binary_path.clone(), "");
        assert!(matches!(
            f.supervisor.start(no_wallet).await,
            Err(SupervisorError::Config(_))
        ));

        let missing = ProcessConfig::new("/nonexistent/junocash-p2pool", "jwallet1");
        assert!(matches!(
            f.supervisor.start(missing).await,
            Err(SupervisorError::Config(_))
        ));

        let empty = ProcessConfig::new("", "jwallet1");
        assert!(matches!(
            f.supervisor.start(empty).await,
            Err(SupervisorError::Config(_))
        ));

        assert_eq!(f.launcher.launches(), 0);
        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn start_spawns_child_with_built_args() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();

        let specs = lock(&f.launcher.specs).clone();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].program, f.config.binary_path);
        assert_eq!(specs[0].args, f.config.build_args());
        assert!(specs[0].log_path.ends_with("p2pool.log"));

        assert_eq!(f.supervisor.state(), SupervisorState::Running);
        assert!(f.supervisor.is_running());
        assert!(f.supervisor.is_healthy());
        assert_eq!(f.supervisor.pid(), Some(1001));
        assert!(f.supervisor.started_at().is_some());

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn start_surfaces_spawn_error() {
        let f = quiet_fixture();
        f.launcher.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.supervisor.start(f.config.clone()).await,
            Err(SupervisorError::Spawn(_))
        ));
        assert!(!f.supervisor.is_running());
        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
        assert_eq!(f.supervisor.pid(), None);
    }

    #[tokio::test]
    async fn start_when_running_is_idempotent() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.supervisor.restart().await.unwrap();
        assert_eq!(f.launcher.launches(), 2);
        assert_eq!(f.supervisor.restart_attempts(), 1);

        f.supervisor.start(f.config.clone()).await.unwrap();
        assert_eq!(f.launcher.launches(), 2);
        assert_eq!(f.supervisor.restart_attempts(), 1);
        assert_eq!(f.launcher.live_children(), 1);

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let f = quiet_fixture();
        f.supervisor.stop().await;

        assert_eq!(f.launcher.launches(), 0);
        assert_eq!(f.launcher.terminations.load(Ordering::SeqCst), 0);
        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_terminates_child_and_resets() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.supervisor.restart().await.unwrap();
        let child = f.launcher.last_child();

        f.supervisor.stop().await;

        assert!(!child.load(Ordering::SeqCst));
        assert_eq!(f.launcher.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(f.launcher.live_children(), 0);
        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
        assert_eq!(f.supervisor.pid(), None);
        assert_eq!(f.supervisor.restart_attempts(), 0);
        assert_eq!(f.supervisor.uptime(), Duration::ZERO);
        assert!(!f.supervisor.is_healthy());

        // Second stop does nothing.
        f.supervisor.stop().await;
        assert_eq!(f.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_before_start_is_rejected() {
        let f = quiet_fixture();
        assert!(matches!(
            f.supervisor.restart().await,
            Err(SupervisorError::NotConfigured)
        ));
        assert_eq!(f.supervisor.restart_attempts(), 0);
    }

    #[tokio::test]
    async fn restart_budget_exhausts_after_max_attempts() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();

        for attempt in 1..=5 {
            f.supervisor.restart().await.unwrap();
            assert_eq!(f.supervisor.restart_attempts(), attempt);
            assert!(f.supervisor.is_running());
            assert_eq!(f.launcher.live_children(), 1);
        }

        assert!(matches!(
            f.supervisor.restart().await,
            Err(SupervisorError::RestartsExhausted { max_attempts: 5 })
        ));
        assert!(!f.supervisor.is_running());
        assert_eq!(f.supervisor.state(), SupervisorState::Failed);
        assert_eq!(f.launcher.launches(), 6);
        assert_eq!(f.launcher.live_children(), 0);

        assert!(f.supervisor.restart().await.is_err());
        assert_eq!(f.launcher.launches(), 6);

        // An explicit start recovers.
        f.supervisor.start(f.config.clone()).await.unwrap();
        assert_eq!(f.supervisor.state(), SupervisorState::Running);
        assert_eq!(f.supervisor.restart_attempts(), 0);
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn restart_spawn_failure_marks_failed() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.launcher.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.supervisor.restart().await,
            Err(SupervisorError::Spawn(_))
        ));
        assert_eq!(f.supervisor.state(), SupervisorState::Failed);
        assert_eq!(f.supervisor.pid(), None);
        assert_eq!(f.launcher.live_children(), 0);
    }

    #[tokio::test]
    async fn restart_does_not_revive_failed_supervisor() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.launcher.fail.store(true, Ordering::SeqCst);
        assert!(f.supervisor.restart().await.is_err());
        assert_eq!(f.supervisor.state(), SupervisorState::Failed);
        let attempts = f.supervisor.restart_attempts();

        f.launcher.fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            f.supervisor.restart().await,
            Err(SupervisorError::Failed)
        ));
        assert_eq!(f.supervisor.state(), SupervisorState::Failed);
        assert_eq!(f.supervisor.restart_attempts(), attempts);
        assert_eq!(f.launcher.launches(), 1);
        assert_eq!(f.launcher.live_children(), 0);

        f.supervisor.start(f.config.clone()).await.unwrap();
        assert_eq!(f.supervisor.state(), SupervisorState::Running);
        assert_eq!(f.launcher.launches(), 2);
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn probe_failures_flip_health_at_threshold() {
        let f = quiet_fixture();
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.supervisor.restart().await.unwrap();
        assert_eq!(f.supervisor.restart_attempts(), 1);

        assert!(!f.supervisor.record_probe(false).await);
        assert!(!f.supervisor.record_probe(false).await);
        assert!(f.supervisor.is_healthy());

        assert!(f.supervisor.record_probe(false).await);
        assert!(!f.supervisor.is_healthy());
        assert_eq!(f.supervisor.http_failures(), 3);

        assert!(!f.supervisor.record_probe(true).await);
        assert!(f.supervisor.is_healthy());
        assert_eq!(f.supervisor.http_failures(), 0);
        assert_eq!(f.supervisor.restart_attempts(), 0);

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn monitor_restarts_dead_child() {
        let f = fixture(Duration::from_millis(10), 5, true);
        f.supervisor.start(f.config.clone()).await.unwrap();

        f.launcher.last_child().store(false, Ordering::SeqCst);

        let launcher = Arc::clone(&f.launcher);
        assert!(wait_for(|| launcher.launches() == 2).await);
        assert!(wait_for(|| f.supervisor.state() == SupervisorState::Running).await);
        assert_eq!(f.launcher.live_children(), 1);

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn monitor_restarts_after_failed_probes() {
        let f = fixture(Duration::from_millis(5), 5, false);
        f.supervisor.start(f.config.clone()).await.unwrap();

        let launcher = Arc::clone(&f.launcher);
        assert!(wait_for(|| launcher.launches() >= 2).await);
        assert!(f.probe.calls.load(Ordering::SeqCst) >= 3);

        f.supervisor.stop().await;
        assert_eq!(f.launcher.live_children(), 0);
    }

    #[tokio::test]
    async fn monitor_gives_up_after_exhaustion() {
        let f = fixture(Duration::from_millis(2), 2, false);
        f.supervisor.start(f.config.clone()).await.unwrap();

        let supervisor = Arc::clone(&f.supervisor);
        assert!(wait_for(|| supervisor.state() == SupervisorState::Failed).await);
        assert_eq!(f.launcher.launches(), 3);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.launcher.launches(), 3);
        assert!(!f.supervisor.is_running());
        assert!(!f.supervisor.monitor_active());
    }

    #[tokio::test]
    async fn stop_prevents_further_restarts() {
        let f = fixture(Duration::from_millis(2), 50, false);
        f.supervisor.start(f.config.clone()).await.unwrap();

        let launcher = Arc::clone(&f.launcher);
        assert!(wait_for(|| launcher.launches() >= 2).await);

        f.supervisor.stop().await;
        let launches = f.launcher.launches();
        assert!(!f.supervisor.monitor_active());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(f.launcher.launches(), launches);
        assert_eq!(f.launcher.live_children(), 0);
        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn monitor_survives_panicking_tick() {
        let restart = RestartPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        };
        let f = fixture_with(Duration::from_millis(5), restart, FakeProbe::panicking_once());
        f.supervisor.start(f.config.clone()).await.unwrap();

        let check = Arc::clone(&f.probe);
        assert!(wait_for(|| check.calls.load(Ordering::SeqCst) >= 3).await);
        assert!(f.supervisor.monitor_active());
        assert_eq!(f.supervisor.state(), SupervisorState::Running);
        assert_eq!(f.launcher.launches(), 1);

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn failed_threshold_restart_still_clears_failures() {
        let f = fixture(Duration::from_millis(2), 5, false);
        f.supervisor.start(f.config.clone()).await.unwrap();
        f.launcher.fail.store(true, Ordering::SeqCst);

        let supervisor = Arc::clone(&f.supervisor);
        assert!(wait_for(|| supervisor.state() == SupervisorState::Failed).await);
        assert!(wait_for(|| !supervisor.monitor_active()).await);

        assert_eq!(f.supervisor.http_failures(), 0);
        assert_eq!(f.launcher.launches(), 1);
        assert!(!f.supervisor.is_healthy());
    }

    #[tokio::test]
    async fn stop_interrupts_long_backoff() {
        let restart = RestartPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(30),
        };
        let f = fixture_with(Duration::from_millis(2), restart, FakeProbe::new(false));
        f.supervisor.start(f.config.clone()).await.unwrap();

        let supervisor = Arc::clone(&f.supervisor);
        assert!(wait_for(|| supervisor.state() == SupervisorState::Restarting).await);

        tokio::time::timeout(Duration::from_secs(2), f.supervisor.stop())
            .await
            .expect("stop must not wait out the backoff");

        assert_eq!(f.supervisor.state(), SupervisorState::Stopped);
        assert_eq!(f.launcher.launches(), 1);
        assert_eq!(f.launcher.live_children(), 0);
        assert!(!f.supervisor.monitor_active());
    }

    #[tokio::test]
    async fn report_for_stopped_supervisor() {
        let f = quiet_fixture();
        insta::assert_json_snapshot!(f.supervisor.report(), @r#"
        {
          "state": "STOPPED",
          "pid": null,
          "started_at": null,
          "uptime_secs": 0,
          "restart_attempts": 0,
          "http_failures": 0,
          "healthy": false
        }
        "#);
    }

    #[test]
    fn state_round_trips_through_atomic_repr() {
        for state in [
            SupervisorState::Stopped,
            SupervisorState::Starting,
            SupervisorState::Running,
            SupervisorState::Restarting,
            SupervisorState::Failed,
        ] {
            assert_eq!(SupervisorState::from_u8(state.as_u8()), state);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervises_real_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("junocash-p2pool");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SupervisorConfig::new(dir.path().join("p2pool.log"))
            .with_probe(FakeProbe::new(true) as Arc<dyn HealthProbe>)
            .with_health_policy(HealthPolicy {
                interval: Duration::from_secs(3600),
                failure_threshold: 3,
            });
        let supervisor = ProcessSupervisor::new(config);

        supervisor
            .start(ProcessConfig::new(&script, "jwallet1"))
            .await
            .unwrap();
        let pid = supervisor.pid().unwrap();
        assert!(dir.path().join("p2pool.log").exists());

        supervisor.stop().await;
        assert!(!supervisor.is_running());

        let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err();
        assert!(gone, "pool process {pid} still alive after stop");
    }
}

//! Process wiring: lock the data directory, register services, hook the
//! coordinator into signal handling, and run the agent until asked to stop.

use crate::config::LifecycleConfig;
use crate::coordinator::{CoordinatorError, ShutdownCoordinator, AGENT_SERVICE};
use crate::data_dir::{DataDir, InstanceLock, LockError};
use crate::record::ShutdownRecord;
use crate::services::{ManagedService, ServiceError, StateSavable, Stoppable};
use crate::signals::{ShutdownSummary, SignalError, SignalHandler};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// The built-in agent: does nothing on each tick except ask the coordinator
/// whether it may.
pub struct IdleAgent {
    tick: Duration,
    stop_tx: watch::Sender<bool>,
    ticks: AtomicU64,
}

impl IdleAgent {
    pub fn new(tick: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tick,
            stop_tx,
            ticks: AtomicU64::new(0),
        }
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Tick until stopped or until the coordinator refuses new work.
    pub async fn run(&self, coordinator: &ShutdownCoordinator) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = coordinator.check_can_start_operation() {
                        info!(error = %e, "agent loop winding down");
                        break;
                    }
                    let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(tick = n, "agent tick");
                }
            }
        }
        info!(ticks = self.ticks(), "agent loop exited");
    }
}

#[async_trait]
impl Stoppable for IdleAgent {
    async fn stop(&self) -> Result<(), ServiceError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}

#[async_trait]
impl StateSavable for IdleAgent {
    async fn save_service_state(&self) -> Result<(), ServiceError> {
        debug!(ticks = self.ticks(), "agent has no state beyond its tick count");
        Ok(())
    }
}

impl ManagedService for IdleAgent {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn as_state_savable(&self) -> Option<&dyn StateSavable> {
        Some(self)
    }
}

/// A booted process: lock held, handlers installed, ready to [`run`].
pub struct Host {
    pub coordinator: Arc<ShutdownCoordinator>,
    pub signals: SignalHandler,
    pub agent: Arc<IdleAgent>,
    /// The previous run's record, when the boot check asked for recovery.
    pub recovered: Option<ShutdownRecord>,
    lock: InstanceLock,
}

impl Host {
    pub fn lock_path(&self) -> &std::path::Path {
        self.lock.path()
    }
}

/// Boot sequence. Must be called from within a tokio runtime.
///
/// The recovery check and crash marker run before signal handlers are
/// installed, so a record written by an early shutdown is never overwritten.
/// The built-in agent is registered as `"agent"` ahead of `services`.
/// A failed recovery is logged and boot continues.
pub fn bootstrap(
    config: &LifecycleConfig,
    services: Vec<(String, Arc<dyn ManagedService>)>,
) -> Result<Host, HostError> {
    let data_dir = DataDir::new(&config.storage.data_dir);
    if data_dir.init().map_err(|e| HostError::DataDir {
        path: data_dir.root().to_path_buf(),
        source: e,
    })? {
        info!(path = %data_dir.root().display(), "created data directory");
    }
    let lock = data_dir.acquire_lock().map_err(HostError::Lock)?;

    let coordinator = Arc::new(
        ShutdownCoordinator::new(config.state_path())
            .with_recent_window(config.recovery.recent_window())
            .with_step_timeout(config.shutdown.step_timeout()),
    );
    let agent = Arc::new(IdleAgent::new(config.agent.tick_interval()));
    coordinator.register_service(AGENT_SERVICE, agent.clone());
    for (name, service) in services {
        coordinator.register_service(name, service);
    }

    let signals = SignalHandler::new(config.shutdown.timeout());
    let primary = coordinator.clone();
    signals.register_async_shutdown_callback(move || {
        let coordinator = primary.clone();
        async move {
            coordinator
                .shutdown()
                .await
                .map(|_| ())
                .map_err(|e| Box::new(e) as ServiceError)
        }
    });

    let mut recovered = None;
    if coordinator.check_recovery_needed() {
        match coordinator.recover_state() {
            Ok(record) => recovered = Some(record),
            Err(e) => warn!(error = %e, "recovery failed, continuing with fresh state"),
        }
    }

    // Armed before any signal can start a shutdown that the marker would clobber.
    if config.recovery.arm_crash_marker {
        coordinator
            .arm_crash_marker()
            .map_err(HostError::CrashMarker)?;
    }
    signals.register_handlers().map_err(HostError::Signals)?;

    info!(
        services = ?coordinator.registered_services(),
        record = %coordinator.state_path().display(),
        "agent host ready"
    );
    Ok(Host {
        coordinator,
        signals,
        agent,
        recovered,
        lock,
    })
}

/// Run the agent until a shutdown is requested, then drive the shutdown to
/// completion within the configured deadline.
pub async fn run(host: Host) -> Result<ShutdownSummary, SignalError> {
    let agent = host.agent.clone();
    let coordinator = host.coordinator.clone();
    let agent_task = tokio::spawn(async move { agent.run(&coordinator).await });

    host.signals.wait_for_shutdown_request().await;
    host.coordinator.begin_shutdown();
    let summary = host.signals.shutdown().await?;

    if let Err(e) = agent_task.await {
        warn!(error = %e, "agent task did not exit cleanly");
    }
    Ok(summary)
}

/// Human-readable account of the last shutdown, for `--status`.
pub fn status(config: &LifecycleConfig) -> String {
    let data_dir = DataDir::new(&config.storage.data_dir);
    let coordinator = ShutdownCoordinator::new(config.state_path())
        .with_recent_window(config.recovery.recent_window());
    let mut out = String::new();

    let running = data_dir.lock().exists()
        && matches!(data_dir.acquire_lock(), Err(LockError::Held { .. }));
    let _ = writeln!(out, "data dir: {}", data_dir.root().display());
    let _ = writeln!(out, "running: {}", if running { "yes" } else { "no" });

    match coordinator.recover_state() {
        Ok(record) => {
            let _ = writeln!(out, "last shutdown: {} at {}", record.reason, record.timestamp);
            for (name, outcome) in &record.services {
                let _ = writeln!(out, "  {name}: {outcome}");
            }
        }
        Err(CoordinatorError::NoRecord(path)) => {
            let _ = writeln!(out, "last shutdown: no record at {}", path.display());
        }
        Err(e) => {
            let _ = writeln!(out, "last shutdown: unreadable ({e})");
        }
    }

    let verdict = if running {
        "n/a (agent is running)"
    } else if coordinator.check_recovery_needed() {
        "yes"
    } else {
        "no"
    };
    let _ = writeln!(out, "recovery needed: {verdict}");
    out
}

/// Errors that prevent the host from booting.
#[derive(Debug)]
pub enum HostError {
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock(LockError),
    Signals(SignalError),
    CrashMarker(CoordinatorError),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::DataDir { path, source } => {
                write!(f, "failed to create data dir {}: {source}", path.display())
            }
            HostError::Lock(e) => write!(f, "{e}"),
            HostError::Signals(e) => write!(f, "{e}"),
            HostError::CrashMarker(e) => write!(f, "failed to arm crash marker: {e}"),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::DataDir { source, .. } => Some(source),
            HostError::Lock(e) => Some(e),
            HostError::Signals(e) => Some(e),
            HostError::CrashMarker(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordStore, REASON_KILLED};
    use std::path::Path;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> LifecycleConfig {
        let mut config = LifecycleConfig::default();
        config.storage.data_dir = dir.join(".agent");
        config.shutdown.timeout_secs = 5.0;
        config.agent.tick_interval_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_bootstrap_then_trigger_writes_graceful_record() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let host = bootstrap(&config, Vec::new()).unwrap();
        let store = RecordStore::new(config.state_path());
        assert_eq!(store.load().unwrap().unwrap().reason, REASON_KILLED);
        assert!(host.recovered.is_none());
        assert!(host.lock_path().ends_with("lock"));

        let signals = host.signals.clone();
        let agent = host.agent.clone();
        let running = tokio::spawn(run(host));
        assert!(signals.trigger("test").await);

        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.callbacks_run, 1);
        assert_eq!(summary.callbacks_failed, 0);

        let record = store.load().unwrap().unwrap();
        assert!(record.is_graceful());
        assert_eq!(record.services["agent"]["status"], "saved");
        assert!(agent.ticks() <= 1);
    }

    #[tokio::test]
    async fn test_second_bootstrap_on_same_dir_is_refused() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let _first = bootstrap(&config, Vec::new()).unwrap();
        let err = bootstrap(&config, Vec::new()).err().unwrap();
        assert!(matches!(err, HostError::Lock(LockError::Held { .. })));
    }

    #[tokio::test]
    async fn test_bootstrap_recovers_after_crash() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(&config.storage.data_dir).unwrap();
        std::fs::write(
            config.state_path(),
            r#"{"timestamp":"2020-01-01T00:00:00","reason":"SIGKILL","services":{}}"#,
        )
        .unwrap();

        let host = bootstrap(&config, Vec::new()).unwrap();
        let recovered = host.recovered.as_ref().unwrap();
        assert_eq!(recovered.reason, REASON_KILLED);
        assert_eq!(recovered.timestamp, "2020-01-01T00:00:00");

        // Re-armed with a fresh stamp.
        let armed = RecordStore::new(config.state_path()).load().unwrap().unwrap();
        assert_ne!(armed.timestamp, "2020-01-01T00:00:00");
    }

    #[tokio::test]
    async fn test_bootstrap_without_crash_marker_leaves_no_record() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.recovery.arm_crash_marker = false;

        let host = bootstrap(&config, Vec::new()).unwrap();
        assert!(!host.coordinator.state_path().exists());
        assert!(host.recovered.is_none());
    }

    #[tokio::test]
    async fn test_unwritable_crash_marker_aborts_boot() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.storage.state_file = PathBuf::from("/nonexistent/dir/shutdown_state.json");

        let err = bootstrap(&config, Vec::new()).err().unwrap();
        assert!(matches!(err, HostError::CrashMarker(_)));
    }

    #[tokio::test]
    async fn test_shutdown_right_after_boot_is_not_clobbered_by_marker() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let host = bootstrap(&config, Vec::new()).unwrap();
        host.signals.shutdown().await.unwrap();

        let record = RecordStore::new(config.state_path()).load().unwrap().unwrap();
        assert!(record.is_graceful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_loop_stops_on_admission_rejection() {
        let dir = tempdir().unwrap();
        let coordinator = ShutdownCoordinator::new(dir.path().join("state.json"));
        let agent = IdleAgent::new(Duration::from_secs(1));

        let run = agent.run(&coordinator);
        let rejector = async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            coordinator.begin_shutdown();
        };
        tokio::join!(run, rejector);

        // Ticks at 0s, 1s and 2s; the 3s tick is refused.
        assert_eq!(agent.ticks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_loop_stops_when_stopped() {
        let dir = tempdir().unwrap();
        let coordinator = ShutdownCoordinator::new(dir.path().join("state.json"));
        let agent = IdleAgent::new(Duration::from_secs(60));

        let stopper = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            agent.stop().await.unwrap();
        };
        tokio::join!(agent.run(&coordinator), stopper);
        assert_eq!(agent.ticks(), 1);
        assert!(!coordinator.is_shutting_down());
    }

    #[test]
    fn test_status_without_record() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let out = status(&config);
        assert!(out.contains("running: no"));
        assert!(out.contains("last shutdown: no record"));
        assert!(out.contains("recovery needed: no"));
    }

    #[test]
    fn test_status_reports_killed_record() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(&config.storage.data_dir).unwrap();
        RecordStore::new(config.state_path())
            .write(&ShutdownRecord::crash_marker())
            .unwrap();

        let out = status(&config);
        assert!(out.contains("last shutdown: SIGKILL at"));
        assert!(out.contains("recovery needed: yes"));
    }
}

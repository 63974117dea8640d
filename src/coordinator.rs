/// Shutdown coordinator: ordered, fault-tolerant wind-down of registered services.
///
/// The sequence is stop agent → drain votes → save every service's state →
/// persist the shutdown record. Only the last step can fail the sequence;
/// everything before it is logged and skipped past.
use crate::record::{RecordError, RecordStore, ShutdownRecord, REASON_GRACEFUL, REASON_KILLED};
use crate::services::{ManagedService, ServiceError};
use chrono::{DateTime, TimeDelta, Utc};
use nix::sys::signal::Signal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Service name whose `Stoppable` capability is invoked first.
pub const AGENT_SERVICE: &str = "agent";
/// Service name whose `VoteManaging` capability is drained second.
pub const VOTING_SERVICE: &str = "voting";

const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(300);

type Registry = Vec<(String, Arc<dyn ManagedService>)>;

/// What the sequence did, returned to whichever caller actually ran it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub agent_stopped: bool,
    pub votes_completed: Vec<String>,
    pub votes_cancelled: Vec<String>,
    pub vote_failures: usize,
    pub services_saved: Vec<String>,
    pub services_failed: Vec<String>,
    pub record_path: PathBuf,
}

pub struct ShutdownCoordinator {
    store: RecordStore,
    recent_window: Duration,
    step_timeout: Option<Duration>,
    services: Mutex<Registry>,
    /// Admission flag. Monotonic.
    shutting_down: AtomicBool,
    /// Set by the first caller to claim the sequence.
    sequence_claimed: tokio::sync::Mutex<bool>,
}

impl ShutdownCoordinator {
    /// Create a coordinator persisting its record at `state_path`.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            store: RecordStore::new(state_path),
            recent_window: DEFAULT_RECENT_WINDOW,
            step_timeout: None,
            services: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            sequence_claimed: tokio::sync::Mutex::new(false),
        }
    }

    /// How old a record may be and still count as "recent" for recovery.
    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }

    /// Bound each collaborator call. `None` leaves calls unbounded.
    pub fn with_step_timeout(mut self, limit: Option<Duration>) -> Self {
        self.step_timeout = limit;
        self
    }

    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    /// Register `service` under `name`. A second registration under the same
    /// name replaces the first but keeps its position in save order.
    pub fn register_service(&self, name: impl Into<String>, service: Arc<dyn ManagedService>) {
        let name = name.into();
        let caps = service.capabilities();
        let mut services = self.lock_services();
        match services.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => {
                slot.1 = service;
                warn!(service = %name, ?caps, "service re-registered, replacing previous handle");
            }
            None => {
                services.push((name.clone(), service));
                info!(service = %name, ?caps, "registered service for shutdown coordination");
            }
        }
    }

    /// Names of registered services in save order.
    pub fn registered_services(&self) -> Vec<String> {
        self.lock_services().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Run the shutdown sequence.
    ///
    /// Concurrent and repeated calls collapse: the first caller runs the
    /// sequence and gets `Some(report)`, everyone else gets `Ok(None)` at once.
    /// Fails only if the shutdown record could not be written.
    pub async fn shutdown(&self) -> Result<Option<ShutdownReport>, CoordinatorError> {
        {
            let mut claimed = self.sequence_claimed.lock().await;
            if *claimed {
                debug!("shutdown sequence already claimed, returning");
                return Ok(None);
            }
            *claimed = true;
        }
        self.shutting_down.store(true, Ordering::SeqCst);

        self.run_sequence()
            .instrument(info_span!("coordinated_shutdown"))
            .await
            .map(Some)
    }

    /// Signal-number entry point. Shares the guard with [`Self::shutdown`].
    pub async fn handle_signal(&self, signum: i32) -> Result<Option<ShutdownReport>, CoordinatorError> {
        let name = Signal::try_from(signum)
            .map(|s| s.as_str())
            .unwrap_or("unknown");
        info!(signal = name, signum, "coordinator handling signal");
        self.shutdown().await
    }

    async fn run_sequence(&self) -> Result<ShutdownReport, CoordinatorError> {
        info!("starting coordinated shutdown");
        // Snapshot so no lock is held across collaborator calls.
        let services: Registry = self.lock_services().clone();
        let mut report = ShutdownReport {
            record_path: self.store.path().to_path_buf(),
            ..Default::default()
        };

        self.stop_agent(&services, &mut report)
            .instrument(info_span!("agent_service_stop"))
            .await;
        self.drain_votes(&services, &mut report)
            .instrument(info_span!("handle_active_votes"))
            .await;
        let outcomes = self
            .save_all_service_states(&services, &mut report)
            .instrument(info_span!("save_service_states"))
            .await;

        let record = ShutdownRecord::now(REASON_GRACEFUL, outcomes);
        self.save_state(&record)?;

        info!(
            agent_stopped = report.agent_stopped,
            votes_completed = report.votes_completed.len(),
            votes_cancelled = report.votes_cancelled.len(),
            vote_failures = report.vote_failures,
            services_saved = report.services_saved.len(),
            services_failed = report.services_failed.len(),
            "coordinated shutdown complete"
        );
        Ok(report)
    }

    async fn stop_agent(&self, services: &Registry, report: &mut ShutdownReport) {
        let Some(agent) = find(services, AGENT_SERVICE) else {
            info!("no agent service registered, skipping stop");
            return;
        };
        let Some(stoppable) = agent.as_stoppable() else {
            info!("agent service is not stoppable, skipping stop");
            return;
        };

        match self.bounded("agent stop", stoppable.stop()).await {
            Ok(()) => {
                report.agent_stopped = true;
                info!("agent service stopped");
            }
            Err(e) => error!(error = %e, "error stopping agent service"),
        }
    }

    async fn drain_votes(&self, services: &Registry, report: &mut ShutdownReport) {
        let Some(voting) = find(services, VOTING_SERVICE) else {
            debug!("no voting service registered, nothing to drain");
            return;
        };
        let Some(votes) = voting.as_vote_managing() else {
            info!("voting service does not manage votes, skipping drain");
            return;
        };

        let active = match self.bounded("vote listing", votes.get_active_votes()).await {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "error listing active votes");
                report.vote_failures += 1;
                return;
            }
        };
        info!(count = active.len(), "draining active votes");

        for vote in active {
            if vote.can_complete {
                match self.bounded("complete vote", votes.complete_vote(&vote.id)).await {
                    Ok(()) => {
                        info!(vote_id = %vote.id, "completed vote");
                        report.votes_completed.push(vote.id);
                    }
                    Err(e) => {
                        error!(vote_id = %vote.id, error = %e, "error completing vote");
                        report.vote_failures += 1;
                    }
                }
            } else {
                match self.bounded("cancel vote", votes.cancel_vote(&vote.id)).await {
                    Ok(()) => {
                        info!(vote_id = %vote.id, "cancelled vote");
                        report.votes_cancelled.push(vote.id);
                    }
                    Err(e) => {
                        error!(vote_id = %vote.id, error = %e, "error cancelling vote");
                        report.vote_failures += 1;
                    }
                }
            }
        }
    }

    /// Save every state-savable service in registration order. Returns the
    /// per-service outcome map that goes into the record.
    async fn save_all_service_states(
        &self,
        services: &Registry,
        report: &mut ShutdownReport,
    ) -> BTreeMap<String, Value> {
        let mut outcomes = BTreeMap::new();
        for (name, service) in services {
            let Some(savable) = service.as_state_savable() else {
                outcomes.insert(name.clone(), json!({"status": "not_savable"}));
                continue;
            };
            match self.bounded("save state", savable.save_service_state()).await {
                Ok(()) => {
                    info!(service = %name, "saved service state");
                    report.services_saved.push(name.clone());
                    outcomes.insert(name.clone(), json!({"status": "saved"}));
                }
                Err(e) => {
                    error!(service = %name, error = %e, "error saving service state");
                    report.services_failed.push(name.clone());
                    outcomes.insert(
                        name.clone(),
                        json!({"status": "failed", "error": e.to_string()}),
                    );
                }
            }
        }
        outcomes
    }

    async fn bounded<T>(
        &self,
        step: &str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(format!("{step} timed out after {limit:?}").into()),
            },
            None => call.await,
        }
    }

    /// Atomically write `record` to the state file.
    pub fn save_state(&self, record: &ShutdownRecord) -> Result<(), CoordinatorError> {
        match self.store.write(record) {
            Ok(()) => {
                info!(path = %self.store.path().display(), reason = %record.reason, "saved shutdown state");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to save shutdown state");
                Err(CoordinatorError::Persistence(e))
            }
        }
    }

    /// Write a presumptive `SIGKILL` record. Call after the boot-time
    /// recovery check; a completed shutdown overwrites it.
    pub fn arm_crash_marker(&self) -> Result<(), CoordinatorError> {
        self.store
            .write(&ShutdownRecord::crash_marker())
            .map_err(CoordinatorError::Persistence)?;
        debug!(path = %self.store.path().display(), "armed crash marker");
        Ok(())
    }

    /// Whether the previous run's record calls for recovery.
    pub fn check_recovery_needed(&self) -> bool {
        self.recovery_needed_at(Utc::now())
    }

    fn recovery_needed_at(&self, now: DateTime<Utc>) -> bool {
        let value = match self.store.load_value() {
            Ok(Some(value)) => value,
            Ok(None) => return false,
            Err(e) => {
                error!(error = %e, "error checking recovery state");
                return false;
            }
        };

        // A kill marker wins regardless of what else the record holds.
        if value.get("reason").and_then(Value::as_str) == Some(REASON_KILLED) {
            warn!(timestamp = ?value.get("timestamp"), "detected previous SIGKILL, recovery needed");
            return true;
        }

        let record: ShutdownRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, path = %self.store.path().display(), "malformed shutdown record");
                return false;
            }
        };

        let Some(at) = record.timestamp_utc() else {
            error!(timestamp = %record.timestamp, "shutdown record has unparseable timestamp");
            return false;
        };
        let window = TimeDelta::from_std(self.recent_window).unwrap_or(TimeDelta::MAX);
        let age = now.signed_duration_since(at);
        if age < window {
            info!(
                reason = %record.reason,
                age_secs = age.num_seconds(),
                "found recent shutdown state, recovery needed"
            );
            true
        } else {
            debug!(reason = %record.reason, age_secs = age.num_seconds(), "previous shutdown state is stale");
            false
        }
    }

    /// Load the previous run's record. Missing or unreadable records are errors.
    pub fn recover_state(&self) -> Result<ShutdownRecord, CoordinatorError> {
        match self.store.load() {
            Ok(Some(record)) => {
                info!(timestamp = %record.timestamp, reason = %record.reason, "recovering state");
                Ok(record)
            }
            Ok(None) => Err(CoordinatorError::NoRecord(self.store.path().to_path_buf())),
            Err(e) => {
                error!(error = %e, "failed to recover state");
                Err(CoordinatorError::Recovery(e))
            }
        }
    }

    /// Refuse new work from here on. Does not run the sequence.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("shutdown begun, refusing new operations");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Admission check for request paths.
    pub fn check_can_start_operation(&self) -> Result<(), CoordinatorError> {
        if self.is_shutting_down() {
            return Err(CoordinatorError::AdmissionRejected);
        }
        Ok(())
    }

    fn lock_services(&self) -> std::sync::MutexGuard<'_, Registry> {
        // The registry holds no invariants a panicking writer could break.
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find<'a>(services: &'a Registry, name: &str) -> Option<&'a Arc<dyn ManagedService>> {
    services.iter().find(|(n, _)| n == name).map(|(_, s)| s)
}

/// Errors from the shutdown coordinator.
#[derive(Debug)]
pub enum CoordinatorError {
    /// An operation was attempted after shutdown began.
    AdmissionRejected,
    /// The shutdown record could not be written.
    Persistence(RecordError),
    /// The previous record exists but could not be read.
    Recovery(RecordError),
    /// There is no previous record to recover.
    NoRecord(PathBuf),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::AdmissionRejected => {
                write!(f, "cannot start new operations during shutdown")
            }
            CoordinatorError::Persistence(e) => write!(f, "failed to persist shutdown record: {e}"),
            CoordinatorError::Recovery(e) => write!(f, "failed to recover state: {e}"),
            CoordinatorError::NoRecord(path) => {
                write!(f, "no shutdown record at {}", path.display())
            }
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Persistence(e) => Some(e),
            CoordinatorError::Recovery(e) => Some(e),
            CoordinatorError::AdmissionRejected | CoordinatorError::NoRecord(_) => None,
        }
    }
}

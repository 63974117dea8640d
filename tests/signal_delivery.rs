//! Delivers real signals to the test process, so it lives in its own binary
//! where no other test has handlers installed.

use agent_lifecycle::{
    ActiveVote, ManagedService, RecordStore, ServiceError, ShutdownCoordinator, ShutdownTrigger,
    SignalHandler, VoteManaging,
};
use async_trait::async_trait;
use nix::sys::signal::{raise, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Votes {
    handled: Mutex<Vec<String>>,
}

#[async_trait]
impl VoteManaging for Votes {
    async fn get_active_votes(&self) -> Result<Vec<ActiveVote>, ServiceError> {
        Ok(vec![ActiveVote::new("v1", true), ActiveVote::new("v2", false)])
    }

    async fn complete_vote(&self, vote_id: &str) -> Result<(), ServiceError> {
        self.handled.lock().unwrap().push(format!("complete:{vote_id}"));
        Ok(())
    }

    async fn cancel_vote(&self, vote_id: &str) -> Result<(), ServiceError> {
        self.handled.lock().unwrap().push(format!("cancel:{vote_id}"));
        Ok(())
    }
}

impl ManagedService for Votes {
    fn as_vote_managing(&self) -> Option<&dyn VoteManaging> {
        Some(self)
    }
}

#[tokio::test]
async fn sigterm_runs_coordinated_shutdown_once() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("shutdown_state.json");

    let coordinator = Arc::new(ShutdownCoordinator::new(&state_path));
    let votes = Arc::new(Votes::default());
    coordinator.register_service("voting", votes.clone());

    let handler = SignalHandler::new(Duration::from_secs(5));
    let runs = Arc::new(AtomicUsize::new(0));
    let primary = coordinator.clone();
    let counted = runs.clone();
    handler.register_async_shutdown_callback(move || {
        let coordinator = primary.clone();
        let counted = counted.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            coordinator
                .shutdown()
                .await
                .map(|_| ())
                .map_err(|e| Box::new(e) as ServiceError)
        }
    });
    handler.register_handlers().unwrap();

    raise(Signal::SIGTERM).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handler.wait_for_shutdown_request())
        .await
        .unwrap();
    let summary = handler.shutdown().await.unwrap();
    assert_eq!(summary.trigger, ShutdownTrigger::Signal(Signal::SIGTERM));
    assert_eq!(summary.callbacks_failed, 0);

    // A second signal is observed but does not re-run anything.
    raise(Signal::SIGINT).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(
        *votes.handled.lock().unwrap(),
        vec!["complete:v1".to_string(), "cancel:v2".to_string()]
    );
    let record = RecordStore::new(&state_path).load().unwrap().unwrap();
    assert!(record.is_graceful());
    assert_eq!(record.services["voting"]["status"], "not_savable");
    assert!(coordinator.check_can_start_operation().is_err());

    handler.unregister_handlers().unwrap();
}

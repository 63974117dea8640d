//! Capabilities a service can expose to the shutdown coordinator.
//!
//! A registered service implements [`ManagedService`] and answers, per
//! capability, whether it supports it. The coordinator probes each handle at
//! the moment it needs a capability; a `None` means "skip", never an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type collaborators return. The coordinator only logs it.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// A vote still in flight when shutdown starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveVote {
    pub id: String,
    /// True if the vote can be finished before exit; otherwise it is cancelled.
    #[serde(default)]
    pub can_complete: bool,
}

impl ActiveVote {
    pub fn new(id: impl Into<String>, can_complete: bool) -> Self {
        Self {
            id: id.into(),
            can_complete,
        }
    }
}

#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Stop accepting work and wind down.
    async fn stop(&self) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait StateSavable: Send + Sync {
    /// Flush whatever this service needs to resume after a restart.
    async fn save_service_state(&self) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait VoteManaging: Send + Sync {
    async fn get_active_votes(&self) -> Result<Vec<ActiveVote>, ServiceError>;
    async fn complete_vote(&self, vote_id: &str) -> Result<(), ServiceError>;
    async fn cancel_vote(&self, vote_id: &str) -> Result<(), ServiceError>;
}

/// A handle registered with the coordinator.
///
/// Every capability defaults to unsupported. Implementors override the
/// probes for the capabilities they have, usually as `Some(self)`.
pub trait ManagedService: Send + Sync {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    fn as_state_savable(&self) -> Option<&dyn StateSavable> {
        None
    }

    fn as_vote_managing(&self) -> Option<&dyn VoteManaging> {
        None
    }

    /// Capability names for log lines.
    fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = Vec::new();
        if self.as_stoppable().is_some() {
            caps.push("stop");
        }
        if self.as_state_savable().is_some() {
            caps.push("save_state");
        }
        if self.as_vote_managing().is_some() {
            caps.push("votes");
        }
        caps
    }
}

//! Graceful-shutdown coordination for the governance voting agent.
//!
//! The pieces, leaves first:
//! - [`record`]: the on-disk shutdown record, written atomically.
//! - [`services`]: capability traits a registered service may implement.
//! - [`coordinator`]: the ordered stop → drain → save → persist sequence.
//! - [`signals`]: SIGTERM/SIGINT bridge with dedupe and an overall deadline.
//! - [`host`]: boot-time wiring used by the binary.

pub mod config;
pub mod coordinator;
pub mod data_dir;
pub mod host;
pub mod record;
pub mod services;
pub mod signals;

pub use coordinator::{CoordinatorError, ShutdownCoordinator, ShutdownReport};
pub use record::{RecordError, RecordStore, ShutdownRecord};
pub use services::{ActiveVote, ManagedService, ServiceError, StateSavable, Stoppable, VoteManaging};
pub use signals::{ShutdownSummary, ShutdownTrigger, SignalError, SignalHandler};

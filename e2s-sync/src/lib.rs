//! # e2s-sync
//!
//! Matching, reconciliation, run state and execution.
//!
//! Call [`pipeline::run`] for a complete run against an [`AddressApi`], or
//! [`reconcile::reconcile`] directly to decide actions over in-memory
//! snapshots without touching the network. Driver rosters go through
//! [`drivers::run_drivers`] against a [`DriverApi`].

pub mod action_log;
pub mod api;
pub mod diff;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod payload;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod state;

pub use action_log::{ActionLog, Summary};
pub use api::{AddressApi, DriverApi};
pub use drivers::{
    run_drivers, DriverAction, DriverActionKind, DriverOperation, DriverReason, DriverRunReport,
};
pub use error::{ApiError, SyncError};
pub use executor::ExecutionOutcome;
pub use matcher::{MatchConfidence, RunMode};
pub use pipeline::{run, RunOptions, RunReport};
pub use reconcile::{reconcile, Action, ActionKind, Operation, ReasonCode, ReconcileContext};
pub use retry::{Retrier, Sleeper, ThreadSleeper};
pub use state::{StateSnapshot, StateStore};

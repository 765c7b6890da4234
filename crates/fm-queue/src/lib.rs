//! Durable job queue + bounded worker pool.
//!
//! Jobs are rows in `queue_jobs` (see `fm-db`); this crate owns the worker
//! side: claiming, executing via a [`JobRunner`], terminal settlement in one
//! transaction (operation row + ledger + outbox), retry with exponential
//! backoff, and restoration of interrupted work on boot.

pub mod backoff;
pub mod restore;
pub mod runner;
pub mod settle;
pub mod worker;

pub use backoff::backoff_delay;
pub use restore::restore_on_start;
pub use runner::{
    CancelFlag, CancelRegistry, ExecContext, JobError, JobOutput, JobRunner, ProgressBus,
    ProgressUpdate,
};
pub use worker::{WorkerPool, WorkerPoolHandle};

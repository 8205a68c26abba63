//! Sync cycles and their scheduling.
//!
//! [`SyncOrchestrator`] runs fetch, merge and bookkeeping for one source or
//! for all of them. [`Scheduler`] drives it from named recurring timers and
//! owns the gate that keeps full syncs from overlapping.

mod orchestrator;
mod scheduler;

pub use orchestrator::{BatchStatus, BatchSummary, SyncError, SyncOrchestrator, SyncOutcome};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStatus};

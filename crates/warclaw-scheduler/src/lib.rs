//! # WarClaw Scheduler
//!
//! Orchestrates every world's recurring work plus ad-hoc requests over one
//! exclusive automation session.
//!
//! ## Design Principles
//! - One session, one runnable executor process-wide, enforced by [`SessionLock`]
//! - All mutable orchestration state lives in one [`OrchestratorState`] behind one coarse guard
//! - Bot-protection hits lock a world out of automatic scheduling until a clean run
//! - Executor failures are outcomes, never faults: every run reschedules
//! - SQLite persistence for manual tasks, dispatch fingerprints and build wish-lists
//!
//! ## Architecture
//! ```text
//! SchedulerEngine::tick() (tokio interval + Notify wake-up)
//!   ├── SessionLock busy? → defer
//!   ├── candidates = due NextRunRecords (active, enabled, not locked out)
//!   │              + Pending ManualTasks (lockout bypassed)
//!   ├── earliest due → manual first → kind priority → world id
//!   ├── acquire SessionLock → PageDriver::execute(world, ctx)
//!   └── release → LockoutRegistry / NextRunRegistry / ManualTask status
//!
//! Executors
//!   ├── ExternalSyncDriver      → DispatchLedger (fingerprint dedup)
//!   ├── ConstructionQueueDriver → PriorityQueueConsumer (one submission per run)
//!   └── WorkerDriver            → remote automation worker (HTTP)
//! ```

pub mod build_queue;
pub mod engine;
pub mod executors;
pub mod history;
pub mod ledger;
pub mod lockout;
pub mod manual;
pub mod next_run;
pub mod persistence;
pub mod session;
pub mod state;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use build_queue::{BuildSite, PriorityQueueConsumer, QueueItem, RemoteBuildState, Resources};
pub use engine::{
    RunReport, ScheduleChange, SchedulerEngine, SchedulerStatus, TickOutcome, TriggerResult,
    spawn_scheduler,
};
pub use executors::{ConstructionQueueDriver, DriverSet, ExternalSyncDriver};
pub use history::{RunHistory, RunRecord};
pub use ledger::{
    ActionSender, DispatchLedger, DispatchRecord, DispatchStatus, PlannedAction, PlanningSource,
    SyncReport, fingerprint, run_sync_cycle,
};
pub use lockout::{LockoutRecord, LockoutRegistry, LockoutTransition};
pub use manual::{EnqueueReceipt, ManualTask, ManualTaskQueue, ManualTaskStatus};
pub use next_run::{NextRunRecord, NextRunRegistry};
pub use persistence::SchedulerDb;
pub use session::{SessionLock, SessionStatus};
pub use state::{Candidate, Claim, OrchestratorState, SessionGuard, SharedState};
pub use worker::{WorkerClient, WorkerDriver};

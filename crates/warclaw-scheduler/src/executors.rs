//! Concrete page drivers built on the ledger and queue patterns, plus the
//! per-kind driver table the engine dispatches through.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use warclaw_core::config::SyncConfig;
use warclaw_core::traits::PageDriver;
use warclaw_core::{DriverOutcome, ExecutionContext, Result, TaskKind, World};

use crate::build_queue::{BuildSite, PriorityQueueConsumer};
use crate::ledger::{
    ActionSender, DispatchLedger, DispatchRecord, PlanningSource, SyncReport, run_sync_cycle,
};
use crate::persistence::SchedulerDb;

/// One driver per task kind.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<TaskKind, Arc<dyn PageDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: TaskKind, driver: Arc<dyn PageDriver>) -> Self {
        self.insert(kind, driver);
        self
    }

    pub fn insert(&mut self, kind: TaskKind, driver: Arc<dyn PageDriver>) {
        tracing::debug!("🔌 Driver registered: {} → {}", kind, driver.name());
        self.drivers.insert(kind, driver);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn PageDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

/// `ExternalSync`: mirrors the external planner into sends, exactly once
/// per planned action.
pub struct ExternalSyncDriver {
    planner: Arc<dyn PlanningSource>,
    sender: Arc<dyn ActionSender>,
    db: Arc<SchedulerDb>,
    config: SyncConfig,
}

impl ExternalSyncDriver {
    pub fn new(
        planner: Arc<dyn PlanningSource>,
        sender: Arc<dyn ActionSender>,
        db: Arc<SchedulerDb>,
        config: SyncConfig,
    ) -> Self {
        Self {
            planner,
            sender,
            db,
            config,
        }
    }

    async fn cycle(&self, world: &World, ctx: &ExecutionContext) -> Result<SyncReport> {
        let mut ledger = DispatchLedger::from_records(self.db.load_dispatch_records(world.id)?);
        let due_field = self.config.due_field.as_str();
        let due_value = self.config.due_value.as_str();

        let result = run_sync_cycle(
            &mut ledger,
            self.planner.as_ref(),
            self.sender.as_ref(),
            world,
            ctx,
            |a| a.field(due_field) == Some(due_value),
            Duration::from_millis(self.config.pause_ms),
            |records: &[DispatchRecord]| self.db.save_dispatch_records(world.id, records),
        )
        .await;

        // Anything the cycle could not store gets one more try.
        let leftover = ledger.take_dirty();
        if leftover.is_empty() {
            return result;
        }
        match (result, self.db.save_dispatch_records(world.id, &leftover)) {
            (result, Ok(())) => result,
            (Ok(_), Err(save)) => Err(save),
            (Err(e), Err(save)) => {
                tracing::error!("❌ [{}] {} dispatch record(s) not stored: {}", world.code, leftover.len(), save);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PageDriver for ExternalSyncDriver {
    fn name(&self) -> &str {
        "external-sync"
    }

    async fn execute(&self, world: &World, ctx: &ExecutionContext) -> DriverOutcome {
        match self.cycle(world, ctx).await {
            Ok(report) => {
                let data = json!({
                    "observed": report.observed,
                    "created": report.created,
                    "sent": report.sent,
                    "failed": report.failed,
                    "cleared": report.cleared,
                });
                let outcome = if report.failed == 0 {
                    DriverOutcome::ok(data)
                } else {
                    DriverOutcome {
                        data,
                        ..DriverOutcome::failed(format!(
                            "{} of {} send(s) failed",
                            report.failed,
                            report.sent + report.failed
                        ))
                    }
                };
                outcome.with_items(report.items)
            }
            Err(e) => DriverOutcome::from_error(&e),
        }
    }
}

/// `ConstructionQueue`: feeds the local wish-list into the remote build
/// queue, one submission per run.
pub struct ConstructionQueueDriver {
    site: Arc<dyn BuildSite>,
    db: Arc<SchedulerDb>,
}

impl ConstructionQueueDriver {
    pub fn new(site: Arc<dyn BuildSite>, db: Arc<SchedulerDb>) -> Self {
        Self { site, db }
    }

    async fn run(&self, world: &World, ctx: &ExecutionContext) -> Result<DriverOutcome> {
        let wishlist = self.db.load_wishlist(world.id)?;
        if wishlist.is_empty() {
            return Ok(DriverOutcome::ok(json!({ "submitted": null, "remaining": 0 })));
        }

        let report = PriorityQueueConsumer::consume(self.site.as_ref(), world, ctx, &wishlist).await?;
        for item in &report.removed {
            self.db.remove_wishlist_item(world.id, item)?;
        }

        let data = json!({
            "submitted": report.submitted,
            "removed": report.removed.len(),
            "remaining": wishlist.len() - report.removed.len(),
        });
        let outcome = match &report.submit_error {
            None => DriverOutcome::ok(data),
            Some(e) => DriverOutcome {
                data,
                ..DriverOutcome::from_error(e)
            },
        };
        Ok(outcome.with_items(report.items))
    }
}

#[async_trait]
impl PageDriver for ConstructionQueueDriver {
    fn name(&self) -> &str {
        "construction-queue"
    }

    async fn execute(&self, world: &World, ctx: &ExecutionContext) -> DriverOutcome {
        self.run(world, ctx)
            .await
            .unwrap_or_else(|e| DriverOutcome::from_error(&e))
    }
}

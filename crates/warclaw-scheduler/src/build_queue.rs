//! Priority queue consumer: a local wish-list fed into a remote queue that
//! accepts about one submission per run.
//!
//! Remote state is re-read on every run and never cached. Items the remote
//! side already satisfies are pruned; of the rest, the first in priority
//! order that is both unlocked and affordable is submitted, then we stop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use warclaw_core::{ExecutionContext, ItemResult, Result, WarClawError, World};

/// Wish-list entry: bring `subject_id` up to `target_level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub subject_id: String,
    pub target_level: u32,
    /// Lower is more urgent.
    pub priority: i32,
}

impl QueueItem {
    pub fn new(subject_id: &str, target_level: u32, priority: i32) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            target_level,
            priority,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub wood: u64,
    pub clay: u64,
    pub iron: u64,
}

impl Resources {
    pub fn covers(&self, cost: &Resources) -> bool {
        self.wood >= cost.wood && self.clay >= cost.clay && self.iron >= cost.iron
    }
}

/// What the remote side offers to build next for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOffer {
    pub subject_id: String,
    pub next_level: u32,
    pub cost: Resources,
    #[serde(default = "default_true")]
    pub prerequisites_met: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteBuildState {
    #[serde(default)]
    pub levels: BTreeMap<String, u32>,
    /// Subjects currently sitting in the remote queue.
    #[serde(default)]
    pub queued: Vec<String>,
    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub offers: Vec<BuildOffer>,
}

fn default_capacity() -> usize {
    1
}

impl RemoteBuildState {
    pub fn level(&self, subject_id: &str) -> u32 {
        self.levels.get(subject_id).copied().unwrap_or(0)
    }

    pub fn is_queued(&self, subject_id: &str) -> bool {
        self.queued.iter().any(|s| s == subject_id)
    }

    pub fn queue_full(&self) -> bool {
        self.queued.len() >= self.queue_capacity
    }

    pub fn offer(&self, subject_id: &str) -> Option<&BuildOffer> {
        self.offers.iter().find(|o| o.subject_id == subject_id)
    }
}

/// Remote build screen.
#[async_trait]
pub trait BuildSite: Send + Sync {
    async fn read_state(&self, world: &World, ctx: &ExecutionContext) -> Result<RemoteBuildState>;
    async fn submit(&self, world: &World, ctx: &ExecutionContext, subject_id: &str) -> Result<()>;
}

/// Decision for one run, computed without side effects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildPlan {
    /// Already satisfied remotely; remove locally.
    pub satisfied: Vec<QueueItem>,
    /// Candidates passed over this run, with the reason.
    pub skipped: Vec<(QueueItem, String)>,
    pub choice: Option<QueueItem>,
}

#[derive(Debug, Default)]
pub struct ConsumeReport {
    /// Items to delete from the local wish-list.
    pub removed: Vec<QueueItem>,
    pub submitted: Option<QueueItem>,
    pub submit_error: Option<WarClawError>,
    pub items: Vec<ItemResult>,
}

pub struct PriorityQueueConsumer;

impl PriorityQueueConsumer {
    pub fn plan(items: &[QueueItem], remote: &RemoteBuildState) -> BuildPlan {
        let mut plan = BuildPlan::default();
        let mut open: Vec<&QueueItem> = Vec::new();
        for item in items {
            if remote.level(&item.subject_id) >= item.target_level {
                plan.satisfied.push(item.clone());
            } else {
                open.push(item);
            }
        }
        open.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });

        if remote.queue_full() {
            plan.skipped = open
                .into_iter()
                .map(|i| (i.clone(), "remote queue full".to_string()))
                .collect();
            return plan;
        }

        for item in open {
            if plan.choice.is_some() {
                break;
            }
            let reason = if remote.is_queued(&item.subject_id) {
                Some("already queued remotely")
            } else {
                match remote.offer(&item.subject_id) {
                    None => Some("not offered"),
                    Some(o) if !o.prerequisites_met => Some("prerequisites not met"),
                    Some(o) if !remote.resources.covers(&o.cost) => Some("not affordable"),
                    Some(_) => None,
                }
            };
            match reason {
                Some(r) => plan.skipped.push((item.clone(), r.to_string())),
                None => plan.choice = Some(item.clone()),
            }
        }
        plan
    }

    /// Read remote state, then submit at most one item.
    ///
    /// Only a failed read is an error; a failed submission lands in
    /// `submit_error` so pruned items are still reported for removal.
    pub async fn consume(
        site: &dyn BuildSite,
        world: &World,
        ctx: &ExecutionContext,
        items: &[QueueItem],
    ) -> Result<ConsumeReport> {
        let remote = site.read_state(world, ctx).await?;
        let plan = Self::plan(items, &remote);

        let mut report = ConsumeReport::default();
        for item in &plan.satisfied {
            report.items.push(ItemResult {
                label: format!("{} → {}", item.subject_id, item.target_level),
                ok: true,
                detail: Some("already satisfied".into()),
            });
        }
        report.removed = plan.satisfied;

        let Some(choice) = plan.choice else {
            tracing::debug!("🏗️ [{}] Nothing to submit ({} skipped)", world.code, plan.skipped.len());
            return Ok(report);
        };

        let label = format!("{} → {}", choice.subject_id, choice.target_level);
        match site.submit(world, ctx, &choice.subject_id).await {
            Ok(()) => {
                tracing::info!("🏗️ [{}] Submitted {}", world.code, label);
                report.items.push(ItemResult {
                    label,
                    ok: true,
                    detail: Some("submitted".into()),
                });
                report.removed.push(choice.clone());
                report.submitted = Some(choice);
            }
            Err(e) => {
                tracing::warn!("❌ [{}] Submission of {} failed: {}", world.code, label, e);
                report.items.push(ItemResult {
                    label,
                    ok: false,
                    detail: Some(e.to_string()),
                });
                report.submit_error = Some(e);
            }
        }
        Ok(report)
    }
}

//! Dispatch ledger: fingerprint-based dedup for sync-style executors.
//!
//! A remote planning source lists candidate actions and keeps listing the
//! same ones cycle after cycle until they are acted on. Each candidate is
//! keyed by a fingerprint over its immutable identifying fields only, so a
//! re-scrape never creates a second record and a `Sent` action is never sent
//! again. `Failed` is terminal: no automatic retry under uncertainty.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use warclaw_core::{ExecutionContext, ItemResult, Result, WarClawError, World};

/// One candidate action as scraped from the planning source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub source: String,
    pub target: String,
    /// Departure time as displayed, e.g. `2026-03-01 12:00:33`.
    pub departure: String,
    /// Labeled display columns (status, countdown, unit mix...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Row handle on the remote side, used for clearing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl PlannedAction {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.source, &self.target, &self.departure)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn label(&self) -> String {
        format!("{} → {} @ {}", self.source, self.target, self.departure)
    }
}

/// Truncate a departure time to minute precision: everything from the
/// second `:` on is dropped.
pub fn coarse_time_bucket(departure: &str) -> &str {
    match departure.match_indices(':').nth(1) {
        Some((idx, _)) => &departure[..idx],
        None => departure,
    }
}

/// Hex SHA-256 over the normalized identifying fields.
pub fn fingerprint(source: &str, target: &str, departure: &str) -> String {
    let key = format!(
        "{}|{}|{}",
        source.trim().to_lowercase(),
        target.trim().to_lowercase(),
        coarse_time_bucket(departure.trim()).to_lowercase()
    );
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DispatchStatus::Pending),
            "sent" => Some(DispatchStatus::Sent),
            "failed" => Some(DispatchStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub fingerprint: String,
    /// Latest scrape of the row, refreshed on every observation.
    pub raw_snapshot: serde_json::Value,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub cleared_upstream: bool,
}

/// In-memory view of one world's dispatch records. Changed records are
/// tracked so the caller can persist exactly those.
#[derive(Debug, Default)]
pub struct DispatchLedger {
    records: BTreeMap<String, DispatchRecord>,
    dirty: BTreeSet<String>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<DispatchRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.fingerprint.clone(), r))
                .collect(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&DispatchRecord> {
        self.records.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Upsert from a fresh scrape. Existing records only get their snapshot
    /// refreshed; status never changes here. Returns `(fingerprint, created)`.
    pub fn observe(&mut self, action: &PlannedAction, now: DateTime<Utc>) -> (String, bool) {
        let fp = action.fingerprint();
        let snapshot = serde_json::to_value(action).unwrap_or_default();
        let created = match self.records.get_mut(&fp) {
            Some(record) => {
                record.raw_snapshot = snapshot;
                false
            }
            None => {
                self.records.insert(
                    fp.clone(),
                    DispatchRecord {
                        fingerprint: fp.clone(),
                        raw_snapshot: snapshot,
                        status: DispatchStatus::Pending,
                        created_at: now,
                        sent_at: None,
                        failure_reason: None,
                        cleared_upstream: false,
                    },
                );
                true
            }
        };
        self.dirty.insert(fp.clone());
        (fp, created)
    }

    fn pending_mut(&mut self, fp: &str) -> Result<&mut DispatchRecord> {
        let record = self
            .records
            .get_mut(fp)
            .ok_or_else(|| WarClawError::NotFound(format!("dispatch record {fp}")))?;
        if record.status != DispatchStatus::Pending {
            return Err(WarClawError::InvalidState(format!(
                "dispatch record {fp} is already {}",
                record.status.as_str()
            )));
        }
        Ok(record)
    }

    pub fn mark_sent(&mut self, fp: &str, now: DateTime<Utc>) -> Result<()> {
        let record = self.pending_mut(fp)?;
        record.status = DispatchStatus::Sent;
        record.sent_at = Some(now);
        self.dirty.insert(fp.to_string());
        Ok(())
    }

    pub fn mark_failed(&mut self, fp: &str, reason: &str) -> Result<()> {
        let record = self.pending_mut(fp)?;
        record.status = DispatchStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        self.dirty.insert(fp.to_string());
        Ok(())
    }

    /// Pending records whose current row passes `is_due`, in fingerprint order.
    pub fn due_pending<F>(&self, actions: &[PlannedAction], is_due: F) -> Vec<(String, PlannedAction)>
    where
        F: Fn(&PlannedAction) -> bool,
    {
        let mut due: BTreeMap<String, PlannedAction> = BTreeMap::new();
        for action in actions.iter().filter(|a| is_due(a)) {
            let fp = action.fingerprint();
            if self
                .records
                .get(&fp)
                .is_some_and(|r| r.status == DispatchStatus::Pending)
            {
                due.entry(fp).or_insert_with(|| action.clone());
            }
        }
        due.into_iter().collect()
    }

    /// Sent, not yet cleared upstream, and still listed by the source.
    pub fn uncleared_matches(&self, actions: &[PlannedAction]) -> Vec<(String, PlannedAction)> {
        let mut matches: BTreeMap<String, PlannedAction> = BTreeMap::new();
        for action in actions {
            let fp = action.fingerprint();
            if self
                .records
                .get(&fp)
                .is_some_and(|r| r.status == DispatchStatus::Sent && !r.cleared_upstream)
            {
                matches.entry(fp).or_insert_with(|| action.clone());
            }
        }
        matches.into_iter().collect()
    }

    pub fn mark_cleared(&mut self, fp: &str) -> bool {
        match self.records.get_mut(fp) {
            Some(record) if !record.cleared_upstream => {
                record.cleared_upstream = true;
                self.dirty.insert(fp.to_string());
                true
            }
            _ => false,
        }
    }

    /// Records changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<DispatchRecord> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|fp| self.records.get(&fp).cloned())
            .collect()
    }
}

/// Remote planning source: lists candidate actions, drops them on request.
#[async_trait]
pub trait PlanningSource: Send + Sync {
    async fn fetch(&self, world: &World, ctx: &ExecutionContext) -> Result<Vec<PlannedAction>>;

    /// Ask the source to drop these rows. `Ok(true)` only on confirmation.
    async fn clear(
        &self,
        world: &World,
        ctx: &ExecutionContext,
        actions: &[PlannedAction],
    ) -> Result<bool>;
}

#[async_trait]
pub trait ActionSender: Send + Sync {
    async fn send(&self, world: &World, ctx: &ExecutionContext, action: &PlannedAction) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub observed: usize,
    pub created: usize,
    pub sent: usize,
    pub failed: usize,
    pub cleared: usize,
    pub items: Vec<ItemResult>,
}

/// Ask the source to drop sent rows it still lists.
async fn clear_pass(
    ledger: &mut DispatchLedger,
    planner: &dyn PlanningSource,
    world: &World,
    ctx: &ExecutionContext,
    actions: &[PlannedAction],
) -> Result<usize> {
    let matches = ledger.uncleared_matches(actions);
    if matches.is_empty() {
        return Ok(0);
    }
    let rows: Vec<PlannedAction> = matches.iter().map(|(_, a)| a.clone()).collect();
    match planner.clear(world, ctx, &rows).await {
        Ok(true) => Ok(matches
            .iter()
            .filter(|(fp, _)| ledger.mark_cleared(fp))
            .count()),
        Ok(false) => {
            tracing::warn!("⚠️ [{}] Planning source did not confirm clearing {} row(s)", world.code, rows.len());
            Ok(0)
        }
        Err(e) if e.is_bot_protection() => Err(e),
        Err(e) => {
            tracing::warn!("⚠️ [{}] Clearing sent rows failed: {}", world.code, e);
            Ok(0)
        }
    }
}

/// Hand changed records to `persist`. They stay dirty if it fails.
fn flush<P>(ledger: &mut DispatchLedger, persist: &mut P) -> Result<()>
where
    P: FnMut(&[DispatchRecord]) -> Result<()>,
{
    let dirty = ledger.take_dirty();
    if dirty.is_empty() {
        return Ok(());
    }
    persist(&dirty).inspect_err(|_| {
        ledger
            .dirty
            .extend(dirty.iter().map(|r| r.fingerprint.clone()));
    })
}

/// One full sync cycle for one world.
///
/// Every status change goes through `persist` before the next send, so a
/// cycle cancelled between sends never forgets a `Sent`. Bot protection
/// aborts the cycle with that error after the in-flight record is marked
/// failed, even if storing the failure does not work.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync_cycle<F, P>(
    ledger: &mut DispatchLedger,
    planner: &dyn PlanningSource,
    sender: &dyn ActionSender,
    world: &World,
    ctx: &ExecutionContext,
    is_due: F,
    pause: Duration,
    mut persist: P,
) -> Result<SyncReport>
where
    F: Fn(&PlannedAction) -> bool,
    P: FnMut(&[DispatchRecord]) -> Result<()>,
{
    let mut report = SyncReport::default();

    let actions = planner.fetch(world, ctx).await?;
    report.cleared += clear_pass(ledger, planner, world, ctx, &actions).await?;

    let now = Utc::now();
    for action in &actions {
        let (_, created) = ledger.observe(action, now);
        report.observed += 1;
        if created {
            report.created += 1;
        }
    }
    flush(ledger, &mut persist)?;

    let due = ledger.due_pending(&actions, is_due);
    for (i, (fp, action)) in due.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        match sender.send(world, ctx, action).await {
            Ok(()) => {
                ledger.mark_sent(fp, Utc::now())?;
                flush(ledger, &mut persist)?;
                report.sent += 1;
                report.items.push(ItemResult {
                    label: action.label(),
                    ok: true,
                    detail: None,
                });
                tracing::info!("📤 [{}] Sent {}", world.code, action.label());
            }
            Err(e) => {
                ledger.mark_failed(fp, &e.to_string())?;
                report.failed += 1;
                report.items.push(ItemResult {
                    label: action.label(),
                    ok: false,
                    detail: Some(e.to_string()),
                });
                tracing::warn!("❌ [{}] Send failed for {}: {}", world.code, action.label(), e);
                if e.is_bot_protection() {
                    if let Err(save) = flush(ledger, &mut persist) {
                        tracing::error!("❌ [{}] Could not store failed send: {}", world.code, save);
                    }
                    return Err(e);
                }
                flush(ledger, &mut persist)?;
            }
        }
    }

    if report.sent > 0 {
        let refreshed = planner.fetch(world, ctx).await?;
        report.cleared += clear_pass(ledger, planner, world, ctx, &refreshed).await?;
        flush(ledger, &mut persist)?;
    }

    tracing::info!(
        "🔁 [{}] Sync cycle: {} observed, {} new, {} sent, {} failed, {} cleared",
        world.code,
        report.observed,
        report.created,
        report.sent,
        report.failed,
        report.cleared
    );
    Ok(report)
}

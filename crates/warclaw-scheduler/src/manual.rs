//! Manual task queue: ad-hoc requests competing for the same session.
//!
//! Tasks are drained by the scheduler's normal selection; there is no
//! separate execution path. Status only moves forward:
//! `Pending → Executing → Completed | Failed`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use warclaw_core::{DriverOutcome, Result, TaskKind, WarClawError, WorldId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualTaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ManualTaskStatus {
    fn rank(&self) -> u8 {
        match self {
            ManualTaskStatus::Pending => 0,
            ManualTaskStatus::Executing => 1,
            ManualTaskStatus::Completed | ManualTaskStatus::Failed => 2,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.rank() == 2
    }

    /// Forward-only transitions.
    pub fn can_transition_to(&self, next: ManualTaskStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManualTaskStatus::Pending => "pending",
            ManualTaskStatus::Executing => "executing",
            ManualTaskStatus::Completed => "completed",
            ManualTaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ManualTaskStatus::Pending),
            "executing" => Some(ManualTaskStatus::Executing),
            "completed" => Some(ManualTaskStatus::Completed),
            "failed" => Some(ManualTaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualTask {
    pub id: String,
    pub kind: TaskKind,
    pub world_id: WorldId,
    pub payload: serde_json::Value,
    pub status: ManualTaskStatus,
    pub queued_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Driver data of the finished run.
    pub result: Option<serde_json::Value>,
}

/// Returned to the caller of `enqueue`.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub task_id: String,
    /// 1-based count of Pending tasks, this one included.
    pub queue_position: usize,
    pub estimated_wait_secs: u64,
}

#[derive(Debug, Default)]
pub struct ManualTaskQueue {
    tasks: VecDeque<ManualTask>,
}

impl ManualTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task due now.
    ///
    /// The wait estimate is zero while the session is free, otherwise
    /// `position × average_task_secs`.
    pub fn enqueue(
        &mut self,
        kind: TaskKind,
        world_id: WorldId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
        session_busy: bool,
        average_task_secs: u64,
    ) -> EnqueueReceipt {
        let task = ManualTask {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            world_id,
            payload,
            status: ManualTaskStatus::Pending,
            queued_at: now,
            scheduled_for: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };
        let task_id = task.id.clone();
        self.tasks.push_back(task);

        let queue_position = self.pending_count();
        let estimated_wait_secs = if session_busy {
            queue_position as u64 * average_task_secs
        } else {
            0
        };
        tracing::info!(
            "📥 Manual task queued: {} for world {} ({}), position {}",
            kind,
            world_id,
            task_id,
            queue_position
        );
        EnqueueReceipt {
            task_id,
            queue_position,
            estimated_wait_secs,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ManualTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &ManualTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == ManualTaskStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn transition(
        &mut self,
        id: &str,
        next: ManualTaskStatus,
    ) -> Result<&mut ManualTask> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| WarClawError::NotFound(format!("manual task {id}")))?;
        if !task.status.can_transition_to(next) {
            return Err(WarClawError::InvalidState(format!(
                "manual task {id}: {} → {}",
                task.status.as_str(),
                next.as_str()
            )));
        }
        task.status = next;
        Ok(task)
    }

    pub fn mark_executing(&mut self, id: &str, now: DateTime<Utc>) -> Result<ManualTask> {
        let task = self.transition(id, ManualTaskStatus::Executing)?;
        task.started_at = Some(now);
        Ok(task.clone())
    }

    /// Finalize from the driver outcome.
    pub fn finish(
        &mut self,
        id: &str,
        outcome: &DriverOutcome,
        now: DateTime<Utc>,
    ) -> Result<ManualTask> {
        let next = if outcome.success {
            ManualTaskStatus::Completed
        } else {
            ManualTaskStatus::Failed
        };
        let task = self.transition(id, next)?;
        task.completed_at = Some(now);
        task.error = outcome.error.clone();
        task.result = Some(outcome.data.clone());
        Ok(task.clone())
    }

    /// Evict finished tasks past the TTL, then the oldest finished ones
    /// beyond `max_retained`. Pending and executing tasks are never evicted.
    pub fn evict(&mut self, now: DateTime<Utc>, ttl_secs: u64, max_retained: usize) -> Vec<String> {
        let cutoff = now - Duration::seconds(ttl_secs as i64);
        let mut evicted = Vec::new();
        self.tasks.retain(|t| {
            let expired = t.status.is_finished() && t.completed_at.is_some_and(|c| c < cutoff);
            if expired {
                evicted.push(t.id.clone());
            }
            !expired
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_finished())
            .map(|t| (t.completed_at.unwrap_or(t.queued_at), t.id.clone()))
            .collect();
        if finished.len() > max_retained {
            finished.sort();
            let overflow = finished.len() - max_retained;
            let excess: Vec<String> = finished
                .into_iter()
                .take(overflow)
                .map(|(_, id)| id)
                .collect();
            self.tasks.retain(|t| !excess.contains(&t.id));
            evicted.extend(excess);
        }

        if !evicted.is_empty() {
            tracing::debug!("🧹 Evicted {} finished manual task(s)", evicted.len());
        }
        evicted
    }

    /// Load persisted tasks at startup. Tasks caught mid-run by a restart are
    /// finalized as failed; returns those so the caller can persist them.
    pub fn restore(&mut self, tasks: Vec<ManualTask>, now: DateTime<Utc>) -> Vec<ManualTask> {
        let mut interrupted = Vec::new();
        for mut task in tasks {
            if task.status == ManualTaskStatus::Executing {
                task.status = ManualTaskStatus::Failed;
                task.completed_at = Some(now);
                task.error = Some("Interrupted by restart".into());
                interrupted.push(task.clone());
            }
            self.tasks.push_back(task);
        }
        self.tasks.make_contiguous().sort_by_key(|t| t.queued_at);
        interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(n: usize, busy: bool) -> (ManualTaskQueue, Vec<EnqueueReceipt>) {
        let mut q = ManualTaskQueue::new();
        let now = Utc::now();
        let receipts = (0..n)
            .map(|i| {
                q.enqueue(
                    TaskKind::MiniAttacks,
                    i as WorldId,
                    serde_json::Value::Null,
                    now,
                    busy,
                    90,
                )
            })
            .collect();
        (q, receipts)
    }

    #[test]
    fn test_positions_increase_while_busy() {
        let (_, receipts) = queue_with(4, true);
        let positions: Vec<usize> = receipts.iter().map(|r| r.queue_position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert_eq!(receipts[2].estimated_wait_secs, 270);
    }

    #[test]
    fn test_free_session_means_no_wait() {
        let (_, receipts) = queue_with(1, false);
        assert_eq!(receipts[0].queue_position, 1);
        assert_eq!(receipts[0].estimated_wait_secs, 0);
    }

    #[test]
    fn test_status_moves_forward_only() {
        let (mut q, receipts) = queue_with(1, false);
        let id = &receipts[0].task_id;
        let now = Utc::now();

        assert!(q.finish(id, &DriverOutcome::ok(serde_json::Value::Null), now).is_err());
        q.mark_executing(id, now).unwrap();
        assert!(q.mark_executing(id, now).is_err());

        let done = q.finish(id, &DriverOutcome::failed("boom"), now).unwrap();
        assert_eq!(done.status, ManualTaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("boom"));
        assert!(done.completed_at.is_some());

        assert!(q.mark_executing(id, now).is_err());
        assert!(q.finish(id, &DriverOutcome::ok(serde_json::Value::Null), now).is_err());
        assert_eq!(q.get(id).unwrap().status, ManualTaskStatus::Failed);
    }

    #[test]
    fn test_pending_count_excludes_started() {
        let (mut q, receipts) = queue_with(3, true);
        q.mark_executing(&receipts[0].task_id, Utc::now()).unwrap();
        assert_eq!(q.pending_count(), 2);
        let next = q.enqueue(TaskKind::Scavenging, 9, serde_json::Value::Null, Utc::now(), true, 10);
        assert_eq!(next.queue_position, 3);
    }

    #[test]
    fn test_evict_by_ttl() {
        let (mut q, receipts) = queue_with(2, false);
        let long_ago = Utc::now() - Duration::hours(48);
        q.mark_executing(&receipts[0].task_id, long_ago).unwrap();
        q.finish(&receipts[0].task_id, &DriverOutcome::ok(serde_json::Value::Null), long_ago)
            .unwrap();

        let evicted = q.evict(Utc::now(), 24 * 3600, 100);
        assert_eq!(evicted, vec![receipts[0].task_id.clone()]);
        assert!(q.get(&receipts[1].task_id).is_some());
    }

    #[test]
    fn test_evict_oldest_beyond_max() {
        let (mut q, receipts) = queue_with(4, false);
        let base = Utc::now() - Duration::minutes(10);
        for (i, r) in receipts.iter().take(3).enumerate() {
            let at = base + Duration::minutes(i as i64);
            q.mark_executing(&r.task_id, at).unwrap();
            q.finish(&r.task_id, &DriverOutcome::ok(serde_json::Value::Null), at)
                .unwrap();
        }

        let evicted = q.evict(Utc::now(), 24 * 3600, 1);
        assert_eq!(
            evicted,
            vec![receipts[0].task_id.clone(), receipts[1].task_id.clone()]
        );
        assert_eq!(q.len(), 2);
        assert!(q.get(&receipts[2].task_id).is_some());
        assert!(q.get(&receipts[3].task_id).is_some());
    }

    #[test]
    fn test_restore_fails_interrupted_tasks() {
        let (mut q, receipts) = queue_with(2, false);
        q.mark_executing(&receipts[0].task_id, Utc::now()).unwrap();
        let snapshot: Vec<ManualTask> = [&receipts[0], &receipts[1]]
            .iter()
            .map(|r| q.get(&r.task_id).unwrap().clone())
            .collect();

        let mut restored = ManualTaskQueue::new();
        let interrupted = restored.restore(snapshot, Utc::now());
        assert_eq!(interrupted.len(), 1);
        assert_eq!(
            restored.get(&receipts[0].task_id).unwrap().status,
            ManualTaskStatus::Failed
        );
        assert_eq!(restored.pending_count(), 1);
    }
}

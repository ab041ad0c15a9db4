//! Run history: the last N finished runs, for the status view.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use warclaw_core::{TaskKind, WorldId};

const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub world_id: WorldId,
    pub kind: TaskKind,
    pub manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub bot_protection: bool,
    pub configuration_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds().max(0)
    }
}

/// In-memory ring buffer, newest last.
#[derive(Debug, Default)]
pub struct RunHistory {
    runs: VecDeque<RunRecord>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, run: RunRecord) {
        self.runs.push_back(run);
        while self.runs.len() > MAX_HISTORY {
            self.runs.pop_front();
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<RunRecord> {
        self.runs.iter().rev().take(limit).cloned().collect()
    }

    pub fn last(&self) -> Option<&RunRecord> {
        self.runs.back()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(world_id: WorldId) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            world_id,
            kind: TaskKind::Scavenging,
            manual: false,
            task_id: None,
            started_at: now,
            finished_at: now,
            success: true,
            bot_protection: false,
            configuration_error: false,
            error: None,
        }
    }

    #[test]
    fn test_ring_buffer_caps_at_100() {
        let mut history = RunHistory::new();
        for i in 0..150 {
            history.record(run(i));
        }
        assert_eq!(history.len(), 100);
        assert_eq!(history.last().unwrap().world_id, 149);
        assert_eq!(history.recent(2)[1].world_id, 148);
    }
}

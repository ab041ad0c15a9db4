//! Next-run bookkeeping: one due time per enabled (world, kind) pair.
//!
//! Due times are jittered: after every run (success or failure) the next one
//! is drawn uniformly from `[now + min, now + max]` so runs never settle into
//! a detectable rhythm.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use warclaw_core::{IntervalBounds, TaskKind, WorldId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextRunRecord {
    pub world_id: WorldId,
    pub kind: TaskKind,
    pub due_at: DateTime<Utc>,
}

impl NextRunRecord {
    /// Ordering used everywhere a schedule is listed or selected from.
    fn sort_key(&self) -> (DateTime<Utc>, u8, WorldId) {
        (self.due_at, self.kind.priority(), self.world_id)
    }
}

/// Draw `now + uniform(min, max)` at second resolution.
pub fn draw_due_at<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    bounds: IntervalBounds,
    rng: &mut R,
) -> DateTime<Utc> {
    let (min, max) = bounds.as_seconds();
    now + Duration::seconds(rng.gen_range(min..=max))
}

#[derive(Debug, Default)]
pub struct NextRunRegistry {
    records: BTreeMap<(WorldId, TaskKind), NextRunRecord>,
}

impl NextRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, world_id: WorldId, kind: TaskKind) -> Option<&NextRunRecord> {
        self.records.get(&(world_id, kind))
    }

    pub fn contains(&self, world_id: WorldId, kind: TaskKind) -> bool {
        self.records.contains_key(&(world_id, kind))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Set an explicit due time, replacing any existing record.
    pub fn schedule(&mut self, world_id: WorldId, kind: TaskKind, due_at: DateTime<Utc>) {
        self.records.insert(
            (world_id, kind),
            NextRunRecord {
                world_id,
                kind,
                due_at,
            },
        );
    }

    /// Recompute the due time after a run of this pair.
    pub fn reschedule_after_run<R: Rng + ?Sized>(
        &mut self,
        world_id: WorldId,
        kind: TaskKind,
        bounds: IntervalBounds,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let due_at = draw_due_at(now, bounds, rng);
        self.schedule(world_id, kind, due_at);
        due_at
    }

    /// Create a near-term first run for a freshly enabled pair.
    /// Returns the new due time, or `None` if the pair was already scheduled.
    pub fn schedule_first_run<R: Rng + ?Sized>(
        &mut self,
        world_id: WorldId,
        kind: TaskKind,
        now: DateTime<Utc>,
        max_delay_secs: u64,
        rng: &mut R,
    ) -> Option<DateTime<Utc>> {
        if self.contains(world_id, kind) {
            return None;
        }
        let delay = rng.gen_range(0..=max_delay_secs as i64);
        let due_at = now + Duration::seconds(delay);
        self.schedule(world_id, kind, due_at);
        Some(due_at)
    }

    pub fn remove(&mut self, world_id: WorldId, kind: TaskKind) -> bool {
        self.records.remove(&(world_id, kind)).is_some()
    }

    /// Drop every record of worlds not in `keep`.
    pub fn retain_worlds(&mut self, keep: impl Fn(WorldId) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|(world_id, _), _| keep(*world_id));
        before - self.records.len()
    }

    /// Records due at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> impl Iterator<Item = &NextRunRecord> {
        self.records.values().filter(move |r| r.due_at <= now)
    }

    /// The next `n` records by due time. Pure read.
    pub fn upcoming(&self, n: usize) -> Vec<NextRunRecord> {
        let mut all: Vec<&NextRunRecord> = self.records.values().collect();
        all.sort_by_key(|r| r.sort_key());
        all.into_iter().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        let bounds = IntervalBounds::new(10, 15);
        let draws: Vec<DateTime<Utc>> = (0..1000)
            .map(|_| draw_due_at(now, bounds, &mut rng))
            .collect();

        for due in &draws {
            assert!(*due >= now + Duration::minutes(10));
            assert!(*due <= now + Duration::minutes(15));
        }
        assert!(draws.iter().any(|d| *d != draws[0]));
    }

    #[test]
    fn test_degenerate_bounds() {
        let mut rng = rand::thread_rng();
        let now = Utc::now();
        let due = draw_due_at(now, IntervalBounds::new(5, 5), &mut rng);
        assert_eq!(due, now + Duration::minutes(5));
    }

    #[test]
    fn test_first_run_is_near_term_and_not_duplicated() {
        let mut reg = NextRunRegistry::new();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Utc::now();
        let due = reg
            .schedule_first_run(1, TaskKind::Scavenging, now, 30, &mut rng)
            .unwrap();
        assert!(due >= now && due <= now + Duration::seconds(30));
        assert!(reg
            .schedule_first_run(1, TaskKind::Scavenging, now, 30, &mut rng)
            .is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_due_and_remove() {
        let mut reg = NextRunRegistry::new();
        let now = Utc::now();
        reg.schedule(1, TaskKind::Scavenging, now - Duration::minutes(1));
        reg.schedule(2, TaskKind::Scavenging, now + Duration::minutes(1));
        assert_eq!(reg.due(now).count(), 1);

        assert!(reg.remove(1, TaskKind::Scavenging));
        assert!(!reg.remove(1, TaskKind::Scavenging));
        assert_eq!(reg.due(now).count(), 0);
    }

    #[test]
    fn test_upcoming_sorted_and_pure() {
        let mut reg = NextRunRegistry::new();
        let now = Utc::now();
        reg.schedule(2, TaskKind::MiniAttacks, now + Duration::minutes(5));
        reg.schedule(1, TaskKind::ExternalSync, now + Duration::minutes(1));
        reg.schedule(3, TaskKind::Scavenging, now + Duration::minutes(1));
        reg.schedule(4, TaskKind::ArmyTraining, now + Duration::minutes(9));

        let next = reg.upcoming(3);
        assert_eq!(next.len(), 3);
        // Same instant: kind priority decides.
        assert_eq!(next[0].world_id, 3);
        assert_eq!(next[1].world_id, 1);
        assert_eq!(next[2].world_id, 2);
        assert_eq!(reg.len(), 4);
        assert_eq!(reg.upcoming(10).len(), 4);
    }

    #[test]
    fn test_retain_worlds() {
        let mut reg = NextRunRegistry::new();
        let now = Utc::now();
        reg.schedule(1, TaskKind::Scavenging, now);
        reg.schedule(1, TaskKind::MiniAttacks, now);
        reg.schedule(2, TaskKind::Scavenging, now);
        assert_eq!(reg.retain_worlds(|id| id == 2), 2);
        assert!(reg.contains(2, TaskKind::Scavenging));
    }
}

//! Lockout registry: per-world circuit breaker for bot-protection hits.
//!
//! `Clear → Blocked` on any run reporting detection, `Blocked → Clear` on the
//! next run for that world that reaches the site and finishes without it.
//! Only automatic selection consults the registry; manual runs bypass it
//! but still feed their outcome back here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use warclaw_core::{TaskKind, WorldId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockoutRecord {
    pub world_id: WorldId,
    pub detected_at: DateTime<Utc>,
    /// Kind of the run that tripped the breaker.
    pub kind: TaskKind,
    pub reason: Option<String>,
}

/// What a run outcome did to a world's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutTransition {
    Blocked,
    StillBlocked,
    Cleared,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct LockoutRegistry {
    records: BTreeMap<WorldId, LockoutRecord>,
}

impl LockoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, world_id: WorldId) -> bool {
        self.records.contains_key(&world_id)
    }

    pub fn get(&self, world_id: WorldId) -> Option<&LockoutRecord> {
        self.records.get(&world_id)
    }

    pub fn list(&self) -> Vec<LockoutRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Feed one run outcome into the breaker.
    ///
    /// `reached_site` is false for runs that never touched the site (missing
    /// credentials, no driver, timeouts); those carry no evidence either way.
    pub fn apply(
        &mut self,
        world_id: WorldId,
        kind: TaskKind,
        detected: bool,
        reached_site: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> LockoutTransition {
        if detected {
            let previous = self.records.insert(
                world_id,
                LockoutRecord {
                    world_id,
                    detected_at: now,
                    kind,
                    reason: reason.map(str::to_string),
                },
            );
            return if previous.is_some() {
                tracing::warn!("🛑 World {} still flagged by bot protection ({})", world_id, kind);
                LockoutTransition::StillBlocked
            } else {
                tracing::warn!(
                    "🛑 World {} locked out: bot protection detected during {}",
                    world_id,
                    kind
                );
                LockoutTransition::Blocked
            };
        }

        if reached_site && self.records.remove(&world_id).is_some() {
            tracing::info!("✅ World {} lockout cleared after clean {} run", world_id, kind);
            return LockoutTransition::Cleared;
        }
        LockoutTransition::Unchanged
    }

    /// Operator override.
    pub fn clear(&mut self, world_id: WorldId) -> bool {
        self.records.remove(&world_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_then_clear() {
        let mut reg = LockoutRegistry::new();
        let now = Utc::now();
        assert_eq!(
            reg.apply(3, TaskKind::Scavenging, true, true, Some("captcha"), now),
            LockoutTransition::Blocked
        );
        assert!(reg.is_locked(3));
        assert_eq!(reg.get(3).unwrap().reason.as_deref(), Some("captcha"));

        assert_eq!(
            reg.apply(3, TaskKind::MiniAttacks, true, true, None, now),
            LockoutTransition::StillBlocked
        );
        assert_eq!(
            reg.apply(3, TaskKind::MiniAttacks, false, true, None, now),
            LockoutTransition::Cleared
        );
        assert!(!reg.is_locked(3));
    }

    #[test]
    fn test_run_without_site_contact_keeps_lockout() {
        let mut reg = LockoutRegistry::new();
        let now = Utc::now();
        reg.apply(5, TaskKind::ArmyTraining, true, true, None, now);
        assert_eq!(
            reg.apply(5, TaskKind::ArmyTraining, false, false, None, now),
            LockoutTransition::Unchanged
        );
        assert!(reg.is_locked(5));
    }

    #[test]
    fn test_clean_run_on_clear_world_is_noop() {
        let mut reg = LockoutRegistry::new();
        assert_eq!(
            reg.apply(1, TaskKind::Scavenging, false, true, None, Utc::now()),
            LockoutTransition::Unchanged
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_lockouts_are_per_world() {
        let mut reg = LockoutRegistry::new();
        reg.apply(1, TaskKind::Scavenging, true, true, None, Utc::now());
        assert!(reg.is_locked(1));
        assert!(!reg.is_locked(2));
        assert!(reg.clear(1));
        assert!(!reg.clear(1));
    }
}

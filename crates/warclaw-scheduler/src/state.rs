//! Orchestrator state: every mutable registry behind one coarse guard.
//!
//! The guard is a `std::sync::Mutex` and is never held across an `.await`:
//! callers lock, mutate, unlock. Candidate selection and session acquisition
//! happen inside a single critical section so the busy check cannot race.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use warclaw_core::{TaskKind, World, WorldId};

use crate::history::RunHistory;
use crate::lockout::LockoutRegistry;
use crate::manual::{ManualTask, ManualTaskQueue};
use crate::next_run::NextRunRegistry;
use crate::session::{AcquireToken, SessionLock, SessionStatus};

#[derive(Debug, Default)]
pub struct OrchestratorState {
    pub session: SessionLock,
    pub lockouts: LockoutRegistry,
    pub next_runs: NextRunRegistry,
    pub manual: ManualTaskQueue,
    pub history: RunHistory,
}

pub type SharedState = Arc<Mutex<OrchestratorState>>;

/// Lock the shared state. A panic elsewhere never wedges the scheduler:
/// every mutation below leaves the registries consistent between statements.
pub fn lock_state(state: &SharedState) -> MutexGuard<'_, OrchestratorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A unit of work eligible to take the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Manual {
        task_id: String,
        world_id: WorldId,
        kind: TaskKind,
        due_at: DateTime<Utc>,
    },
    Scheduled {
        world_id: WorldId,
        kind: TaskKind,
        due_at: DateTime<Utc>,
    },
}

impl Candidate {
    pub fn world_id(&self) -> WorldId {
        match self {
            Candidate::Manual { world_id, .. } | Candidate::Scheduled { world_id, .. } => *world_id,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Candidate::Manual { kind, .. } | Candidate::Scheduled { kind, .. } => *kind,
        }
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        match self {
            Candidate::Manual { due_at, .. } | Candidate::Scheduled { due_at, .. } => *due_at,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Candidate::Manual { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Candidate::Manual { task_id, .. } => Some(task_id),
            Candidate::Scheduled { .. } => None,
        }
    }

    /// Earliest due first; on ties manual before scheduled, then kind
    /// priority, then world id.
    fn sort_key(&self) -> (DateTime<Utc>, u8, u8, WorldId) {
        (
            self.due_at(),
            if self.is_manual() { 0 } else { 1 },
            self.kind().priority(),
            self.world_id(),
        )
    }
}

/// The work a successful claim bound to its guard.
#[derive(Debug, Clone)]
pub struct Claim {
    pub candidate: Candidate,
    /// Snapshot of the manual task after it moved to `Executing`.
    pub manual_task: Option<ManualTask>,
}

impl OrchestratorState {
    /// Pick the next unit of work, or `None` if nothing is eligible.
    ///
    /// Scheduled records must be due, belong to a world that is active with
    /// the feature enabled, and not be locked out. Pending manual tasks are
    /// always eligible.
    pub fn select(&self, worlds: &HashMap<WorldId, World>, now: DateTime<Utc>) -> Option<Candidate> {
        let scheduled = self
            .next_runs
            .due(now)
            .filter(|r| {
                worlds
                    .get(&r.world_id)
                    .is_some_and(|w| w.schedulable(r.kind))
            })
            .filter(|r| !self.lockouts.is_locked(r.world_id))
            .map(|r| Candidate::Scheduled {
                world_id: r.world_id,
                kind: r.kind,
                due_at: r.due_at,
            });

        let manual = self
            .manual
            .pending()
            .filter(|t| t.scheduled_for <= now)
            .map(|t| Candidate::Manual {
                task_id: t.id.clone(),
                world_id: t.world_id,
                kind: t.kind,
                due_at: t.scheduled_for,
            });

        scheduled.chain(manual).min_by_key(|c| c.sort_key())
    }

    pub fn session_status(&self, now: DateTime<Utc>) -> Option<SessionStatus> {
        self.session.status(now)
    }
}

/// Holds the session for one run. Releases on `finish` or, failing that,
/// on drop so no early return or panic leaves the lock held.
#[derive(Debug)]
pub struct SessionGuard {
    state: SharedState,
    token: Option<AcquireToken>,
}

impl SessionGuard {
    /// Select and acquire in one critical section.
    pub fn claim_next(
        state: &SharedState,
        worlds: &HashMap<WorldId, World>,
        now: DateTime<Utc>,
    ) -> Option<(SessionGuard, Claim)> {
        let mut st = lock_state(state);
        if st.session.is_held() {
            return None;
        }
        let candidate = st.select(worlds, now)?;
        let token = st.session.try_acquire(
            candidate.world_id(),
            candidate.kind(),
            candidate.is_manual(),
            now,
        )?;

        let manual_task = match candidate.task_id() {
            Some(id) => match st.manual.mark_executing(id, now) {
                Ok(task) => Some(task),
                Err(e) => {
                    st.session.release(token);
                    tracing::warn!("⚠️ Manual task {} could not start: {}", id, e);
                    return None;
                }
            },
            None => None,
        };
        drop(st);

        Some((
            SessionGuard {
                state: state.clone(),
                token: Some(token),
            },
            Claim {
                candidate,
                manual_task,
            },
        ))
    }

    /// Acquire for a specific pair, bypassing selection.
    /// On contention returns the current holder.
    pub fn try_begin(
        state: &SharedState,
        world_id: WorldId,
        kind: TaskKind,
        now: DateTime<Utc>,
    ) -> std::result::Result<SessionGuard, Option<SessionStatus>> {
        let mut st = lock_state(state);
        match st.session.try_acquire(world_id, kind, true, now) {
            Some(token) => Ok(SessionGuard {
                state: state.clone(),
                token: Some(token),
            }),
            None => Err(st.session.status(now)),
        }
    }

    /// Apply the run's bookkeeping and release the session atomically.
    pub fn finish<T>(mut self, apply: impl FnOnce(&mut OrchestratorState) -> T) -> T {
        let token = self.token.take();
        let mut st = lock_state(&self.state);
        let out = apply(&mut st);
        if let Some(token) = token {
            st.session.release(token);
        }
        out
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take()
            && lock_state(&self.state).session.release(token)
        {
            tracing::warn!("⚠️ Session released without bookkeeping (run aborted)");
        }
    }
}

//! Session lock: process-wide mutual exclusion over the one automation session.
//!
//! Non-blocking: callers that fail to acquire simply defer. Each successful
//! acquire hands out a token; `release` only clears the holder that token
//! belongs to, so a late or repeated release can never free a newer holder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use warclaw_core::{TaskKind, WorldId};

/// Proof of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireToken(u64);

/// Who is driving the session right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHolder {
    pub world_id: WorldId,
    pub kind: TaskKind,
    pub manual: bool,
    pub started_at: DateTime<Utc>,
}

/// Observability view of the lock.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub world_id: WorldId,
    pub kind: TaskKind,
    pub manual: bool,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
}

#[derive(Debug, Default)]
pub struct SessionLock {
    holder: Option<(AcquireToken, SessionHolder)>,
    next_token: u64,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session if it is free. Never waits.
    pub fn try_acquire(
        &mut self,
        world_id: WorldId,
        kind: TaskKind,
        manual: bool,
        now: DateTime<Utc>,
    ) -> Option<AcquireToken> {
        if self.holder.is_some() {
            return None;
        }
        self.next_token += 1;
        let token = AcquireToken(self.next_token);
        self.holder = Some((
            token,
            SessionHolder {
                world_id,
                kind,
                manual,
                started_at: now,
            },
        ));
        tracing::debug!("🔒 Session acquired: world {} / {}", world_id, kind);
        Some(token)
    }

    /// Release the session held under `token`. Idempotent.
    /// Returns whether this call actually freed the lock.
    pub fn release(&mut self, token: AcquireToken) -> bool {
        match &self.holder {
            Some((held, holder)) if *held == token => {
                tracing::debug!(
                    "🔓 Session released: world {} / {}",
                    holder.world_id,
                    holder.kind
                );
                self.holder = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    pub fn holder(&self) -> Option<&SessionHolder> {
        self.holder.as_ref().map(|(_, h)| h)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Option<SessionStatus> {
        self.holder().map(|h| SessionStatus {
            world_id: h.world_id,
            kind: h.kind,
            manual: h.manual,
            started_at: h.started_at,
            duration_secs: (now - h.started_at).num_seconds().max(0),
        })
    }
}

//! SQLite-backed persistence for manual tasks, dispatch fingerprints and
//! build wish-lists. Survives restarts; next-run and lockout state do not
//! need to and are rebuilt from settings.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use warclaw_core::{Result, TaskKind, WarClawError, WorldId};

use crate::build_queue::QueueItem;
use crate::ledger::{DispatchRecord, DispatchStatus};
use crate::manual::{ManualTask, ManualTaskStatus};

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> WarClawError + '_ {
    move |e| WarClawError::Database(format!("{context}: {e}"))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WarClawError::Database(format!("Lock: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS manual_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                world_id INTEGER NOT NULL,
                payload TEXT NOT NULL DEFAULT 'null',  -- JSON
                status TEXT NOT NULL DEFAULT 'pending',
                queued_at TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                result TEXT                              -- JSON
            );

            -- One row per logical planned action, per world
            CREATE TABLE IF NOT EXISTS dispatch_fingerprints (
                world_id INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                raw_snapshot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, sent, failed
                created_at TEXT NOT NULL,
                sent_at TEXT,
                failure_reason TEXT,
                cleared_upstream INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (world_id, fingerprint)
            );

            CREATE TABLE IF NOT EXISTS build_wishlist (
                world_id INTEGER NOT NULL,
                subject_id TEXT NOT NULL,
                target_level INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (world_id, subject_id, target_level)
            );
         ",
            )
            .map_err(db_err("Migration"))
    }

    // ─── Manual tasks ─────────────────────────────────────────

    pub fn save_manual_task(&self, task: &ManualTask) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO manual_tasks
                 (id, kind, world_id, payload, status, queued_at, scheduled_for,
                  started_at, completed_at, error, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    task.kind.as_str(),
                    task.world_id,
                    task.payload.to_string(),
                    task.status.as_str(),
                    task.queued_at.to_rfc3339(),
                    task.scheduled_for.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    task.error,
                    task.result.as_ref().map(|r| r.to_string()),
                ],
            )
            .map_err(db_err("Save manual task"))?;
        Ok(())
    }

    /// All persisted manual tasks, oldest first. Rows with an unknown kind
    /// are skipped.
    pub fn load_manual_tasks(&self) -> Result<Vec<ManualTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, world_id, payload, status, queued_at, scheduled_for,
                        started_at, completed_at, error, result
                 FROM manual_tasks ORDER BY queued_at",
            )
            .map_err(db_err("Load manual tasks"))?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                let payload: String = row.get(3)?;
                let status: String = row.get(4)?;
                let queued_at: String = row.get(5)?;
                let scheduled_for: String = row.get(6)?;
                let result: Option<String> = row.get(10)?;
                Ok((
                    kind.parse::<TaskKind>().ok(),
                    ManualTask {
                        id: row.get(0)?,
                        kind: TaskKind::Scavenging,
                        world_id: row.get(2)?,
                        payload: serde_json::from_str(&payload).unwrap_or_default(),
                        status: ManualTaskStatus::parse(&status)
                            .unwrap_or(ManualTaskStatus::Failed),
                        queued_at: parse_time(&queued_at),
                        scheduled_for: parse_time(&scheduled_for),
                        started_at: parse_opt_time(row.get(7)?),
                        completed_at: parse_opt_time(row.get(8)?),
                        error: row.get(9)?,
                        result: result.and_then(|r| serde_json::from_str(&r).ok()),
                    },
                ))
            })
            .map_err(db_err("Load manual tasks"))?;

        let mut tasks = Vec::new();
        for row in rows {
            let (kind, mut task) = row.map_err(db_err("Read manual task"))?;
            match kind {
                Some(kind) => {
                    task.kind = kind;
                    tasks.push(task);
                }
                None => tracing::warn!("⚠️ Skipping manual task {} with unknown kind", task.id),
            }
        }
        Ok(tasks)
    }

    pub fn delete_manual_tasks(&self, ids: &[String]) -> Result<usize> {
        let conn = self.conn()?;
        let mut deleted = 0;
        for id in ids {
            deleted += conn
                .execute("DELETE FROM manual_tasks WHERE id = ?1", params![id])
                .map_err(db_err("Delete manual task"))?;
        }
        Ok(deleted)
    }

    // ─── Dispatch fingerprints ────────────────────────────────

    pub fn save_dispatch_records(&self, world_id: WorldId, records: &[DispatchRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        for r in records {
            tx.execute(
                "INSERT OR REPLACE INTO dispatch_fingerprints
                 (world_id, fingerprint, raw_snapshot, status, created_at, sent_at,
                  failure_reason, cleared_upstream)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    world_id,
                    r.fingerprint,
                    r.raw_snapshot.to_string(),
                    r.status.as_str(),
                    r.created_at.to_rfc3339(),
                    r.sent_at.map(|t| t.to_rfc3339()),
                    r.failure_reason,
                    r.cleared_upstream as i32,
                ],
            )
            .map_err(db_err("Save dispatch record"))?;
        }
        tx.commit().map_err(db_err("Commit"))
    }

    pub fn load_dispatch_records(&self, world_id: WorldId) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT fingerprint, raw_snapshot, status, created_at, sent_at,
                        failure_reason, cleared_upstream
                 FROM dispatch_fingerprints WHERE world_id = ?1 ORDER BY fingerprint",
            )
            .map_err(db_err("Load dispatch records"))?;
        let rows = stmt
            .query_map(params![world_id], |row| {
                let snapshot: String = row.get(1)?;
                let status: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                Ok(DispatchRecord {
                    fingerprint: row.get(0)?,
                    raw_snapshot: serde_json::from_str(&snapshot).unwrap_or_default(),
                    // An unreadable status must never let a row be sent again.
                    status: DispatchStatus::parse(&status).unwrap_or(DispatchStatus::Failed),
                    created_at: parse_time(&created_at),
                    sent_at: parse_opt_time(row.get(4)?),
                    failure_reason: row.get(5)?,
                    cleared_upstream: row.get::<_, i32>(6)? != 0,
                })
            })
            .map_err(db_err("Load dispatch records"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Read dispatch record"))
    }

    pub fn dispatch_status(&self, world_id: WorldId, fingerprint: &str) -> Result<Option<DispatchStatus>> {
        let status: Option<String> = self
            .conn()?
            .query_row(
                "SELECT status FROM dispatch_fingerprints WHERE world_id = ?1 AND fingerprint = ?2",
                params![world_id, fingerprint],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Dispatch status"))?;
        Ok(status.and_then(|s| DispatchStatus::parse(&s)))
    }

    // ─── Build wish-list ──────────────────────────────────────

    pub fn add_wishlist_item(&self, world_id: WorldId, item: &QueueItem) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO build_wishlist (world_id, subject_id, target_level, priority)
                 VALUES (?1, ?2, ?3, ?4)",
                params![world_id, item.subject_id, item.target_level, item.priority],
            )
            .map_err(db_err("Add wish-list item"))?;
        Ok(())
    }

    /// The world's wish-list ordered by priority.
    pub fn load_wishlist(&self, world_id: WorldId) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT subject_id, target_level, priority FROM build_wishlist
                 WHERE world_id = ?1 ORDER BY priority, subject_id",
            )
            .map_err(db_err("Load wish-list"))?;
        let rows = stmt
            .query_map(params![world_id], |row| {
                Ok(QueueItem {
                    subject_id: row.get(0)?,
                    target_level: row.get(1)?,
                    priority: row.get(2)?,
                })
            })
            .map_err(db_err("Load wish-list"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Read wish-list item"))
    }

    pub fn remove_wishlist_item(&self, world_id: WorldId, item: &QueueItem) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "DELETE FROM build_wishlist WHERE world_id = ?1 AND subject_id = ?2 AND target_level = ?3",
                params![world_id, item.subject_id, item.target_level],
            )
            .map_err(db_err("Remove wish-list item"))?;
        Ok(n > 0)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).map_err(db_err("Batch"))
    }
}

//! Gateway SQLite database: the world registry and its per-world settings.
//!
//! Worlds are seeded from the `[[worlds]]` config section on first start;
//! after that the database is the source of truth and the control surface
//! edits it in place.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use warclaw_core::config::{IntervalsConfig, WorldSeed};
use warclaw_core::traits::{SettingsStore, WorldRegistry};
use warclaw_core::{IntervalBounds, Result, TaskKind, WarClawError, World, WorldId};

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> WarClawError + '_ {
    move |e| WarClawError::Database(format!("{context}: {e}"))
}

/// Gateway database: worlds, feature toggles and interval overrides.
pub struct GatewayDb {
    conn: Mutex<Connection>,
    defaults: BTreeMap<TaskKind, IntervalBounds>,
}

impl GatewayDb {
    /// Open or create the gateway database.
    pub fn open(path: &Path, intervals: &IntervalsConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("Gateway DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let db = Self {
            conn: Mutex::new(conn),
            defaults: intervals.as_map(),
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
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS worlds (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                display_name TEXT DEFAULT '',
                active INTEGER DEFAULT 1,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS world_features (
                world_id INTEGER NOT NULL REFERENCES worlds(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (world_id, kind)
            );

            CREATE TABLE IF NOT EXISTS world_intervals (
                world_id INTEGER NOT NULL REFERENCES worlds(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                min_minutes INTEGER NOT NULL,
                max_minutes INTEGER NOT NULL,
                updated_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (world_id, kind)
            );
        ",
            )
            .map_err(db_err("Migration"))
    }

    /// Insert seed worlds that are not in the database yet. Existing rows
    /// (and their edited settings) are left alone.
    pub fn seed_worlds(&self, seeds: &[WorldSeed]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Seed"))?;
        let mut inserted = 0;
        for seed in seeds {
            let world = seed.to_world();
            let added = tx
                .execute(
                    "INSERT OR IGNORE INTO worlds (id, code, display_name, active) VALUES (?1, ?2, ?3, ?4)",
                    params![world.id, world.code, world.display_name, world.active],
                )
                .map_err(db_err("Seed world"))?;
            if added == 0 {
                continue;
            }
            for (kind, enabled) in &world.features {
                tx.execute(
                    "INSERT OR REPLACE INTO world_features (world_id, kind, enabled) VALUES (?1, ?2, ?3)",
                    params![world.id, kind.as_str(), enabled],
                )
                .map_err(db_err("Seed features"))?;
            }
            inserted += 1;
        }
        tx.commit().map_err(db_err("Seed commit"))?;
        if inserted > 0 {
            tracing::info!("🌍 Seeded {} world(s) from config", inserted);
        }
        Ok(inserted)
    }

    /// Add or update a world's identity. Settings are untouched.
    pub fn upsert_world(&self, id: WorldId, code: &str, display_name: &str, active: bool) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO worlds (id, code, display_name, active) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET code = ?2, display_name = ?3, active = ?4",
                params![id, code, display_name, active],
            )
            .map_err(db_err("Upsert world"))?;
        Ok(())
    }

    pub fn set_active(&self, id: WorldId, active: bool) -> Result<bool> {
        let changed = self
            .conn()?
            .execute("UPDATE worlds SET active = ?1 WHERE id = ?2", params![active, id])
            .map_err(db_err("Set active"))?;
        Ok(changed > 0)
    }

    pub fn delete_world(&self, id: WorldId) -> Result<bool> {
        // Settings rows go with it (ON DELETE CASCADE)
        let deleted = self
            .conn()?
            .execute("DELETE FROM worlds WHERE id = ?1", params![id])
            .map_err(db_err("Delete world"))?;
        Ok(deleted > 0)
    }

    pub fn world_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM worlds", [], |r| r.get(0))
            .map_err(db_err("Count worlds"))?;
        Ok(count as usize)
    }

    fn load_world(conn: &Connection, id: WorldId, code: String, display_name: String, active: bool) -> Result<World> {
        let mut world = World::new(id, &code);
        if !display_name.is_empty() {
            world.display_name = display_name;
        }
        world.active = active;

        let mut stmt = conn
            .prepare("SELECT kind, enabled FROM world_features WHERE world_id = ?1")
            .map_err(db_err("Query features"))?;
        let features = stmt
            .query_map(params![id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?)))
            .map_err(db_err("Query features"))?;
        for row in features {
            let (kind, enabled) = row.map_err(db_err("Read feature"))?;
            if let Ok(kind) = kind.parse::<TaskKind>() {
                world.features.insert(kind, enabled);
            }
        }

        let mut stmt = conn
            .prepare("SELECT kind, min_minutes, max_minutes FROM world_intervals WHERE world_id = ?1")
            .map_err(db_err("Query intervals"))?;
        let intervals = stmt
            .query_map(params![id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?, r.get::<_, u32>(2)?))
            })
            .map_err(db_err("Query intervals"))?;
        for row in intervals {
            let (kind, min, max) = row.map_err(db_err("Read interval"))?;
            if let Ok(kind) = kind.parse::<TaskKind>() {
                world.intervals.insert(kind, IntervalBounds::new(min, max));
            }
        }
        Ok(world)
    }

    /// All worlds with their settings, by id.
    pub fn worlds(&self) -> Result<Vec<World>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, code, display_name, active FROM worlds ORDER BY id")
            .map_err(db_err("Query worlds"))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, WorldId>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, bool>(3)?,
                ))
            })
            .map_err(db_err("Query worlds"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Read world"))?;

        rows.into_iter()
            .map(|(id, code, name, active)| Self::load_world(&conn, id, code, name, active))
            .collect()
    }

    pub fn world(&self, id: WorldId) -> Result<Option<World>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT code, display_name, active FROM worlds WHERE id = ?1",
                params![id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, bool>(2)?)),
            )
            .optional()
            .map_err(db_err("Get world"))?;
        row.map(|(code, name, active)| Self::load_world(&conn, id, code, name, active))
            .transpose()
    }

    fn ensure_world(conn: &Connection, id: WorldId) -> Result<()> {
        let exists: bool = conn
            .query_row("SELECT EXISTS(SELECT 1 FROM worlds WHERE id = ?1)", params![id], |r| r.get(0))
            .map_err(db_err("Check world"))?;
        if exists {
            Ok(())
        } else {
            Err(WarClawError::NotFound(format!("world {id}")))
        }
    }

    pub fn set_feature(&self, id: WorldId, kind: TaskKind, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        Self::ensure_world(&conn, id)?;
        conn.execute(
            "INSERT INTO world_features (world_id, kind, enabled) VALUES (?1, ?2, ?3)
             ON CONFLICT(world_id, kind) DO UPDATE SET enabled = ?3, updated_at = datetime('now')",
            params![id, kind.as_str(), enabled],
        )
        .map_err(db_err("Set feature"))?;
        Ok(())
    }

    pub fn set_interval(&self, id: WorldId, kind: TaskKind, bounds: IntervalBounds) -> Result<()> {
        let conn = self.conn()?;
        Self::ensure_world(&conn, id)?;
        conn.execute(
            "INSERT INTO world_intervals (world_id, kind, min_minutes, max_minutes) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(world_id, kind) DO UPDATE SET min_minutes = ?3, max_minutes = ?4,
                 updated_at = datetime('now')",
            params![id, kind.as_str(), bounds.min_minutes, bounds.max_minutes],
        )
        .map_err(db_err("Set interval"))?;
        Ok(())
    }

    pub fn defaults(&self) -> &BTreeMap<TaskKind, IntervalBounds> {
        &self.defaults
    }
}

#[async_trait]
impl WorldRegistry for GatewayDb {
    async fn list_worlds(&self) -> Result<Vec<World>> {
        self.worlds()
    }

    async fn get_world(&self, id: WorldId) -> Result<Option<World>> {
        self.world(id)
    }
}

#[async_trait]
impl SettingsStore for GatewayDb {
    async fn set_feature_enabled(&self, world: WorldId, kind: TaskKind, enabled: bool) -> Result<()> {
        self.set_feature(world, kind, enabled)
    }

    async fn set_interval_bounds(&self, world: WorldId, kind: TaskKind, bounds: IntervalBounds) -> Result<()> {
        self.set_interval(world, kind, bounds)
    }

    fn default_intervals(&self) -> BTreeMap<TaskKind, IntervalBounds> {
        self.defaults.clone()
    }
}

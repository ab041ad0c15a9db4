//! API route handlers for the gateway.
//!
//! Every handler answers with a JSON body. Domain failures (unknown world,
//! busy session, bad kind) come back as `{"ok": false, "error": ...}` with
//! status 200, the same shape the management layer polls for.

use axum::body::Bytes;
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use std::sync::Arc;
use warclaw_core::traits::WorldRegistry;
use warclaw_core::{IntervalBounds, TaskKind, World};
use warclaw_scheduler::QueueItem;

use super::server::AppState;

fn fail(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({"ok": false, "error": error.to_string()}))
}

/// Resolve `{world}` (code or numeric id) against the registry.
async fn resolve_world(state: &AppState, key: &str) -> Result<World, Json<Value>> {
    match state.db.find_world(key).await {
        Ok(Some(world)) => Ok(world),
        Ok(None) => Err(fail(format!("World '{key}' not found"))),
        Err(e) => Err(fail(e)),
    }
}

fn parse_kind(raw: &str) -> Result<TaskKind, Json<Value>> {
    raw.parse::<TaskKind>().map_err(fail)
}

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "warclaw-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.scheduler.status();
    let config = state.scheduler.config();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "worlds": state.db.world_count().unwrap_or(0),
        "drivers": status.drivers,
        "scheduler": {
            "tick_interval_secs": config.tick_interval_secs,
            "run_timeout_secs": config.run_timeout_secs,
            "scheduled_records": status.scheduled_records,
        },
        "gateway": {
            "host": state.gateway_config.host,
            "port": state.gateway_config.port,
            "require_pairing": state.gateway_config.require_pairing,
        }
    }))
}

// ═══ Scheduler control ═══

/// Run one task for one world right now (bypasses the lockout check).
/// An optional JSON body is handed to the driver as payload.
pub async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Path((world, kind)): Path<(String, String)>,
    body: Bytes,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return fail(format!("Invalid JSON body: {e}")),
        }
    };

    let result = state.scheduler.trigger_now(world.id, kind, payload).await;
    Json(serde_json::to_value(&result).unwrap_or_else(|e| json!({"success": false, "message": e.to_string()})))
}

/// Toggle a feature, then reschedule the world.
pub async fn set_feature(
    State(state): State<Arc<AppState>>,
    Path((world, kind)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let Some(enabled) = body["value"].as_bool() else {
        return fail("'value' (bool) is required");
    };

    if let Err(e) = state.db.set_feature(world.id, kind, enabled) {
        return fail(e);
    }
    tracing::info!(
        "⚙️ World {} {} {}",
        world.code,
        kind,
        if enabled { "enabled" } else { "disabled" }
    );

    match state.scheduler.update_world_task_states(world.id).await {
        Ok(changes) => {
            let schedule = changes
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, change)| json!(change))
                .unwrap_or(Value::Null);
            Json(json!({
                "ok": true,
                "world": world.code,
                "kind": kind,
                "enabled": enabled,
                "schedule": schedule,
            }))
        }
        Err(e) => fail(e),
    }
}

/// Override a world's re-run window for one kind.
pub async fn set_interval(
    State(state): State<Arc<AppState>>,
    Path((world, kind)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let kind = match parse_kind(&kind) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let (Some(min), Some(max)) = (body["min_minutes"].as_u64(), body["max_minutes"].as_u64()) else {
        return fail("'min_minutes' and 'max_minutes' are required");
    };
    let (Ok(min), Ok(max)) = (u32::try_from(min), u32::try_from(max)) else {
        return fail("Interval out of range");
    };
    let bounds = IntervalBounds::new(min, max);
    if bounds.max_minutes == 0 {
        return fail("Interval must be at least one minute");
    }

    match state.db.set_interval(world.id, kind, bounds) {
        Ok(()) => {
            tracing::info!(
                "⚙️ World {} {} interval set to {}-{} min",
                world.code,
                kind,
                bounds.min_minutes,
                bounds.max_minutes
            );
            Json(json!({"ok": true, "world": world.code, "kind": kind, "interval": bounds}))
        }
        Err(e) => fail(e),
    }
}

/// Force a scheduler pass now: pick up newly enabled pairs and wake the loop.
pub async fn start_monitoring(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.scheduler.rebuild_from_settings().await {
        Ok(records) => {
            state.scheduler.wake();
            Json(json!({"ok": true, "message": "Scheduler pass requested", "scheduled_records": records}))
        }
        Err(e) => fail(e),
    }
}

/// Session, lockouts, upcoming schedule, pending manual tasks.
pub async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.scheduler.status();
    Json(json!({
        "ok": true,
        "session": status.session,
        "lockouts": status.lockouts,
        "upcoming": status.upcoming,
        "scheduled_records": status.scheduled_records,
        "pending_manual": status.pending_manual,
        "drivers": status.drivers,
    }))
}

/// Session and recent runs.
pub async fn crawler_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.scheduler.status();
    Json(json!({
        "ok": true,
        "running": status.session.is_some(),
        "session": status.session,
        "recent_runs": status.recent_runs,
    }))
}

pub async fn default_intervals(State(state): State<Arc<AppState>>) -> Json<Value> {
    let intervals: serde_json::Map<String, Value> = state
        .db
        .defaults()
        .iter()
        .map(|(kind, bounds)| (kind.as_str().to_string(), json!(bounds)))
        .collect();
    Json(json!({"ok": true, "intervals": intervals}))
}

/// Registry listing with feature flags and effective intervals.
pub async fn list_worlds(State(state): State<Arc<AppState>>) -> Json<Value> {
    let worlds = match state.db.list_worlds().await {
        Ok(w) => w,
        Err(e) => return fail(e),
    };
    let defaults = state.db.defaults();
    let list: Vec<Value> = worlds
        .iter()
        .map(|w| {
            let features: serde_json::Map<String, Value> = TaskKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), json!(w.feature_enabled(*k))))
                .collect();
            let intervals: serde_json::Map<String, Value> = TaskKind::ALL
                .iter()
                .filter_map(|k| w.interval_for(*k, defaults).map(|b| (k.as_str().to_string(), json!(b))))
                .collect();
            json!({
                "id": w.id,
                "code": w.code,
                "display_name": w.display_name,
                "active": w.active,
                "locked_out": state.scheduler.is_locked_out(w.id),
                "features": features,
                "intervals": intervals,
            })
        })
        .collect();
    Json(json!({"ok": true, "worlds": list}))
}

/// Operator override: drop a world's lockout.
pub async fn clear_lockout(
    State(state): State<Arc<AppState>>,
    Path(world): Path<String>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let cleared = state.scheduler.clear_lockout(world.id);
    if cleared {
        tracing::info!("🔓 Lockout for world {} cleared by operator", world.code);
        state.scheduler.wake();
    }
    Json(json!({"ok": true, "world": world.code, "cleared": cleared}))
}

// ═══ Manual tasks ═══

/// Queue an ad-hoc task: `{kind, world, payload?}`.
pub async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let Some(kind) = body["kind"].as_str() else {
        return fail("'kind' is required");
    };
    let kind = match parse_kind(kind) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let key = match &body["world"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return fail("'world' is required"),
    };
    let world = match resolve_world(&state, &key).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let payload = body.get("payload").cloned().unwrap_or(Value::Null);

    match state.scheduler.enqueue_manual(kind, world.id, payload).await {
        Ok(receipt) => {
            tracing::info!(
                "📥 Manual {} queued for world {} (position {})",
                kind,
                world.code,
                receipt.queue_position
            );
            Json(json!({
                "ok": true,
                "task_id": receipt.task_id,
                "queue_position": receipt.queue_position,
                "estimated_wait_secs": receipt.estimated_wait_secs,
            }))
        }
        Err(e) => fail(e),
    }
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Value> {
    match state.scheduler.manual_status(&id) {
        Some(task) => Json(json!({"found": true, "task": task})),
        None => Json(json!({"found": false})),
    }
}

// ═══ Construction wish-list ═══

pub async fn list_wishlist(
    State(state): State<Arc<AppState>>,
    Path(world): Path<String>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    match state.scheduler_db.load_wishlist(world.id) {
        Ok(items) => Json(json!({"ok": true, "world": world.code, "items": items})),
        Err(e) => fail(e),
    }
}

pub async fn add_wishlist_item(
    State(state): State<Arc<AppState>>,
    Path(world): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let Some(subject_id) = body["subject_id"].as_str().filter(|s| !s.trim().is_empty()) else {
        return fail("'subject_id' is required");
    };
    let Some(target_level) = body["target_level"].as_u64().and_then(|l| u32::try_from(l).ok()) else {
        return fail("'target_level' is required");
    };
    let priority = body["priority"].as_i64().unwrap_or(0).clamp(i32::MIN.into(), i32::MAX.into()) as i32;

    let item = QueueItem::new(subject_id.trim(), target_level, priority);
    match state.scheduler_db.add_wishlist_item(world.id, &item) {
        Ok(()) => Json(json!({"ok": true, "world": world.code, "item": item})),
        Err(e) => fail(e),
    }
}

pub async fn remove_wishlist_item(
    State(state): State<Arc<AppState>>,
    Path((world, subject, level)): Path<(String, String, u32)>,
) -> Json<Value> {
    let world = match resolve_world(&state, &world).await {
        Ok(w) => w,
        Err(e) => return e,
    };
    let item = QueueItem::new(&subject, level, 0);
    match state.scheduler_db.remove_wishlist_item(world.id, &item) {
        Ok(removed) => Json(json!({"ok": true, "removed": removed})),
        Err(e) => fail(e),
    }
}

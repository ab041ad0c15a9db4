//! # WarClaw Gateway
//!
//! Axum control surface over the scheduler engine, plus the SQLite-backed
//! world registry and settings store it reads and writes.

pub mod db;
pub mod routes;
pub mod server;

pub use db::GatewayDb;
pub use server::{AppState, build_router, start};

//! # WarClaw Core
//!
//! Shared building blocks for the WarClaw automation agent:
//! configuration, the error taxonomy, world/task domain types and the
//! collaborator traits the orchestrator depends on.
//!
//! The orchestrator never talks to the target site directly. Everything
//! page-level goes through [`traits::PageDriver`].

pub mod config;
pub mod credentials;
pub mod error;
pub mod traits;
pub mod types;

pub use config::WarClawConfig;
pub use credentials::CookieFileStore;
pub use error::{Result, WarClawError};
pub use types::{
    DriverOutcome, ExecutionContext, IntervalBounds, ItemResult, SessionCredentials, TaskKind,
    World, WorldId,
};

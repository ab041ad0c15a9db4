//! Page driver: the sole boundary through which the orchestrator touches the site.

use async_trait::async_trait;

use crate::types::{DriverOutcome, ExecutionContext, World};

/// One driver per [`TaskKind`](crate::types::TaskKind).
///
/// Implementations run a chain of fallible steps (login → navigate → read →
/// act → confirm) and must convert every failure into a [`DriverOutcome`].
/// Bot-protection detection is reported through
/// `DriverOutcome::bot_protection_detected`, not as an error.
#[async_trait]
pub trait PageDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, world: &World, ctx: &ExecutionContext) -> DriverOutcome;
}

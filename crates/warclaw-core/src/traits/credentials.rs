use async_trait::async_trait;

use crate::error::Result;
use crate::types::{SessionCredentials, World};

/// Supplies the login cookies for a world's automation session.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fails with `WarClawError::Credential` when nothing usable is stored.
    async fn credentials_for(&self, world: &World) -> Result<SessionCredentials>;
}

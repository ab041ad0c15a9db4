//! Cookie-file credential provider.
//!
//! Each world keeps its logged-in session in `<cookie_dir>/<code>.json`:
//! `{"cookie": "sid=...; pid=...", "user_agent": "..."}`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, WarClawError};
use crate::traits::CredentialProvider;
use crate::types::{SessionCredentials, World};

#[derive(Deserialize)]
struct CookieFile {
    cookie: String,
    #[serde(default)]
    user_agent: String,
}

/// Reads per-world cookie files from a directory.
pub struct CookieFileStore {
    dir: PathBuf,
    default_user_agent: String,
}

impl CookieFileStore {
    pub fn new(dir: &Path, default_user_agent: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            default_user_agent: default_user_agent.to_string(),
        }
    }

    fn path_for(&self, world: &World) -> PathBuf {
        self.dir.join(format!("{}.json", world.code))
    }
}

#[async_trait]
impl CredentialProvider for CookieFileStore {
    async fn credentials_for(&self, world: &World) -> Result<SessionCredentials> {
        let path = self.path_for(world);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            WarClawError::Credential(format!(
                "No session for world {} ({}): {e}",
                world.code,
                path.display()
            ))
        })?;
        let file: CookieFile = serde_json::from_str(&raw).map_err(|e| {
            WarClawError::Credential(format!("Malformed cookie file {}: {e}", path.display()))
        })?;
        if file.cookie.trim().is_empty() {
            return Err(WarClawError::Credential(format!(
                "Empty cookie for world {}",
                world.code
            )));
        }
        tracing::debug!("🍪 Loaded session cookie for world {}", world.code);
        Ok(SessionCredentials {
            cookie_header: file.cookie,
            user_agent: if file.user_agent.is_empty() {
                self.default_user_agent.clone()
            } else {
                file.user_agent
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_cookie_file() {
        let dir = std::env::temp_dir().join("warclaw-cookie-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("W17.json"), r#"{"cookie": "sid=abc"}"#).unwrap();

        let store = CookieFileStore::new(&dir, "TestAgent/1.0");
        let creds = store.credentials_for(&World::new(17, "W17")).await.unwrap();
        assert_eq!(creds.cookie_header, "sid=abc");
        assert_eq!(creds.user_agent, "TestAgent/1.0");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_cookie_is_credential_error() {
        let dir = std::env::temp_dir().join("warclaw-cookie-missing");
        let store = CookieFileStore::new(&dir, "TestAgent/1.0");
        let err = store
            .credentials_for(&World::new(3, "W3"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_empty_cookie_rejected() {
        let dir = std::env::temp_dir().join("warclaw-cookie-empty");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("W5.json"), r#"{"cookie": "  "}"#).unwrap();
        let store = CookieFileStore::new(&dir, "ua");
        assert!(store.credentials_for(&World::new(5, "W5")).await.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}

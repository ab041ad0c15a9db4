//! Error taxonomy shared by every WarClaw crate.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, WarClawError>;

#[derive(Debug, Error)]
pub enum WarClawError {
    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Missing cookie file, unreadable secret, expired session.
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Page driver or automation worker failure (unexpected page structure, rejected action).
    #[error("Driver error: {0}")]
    Driver(String),

    /// The remote site flagged the session as automated.
    #[error("Bot protection detected: {0}")]
    BotProtection(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A state transition that would break an invariant (e.g. status going backwards).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl WarClawError {
    /// Whether this error is the bot-protection signal rather than an ordinary failure.
    pub fn is_bot_protection(&self) -> bool {
        matches!(self, WarClawError::BotProtection(_))
    }

    /// Configuration-class errors: fatal to the single run, never to the loop.
    pub fn is_configuration(&self) -> bool {
        matches!(self, WarClawError::Config(_) | WarClawError::Credential(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(WarClawError::BotProtection("captcha".into()).is_bot_protection());
        assert!(!WarClawError::Driver("boom".into()).is_bot_protection());
        assert!(WarClawError::Credential("no cookie".into()).is_configuration());
        assert!(!WarClawError::Timeout(30).is_configuration());
    }

    #[test]
    fn test_display() {
        assert_eq!(WarClawError::Timeout(30).to_string(), "Timed out after 30s");
        assert_eq!(
            WarClawError::NotFound("world 9".into()).to_string(),
            "Not found: world 9"
        );
    }
}

//! Collaborator traits: the orchestrator depends on these capabilities only,
//! never on a concrete web framework, database or browser.

pub mod credentials;
pub mod driver;
pub mod registry;

pub use credentials::CredentialProvider;
pub use driver::PageDriver;
pub use registry::{SettingsStore, WorldRegistry};

//! Validator identities

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Method prefix of identities made by [`DemoIdentityProvider`]
pub const DEMO_METHOD: &str = "demo";

/// An identity resolved into its parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub identifier: String,
    pub method: String,
    pub name: String,
}

/// Creates and resolves validator identities
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_identity(&self) -> Result<String, IdentityError>;

    async fn resolve(&self, identifier: &str) -> Result<ResolvedIdentity, IdentityError>;
}

/// `did:demo:<name>` identities with random names
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoIdentityProvider;

#[async_trait]
impl IdentityProvider for DemoIdentityProvider {
    async fn create_identity(&self) -> Result<String, IdentityError> {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let identifier = format!("did:{}:{}", DEMO_METHOD, name);
        log::info!("Created validator identity {}", identifier);
        Ok(identifier)
    }

    async fn resolve(&self, identifier: &str) -> Result<ResolvedIdentity, IdentityError> {
        let mut parts = identifier.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("did"), Some(method), Some(name)) if !method.is_empty() && !name.is_empty() => {
                Ok(ResolvedIdentity {
                    identifier: identifier.to_string(),
                    method: method.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(IdentityError::Malformed(identifier.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Malformed identity '{0}'")]
    Malformed(String),

    #[error("Failed to resolve identity '{identifier}': {reason}")]
    Unresolved { identifier: String, reason: String },
}

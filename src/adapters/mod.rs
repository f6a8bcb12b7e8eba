//! Capability provider interfaces.
//!
//! A provider does the real work of a stage: it receives the stage input as
//! JSON and returns the stage payload as JSON. Orchestration never looks
//! inside either document.

pub mod command;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::StageName;

// Re-export the subprocess provider
pub use command::{CommandProvider, ProviderSettings};

/// Failure reported by a provider, classified for the retry executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Worth retrying: timeouts, rate-limit signals, server errors
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Retrying cannot help: bad input, malformed output, missing binary
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

/// Trait for capability providers
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Human-readable provider name; also keys the provider's rate window
    fn name(&self) -> &str;

    /// Perform `stage` on `input`
    async fn invoke(&self, stage: StageName, input: &Value) -> Result<Value, ProviderError>;

    /// Check the provider is reachable
    async fn health_check(&self) -> Result<(), ProviderError>;
}

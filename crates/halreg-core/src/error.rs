//! Error types for the halreg registry engine.
//!
//! The registry itself never panics on caller input: malformed identities
//! and missing handles are rejected synchronously, lookup misses are plain
//! `None`/empty results. `RegistryError` is used at the parse and transport
//! seams where a structured cause is worth carrying.

use thiserror::Error;

/// Main error type for the registry engine.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The interface-identity string failed the fqname grammar.
    #[error("Invalid interface identity {fqname:?}: {message}")]
    InvalidIdentity { fqname: String, message: String },

    /// A publish was attempted with no interfaces in the declared chain.
    #[error("Interface chain is empty")]
    EmptyInterfaceChain,

    /// An operation that requires an instance name got an empty one.
    #[error("Instance name is empty ({context})")]
    EmptyInstance { context: &'static str },

    /// Transport-level failure surfaced by a collaborator.
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

impl RegistryError {
    /// Build an `InvalidIdentity` error for a rejected fqname.
    pub fn invalid_identity(fqname: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            fqname: fqname.into(),
            message: message.into(),
        }
    }

    /// Build a `Transport` error from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

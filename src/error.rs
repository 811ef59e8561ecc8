//! Error handling module
//!
//! Based on anyhow but adds domain-specific error kinds so callers can
//! distinguish lookup misses from backend failures and shutdown races.

use std::io;

/// Main error types for the tunl supervisor
///
/// Lookup misses (unknown connection, backend or primary) leave the state
/// machine untouched; backend failures are surfaced wrapped; operations
/// after shutdown fail fast instead of hanging.
#[derive(Debug)]
pub enum TunlError {
    /// Configuration file related errors
    Config(String),
    /// No connection registered under the given id
    ConnectionNotFound(String),
    /// No backend registered under the given method name
    BackendNotRegistered(String),
    /// No primary connection is currently designated
    NoPrimary,
    /// A backend connect/disconnect call failed
    Backend(String),
    /// The manager has been shut down
    ShutDown,
    /// Process management related errors
    Process(String),
}

impl std::fmt::Display for TunlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunlError::Config(msg) => write!(f, "Config error: {}", msg),
            TunlError::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            TunlError::BackendNotRegistered(method) => {
                write!(f, "Provider not registered: {}", method)
            }
            TunlError::NoPrimary => write!(f, "No primary connection designated"),
            TunlError::Backend(msg) => write!(f, "Backend operation failed: {}", msg),
            TunlError::ShutDown => write!(f, "Manager is shut down"),
            TunlError::Process(msg) => write!(f, "Process control error: {}", msg),
        }
    }
}

impl std::error::Error for TunlError {}

/// Helper trait for adding context to anyhow::Error
pub trait ResultExt<T> {
    /// Add configuration error context
    fn context_config(self, msg: &str) -> anyhow::Result<T>;
    /// Add process error context
    fn context_process(self, msg: &str) -> anyhow::Result<T>;
    /// Add backend error context
    fn context_backend(self, msg: &str) -> anyhow::Result<T>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn context_config(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Config(msg.to_string()), e))
    }

    fn context_process(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Process(msg.to_string()), e))
    }

    fn context_backend(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Backend(msg.to_string()), e))
    }
}

impl<T> ResultExt<T> for io::Result<T> {
    fn context_config(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Config(msg.to_string()), e))
    }

    fn context_process(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Process(msg.to_string()), e))
    }

    fn context_backend(self, msg: &str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {}", TunlError::Backend(msg.to_string()), e))
    }
}

/// Check whether an anyhow error wraps a given tunl error kind.
///
/// Used by callers that need to branch on lookup-miss vs backend failure
/// without string matching.
pub fn is_lookup_miss(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<TunlError>(),
        Some(TunlError::ConnectionNotFound(_))
            | Some(TunlError::BackendNotRegistered(_))
            | Some(TunlError::NoPrimary)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_missing_entity() {
        let err = TunlError::ConnectionNotFound("ssh-42".to_string());
        assert_eq!(err.to_string(), "Connection not found: ssh-42");

        let err = TunlError::BackendNotRegistered("warp".to_string());
        assert!(err.to_string().contains("warp"));
    }

    #[test]
    fn lookup_miss_detection_through_anyhow() {
        let err = anyhow::Error::new(TunlError::ConnectionNotFound("x".into()));
        assert!(is_lookup_miss(&err));

        let err = anyhow::Error::new(TunlError::Backend("boom".into()));
        assert!(!is_lookup_miss(&err));

        let err = anyhow::anyhow!("plain error");
        assert!(!is_lookup_miss(&err));
    }
}

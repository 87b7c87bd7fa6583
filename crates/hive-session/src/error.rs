//! Error types for cluster session operations.
//!
//! A missing session or attribute is never an error here: lookups return
//! `Option` and callers branch on absence.

/// Error type for cluster session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cluster store could not be reached or rejected the operation.
    #[error("Cluster store unavailable: {0}")]
    StoreUnavailable(String),

    /// No worker name was configured and the host name could not be determined.
    #[error("Failed to resolve host name: {0}")]
    HostnameResolution(String),

    /// The session handle was invalidated and can no longer be used.
    #[error("Session invalidated: {0}")]
    SessionInvalidated(String),

    /// A versioned metadata update kept losing to concurrent writers.
    #[error("Concurrent modification of session metadata: {0}")]
    ConcurrentModification(String),

    /// The cluster store does not offer a capability this operation needs.
    #[error("Unsupported store operation: {0}")]
    Unsupported(String),

    /// The session manager is not running.
    #[error("Session manager is not running")]
    NotRunning,

    /// The background reaper could not be started.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An attribute value could not be converted to or from its typed form.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for wrapping a store client failure.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for cluster session operations.
pub type Result<T> = std::result::Result<T, Error>;

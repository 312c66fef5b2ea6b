//! Error types for the node agent
//!
//! Errors carry the kind information the reconciliation loops route on:
//! session loss collapses to the outer reconnect loop, per-instance
//! failures travel on the results channel, and `NotFound` is frequently a
//! benign answer rather than a failure.

use thiserror::Error;

/// Result alias used throughout the agent.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Transient failure; the operation may be retried as-is
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "coordinator", "runtime")
        context: String,
    },

    /// The coordination session expired or was closed
    ///
    /// All outstanding watches are invalid; the holder must reconnect and
    /// re-read any state it was watching.
    #[error("coordination session lost")]
    SessionLost,

    /// A node, container, or image does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency write lost the race
    ///
    /// The stored version differs from the one supplied; re-read and retry.
    #[error("version conflict at {path}")]
    Conflict {
        /// Path of the contested node
        path: String,
    },

    /// Container driver failure
    #[error("runtime error for {container}: {message}")]
    Runtime {
        /// Container name or id the operation addressed
        container: String,
        /// Description of what failed
        message: String,
    },

    /// The operation was cancelled by a shutdown or cancel signal
    ///
    /// Propagated silently; never logged as a failure.
    #[error("cancelled")]
    Cancelled,

    /// Configuration or invariant violation; the agent cannot continue
    #[error("fatal: {0}")]
    Fatal(String),

    /// Filesystem or process I/O failure
    #[error("io error [{context}]: {source}")]
    Io {
        /// The underlying I/O error
        source: std::io::Error,
        /// Where the error occurred (e.g., "config-file", "subvolume")
        context: String,
    },

    /// Payload could not be encoded or decoded
    #[error("serialization error at {path}: {source}")]
    Serialization {
        /// Node path or file whose payload was malformed
        path: String,
        /// The underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a transient error without specific context
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            context: "agent".to_string(),
        }
    }

    /// Create a transient error with context
    pub fn transient_in(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a not-found error for a path or name
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a version-conflict error for a node path
    pub fn conflict(path: impl Into<String>) -> Self {
        Self::Conflict { path: path.into() }
    }

    /// Create a runtime error for a container
    pub fn runtime(container: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runtime {
            container: container.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: context.into(),
        }
    }

    /// Create a serialization error for a node path
    pub fn serialization(path: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }

    /// Whether the failed operation may be retried without intervention
    ///
    /// `Conflict` requires a re-read first; `SessionLost` requires a
    /// reconnect; neither is retryable as-is. `NotFound` is an answer,
    /// not a failure, and is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Io { .. })
    }

    /// Whether this error means the coordination session must be rebuilt
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionLost)
    }

    /// Whether this is the benign "node/container does not exist" answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether this error is a silent cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: "agent".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::transient_in("coordinator", "timed out").is_retryable());
        assert!(Error::io("subvolume", std::io::Error::other("disk full")).is_retryable());
    }

    #[test]
    fn session_loss_is_not_retryable_in_place() {
        let err = Error::SessionLost;
        assert!(!err.is_retryable());
        assert!(err.is_session_loss());
    }

    #[test]
    fn conflict_requires_reread() {
        let err = Error::conflict("/services/s1/states/i1");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/services/s1/states/i1"));
    }

    #[test]
    fn not_found_is_an_answer() {
        let err = Error::not_found("/hosts/h1/instances/i1");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn cancellation_is_silent() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_errors_carry_the_message() {
        let err = Error::fatal("unresolved placeholder in startup template");
        assert!(err.to_string().contains("unresolved placeholder"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn runtime_errors_name_the_container() {
        let err = Error::runtime("s1-i1", "failed to start");
        assert!(err.to_string().contains("s1-i1"));
        assert!(err.to_string().contains("failed to start"));
    }
}

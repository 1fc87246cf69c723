//! Error taxonomy for the replication engine.
//!
//! Two layers: [`ConfigError`] covers everything that is fatal at startup
//! only, [`ReplicationError`] covers the runtime taxonomy. Transport-level
//! failures are *transient* and retried until cancelled; semantic failures
//! are logged and the flow continues except during an initial dump with
//! `continue-on-error` off.

use miette::Diagnostic;
use thiserror::Error;

use crate::position::LogPosition;

/// Startup-time configuration failures.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    /// The source and destination namespace lists do not pair up.
    #[error("namespace sets differ in length: {sources} source(s), {destinations} destination(s)")]
    #[diagnostic(
        code(driftsync::config::namespace_lengths),
        help("The destination namespace set must name exactly one destination per source namespace.")
    )]
    NamespaceLengths { sources: usize, destinations: usize },

    /// A namespace appears more than once on either side of the rename map.
    #[error("namespace sets must not contain duplicates")]
    #[diagnostic(code(driftsync::config::namespace_duplicates))]
    DuplicateNamespaces,

    /// A namespace string is not of the form `database.collection`.
    #[error("invalid namespace: {name:?}")]
    #[diagnostic(
        code(driftsync::config::invalid_namespace),
        help("Namespaces are qualified as `database.collection`.")
    )]
    InvalidNamespace { name: String },

    /// The checkpoint file cannot be created or written.
    #[error("checkpoint path unusable: {path}: {message}")]
    #[diagnostic(code(driftsync::config::checkpoint_path))]
    CheckpointPath { path: String, message: String },

    /// A configured sink name has no registered constructor.
    #[error("unknown sink: {name}")]
    #[diagnostic(
        code(driftsync::config::unknown_sink),
        help("Sink names must be registered in the SinkRegistry before startup.")
    )]
    UnknownSink { name: String },

    /// A target URL was configured without any sink to consume it.
    #[error("target URL given without any sink name")]
    #[diagnostic(code(driftsync::config::url_without_sink))]
    TargetUrlWithoutSink,

    /// The password file could not be read.
    #[error("could not read password file {path}: {message}")]
    #[diagnostic(code(driftsync::config::auth_file))]
    AuthFile { path: String, message: String },

    /// An auth username was supplied with no password or password file.
    #[error("auth username specified without a password")]
    #[diagnostic(code(driftsync::config::missing_password))]
    MissingPassword,
}

impl ConfigError {
    /// Process exit code an embedding CLI should use for this failure.
    /// Checkpoint-path problems exit with 2, every other configuration
    /// problem with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::CheckpointPath { .. } => 2,
            _ => 1,
        }
    }
}

/// Runtime failures observed while replicating.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplicationError {
    /// Transport lost to the source or a sink. Transient: retried with
    /// backoff until the engine is cancelled.
    #[error("connection failed: {message}")]
    #[diagnostic(code(driftsync::replication::connection))]
    ConnectionFailed { message: String },

    /// Semantic failure at the source or a sink.
    #[error("operation failed: {message}")]
    #[diagnostic(code(driftsync::replication::operation))]
    OperationFailed { message: String },

    /// A bulk write was attempted with no documents. Callers tolerate this
    /// silently.
    #[error("empty document stream")]
    #[diagnostic(code(driftsync::replication::empty_stream))]
    EmptyStream,

    /// The shard's log no longer contains the checkpointed position.
    /// Internal trigger for rollback reconciliation, never user-surfaced.
    #[error("log diverged on shard {shard}: no entry at checkpoint {checkpoint}")]
    #[diagnostic(code(driftsync::replication::divergence))]
    LogDivergence {
        shard: String,
        checkpoint: LogPosition,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(driftsync::replication::serde))]
    Serde(#[from] serde_json::Error),
}

impl ReplicationError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Transient errors are retried; everything else is handled by the
    /// caller's error policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }

    /// Process exit code an embedding CLI should use. Zero (normal exit)
    /// is the embedder's decision and never produced here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(config) => config.exit_code(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        let path_err = ReplicationError::from(ConfigError::CheckpointPath {
            path: "/nope".into(),
            message: "denied".into(),
        });
        assert_eq!(path_err.exit_code(), 2);
        assert_eq!(
            ReplicationError::from(ConfigError::MissingPassword).exit_code(),
            1
        );
        assert_eq!(ReplicationError::operation("boom").exit_code(), 1);
    }

    #[test]
    fn only_connection_failures_are_transient() {
        assert!(ReplicationError::connection("reset").is_transient());
        assert!(!ReplicationError::operation("bad doc").is_transient());
        assert!(!ReplicationError::EmptyStream.is_transient());
    }
}

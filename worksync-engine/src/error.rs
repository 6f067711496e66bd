//! Error types for worksync-engine.

use std::path::PathBuf;

use thiserror::Error;

use worksync_connector::ConnectorError;
use worksync_core::{ConfigError, HistoryId, SystemTag, TeamId};

/// All errors that can arise from running the sync engine.
///
/// Record-level failures never surface here; they are collected into the
/// run's issue list. These are the errors that stop an operation outright.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error loading or saving team configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (store documents).
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A link would associate a record with a second counterpart.
    #[error("link invariant violated for team '{team}': {message}")]
    LinkInvariant { team: TeamId, message: String },

    /// The credential could not be refreshed.
    #[error("credential for {system} could not be refreshed: {message}")]
    Credential { system: SystemTag, message: String },

    #[error("run '{0}' not found")]
    RunNotFound(HistoryId),

    /// Finalized runs are immutable.
    #[error("run '{0}' is already finalized")]
    RunFinalized(HistoryId),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

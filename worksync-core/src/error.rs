//! Error types for worksync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SystemTag;

/// All errors that can arise from loading, validating or saving team config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse team config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`, so `~/.worksync/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No config file exists for the requested team.
    #[error("team config not found at {path}")]
    TeamNotFound { path: PathBuf },

    /// A native field is claimed by more than one mapping entry.
    #[error("field '{field}' on {system} appears in more than one mapping entry")]
    DuplicateField { system: SystemTag, field: String },

    /// Any other structural problem with the field mapping.
    #[error("invalid field mapping: {0}")]
    InvalidMapping(String),
}

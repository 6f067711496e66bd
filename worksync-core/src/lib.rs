//! worksync core library — domain types, team configuration, errors.
//!
//! - [`types`] — records, links, run history
//! - [`config`] — per-team [`SyncConfig`] and [`FieldMapping`]
//! - [`config_store`] — load / save / init of team config files
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod config_store;
pub mod error;
pub mod types;

pub use config::{
    Credential, FieldKind, FieldMapping, MappingEntry, ScheduleConfig, SourceAConfig,
    SourceBConfig, SyncConfig, ValueTranslation,
};
pub use error::ConfigError;
pub use types::{
    AbortReason, CanonicalRecord, Direction, FieldValue, HistoryId, IssueLevel, Link, LinkStatus,
    NativeFields, NativeRecord, RecordId, RecordRef, RunCounts, RunIssue, RunOutcome, RunResult,
    SupersededChange, SyncRun, SystemTag, TeamId, Trigger,
};

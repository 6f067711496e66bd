//! Per-team sync configuration: endpoints, credentials, schedule and the
//! field mapping between the two systems.
//!
//! Canonical values for enumerated fields use Source A's spelling; the
//! translation table of a mapping entry names the Source B equivalent.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{Direction, SystemTag, TeamId};

/// Canonical keys that populate the fixed [`CanonicalRecord`] fields rather
/// than `field_values`.
///
/// [`CanonicalRecord`]: crate::types::CanonicalRecord
pub const TITLE_KEY: &str = "title";
pub const STATE_KEY: &str = "state";
pub const DESCRIPTION_KEY: &str = "description";

pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 900;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A bearer credential for one remote system.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` means the token does not expire (integration tokens, PATs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            ..Self::default()
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.token_url.is_some()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Source A: hierarchical work-item tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAConfig {
    /// Organization/collection URL, e.g. `https://tracker.example.com/acme`.
    pub base_url: String,
    pub project: String,
    /// Work item type used when creating records (e.g. "Task").
    #[serde(default = "default_work_item_type")]
    pub work_item_type: String,
    pub credential: Credential,
}

impl Default for SourceAConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project: String::new(),
            work_item_type: default_work_item_type(),
            credential: Credential::default(),
        }
    }
}

fn default_work_item_type() -> String {
    "Task".to_string()
}

/// Source B: property-based database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceBConfig {
    pub base_url: String,
    pub database_id: String,
    pub credential: Credential,
}

// ---------------------------------------------------------------------------
// Field mapping
// ---------------------------------------------------------------------------

/// Native type family of a mapped field; drives value coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Bool,
    Date,
    /// State / status / select; looked up in the translation table.
    Select,
    MultiSelect,
    /// Area/iteration-style path; flattened to a string in canonical form.
    Path,
}

/// One row of an enumerated-value equivalence table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueTranslation {
    pub a: String,
    pub b: String,
}

/// One mapped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Canonical key; `title`, `state` and `description` fill the fixed
    /// record fields, anything else lands in `field_values`.
    pub canonical: String,
    pub source_a: String,
    pub source_b: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ValueTranslation>,
}

impl MappingEntry {
    pub fn new(
        canonical: impl Into<String>,
        source_a: impl Into<String>,
        source_b: impl Into<String>,
        kind: FieldKind,
    ) -> Self {
        Self {
            canonical: canonical.into(),
            source_a: source_a.into(),
            source_b: source_b.into(),
            kind,
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.values.push(ValueTranslation {
            a: a.into(),
            b: b.into(),
        });
        self
    }

    pub fn field_for(&self, system: SystemTag) -> &str {
        match system {
            SystemTag::A => &self.source_a,
            SystemTag::B => &self.source_b,
        }
    }
}

/// Ordered list of mapping entries for one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldMapping {
    #[serde(default)]
    pub entries: Vec<MappingEntry>,
}

impl FieldMapping {
    pub fn new(entries: Vec<MappingEntry>) -> Self {
        Self { entries }
    }

    /// Enforce the no-fan-out invariant: each side's field, and each
    /// canonical key, appears in at most one entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut canonical = HashSet::new();
        let mut a_fields = HashSet::new();
        let mut b_fields = HashSet::new();

        for entry in &self.entries {
            if entry.canonical.trim().is_empty() {
                return Err(ConfigError::InvalidMapping(format!(
                    "entry for '{}' has an empty canonical key",
                    entry.source_a
                )));
            }
            if !canonical.insert(entry.canonical.as_str()) {
                return Err(ConfigError::InvalidMapping(format!(
                    "canonical key '{}' is mapped twice",
                    entry.canonical
                )));
            }
            if !a_fields.insert(entry.source_a.as_str()) {
                return Err(ConfigError::DuplicateField {
                    system: SystemTag::A,
                    field: entry.source_a.clone(),
                });
            }
            if !b_fields.insert(entry.source_b.as_str()) {
                return Err(ConfigError::DuplicateField {
                    system: SystemTag::B,
                    field: entry.source_b.clone(),
                });
            }

            let mut seen_a = HashSet::new();
            let mut seen_b = HashSet::new();
            for row in &entry.values {
                if !seen_a.insert(row.a.as_str()) || !seen_b.insert(row.b.as_str()) {
                    return Err(ConfigError::InvalidMapping(format!(
                        "translation table for '{}' maps a value twice ({} / {})",
                        entry.canonical, row.a, row.b
                    )));
                }
            }
        }

        if !canonical.contains(TITLE_KEY) {
            return Err(ConfigError::InvalidMapping(
                "a mapping entry with canonical key 'title' is required".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Team config
// ---------------------------------------------------------------------------

/// When and how the scheduler runs this team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub direction: Direction,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INTERVAL_SECS,
            direction: Direction::Both,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_run_timeout_secs() -> u64 {
    DEFAULT_RUN_TIMEOUT_SECS
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

/// Everything one team's runs need, loaded once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub team: TeamId,
    /// Tie-break winner when both sides changed at the same instant.
    #[serde(default)]
    pub primary: SystemTag,
    #[serde(default)]
    pub propagate_deletes: bool,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    pub source_a: SourceAConfig,
    pub source_b: SourceBConfig,
    #[serde(default)]
    pub mapping: FieldMapping,
}

impl SyncConfig {
    pub fn credential(&self, system: SystemTag) -> &Credential {
        match system {
            SystemTag::A => &self.source_a.credential,
            SystemTag::B => &self.source_b.credential,
        }
    }

    pub fn set_credential(&mut self, system: SystemTag, credential: Credential) {
        match system {
            SystemTag::A => self.source_a.credential = credential,
            SystemTag::B => self.source_b.credential = credential,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.team.0.trim().is_empty() {
            return Err(ConfigError::InvalidMapping("team id is empty".to_string()));
        }
        self.mapping.validate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Domain types shared by every worksync crate.
//!
//! Record payloads travel in two shapes: [`NativeRecord`] (a connector's own
//! field names and values) and [`CanonicalRecord`] (after field mapping).
//! Everything else here is bookkeeping for links and run history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed team identifier. Every run and link is scoped to one team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamId(pub String);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TeamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TeamId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A record identifier as assigned by the remote system that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of one persisted [`SyncRun`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryId(pub String);

impl HistoryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for HistoryId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Systems and directions
// ---------------------------------------------------------------------------

/// Which of the two mirrored systems a record lives in.
///
/// `A` is the hierarchical work-item tracker, `B` the property database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemTag {
    #[default]
    A,
    B,
}

impl SystemTag {
    pub fn opposite(self) -> Self {
        match self {
            SystemTag::A => SystemTag::B,
            SystemTag::B => SystemTag::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystemTag::A => "a",
            SystemTag::B => "b",
        }
    }

    pub fn both() -> [SystemTag; 2] {
        [SystemTag::A, SystemTag::B]
    }
}

impl fmt::Display for SystemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemTag::A => write!(f, "source-a"),
            SystemTag::B => write!(f, "source-b"),
        }
    }
}

/// Which way changes flow during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    AToB,
    BToA,
    #[default]
    Both,
}

impl Direction {
    /// Whether changes originating in `system` are collected under this direction.
    pub fn reads_from(self, system: SystemTag) -> bool {
        match self {
            Direction::AToB => system == SystemTag::A,
            Direction::BToA => system == SystemTag::B,
            Direction::Both => true,
        }
    }

    /// Whether `system` may be written to under this direction.
    pub fn writes_to(self, system: SystemTag) -> bool {
        self.reads_from(system.opposite())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a-to-b"),
            Direction::BToA => write!(f, "b-to-a"),
            Direction::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a-to-b" | "a2b" => Ok(Direction::AToB),
            "b-to-a" | "b2a" => Ok(Direction::BToA),
            "both" => Ok(Direction::Both),
            other => Err(format!(
                "unknown direction '{other}'; expected: a-to-b, b-to-a, both"
            )),
        }
    }
}

/// A `(system, id)` pair used in audit entries and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub system: SystemTag,
    pub id: RecordId,
}

impl RecordRef {
    pub fn new(system: SystemTag, id: impl Into<RecordId>) -> Self {
        Self {
            system,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system.as_str(), self.id)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A typed field value. Both systems' native values and canonical values use
/// this representation; the Field Mapper coerces between kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    /// A single enumerated value (state, status, select).
    Select(String),
    MultiSelect(Vec<String>),
    /// A hierarchical classification path (area / iteration).
    Path(Vec<String>),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn select(s: impl Into<String>) -> Self {
        FieldValue::Select(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Best-effort string rendering, used when a value must land in a text field.
    pub fn as_display_string(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) | FieldValue::Select(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Date(d) => Some(d.to_rfc3339()),
            FieldValue::MultiSelect(values) => Some(values.join(", ")),
            FieldValue::Path(segments) => Some(segments.join(PATH_SEPARATOR)),
        }
    }
}

/// Separator used when a hierarchical path is flattened into a string.
pub const PATH_SEPARATOR: &str = "\\";

/// Native field name → value, as a connector reads or writes it.
pub type NativeFields = BTreeMap<String, FieldValue>;

/// A record in a connector's own schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeRecord {
    pub id: RecordId,
    pub fields: NativeFields,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

/// System-agnostic representation of a work item after field mapping.
///
/// Immutable for the duration of a sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub source: SystemTag,
    pub external_id: RecordId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub field_values: BTreeMap<String, FieldValue>,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl CanonicalRecord {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.source, self.external_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Whether a link can still carry changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Active,
    /// The counterpart is gone. Kept so the record is never re-created.
    Broken { reason: String, at: DateTime<Utc> },
}

/// Durable identity association between one record on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub team: TeamId,
    pub source_a_id: RecordId,
    pub source_b_id: RecordId,
    /// Fingerprint of the last canonical field set successfully synced.
    pub last_synced_fingerprint: String,
    #[serde(default)]
    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Link {
    pub fn new(
        team: TeamId,
        source_a_id: RecordId,
        source_b_id: RecordId,
        fingerprint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            team,
            source_a_id,
            source_b_id,
            last_synced_fingerprint: fingerprint.into(),
            status: LinkStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id_for(&self, system: SystemTag) -> &RecordId {
        match system {
            SystemTag::A => &self.source_a_id,
            SystemTag::B => &self.source_b_id,
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.status, LinkStatus::Broken { .. })
    }

    pub fn mark_broken(&mut self, reason: impl Into<String>) {
        let now = Utc::now();
        self.status = LinkStatus::Broken {
            reason: reason.into(),
            at: now,
        };
        self.updated_at = now;
    }

    pub fn record_sync(&mut self, fingerprint: impl Into<String>) {
        self.last_synced_fingerprint = fingerprint.into();
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Run history
// ---------------------------------------------------------------------------

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Scheduled,
    Webhook,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Webhook => write!(f, "webhook"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Why a run stopped before completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Another run holds the team lock. Expected contention, not an error.
    AlreadyRunning,
    CredentialExpired { system: SystemTag, message: String },
    CollectorFailed { system: SystemTag, message: String },
    Timeout,
    Internal { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::AlreadyRunning => write!(f, "already running"),
            AbortReason::CredentialExpired { system, message } => {
                write!(f, "credential expired for {system}: {message}")
            }
            AbortReason::CollectorFailed { system, message } => {
                write!(f, "collecting from {system} failed: {message}")
            }
            AbortReason::Timeout => write!(f, "run timed out"),
            AbortReason::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    #[default]
    Running,
    Completed,
    Aborted { reason: AbortReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Warning,
    Error,
}

/// One audit entry in a run's issue list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordRef>,
    pub level: IssueLevel,
    pub message: String,
}

impl RunIssue {
    pub fn warning(record: Option<RecordRef>, message: impl Into<String>) -> Self {
        Self {
            record,
            level: IssueLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(record: Option<RecordRef>, message: impl Into<String>) -> Self {
        Self {
            record,
            level: IssueLevel::Error,
            message: message.into(),
        }
    }
}

/// A concurrent edit that lost conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersededChange {
    pub loser: RecordRef,
    pub winner: RecordRef,
    pub loser_modified_at: DateTime<Utc>,
    pub winner_modified_at: DateTime<Utc>,
}

/// Counters reported back to the caller of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunCounts {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub error_count: u32,
}

/// `{historyId, result}` as returned to triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub history_id: HistoryId,
    pub result: RunCounts,
}

/// Durable audit record of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: HistoryId,
    pub team: TeamId,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub direction: Direction,
    pub dry_run: bool,
    pub created: u32,
    pub updated: u32,
    #[serde(default)]
    pub deleted: u32,
    pub skipped: u32,
    pub error_count: u32,
    #[serde(default)]
    pub errors: Vec<RunIssue>,
    #[serde(default)]
    pub superseded: Vec<SupersededChange>,
    #[serde(default)]
    pub outcome: RunOutcome,
}

impl SyncRun {
    pub fn start(team: TeamId, trigger: Trigger, direction: Direction, dry_run: bool) -> Self {
        Self {
            id: HistoryId::generate(),
            team,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            direction,
            dry_run,
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            error_count: 0,
            errors: Vec::new(),
            superseded: Vec::new(),
            outcome: RunOutcome::Running,
        }
    }

    /// Append an issue; error-level issues count towards `error_count`.
    pub fn push_issue(&mut self, issue: RunIssue) {
        if issue.level == IssueLevel::Error {
            self.error_count += 1;
        }
        self.errors.push(issue);
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn finalize(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn counts(&self) -> RunCounts {
        RunCounts {
            created: self.created,
            updated: self.updated,
            skipped: self.skipped,
            error_count: self.error_count,
        }
    }

    pub fn result(&self) -> RunResult {
        RunResult {
            history_id: self.id.clone(),
            result: self.counts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(TeamId::from("core").to_string(), "core");
        assert_eq!(RecordId::from("42").to_string(), "42");
        assert_eq!(RecordRef::new(SystemTag::B, "p-1").to_string(), "b:p-1");
    }

    #[test]
    fn direction_reads_and_writes() {
        assert!(Direction::AToB.reads_from(SystemTag::A));
        assert!(!Direction::AToB.reads_from(SystemTag::B));
        assert!(Direction::AToB.writes_to(SystemTag::B));
        assert!(!Direction::AToB.writes_to(SystemTag::A));
        assert!(Direction::Both.writes_to(SystemTag::A));
    }

    #[test]
    fn direction_parses_cli_spellings() {
        assert_eq!("a-to-b".parse::<Direction>(), Ok(Direction::AToB));
        assert_eq!("B2A".parse::<Direction>(), Ok(Direction::BToA));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut run = SyncRun::start(TeamId::from("t"), Trigger::Manual, Direction::Both, false);
        run.push_issue(RunIssue::warning(None, "unmapped value"));
        run.push_issue(RunIssue::error(None, "rejected"));
        assert_eq!(run.error_count, 1);
        assert_eq!(run.errors.len(), 2);
    }

    #[test]
    fn finalize_sets_finished_at() {
        let mut run = SyncRun::start(TeamId::from("t"), Trigger::Manual, Direction::Both, true);
        assert!(!run.is_finalized());
        run.finalize(RunOutcome::Completed);
        assert!(run.is_finalized());
        assert_eq!(run.outcome, RunOutcome::Completed);
    }

    #[test]
    fn broken_link_keeps_ids() {
        let mut link = Link::new(TeamId::from("t"), "1".into(), "p".into(), "fp");
        link.mark_broken("counterpart deleted");
        assert!(link.is_broken());
        assert_eq!(link.id_for(SystemTag::A), &RecordId::from("1"));
        assert_eq!(link.id_for(SystemTag::B), &RecordId::from("p"));
    }

    #[test]
    fn path_flattens_with_backslash() {
        let value = FieldValue::Path(vec!["Team".into(), "Backend".into()]);
        assert_eq!(value.as_display_string().as_deref(), Some("Team\\Backend"));
    }
}

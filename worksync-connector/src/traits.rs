//! The capability surface every remote system is reached through.
//!
//! Connectors speak their own field names ([`NativeRecord`]); the engine's
//! field mapper turns those into canonical records. One trait, two REST
//! implementations plus an in-memory one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use worksync_core::{FieldKind, NativeFields, NativeRecord, RecordId, SystemTag};

use crate::error::ConnectorResult;

/// One page of changed records plus the cursor to resume from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangePage {
    pub records: Vec<NativeRecord>,
    /// Opaque position; `None` only when the remote returned nothing and no
    /// previous cursor existed.
    pub cursor: Option<String>,
}

/// Result of translating a raw webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    Record { event_id: String, record: NativeRecord },
    Ignored { reason: String },
}

impl DeltaEvent {
    pub fn ignored(reason: impl Into<String>) -> Self {
        DeltaEvent::Ignored {
            reason: reason.into(),
        }
    }
}

/// A native field as the remote describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteField {
    pub name: String,
    pub kind: FieldKind,
    /// The remote's own type name (`title`, `status`, `treePath`, ...).
    pub native_type: String,
}

impl RemoteField {
    pub fn new(name: impl Into<String>, kind: FieldKind, native_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            native_type: native_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteSchema {
    pub fields: Vec<RemoteField>,
}

impl RemoteSchema {
    pub fn field(&self, name: &str) -> Option<&RemoteField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// Uniform surface over one remote system.
///
/// Implementations retry transient failures internally and never retry a
/// 4xx. `list_changed` must be resumable: calling it again with an older
/// cursor returns a superset of what a newer cursor would.
#[async_trait]
pub trait Connector: Send + Sync {
    fn system(&self) -> SystemTag;

    async fn list_changed(&self, cursor: Option<&str>) -> ConnectorResult<ChangePage>;

    async fn get_by_id(&self, id: &RecordId) -> ConnectorResult<Option<NativeRecord>>;

    async fn create(&self, fields: &NativeFields) -> ConnectorResult<RecordId>;

    /// Apply `delta` to an existing record. A missing record is
    /// `ConnectorError::NotFound`.
    async fn update(&self, id: &RecordId, delta: &NativeFields) -> ConnectorResult<()>;

    async fn delete(&self, id: &RecordId) -> ConnectorResult<()>;

    async fn describe_schema(&self) -> ConnectorResult<RemoteSchema>;

    /// Turn a push notification into a single changed record. Must be pure
    /// with respect to remote state: replays yield the same event id.
    async fn translate_delta_event(&self, payload: &Value) -> ConnectorResult<DeltaEvent>;
}

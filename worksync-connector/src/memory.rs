//! In-process connector with a monotonic change sequence.
//!
//! Used by the engine's tests and for local dry runs. Every mutation bumps a
//! sequence number; the cursor is the last sequence a caller has seen.
//! Failure injection covers the cases the engine has to survive: rejected
//! writes, listing outages, and counterparts that vanish.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use worksync_core::{FieldKind, FieldValue, NativeFields, NativeRecord, RecordId, SystemTag};

use crate::error::{ConnectorError, ConnectorResult};
use crate::traits::{ChangePage, Connector, DeltaEvent, RemoteField, RemoteSchema};

/// How many times each operation was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: u32,
    pub get: u32,
    pub create: u32,
    pub update: u32,
    pub delete: u32,
}

impl CallCounts {
    pub fn mutations(&self) -> u32 {
        self.create + self.update + self.delete
    }
}

#[derive(Debug)]
struct Stored {
    record: NativeRecord,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<RecordId, Stored>,
    seq: u64,
    next_id: u64,
    calls: CallCounts,
    reject_rules: Vec<(String, FieldValue)>,
    list_failure: Option<ConnectorError>,
    schema: Option<RemoteSchema>,
    write_delay: Option<Duration>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn check_rejections(&self, fields: &NativeFields) -> ConnectorResult<()> {
        for (field, value) in &self.reject_rules {
            if fields.get(field) == Some(value) {
                return Err(ConnectorError::rejected(format!(
                    "value {value:?} not allowed for {field}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryConnector {
    system: SystemTag,
    id_prefix: String,
    state: Mutex<State>,
}

impl MemoryConnector {
    pub fn new(system: SystemTag) -> Self {
        Self {
            system,
            id_prefix: system.as_str().to_ascii_uppercase(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed or overwrite a record exactly as given, timestamps included.
    pub fn insert(&self, record: NativeRecord) {
        let mut state = self.state();
        let seq = state.bump();
        state
            .records
            .insert(record.id.clone(), Stored { record, seq });
    }

    /// Edit a field the way a user would in the remote UI.
    pub fn edit(&self, id: &RecordId, field: &str, value: FieldValue, at: DateTime<Utc>) {
        let mut state = self.state();
        let seq = state.bump();
        if let Some(stored) = state.records.get_mut(id) {
            stored.record.fields.insert(field.to_string(), value);
            stored.record.modified_at = at;
            stored.seq = seq;
        }
    }

    /// Flag a record deleted (soft delete, still listed as a change).
    pub fn mark_deleted(&self, id: &RecordId, at: DateTime<Utc>) {
        let mut state = self.state();
        let seq = state.bump();
        if let Some(stored) = state.records.get_mut(id) {
            stored.record.deleted = true;
            stored.record.modified_at = at;
            stored.seq = seq;
        }
    }

    /// Hard-remove a record without leaving a change behind.
    pub fn purge(&self, id: &RecordId) {
        self.state().records.remove(id);
    }

    /// Reject any create or update whose payload sets `field` to `value`.
    pub fn reject_when(&self, field: &str, value: FieldValue) {
        self.state().reject_rules.push((field.to_string(), value));
    }

    /// Make every create, update and delete take `delay` before it lands.
    pub fn delay_writes(&self, delay: Duration) {
        self.state().write_delay = Some(delay);
    }

    async fn pause_before_write(&self) {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn clear_rejections(&self) {
        self.state().reject_rules.clear();
    }

    /// Make every `list_changed` fail with `error` until cleared.
    pub fn fail_listing(&self, error: Option<ConnectorError>) {
        self.state().list_failure = error;
    }

    pub fn set_schema(&self, schema: RemoteSchema) {
        self.state().schema = Some(schema);
    }

    pub fn get(&self, id: &RecordId) -> Option<NativeRecord> {
        self.state().records.get(id).map(|s| s.record.clone())
    }

    pub fn records(&self) -> Vec<NativeRecord> {
        self.state()
            .records
            .values()
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Current end of the change sequence, usable as a cursor.
    pub fn head(&self) -> String {
        self.state().seq.to_string()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn system(&self) -> SystemTag {
        self.system
    }

    async fn list_changed(&self, cursor: Option<&str>) -> ConnectorResult<ChangePage> {
        let mut state = self.state();
        state.calls.list += 1;
        if let Some(err) = &state.list_failure {
            return Err(err.clone());
        }
        let since = match cursor {
            Some(c) => c
                .parse::<u64>()
                .map_err(|_| ConnectorError::rejected(format!("invalid cursor '{c}'")))?,
            None => 0,
        };

        let mut changed: Vec<&Stored> = state.records.values().filter(|s| s.seq > since).collect();
        changed.sort_by_key(|s| s.seq);
        let records = changed.iter().map(|s| s.record.clone()).collect();
        Ok(ChangePage {
            records,
            cursor: Some(state.seq.to_string()),
        })
    }

    async fn get_by_id(&self, id: &RecordId) -> ConnectorResult<Option<NativeRecord>> {
        let mut state = self.state();
        state.calls.get += 1;
        Ok(state.records.get(id).map(|s| s.record.clone()))
    }

    async fn create(&self, fields: &NativeFields) -> ConnectorResult<RecordId> {
        self.pause_before_write().await;
        let mut state = self.state();
        state.calls.create += 1;
        state.check_rejections(fields)?;

        state.next_id += 1;
        let id = RecordId(format!("{}-{}", self.id_prefix, state.next_id));
        let seq = state.bump();
        let record = NativeRecord {
            id: id.clone(),
            fields: fields.clone(),
            modified_at: Utc::now(),
            deleted: false,
        };
        state.records.insert(id.clone(), Stored { record, seq });
        Ok(id)
    }

    async fn update(&self, id: &RecordId, delta: &NativeFields) -> ConnectorResult<()> {
        self.pause_before_write().await;
        let mut state = self.state();
        state.calls.update += 1;
        state.check_rejections(delta)?;
        if !state.records.contains_key(id) {
            return Err(ConnectorError::NotFound {
                resource: id.to_string(),
            });
        }
        let seq = state.bump();
        if let Some(stored) = state.records.get_mut(id) {
            for (field, value) in delta {
                stored.record.fields.insert(field.clone(), value.clone());
            }
            stored.record.modified_at = Utc::now();
            stored.seq = seq;
        }
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> ConnectorResult<()> {
        self.pause_before_write().await;
        let mut state = self.state();
        state.calls.delete += 1;
        match state.records.remove(id) {
            Some(_) => Ok(()),
            None => Err(ConnectorError::NotFound {
                resource: id.to_string(),
            }),
        }
    }

    async fn describe_schema(&self) -> ConnectorResult<RemoteSchema> {
        let state = self.state();
        if let Some(schema) = &state.schema {
            return Ok(schema.clone());
        }
        // Without an explicit schema, every field ever stored counts.
        let mut kinds: HashMap<&str, &FieldValue> = HashMap::new();
        for stored in state.records.values() {
            for (name, value) in &stored.record.fields {
                kinds.entry(name.as_str()).or_insert(value);
            }
        }
        let mut fields: Vec<RemoteField> = kinds
            .into_iter()
            .map(|(name, value)| RemoteField::new(name, value_kind(value), value_type(value)))
            .collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(RemoteSchema { fields })
    }

    /// Accepts `{"event_id": "...", "record_id": "..."}`.
    async fn translate_delta_event(&self, payload: &Value) -> ConnectorResult<DeltaEvent> {
        let (Some(event_id), Some(record_id)) = (
            payload.get("event_id").and_then(Value::as_str),
            payload.get("record_id").and_then(Value::as_str),
        ) else {
            return Ok(DeltaEvent::ignored("payload lacks event_id or record_id"));
        };
        match self.get_by_id(&RecordId::from(record_id)).await? {
            Some(record) => Ok(DeltaEvent::Record {
                event_id: event_id.to_string(),
                record,
            }),
            None => Ok(DeltaEvent::ignored(format!("record {record_id} not found"))),
        }
    }
}

fn value_kind(value: &FieldValue) -> FieldKind {
    match value {
        FieldValue::Null | FieldValue::Text(_) => FieldKind::Text,
        FieldValue::Number(_) => FieldKind::Number,
        FieldValue::Bool(_) => FieldKind::Bool,
        FieldValue::Date(_) => FieldKind::Date,
        FieldValue::Select(_) => FieldKind::Select,
        FieldValue::MultiSelect(_) => FieldKind::MultiSelect,
        FieldValue::Path(_) => FieldKind::Path,
    }
}

fn value_type(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Null | FieldValue::Text(_) => "text",
        FieldValue::Number(_) => "number",
        FieldValue::Bool(_) => "bool",
        FieldValue::Date(_) => "date",
        FieldValue::Select(_) => "select",
        FieldValue::MultiSelect(_) => "multi_select",
        FieldValue::Path(_) => "path",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(title: &str) -> NativeFields {
        let mut f = NativeFields::new();
        f.insert("title".into(), FieldValue::text(title));
        f
    }

    #[tokio::test]
    async fn cursor_only_returns_newer_changes() {
        let conn = MemoryConnector::new(SystemTag::B);
        conn.create(&fields("one")).await.unwrap();
        let first = conn.list_changed(None).await.unwrap();
        assert_eq!(first.records.len(), 1);

        conn.create(&fields("two")).await.unwrap();
        let second = conn.list_changed(first.cursor.as_deref()).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].fields["title"], FieldValue::text("two"));

        // An older cursor yields a superset.
        let replay = conn.list_changed(None).await.unwrap();
        assert_eq!(replay.records.len(), 2);
    }

    #[tokio::test]
    async fn rejection_rule_applies_to_creates() {
        let conn = MemoryConnector::new(SystemTag::B);
        conn.reject_when("title", FieldValue::text("bad"));
        let err = conn.create(&fields("bad")).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected { .. }));
        assert!(conn.is_empty());
        assert_eq!(conn.calls().create, 1);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let conn = MemoryConnector::new(SystemTag::A);
        let err = conn
            .update(&RecordId::from("nope"), &fields("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ids_carry_system_prefix() {
        let conn = MemoryConnector::new(SystemTag::B);
        let id = conn.create(&fields("x")).await.unwrap();
        assert_eq!(id, RecordId::from("B-1"));
    }
}

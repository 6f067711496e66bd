//! Source A: hierarchical work-item tracker over REST.
//!
//! Change listing runs a WIQL query for ids whose `System.ChangedDate` is at
//! or after the cursor, then fetches details in batches. Writes use
//! JSON-Patch documents against `/fields/<reference name>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, info};
use worksync_core::types::PATH_SEPARATOR;
use worksync_core::{
    Credential, FieldKind, FieldValue, NativeFields, NativeRecord, RecordId, SourceAConfig,
    SystemTag,
};

use crate::error::{ConnectorError, ConnectorResult};
use crate::http::{build_client, send_json};
use crate::retry::RetryPolicy;
use crate::traits::{ChangePage, Connector, DeltaEvent, RemoteField, RemoteSchema};

const API_VERSION: &str = "7.1";
/// Maximum ids per detail request accepted by the batch endpoint.
pub const BATCH_SIZE: usize = 200;

pub const FIELD_ID: &str = "System.Id";
pub const FIELD_CHANGED_DATE: &str = "System.ChangedDate";
pub const FIELD_STATE: &str = "System.State";
pub const FIELD_TAGS: &str = "System.Tags";
const REMOVED_STATE: &str = "Removed";

/// Reference names whose values are tree paths.
const PATH_FIELDS: &[&str] = &["System.AreaPath", "System.IterationPath"];

/// Fields the tracker maintains itself; never written back.
const READ_ONLY_FIELDS: &[&str] = &[
    FIELD_ID,
    FIELD_CHANGED_DATE,
    "System.Rev",
    "System.CreatedDate",
    "System.ChangedBy",
    "System.CreatedBy",
    "System.TeamProject",
    "System.WorkItemType",
];

pub struct WorkItemsConnector {
    client: Client,
    base_url: String,
    project: String,
    work_item_type: String,
    token: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for WorkItemsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemsConnector")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .finish()
    }
}

impl WorkItemsConnector {
    pub fn new(config: &SourceAConfig, credential: &Credential) -> ConnectorResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ConnectorError::Config {
                message: "source_a.base_url is empty".to_string(),
            });
        }
        Ok(Self {
            client: build_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            work_item_type: config.work_item_type.clone(),
            token: credential.access_token.clone(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        format!(
            "{}/{}/_apis/wit/{}{}api-version={}",
            self.base_url, self.project, path, sep, API_VERSION
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/json")
    }

    fn patch_request(&self, method: Method, url: &str, ops: &Value) -> RequestBuilder {
        self.request(method, url)
            .header(header::CONTENT_TYPE, "application/json-patch+json")
            .body(ops.to_string())
    }

    /// WIQL for ids changed at or after `cursor`, oldest first.
    fn changed_query(&self, cursor: Option<&str>) -> String {
        let mut wiql = format!(
            "SELECT [{FIELD_ID}] FROM WorkItems WHERE [System.TeamProject] = '{}'",
            self.project.replace('\'', "''")
        );
        if let Some(cursor) = cursor {
            wiql.push_str(&format!(
                " AND [{FIELD_CHANGED_DATE}] >= '{}'",
                cursor.replace('\'', "''")
            ));
        }
        wiql.push_str(&format!(" ORDER BY [{FIELD_CHANGED_DATE}] ASC"));
        wiql
    }

    async fn query_ids(&self, cursor: Option<&str>) -> ConnectorResult<Vec<u64>> {
        let url = self.url("wiql?timePrecision=true");
        let body = json!({ "query": self.changed_query(cursor) });
        let response = send_json(&self.retry, "wiql", || {
            self.request(Method::POST, &url).json(&body)
        })
        .await?;

        let ids = response
            .get("workItems")
            .and_then(Value::as_array)
            .ok_or_else(|| ConnectorError::invalid_payload("wiql response lacks workItems"))?
            .iter()
            .filter_map(|w| w.get("id").and_then(Value::as_u64))
            .collect();
        Ok(ids)
    }

    async fn fetch_batch(&self, ids: &[u64]) -> ConnectorResult<Vec<NativeRecord>> {
        let url = self.url("workitemsbatch");
        let body = json!({ "ids": ids, "errorPolicy": "omit" });
        let response = send_json(&self.retry, "workitemsbatch", || {
            self.request(Method::POST, &url).json(&body)
        })
        .await?;

        response
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| ConnectorError::invalid_payload("batch response lacks value"))?
            .iter()
            .filter(|item| !item.is_null())
            .map(parse_work_item)
            .collect()
    }
}

#[async_trait]
impl Connector for WorkItemsConnector {
    fn system(&self) -> SystemTag {
        SystemTag::A
    }

    async fn list_changed(&self, cursor: Option<&str>) -> ConnectorResult<ChangePage> {
        let ids = self.query_ids(cursor).await?;
        debug!(count = ids.len(), cursor = ?cursor, "work items changed since cursor");

        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            records.extend(self.fetch_batch(chunk).await?);
        }
        records.sort_by(|a, b| a.modified_at.cmp(&b.modified_at));

        let cursor = records
            .iter()
            .map(|r| r.modified_at)
            .max()
            .map(|t| t.to_rfc3339())
            .or_else(|| cursor.map(str::to_string));
        Ok(ChangePage { records, cursor })
    }

    async fn get_by_id(&self, id: &RecordId) -> ConnectorResult<Option<NativeRecord>> {
        let url = self.url(&format!("workitems/{}", id.0));
        match send_json(&self.retry, "get work item", || {
            self.request(Method::GET, &url)
        })
        .await
        {
            Ok(item) => parse_work_item(&item).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, fields: &NativeFields) -> ConnectorResult<RecordId> {
        let url = self.url(&format!("workitems/${}", self.work_item_type));
        let ops = patch_document(fields, false);
        let created = send_json(&self.retry, "create work item", || {
            self.patch_request(Method::POST, &url, &ops)
        })
        .await?;
        let id = created
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ConnectorError::invalid_payload("created work item lacks id"))?;
        info!(id, "created work item");
        Ok(RecordId(id.to_string()))
    }

    async fn update(&self, id: &RecordId, delta: &NativeFields) -> ConnectorResult<()> {
        let url = self.url(&format!("workitems/{}", id.0));
        let ops = patch_document(delta, true);
        if ops.as_array().map(Vec::is_empty).unwrap_or(true) {
            return Ok(());
        }
        send_json(&self.retry, "update work item", || {
            self.patch_request(Method::PATCH, &url, &ops)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> ConnectorResult<()> {
        let url = self.url(&format!("workitems/{}", id.0));
        send_json(&self.retry, "delete work item", || {
            self.request(Method::DELETE, &url)
        })
        .await?;
        Ok(())
    }

    async fn describe_schema(&self) -> ConnectorResult<RemoteSchema> {
        let url = self.url("fields");
        let response = send_json(&self.retry, "list fields", || {
            self.request(Method::GET, &url)
        })
        .await?;
        let fields = response
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| ConnectorError::invalid_payload("fields response lacks value"))?
            .iter()
            .filter_map(|f| {
                let name = f.get("referenceName")?.as_str()?;
                let native = f.get("type").and_then(Value::as_str).unwrap_or("string");
                Some(RemoteField::new(name, field_kind(name, native), native))
            })
            .collect();
        Ok(RemoteSchema { fields })
    }

    async fn translate_delta_event(&self, payload: &Value) -> ConnectorResult<DeltaEvent> {
        translate_service_hook(payload)
    }
}

// ---------------------------------------------------------------------------
// Payload translation
// ---------------------------------------------------------------------------

/// Parse a work item document (`{id, fields: {...}}`) into a native record.
pub fn parse_work_item(item: &Value) -> ConnectorResult<NativeRecord> {
    let id = item
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConnectorError::invalid_payload("work item lacks id"))?;
    let raw_fields = item
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| ConnectorError::invalid_payload(format!("work item {id} lacks fields")))?;

    let modified_at = raw_fields
        .get(FIELD_CHANGED_DATE)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| {
            ConnectorError::invalid_payload(format!("work item {id} lacks {FIELD_CHANGED_DATE}"))
        })?;

    let fields: BTreeMap<String, FieldValue> = raw_fields
        .iter()
        .map(|(name, value)| (name.clone(), native_value(name, value)))
        .collect();
    let deleted = matches!(fields.get(FIELD_STATE), Some(FieldValue::Text(s)) if s == REMOVED_STATE);

    Ok(NativeRecord {
        id: RecordId(id.to_string()),
        fields,
        modified_at,
        deleted,
    })
}

/// Service-hook payloads: `workitem.created`, `workitem.updated`,
/// `workitem.deleted`, `workitem.restored`.
pub fn translate_service_hook(payload: &Value) -> ConnectorResult<DeltaEvent> {
    let Some(event_id) = payload.get("id").and_then(Value::as_str) else {
        return Ok(DeltaEvent::ignored("payload has no event id"));
    };
    let event_type = payload
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(resource) = payload.get("resource") else {
        return Ok(DeltaEvent::ignored("payload has no resource"));
    };

    let record = match event_type {
        "workitem.created" | "workitem.restored" => parse_work_item(resource)?,
        "workitem.updated" => {
            // The updated resource is a revision delta; the full item rides in `revision`.
            let revision = resource
                .get("revision")
                .ok_or_else(|| ConnectorError::invalid_payload("update event lacks revision"))?;
            parse_work_item(revision)?
        }
        "workitem.deleted" => {
            let mut record = parse_work_item(resource)?;
            record.deleted = true;
            record
        }
        other => return Ok(DeltaEvent::ignored(format!("unhandled event type '{other}'"))),
    };

    Ok(DeltaEvent::Record {
        event_id: event_id.to_string(),
        record,
    })
}

fn native_value(name: &str, value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
        Value::String(s) if PATH_FIELDS.contains(&name) => FieldValue::Path(
            s.split(PATH_SEPARATOR)
                .filter(|seg| !seg.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) if name == FIELD_TAGS => FieldValue::MultiSelect(
            s.split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) if name.ends_with("Date") => parse_timestamp(s)
            .map(FieldValue::Date)
            .unwrap_or_else(|| FieldValue::Text(s.clone())),
        Value::String(s) => FieldValue::Text(s.clone()),
        // Identity references carry a display name.
        Value::Object(obj) => obj
            .get("displayName")
            .or_else(|| obj.get("uniqueName"))
            .and_then(Value::as_str)
            .map(FieldValue::text)
            .unwrap_or(FieldValue::Null),
        Value::Array(items) => FieldValue::MultiSelect(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
    }
}

fn wire_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) | FieldValue::Select(s) => Value::String(s.clone()),
        FieldValue::Number(n) => json!(n),
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Date(d) => Value::String(d.to_rfc3339()),
        FieldValue::MultiSelect(values) => Value::String(values.join("; ")),
        FieldValue::Path(segments) => Value::String(segments.join(PATH_SEPARATOR)),
    }
}

/// JSON-Patch for `fields`. Nulls become `remove` on update and are omitted
/// on create.
fn patch_document(fields: &NativeFields, is_update: bool) -> Value {
    let ops: Vec<Value> = fields
        .iter()
        .filter(|(name, _)| !READ_ONLY_FIELDS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            let path = format!("/fields/{name}");
            match value {
                FieldValue::Null if is_update => Some(json!({ "op": "remove", "path": path })),
                FieldValue::Null => None,
                v => Some(json!({ "op": "add", "path": path, "value": wire_value(v) })),
            }
        })
        .collect();
    Value::Array(ops)
}

fn field_kind(name: &str, native: &str) -> FieldKind {
    if name == FIELD_STATE {
        return FieldKind::Select;
    }
    if name == FIELD_TAGS {
        return FieldKind::MultiSelect;
    }
    match native {
        "treePath" => FieldKind::Path,
        "integer" | "double" => FieldKind::Number,
        "boolean" => FieldKind::Bool,
        "dateTime" => FieldKind::Date,
        _ => FieldKind::Text,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

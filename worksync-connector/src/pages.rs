//! Source B: property-based database over REST.
//!
//! Records are pages in one database. Property values are typed on read
//! (`title`, `rich_text`, `select`, `status`, ...), so writes look up each
//! property's native type in the database schema before serialising.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use worksync_core::{
    Credential, FieldKind, FieldValue, NativeFields, NativeRecord, RecordId, SourceBConfig,
    SystemTag,
};

use crate::error::{ConnectorError, ConnectorResult};
use crate::http::{build_client, send_json};
use crate::retry::RetryPolicy;
use crate::traits::{ChangePage, Connector, DeltaEvent, RemoteField, RemoteSchema};

pub const API_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

pub struct PagesConnector {
    client: Client,
    base_url: String,
    database_id: String,
    token: String,
    retry: RetryPolicy,
    schema: OnceCell<RemoteSchema>,
}

impl std::fmt::Debug for PagesConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagesConnector")
            .field("base_url", &self.base_url)
            .field("database_id", &self.database_id)
            .finish()
    }
}

impl PagesConnector {
    pub fn new(config: &SourceBConfig, credential: &Credential) -> ConnectorResult<Self> {
        if config.database_id.trim().is_empty() {
            return Err(ConnectorError::Config {
                message: "source_b.database_id is empty".to_string(),
            });
        }
        Ok(Self {
            client: build_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            database_id: config.database_id.clone(),
            token: credential.access_token.clone(),
            retry: RetryPolicy::default(),
            schema: OnceCell::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/v1/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", API_VERSION)
    }

    async fn schema(&self) -> ConnectorResult<&RemoteSchema> {
        self.schema
            .get_or_try_init(|| self.fetch_schema())
            .await
    }

    async fn fetch_schema(&self) -> ConnectorResult<RemoteSchema> {
        let path = format!("databases/{}", self.database_id);
        let database = send_json(&self.retry, "get database", || {
            self.request(Method::GET, &path)
        })
        .await?;
        let properties = database
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| ConnectorError::invalid_payload("database lacks properties"))?;

        let fields = properties
            .iter()
            .map(|(name, prop)| {
                let native = prop.get("type").and_then(Value::as_str).unwrap_or("unknown");
                RemoteField::new(name.as_str(), property_kind(native), native)
            })
            .collect();
        Ok(RemoteSchema { fields })
    }

    /// Serialise `fields` into a `properties` object. Unknown properties and
    /// read-only types are rejected before any request is made.
    async fn properties(&self, fields: &NativeFields) -> ConnectorResult<Value> {
        let schema = self.schema().await?;
        let mut properties = Map::new();
        for (name, value) in fields {
            let field = schema.field(name).ok_or_else(|| {
                ConnectorError::rejected(format!("database has no property '{name}'"))
            })?;
            properties.insert(name.clone(), property_value(&field.native_type, value)?);
        }
        Ok(Value::Object(properties))
    }
}

#[async_trait]
impl Connector for PagesConnector {
    fn system(&self) -> SystemTag {
        SystemTag::B
    }

    async fn list_changed(&self, cursor: Option<&str>) -> ConnectorResult<ChangePage> {
        let path = format!("databases/{}/query", self.database_id);
        let mut records = Vec::new();
        let mut start_cursor: Option<String> = None;

        loop {
            let mut body = json!({
                "page_size": PAGE_SIZE,
                "sorts": [{ "timestamp": "last_edited_time", "direction": "ascending" }],
            });
            if let Some(since) = cursor {
                body["filter"] = json!({
                    "timestamp": "last_edited_time",
                    "last_edited_time": { "on_or_after": since },
                });
            }
            if let Some(start) = &start_cursor {
                body["start_cursor"] = json!(start);
            }

            let response = send_json(&self.retry, "query database", || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;

            let results = response
                .get("results")
                .and_then(Value::as_array)
                .ok_or_else(|| ConnectorError::invalid_payload("query response lacks results"))?;
            for page in results {
                records.push(parse_page(page)?);
            }

            let has_more = response
                .get("has_more")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            start_cursor = response
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || start_cursor.is_none() {
                break;
            }
        }
        debug!(count = records.len(), cursor = ?cursor, "pages changed since cursor");

        let cursor = records
            .iter()
            .map(|r| r.modified_at)
            .max()
            .map(|t| t.to_rfc3339())
            .or_else(|| cursor.map(str::to_string));
        Ok(ChangePage { records, cursor })
    }

    async fn get_by_id(&self, id: &RecordId) -> ConnectorResult<Option<NativeRecord>> {
        let path = format!("pages/{}", id.0);
        match send_json(&self.retry, "get page", || self.request(Method::GET, &path)).await {
            Ok(page) => parse_page(&page).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, fields: &NativeFields) -> ConnectorResult<RecordId> {
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": self.properties(fields).await?,
        });
        let page = send_json(&self.retry, "create page", || {
            self.request(Method::POST, "pages").json(&body)
        })
        .await?;
        let id = page
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::invalid_payload("created page lacks id"))?;
        info!(id, "created page");
        Ok(RecordId::from(id))
    }

    async fn update(&self, id: &RecordId, delta: &NativeFields) -> ConnectorResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let path = format!("pages/{}", id.0);
        let body = json!({ "properties": self.properties(delta).await? });
        send_json(&self.retry, "update page", || {
            self.request(Method::PATCH, &path).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> ConnectorResult<()> {
        let path = format!("pages/{}", id.0);
        let body = json!({ "archived": true });
        send_json(&self.retry, "archive page", || {
            self.request(Method::PATCH, &path).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn describe_schema(&self) -> ConnectorResult<RemoteSchema> {
        self.schema().await.cloned()
    }

    async fn translate_delta_event(&self, payload: &Value) -> ConnectorResult<DeltaEvent> {
        if payload.get("verification_token").is_some() {
            return Ok(DeltaEvent::ignored("subscription verification request"));
        }
        let Some(event_id) = payload.get("id").and_then(Value::as_str) else {
            return Ok(DeltaEvent::ignored("payload has no event id"));
        };
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !event_type.starts_with("page.") {
            return Ok(DeltaEvent::ignored(format!(
                "unhandled event type '{event_type}'"
            )));
        }
        let Some(page_id) = payload.pointer("/entity/id").and_then(Value::as_str) else {
            return Ok(DeltaEvent::ignored("event has no entity id"));
        };
        if let Some(parent) = payload.pointer("/data/parent/id").and_then(Value::as_str) {
            if normalize_id(parent) != normalize_id(&self.database_id) {
                return Ok(DeltaEvent::ignored("page belongs to another database"));
            }
        }

        let deleted_at = || {
            payload
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now)
        };
        let record = if event_type == "page.deleted" {
            tombstone(page_id, deleted_at())
        } else {
            // Events only signal a change; the page itself carries the values.
            match self.get_by_id(&RecordId::from(page_id)).await? {
                Some(record) => record,
                None => tombstone(page_id, deleted_at()),
            }
        };

        Ok(DeltaEvent::Record {
            event_id: event_id.to_string(),
            record,
        })
    }
}

// ---------------------------------------------------------------------------
// Payload translation
// ---------------------------------------------------------------------------

/// Parse a page object into a native record.
pub fn parse_page(page: &Value) -> ConnectorResult<NativeRecord> {
    let id = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::invalid_payload("page lacks id"))?;
    let modified_at = page
        .get("last_edited_time")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| ConnectorError::invalid_payload(format!("page {id} lacks last_edited_time")))?;
    let archived = page
        .get("archived")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || page.get("in_trash").and_then(Value::as_bool).unwrap_or(false);

    let mut fields = NativeFields::new();
    if let Some(properties) = page.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            if let Some(value) = read_property(prop) {
                fields.insert(name.clone(), value);
            }
        }
    }

    Ok(NativeRecord {
        id: RecordId::from(id),
        fields,
        modified_at,
        deleted: archived,
    })
}

fn tombstone(id: &str, at: DateTime<Utc>) -> NativeRecord {
    NativeRecord {
        id: RecordId::from(id),
        fields: NativeFields::new(),
        modified_at: at,
        deleted: true,
    }
}

/// Read one typed property. `None` for types that have no field value
/// (relations, rollups, formulas, people).
fn read_property(prop: &Value) -> Option<FieldValue> {
    let kind = prop.get("type")?.as_str()?;
    let inner = prop.get(kind)?;
    let value = match kind {
        "title" | "rich_text" => FieldValue::Text(plain_text(inner)),
        "select" | "status" => inner
            .get("name")
            .and_then(Value::as_str)
            .map(FieldValue::select)
            .unwrap_or(FieldValue::Null),
        "multi_select" => FieldValue::MultiSelect(
            inner
                .as_array()
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| o.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        "number" => inner.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
        "checkbox" => FieldValue::Bool(inner.as_bool().unwrap_or(false)),
        "date" => inner
            .get("start")
            .and_then(Value::as_str)
            .and_then(parse_date)
            .map(FieldValue::Date)
            .unwrap_or(FieldValue::Null),
        "url" | "email" | "phone_number" => inner
            .as_str()
            .map(FieldValue::text)
            .unwrap_or(FieldValue::Null),
        _ => return None,
    };
    Some(value)
}

fn plain_text(fragments: &Value) -> String {
    fragments
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Serialise a value for a property of `native_type`.
fn property_value(native_type: &str, value: &FieldValue) -> ConnectorResult<Value> {
    let text = || value.as_display_string().unwrap_or_default();
    let out = match native_type {
        "title" | "rich_text" => {
            let content = text();
            let fragments = if content.is_empty() {
                json!([])
            } else {
                json!([{ "type": "text", "text": { "content": content } }])
            };
            keyed(native_type, fragments)
        }
        "select" | "status" => match value.as_display_string() {
            Some(name) => keyed(native_type, json!({ "name": name })),
            None => keyed(native_type, Value::Null),
        },
        "multi_select" => {
            let names: Vec<String> = match value {
                FieldValue::MultiSelect(values) => values.clone(),
                FieldValue::Null => Vec::new(),
                other => other.as_display_string().into_iter().collect(),
            };
            let options: Vec<Value> = names.into_iter().map(|n| json!({ "name": n })).collect();
            json!({ "multi_select": options })
        }
        "number" => match value {
            FieldValue::Number(n) => json!({ "number": n }),
            FieldValue::Null => json!({ "number": null }),
            other => {
                let parsed = other
                    .as_display_string()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .ok_or_else(|| {
                        ConnectorError::rejected(format!("{other:?} is not a number"))
                    })?;
                json!({ "number": parsed })
            }
        },
        "checkbox" => match value {
            FieldValue::Bool(b) => json!({ "checkbox": b }),
            FieldValue::Null => json!({ "checkbox": false }),
            other => {
                let truthy = matches!(
                    other.as_display_string().as_deref(),
                    Some("true") | Some("yes") | Some("1")
                );
                json!({ "checkbox": truthy })
            }
        },
        "date" => match value {
            FieldValue::Date(d) => json!({ "date": { "start": d.to_rfc3339() } }),
            FieldValue::Null => json!({ "date": null }),
            other => {
                let start = other.as_display_string().unwrap_or_default();
                json!({ "date": { "start": start } })
            }
        },
        "url" | "email" | "phone_number" => match value.as_display_string() {
            Some(s) => keyed(native_type, Value::String(s)),
            None => keyed(native_type, Value::Null),
        },
        other => {
            return Err(ConnectorError::rejected(format!(
                "property type '{other}' is not writable"
            )))
        }
    };
    Ok(out)
}

fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn property_kind(native: &str) -> FieldKind {
    match native {
        "select" | "status" => FieldKind::Select,
        "multi_select" => FieldKind::MultiSelect,
        "number" => FieldKind::Number,
        "checkbox" => FieldKind::Bool,
        "date" => FieldKind::Date,
        _ => FieldKind::Text,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Dates may be a full timestamp or a bare `YYYY-MM-DD`.
fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(s).or_else(|| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    })
}

fn normalize_id(id: &str) -> String {
    id.replace('-', "").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Value {
        json!({
            "id": "59833787-2cf9-4fdf-8782-e53db20768a5",
            "last_edited_time": "2024-03-01T10:00:00.000Z",
            "archived": false,
            "properties": {
                "Name": { "type": "title", "title": [
                    { "plain_text": "Fix " }, { "plain_text": "login" }
                ]},
                "Status": { "type": "status", "status": { "name": "Done" } },
                "Labels": { "type": "multi_select", "multi_select": [{ "name": "backend" }] },
                "Due": { "type": "date", "date": { "start": "2024-04-02" } },
                "Owner": { "type": "people", "people": [] }
            }
        })
    }

    #[test]
    fn parses_typed_properties() {
        let record = parse_page(&page()).unwrap();
        assert_eq!(record.fields["Name"], FieldValue::text("Fix login"));
        assert_eq!(record.fields["Status"], FieldValue::select("Done"));
        assert_eq!(
            record.fields["Labels"],
            FieldValue::MultiSelect(vec!["backend".into()])
        );
        assert!(matches!(record.fields["Due"], FieldValue::Date(_)));
        assert!(!record.fields.contains_key("Owner"));
        assert!(!record.deleted);
    }

    #[test]
    fn archived_page_is_a_deletion() {
        let mut p = page();
        p["archived"] = json!(true);
        assert!(parse_page(&p).unwrap().deleted);
    }

    #[test]
    fn serialises_by_native_type() {
        assert_eq!(
            property_value("status", &FieldValue::text("Done")).unwrap(),
            json!({ "status": { "name": "Done" } })
        );
        assert_eq!(
            property_value("title", &FieldValue::text("Fix")).unwrap(),
            json!({ "title": [{ "type": "text", "text": { "content": "Fix" } }] })
        );
        assert_eq!(
            property_value("rich_text", &FieldValue::Path(vec!["A".into(), "B".into()])).unwrap(),
            json!({ "rich_text": [{ "type": "text", "text": { "content": "A\\B" } }] })
        );
        assert!(property_value("number", &FieldValue::text("abc")).is_err());
        assert!(property_value("formula", &FieldValue::text("x")).is_err());
    }

    #[test]
    fn ids_compare_without_dashes() {
        assert_eq!(
            normalize_id("59833787-2CF9-4fdf"),
            normalize_id("598337872cf94fdf")
        );
    }
}

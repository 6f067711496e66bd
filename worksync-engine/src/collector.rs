//! Change collection: turn a connector's native changes into canonical
//! records, either by a cursor pull or from a single webhook delta.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};
use worksync_connector::{Connector, ConnectorResult, DeltaEvent};
use worksync_core::{CanonicalRecord, RecordId, RunIssue};

use crate::mapper::FieldMapper;

/// The output of one collection pass for one side.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// Changed records, oldest first, at most one per id.
    pub records: Vec<CanonicalRecord>,
    /// Position to resume from after these records are applied.
    pub cursor: Option<String>,
    /// Mapping warnings raised while converting.
    pub issues: Vec<RunIssue>,
}

/// A resolved webhook delivery.
#[derive(Debug, Clone)]
pub enum Delta {
    Record {
        event_id: String,
        record: CanonicalRecord,
        issues: Vec<RunIssue>,
    },
    Ignored {
        reason: String,
    },
}

/// Pull everything `connector` reports as changed since `cursor`.
///
/// Connector listings may repeat a record (inclusive cursors, pagination
/// overlap). Only the most recently modified version of each id is kept,
/// at the position of its first appearance.
pub async fn collect_since(
    connector: &dyn Connector,
    mapper: &FieldMapper,
    cursor: Option<&str>,
) -> ConnectorResult<Collected> {
    let system = connector.system();
    let page = connector.list_changed(cursor).await?;
    let listed = page.records.len();

    let mut position: HashMap<RecordId, usize> = HashMap::new();
    let mut collected = Collected {
        cursor: page.cursor,
        ..Collected::default()
    };

    for native in &page.records {
        let mapped = mapper.to_canonical(system, native);
        match position.get(&native.id) {
            Some(&idx) => {
                if mapped.value.last_modified_at >= collected.records[idx].last_modified_at {
                    collected.records[idx] = mapped.value;
                }
            }
            None => {
                position.insert(native.id.clone(), collected.records.len());
                collected.records.push(mapped.value);
            }
        }
        collected.issues.extend(mapped.warnings);
    }

    info!(
        system = %system,
        listed,
        changed = collected.records.len(),
        "collected changes"
    );
    Ok(collected)
}

/// Resolve one raw webhook payload into at most one canonical record.
pub async fn collect_delta(
    connector: &dyn Connector,
    mapper: &FieldMapper,
    payload: &Value,
) -> ConnectorResult<Delta> {
    let system = connector.system();
    match connector.translate_delta_event(payload).await? {
        DeltaEvent::Record { event_id, record } => {
            let mapped = mapper.to_canonical(system, &record);
            debug!(system = %system, event_id = %event_id, record = %record.id, "webhook delta resolved");
            Ok(Delta::Record {
                event_id,
                record: mapped.value,
                issues: mapped.warnings,
            })
        }
        DeltaEvent::Ignored { reason } => {
            debug!(system = %system, reason = %reason, "webhook delta ignored");
            Ok(Delta::Ignored { reason })
        }
    }
}

//! Field Mapper: native field sets ↔ canonical records.
//!
//! Canonical enumerated values use Source A's spelling. Reading from B looks
//! values up in the `b` column of the entry's translation table; writing to
//! B looks them up in the `a` column. A value with no table row passes
//! through unchanged and produces a warning-level issue.
//!
//! Normalisation keeps fingerprints stable across the two schemas:
//! empty text and nulls are dropped, multi-selects are sorted and
//! deduplicated, and tree paths are flattened to `\`-joined text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use worksync_core::config::{DESCRIPTION_KEY, STATE_KEY, TITLE_KEY};
use worksync_core::types::PATH_SEPARATOR;
use worksync_core::{
    CanonicalRecord, FieldKind, FieldMapping, FieldValue, MappingEntry, NativeFields,
    NativeRecord, RecordRef, RunIssue, SystemTag,
};
use worksync_connector::RemoteSchema;

/// A mapping result together with the warnings produced along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped<T> {
    pub value: T,
    pub warnings: Vec<RunIssue>,
}

#[derive(Debug, Clone)]
pub struct FieldMapper {
    mapping: FieldMapping,
}

impl FieldMapper {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Translate a native record read from `system` into canonical form.
    pub fn to_canonical(&self, system: SystemTag, native: &NativeRecord) -> Mapped<CanonicalRecord> {
        let record_ref = RecordRef::new(system, native.id.clone());
        let mut warnings = Vec::new();
        let mut title = String::new();
        let mut state = None;
        let mut description = None;
        let mut field_values = BTreeMap::new();

        for entry in &self.mapping.entries {
            let Some(raw) = native.fields.get(entry.field_for(system)) else {
                continue;
            };
            let value = match canonical_value(entry, system, raw) {
                Translated::Value(v) => v,
                Translated::Unmapped(v, name) => {
                    warnings.push(unmapped_warning(&record_ref, entry, &name, system));
                    v
                }
            };
            let Some(value) = normalize(value) else {
                continue;
            };

            match entry.canonical.as_str() {
                TITLE_KEY => title = value.as_display_string().unwrap_or_default(),
                STATE_KEY => state = value.as_display_string(),
                DESCRIPTION_KEY => description = value.as_display_string(),
                key => {
                    field_values.insert(key.to_string(), value);
                }
            }
        }

        Mapped {
            value: CanonicalRecord {
                source: system,
                external_id: native.id.clone(),
                title,
                state,
                description,
                field_values,
                last_modified_at: native.modified_at,
                deleted: native.deleted,
            },
            warnings,
        }
    }

    /// Produce the native field set for writing `record` into `target`.
    ///
    /// Every mapped field is present; absent canonical values become
    /// `FieldValue::Null` so an update clears them on the target.
    pub fn from_canonical(&self, record: &CanonicalRecord, target: SystemTag) -> Mapped<NativeFields> {
        let record_ref = record.record_ref();
        let mut warnings = Vec::new();
        let mut fields = NativeFields::new();

        for entry in &self.mapping.entries {
            let canonical = match entry.canonical.as_str() {
                TITLE_KEY => FieldValue::Text(record.title.clone()),
                STATE_KEY => record
                    .state
                    .clone()
                    .map(FieldValue::Select)
                    .unwrap_or(FieldValue::Null),
                DESCRIPTION_KEY => record
                    .description
                    .clone()
                    .map(FieldValue::Text)
                    .unwrap_or(FieldValue::Null),
                key => record
                    .field_values
                    .get(key)
                    .cloned()
                    .unwrap_or(FieldValue::Null),
            };
            let value = match native_value(entry, target, canonical) {
                Translated::Value(v) => v,
                Translated::Unmapped(v, name) => {
                    warnings.push(unmapped_warning(&record_ref, entry, &name, target));
                    v
                }
            };
            fields.insert(entry.field_for(target).to_string(), value);
        }

        Mapped {
            value: fields,
            warnings,
        }
    }

    /// Warnings for mapped fields the remote schema does not know about.
    pub fn check_schema(&self, system: SystemTag, schema: &RemoteSchema) -> Vec<RunIssue> {
        self.mapping
            .entries
            .iter()
            .filter(|entry| !schema.contains(entry.field_for(system)))
            .map(|entry| {
                RunIssue::warning(
                    None,
                    format!(
                        "mapped field '{}' does not exist on {system}",
                        entry.field_for(system)
                    ),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

enum Translated {
    Value(FieldValue),
    /// Passed through without a table row; carries the offending name.
    Unmapped(FieldValue, String),
}

fn canonical_value(entry: &MappingEntry, from: SystemTag, raw: &FieldValue) -> Translated {
    match entry.kind {
        FieldKind::Select => match raw.as_display_string() {
            None => Translated::Value(FieldValue::Null),
            Some(name) => match to_canonical_name(entry, from, &name) {
                Some(canonical) => Translated::Value(FieldValue::Select(canonical)),
                None => Translated::Unmapped(FieldValue::Select(name.clone()), name),
            },
        },
        FieldKind::MultiSelect => {
            let mut unmapped = Vec::new();
            let values = multi_values(raw)
                .into_iter()
                .map(|name| {
                    to_canonical_name(entry, from, &name).unwrap_or_else(|| {
                        unmapped.push(name.clone());
                        name
                    })
                })
                .collect();
            with_unmapped(FieldValue::MultiSelect(values), unmapped)
        }
        FieldKind::Path => Translated::Value(match raw {
            FieldValue::Path(segments) => FieldValue::Text(segments.join(PATH_SEPARATOR)),
            other => other
                .as_display_string()
                .map(FieldValue::Text)
                .unwrap_or(FieldValue::Null),
        }),
        kind => Translated::Value(coerce(kind, raw)),
    }
}

fn native_value(entry: &MappingEntry, to: SystemTag, canonical: FieldValue) -> Translated {
    match entry.kind {
        FieldKind::Select => match canonical.as_display_string() {
            None => Translated::Value(FieldValue::Null),
            Some(name) => match to_native_name(entry, to, &name) {
                Some(native) => Translated::Value(FieldValue::Select(native)),
                None => Translated::Unmapped(FieldValue::Select(name.clone()), name),
            },
        },
        FieldKind::MultiSelect => {
            let mut unmapped = Vec::new();
            let values = multi_values(&canonical)
                .into_iter()
                .map(|name| {
                    to_native_name(entry, to, &name).unwrap_or_else(|| {
                        unmapped.push(name.clone());
                        name
                    })
                })
                .collect();
            with_unmapped(FieldValue::MultiSelect(values), unmapped)
        }
        FieldKind::Path => Translated::Value(match canonical.as_display_string() {
            None => FieldValue::Null,
            Some(flat) if to == SystemTag::A => FieldValue::Path(
                flat.split(PATH_SEPARATOR)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Some(flat) => FieldValue::Text(flat),
        }),
        kind => Translated::Value(coerce(kind, &canonical)),
    }
}

fn with_unmapped(value: FieldValue, unmapped: Vec<String>) -> Translated {
    if unmapped.is_empty() {
        Translated::Value(value)
    } else {
        Translated::Unmapped(value, unmapped.join(", "))
    }
}

/// Native name → canonical (A) name. Values without a table row are
/// unresolvable unless the table is empty, in which case names pass
/// through silently.
fn to_canonical_name(entry: &MappingEntry, from: SystemTag, name: &str) -> Option<String> {
    if entry.values.is_empty() {
        return Some(name.to_string());
    }
    let row = match from {
        SystemTag::A => entry.values.iter().find(|row| row.a == name),
        SystemTag::B => entry.values.iter().find(|row| row.b == name),
    };
    row.map(|row| row.a.clone())
}

/// Canonical (A) name → native name for `to`.
fn to_native_name(entry: &MappingEntry, to: SystemTag, name: &str) -> Option<String> {
    if entry.values.is_empty() {
        return Some(name.to_string());
    }
    if let Some(row) = entry.values.iter().find(|row| row.a == name) {
        return Some(match to {
            SystemTag::A => row.a.clone(),
            SystemTag::B => row.b.clone(),
        });
    }
    // Already in the target's vocabulary: it was passed through on read and
    // has been warned about there.
    match to {
        SystemTag::B if entry.values.iter().any(|row| row.b == name) => Some(name.to_string()),
        _ => None,
    }
}

fn multi_values(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::MultiSelect(values) => values.clone(),
        FieldValue::Null => Vec::new(),
        other => other
            .as_display_string()
            .map(|s| {
                s.split([';', ','])
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Coerce scalar kinds. Values that cannot be coerced keep their text form.
fn coerce(kind: FieldKind, value: &FieldValue) -> FieldValue {
    match (kind, value) {
        (_, FieldValue::Null) => FieldValue::Null,
        (FieldKind::Number, FieldValue::Number(_))
        | (FieldKind::Bool, FieldValue::Bool(_))
        | (FieldKind::Date, FieldValue::Date(_)) => value.clone(),
        (FieldKind::Number, other) => {
            let text = other.as_display_string().unwrap_or_default();
            text.trim()
                .parse::<f64>()
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Text(text))
        }
        (FieldKind::Bool, other) => {
            let text = other.as_display_string().unwrap_or_default();
            match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => FieldValue::Bool(true),
                "false" | "no" | "0" => FieldValue::Bool(false),
                _ => FieldValue::Text(text),
            }
        }
        (FieldKind::Date, other) => {
            let text = other.as_display_string().unwrap_or_default();
            DateTime::parse_from_rfc3339(text.trim())
                .map(|d| FieldValue::Date(d.with_timezone(&Utc)))
                .unwrap_or(FieldValue::Text(text))
        }
        (_, other) => other
            .as_display_string()
            .map(FieldValue::Text)
            .unwrap_or(FieldValue::Null),
    }
}

/// Drop empties and order multi-selects; `None` means "no value".
fn normalize(value: FieldValue) -> Option<FieldValue> {
    match value {
        FieldValue::Null => None,
        FieldValue::Text(s) | FieldValue::Select(s) if s.trim().is_empty() => None,
        FieldValue::MultiSelect(mut values) => {
            values.sort();
            values.dedup();
            (!values.is_empty()).then_some(FieldValue::MultiSelect(values))
        }
        other => Some(other),
    }
}

fn unmapped_warning(
    record: &RecordRef,
    entry: &MappingEntry,
    value: &str,
    system: SystemTag,
) -> RunIssue {
    tracing::warn!(
        record = %record,
        field = %entry.canonical,
        value,
        "value has no translation, passing through"
    );
    RunIssue::warning(
        Some(record.clone()),
        format!(
            "value '{value}' of '{}' has no translation for {system}; passed through as-is",
            entry.canonical
        ),
    )
}

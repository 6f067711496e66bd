//! Content fingerprints for canonical records.
//!
//! A fingerprint is the SHA-256 hex digest of a record's mapped content:
//! title, state, description and field values. Source system, ids and
//! timestamps are excluded, so a record and its synced counterpart share a
//! fingerprint and an echo of our own write reads as "unchanged".

use sha2::{Digest, Sha256};
use worksync_core::{CanonicalRecord, FieldValue};

pub fn fingerprint(record: &CanonicalRecord) -> String {
    let mut h = Sha256::new();
    feed_str(&mut h, &record.title);
    feed_opt(&mut h, record.state.as_deref());
    feed_opt(&mut h, record.description.as_deref());
    feed_len(&mut h, record.field_values.len());
    for (key, value) in &record.field_values {
        feed_str(&mut h, key);
        feed_value(&mut h, value);
    }
    hex::encode(h.finalize())
}

// Every piece is length-prefixed so adjacent fields cannot run together.
fn feed_len(h: &mut Sha256, len: usize) {
    h.update((len as u64).to_le_bytes());
}

fn feed_str(h: &mut Sha256, s: &str) {
    feed_len(h, s.len());
    h.update(s.as_bytes());
}

fn feed_opt(h: &mut Sha256, s: Option<&str>) {
    match s {
        None => h.update([0u8]),
        Some(s) => {
            h.update([1u8]);
            feed_str(h, s);
        }
    }
}

fn feed_list(h: &mut Sha256, items: &[String]) {
    feed_len(h, items.len());
    for item in items {
        feed_str(h, item);
    }
}

fn feed_value(h: &mut Sha256, value: &FieldValue) {
    match value {
        FieldValue::Null => h.update([0u8]),
        FieldValue::Text(s) => {
            h.update([1u8]);
            feed_str(h, s);
        }
        FieldValue::Number(n) => {
            h.update([2u8]);
            h.update(n.to_bits().to_le_bytes());
        }
        FieldValue::Bool(b) => h.update([3u8, u8::from(*b)]),
        FieldValue::Date(at) => {
            h.update([4u8]);
            h.update(at.timestamp_micros().to_le_bytes());
        }
        FieldValue::Select(s) => {
            h.update([5u8]);
            feed_str(h, s);
        }
        FieldValue::MultiSelect(items) => {
            h.update([6u8]);
            feed_list(h, items);
        }
        FieldValue::Path(segments) => {
            h.update([7u8]);
            feed_list(h, segments);
        }
    }
}

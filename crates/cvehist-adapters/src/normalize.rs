//! Raw NVD change entries → [`HistoryRecord`].
//!
//! Normalization never fails: every field has an absent default, and a change
//! without a source-provided id gets a content-derived one.

use chrono::{DateTime, NaiveDateTime, Utc};
use cvehist_core::{HistoryRecord, RawValue, UNKNOWN_CVE_ID};
use sha2::{Digest, Sha256};
use tracing::debug;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A page worth of records plus how many entries lacked a usable envelope.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPage {
    pub records: Vec<HistoryRecord>,
    pub malformed: usize,
}

pub fn normalize_page(entries: &[RawValue]) -> NormalizedPage {
    let mut page = NormalizedPage {
        records: Vec::with_capacity(entries.len()),
        malformed: 0,
    };
    for (position, entry) in entries.iter().enumerate() {
        if !has_change_envelope(entry) {
            page.malformed += 1;
            debug!(position, "entry has no change object; using defaults");
        }
        page.records.push(normalize(entry));
    }
    page
}

/// A missing or non-object `change` is malformed. A missing one normalizes
/// from `{}`; a scalar one keeps its own value for the fallback id.
fn has_change_envelope(entry: &RawValue) -> bool {
    entry.get("change").is_some_and(RawValue::is_mapping)
}

/// Map one `{"change": {...}}` entry to a record.
pub fn normalize(entry: &RawValue) -> HistoryRecord {
    let empty = RawValue::empty_mapping();
    // Field lookups on a scalar `change` are all absent, but the scalar
    // itself is still hashed so distinct garbage payloads stay distinct.
    let change = entry.get("change").unwrap_or(&empty);

    let change_id = text_field(change, "cveChangeId")
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback_change_id(change));

    HistoryRecord {
        cve_id: text_field(change, "cveId")
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNKNOWN_CVE_ID.to_string()),
        event_name: text_field(change, "eventName"),
        change_id,
        source_identifier: text_field(change, "sourceIdentifier"),
        created_at: change
            .get("created")
            .and_then(RawValue::as_text)
            .and_then(parse_timestamp),
        details: change
            .get("details")
            .filter(|d| d.is_structured())
            .map(RawValue::to_json),
    }
}

fn text_field(change: &RawValue, key: &str) -> Option<String> {
    match change.get(key)? {
        RawValue::Text(text) => Some(text.clone()),
        RawValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// SHA-256 over the key-sorted compact JSON of the change payload.
pub fn fallback_change_id(change: &RawValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(change.canonical_json().as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse a source timestamp, dropping the fractional part as a last resort.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_datetime(raw).or_else(|| {
        let (whole_seconds, _) = raw.split_once('.')?;
        parse_datetime(whole_seconds)
    })
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

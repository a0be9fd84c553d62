//! Core domain model for CVE change-history ingestion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cvehist-core";

/// Sentinel stored when the source omits the CVE identifier.
pub const UNKNOWN_CVE_ID: &str = "unknown";

/// One change event for a CVE, as persisted.
///
/// Built once per raw entry and never mutated afterwards; `change_id` is the
/// store-wide unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub cve_id: String,
    pub event_name: Option<String>,
    pub change_id: String,
    pub source_identifier: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Only ever a JSON object or array.
    pub details: Option<JsonValue>,
}

/// Durable cursor for one named ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub next_index: u64,
    pub total: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn fresh(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_index: 0,
            total: None,
            updated_at: Utc::now(),
        }
    }

    /// True once a known total has been reached by the cursor.
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.next_index >= total)
    }
}

/// One page of raw entries as returned by the remote source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawPage {
    pub entries: Vec<RawValue>,
    pub total: Option<u64>,
}

impl RawPage {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Decoded JSON with exhaustive shapes. Absence is modelled by `Option` at
/// the access site, never by a variant.
///
/// Mapping keys are kept in a `BTreeMap` so the canonical text form is
/// independent of the order the source emitted them in.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Sequence(Vec<RawValue>),
    Mapping(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn empty_mapping() -> Self {
        RawValue::Mapping(BTreeMap::new())
    }

    /// Field lookup; `None` for missing keys and for non-mapping values.
    pub fn get(&self, key: &str) -> Option<&RawValue> {
        match self {
            RawValue::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RawValue::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[RawValue]> {
        match self {
            RawValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, RawValue::Mapping(_))
    }

    /// Mapping or sequence.
    pub fn is_structured(&self) -> bool {
        matches!(self, RawValue::Mapping(_) | RawValue::Sequence(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RawValue::Null => JsonValue::Null,
            RawValue::Bool(b) => JsonValue::Bool(*b),
            RawValue::Number(n) => JsonValue::Number(n.clone()),
            RawValue::Text(s) => JsonValue::String(s.clone()),
            RawValue::Sequence(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            RawValue::Mapping(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Compact JSON with object keys in sorted order.
    ///
    /// Objects are built from the sorted `BTreeMap`, so the key order holds
    /// with or without serde_json's `preserve_order` feature.
    pub fn canonical_json(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<JsonValue> for RawValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Null,
            JsonValue::Bool(b) => RawValue::Bool(b),
            JsonValue::Number(n) => RawValue::Number(n),
            JsonValue::String(s) => RawValue::Text(s),
            JsonValue::Array(items) => {
                RawValue::Sequence(items.into_iter().map(RawValue::from).collect())
            }
            JsonValue::Object(map) => RawValue::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(RawValue::from)
    }
}

impl Serialize for RawValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

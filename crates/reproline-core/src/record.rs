//! Record and value model shared by every pipeline stage.
//!
//! A [`Record`] is one normalized row: a provider label plus named [`Value`]
//! fields. Records are grouped into a [`Batch`] that moves between stages by
//! value; a stage consumes its input batch and produces a new one, so no
//! stage ever mutates rows it does not own.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

/// Suffix appended to `source_system` on synthesized fallback rows.
pub const FALLBACK_SUFFIX: &str = "_FALLBACK";

/// One cell value. The set of variants is closed; providers map whatever
/// their wire format carries into one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Instant in UTC. Canonical form truncates to whole seconds.
    Timestamp(DateTime<Utc>),
    /// Nested structure kept as JSON. Canonical form is minimal with
    /// lexicographically sorted keys.
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            // Non-finite floats have no canonical textual form; they are
            // treated as missing everywhere (encoding, sorting, storage).
            Value::Float(f) => !f.is_finite(),
            _ => false,
        }
    }

    /// Short type label for violation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }

    /// Canonical textual encoding used for hashing and tie-breaking.
    ///
    /// Null (and non-finite floats) encode as the empty string, floats as
    /// fixed 6-decimal text with negative zero normalized, timestamps as
    /// RFC 3339 UTC with a trailing `Z`, nested JSON as its minimal form
    /// with sorted keys.
    pub fn canonical_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if !f.is_finite() {
                    return String::new();
                }
                let f = if *f == 0.0 { 0.0 } else { *f };
                format!("{f:.6}")
            }
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            Value::Json(v) => canonical_json(v),
        }
    }

    /// Total order for the canonical sort. Nulls sort last; ints and floats
    /// compare numerically; everything else compares within its family, and
    /// mixed families fall back to canonical text so the order stays
    /// deterministic even for rows a contract would reject.
    pub fn cmp_for_sort(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => self.canonical_text().cmp(&other.canonical_text()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// Minimal JSON encoding with lexicographically sorted object keys at every
/// nesting level. Independent of serde_json's map ordering so the output
/// stays canonical no matter how the value was built.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical_json(value, &mut out);
    out
}

fn write_canonical_json(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => {
            // serde_json handles escaping; a bare string cannot fail.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical_json(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// One normalized row. Field iteration order is the field name order
/// (BTreeMap), which keeps every derived artifact deterministic; the
/// contract's `column_order` governs the written layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    source_system: String,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(source_system: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Provider label, e.g. `"PUBCHEM"` or `"PUBCHEM_FALLBACK"`.
    pub fn source_system(&self) -> &str {
        &self.source_system
    }

    pub fn is_fallback(&self) -> bool {
        self.source_system.ends_with(FALLBACK_SUFFIX)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`set`](Record::set) for mappers and tests.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Field lookup. Absent fields read as null downstream.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// A batch of records plus the schema version the producer claims to
/// satisfy. Stages hand batches off by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub schema_version: String,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
            records: Vec::new(),
        }
    }

    pub fn from_records(schema_version: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            schema_version: schema_version.into(),
            records,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

//! Canonical form for validated batches.
//!
//! Row identity must not depend on arrival order, float sign quirks, or
//! sub-second timestamp noise. The engine normalizes every stored value,
//! sorts rows by the contract's sort keys with the full row encoding as the
//! final tie-break, and derives SHA-256 digests from the encoding. Two runs
//! that fetched the same logical content therefore produce byte-identical
//! digests, which is what makes a re-acquisition verifiable.

use std::cmp::Ordering;

use chrono::Timelike;

use reproline_contract::{ColumnType, SchemaContract};
use reproline_core::record::{Batch, Record, Value};

use crate::hash;

/// ASCII unit separator. Normalized payload text never contains it, so
/// joined fields cannot run into each other.
const FIELD_SEPARATOR: &str = "\u{1f}";

/// A batch in canonical form: normalized values, content-defined row order,
/// and identity digests aligned index-for-index with `records`.
#[derive(Debug, Clone)]
pub struct CanonicalBatch {
    pub schema_version: String,
    pub records: Vec<Record>,
    /// Hex SHA-256 of each row's canonical encoding, in row order.
    pub row_hashes: Vec<String>,
    /// Hex SHA-256 of each row's business key, in row order.
    pub key_hashes: Vec<String>,
    /// Digest folding every row hash in final order.
    pub hash_row: String,
    /// Digest folding every business-key hash in final order.
    pub hash_business_key: String,
}

impl CanonicalBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Applies the canonical transform for one contract.
pub struct CanonicalizationEngine<'a> {
    contract: &'a SchemaContract,
}

impl<'a> CanonicalizationEngine<'a> {
    pub fn new(contract: &'a SchemaContract) -> Self {
        Self { contract }
    }

    /// Normalize, sort, and digest a batch. The input is consumed; the
    /// output carries exactly the declared columns, so undeclared fields a
    /// lenient gate let through never reach the artifact.
    pub fn canonicalize(&self, batch: Batch) -> CanonicalBatch {
        let mut tagged: Vec<(Record, String)> = batch
            .records
            .iter()
            .map(|record| {
                let canonical = self.canonical_record(record);
                let encoding = self.encode_row(&canonical);
                (canonical, encoding)
            })
            .collect();

        tagged.sort_by(|(ra, ea), (rb, eb)| self.compare(ra, rb).then_with(|| ea.cmp(eb)));

        let mut records = Vec::with_capacity(tagged.len());
        let mut row_digests = Vec::with_capacity(tagged.len());
        let mut key_digests = Vec::with_capacity(tagged.len());
        for (record, encoding) in tagged {
            row_digests.push(hash::sha256(encoding.as_bytes()));
            key_digests.push(hash::sha256(self.encode_key(&record).as_bytes()));
            records.push(record);
        }

        CanonicalBatch {
            schema_version: batch.schema_version,
            row_hashes: row_digests.iter().map(hex::encode).collect(),
            key_hashes: key_digests.iter().map(hex::encode).collect(),
            hash_row: hash::combine_sha256(&row_digests),
            hash_business_key: hash::combine_sha256(&key_digests),
            records,
        }
    }

    /// Rebuild a record with exactly the declared columns, normalized.
    /// Absent columns materialize as explicit nulls.
    fn canonical_record(&self, record: &Record) -> Record {
        let mut out = Record::new(record.source_system());
        for col in &self.contract.columns {
            let value = record
                .get(&col.name)
                .map_or(Value::Null, |v| canonical_value(col.ty, v));
            out.set(col.name.clone(), value);
        }
        out
    }

    /// Compare two rows on the contract's sort keys. Equal keys are settled
    /// by the caller on the full row encoding, so the final order is
    /// content-defined even when sort keys repeat.
    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.contract.sort_keys {
            let ord = match (a.get(key), b.get(key)) {
                (Some(x), Some(y)) => x.cmp_for_sort(y),
                (Some(x), None) => x.cmp_for_sort(&Value::Null),
                (None, Some(y)) => Value::Null.cmp_for_sort(y),
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Canonical row encoding: provider label plus every declared column's
    /// canonical text, in contract order.
    fn encode_row(&self, record: &Record) -> String {
        let mut parts = Vec::with_capacity(self.contract.columns.len() + 1);
        parts.push(record.source_system().to_string());
        for col in &self.contract.columns {
            parts.push(
                record
                    .get(&col.name)
                    .map(Value::canonical_text)
                    .unwrap_or_default(),
            );
        }
        parts.join(FIELD_SEPARATOR)
    }

    /// Business-key encoding. Excludes the provider label so a fallback row
    /// and the real row it stands in for share a key hash.
    fn encode_key(&self, record: &Record) -> String {
        let parts: Vec<String> = self
            .contract
            .business_key
            .iter()
            .map(|name| {
                record
                    .get(name)
                    .map(Value::canonical_text)
                    .unwrap_or_default()
            })
            .collect();
        parts.join(FIELD_SEPARATOR)
    }
}

/// Normalize one value: negative zero folds into plain zero, non-finite
/// floats read as null, timestamps drop sub-second precision, and ints the
/// gate admitted into a float column become floats so both spellings of the
/// same number share one identity.
fn canonical_value(ty: ColumnType, value: &Value) -> Value {
    match value {
        Value::Float(f) if !f.is_finite() => Value::Null,
        Value::Float(f) if *f == 0.0 => Value::Float(0.0),
        Value::Int(i) if ty == ColumnType::Float => Value::Float(*i as f64),
        // Setting zero nanoseconds cannot fail.
        Value::Timestamp(ts) => Value::Timestamp(ts.with_nanosecond(0).unwrap_or(*ts)),
        other => other.clone(),
    }
}

//! Atomic artifact writer.
//!
//! A dataset is serialized into a run-scoped staging directory, flushed and
//! fsynced, then renamed into the destination in one step; the metadata
//! document follows the same temp-then-rename discipline. A failure anywhere
//! before [`commit`](AtomicWriter::commit) leaves the destination untouched;
//! staged leftovers are kept for inspection and swept by the next run.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::SerializedFileReader;

use reproline_contract::{ColumnSpec, ColumnType, SchemaContract};
use reproline_core::config::OutputConfig;
use reproline_core::record::{canonical_json, Record, Value};

use crate::canonical::CanonicalBatch;
use crate::hash;
use crate::meta::RunMetadata;

/// Prefix of run-scoped staging directories under the output directory.
pub const STAGING_PREFIX: &str = ".staging-";

/// A dataset serialized and fsynced under staging, not yet visible at the
/// destination. Consumed by [`AtomicWriter::commit`].
pub struct StagedDataset {
    staging_dir: PathBuf,
    staged_file: PathBuf,
    /// File name the dataset will carry after commit.
    pub file_name: String,
    /// Blake3 of the staged bytes, computed after fsync.
    pub dataset_blake3: String,
    pub row_count: usize,
}

/// A committed artifact: dataset file plus sibling metadata document.
#[derive(Debug)]
pub struct OutputArtifact {
    pub dataset_path: PathBuf,
    pub meta_path: PathBuf,
    pub row_count: usize,
    pub dataset_blake3: String,
}

/// Two-phase parquet writer for canonical batches.
pub struct AtomicWriter<'a> {
    contract: &'a SchemaContract,
    output: &'a OutputConfig,
}

impl<'a> AtomicWriter<'a> {
    pub fn new(contract: &'a SchemaContract, output: &'a OutputConfig) -> Self {
        Self { contract, output }
    }

    /// Serialize the batch into `<out_dir>/.staging-<run_id>/` and fsync.
    /// Writer properties are fixed so identical canonical batches produce
    /// byte-identical files.
    pub fn stage_dataset(&self, run_id: &str, batch: &CanonicalBatch) -> Result<StagedDataset> {
        let staging_dir = self.output.dir.join(format!("{STAGING_PREFIX}{run_id}"));
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("failed to create staging dir {}", staging_dir.display()))?;

        let file_name = format!("{}.parquet", self.output.dataset);
        let staged_file = staging_dir.join(&file_name);

        let schema = Arc::new(arrow_schema(self.contract));
        let record_batch = RecordBatch::try_new(schema.clone(), self.build_columns(batch))
            .context("failed to assemble arrow batch")?;

        let file = File::create(&staged_file)
            .with_context(|| format!("failed to create {}", staged_file.display()))?;
        let level = ZstdLevel::try_new(self.output.zstd_level).context("invalid zstd level")?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(level))
            .set_max_row_group_size(1024 * 1024)
            .build();

        let mut writer = ArrowWriter::try_new(file, schema, Some(props))
            .context("failed to open parquet writer")?;
        writer
            .write(&record_batch)
            .context("failed to write parquet rows")?;
        let file = writer
            .into_inner()
            .context("failed to finalize parquet footer")?;
        file.sync_all().context("failed to fsync staged dataset")?;

        let digest = hash::hash_file(&staged_file)
            .with_context(|| format!("failed to hash {}", staged_file.display()))?;

        Ok(StagedDataset {
            staging_dir,
            staged_file,
            file_name,
            dataset_blake3: digest.to_hex().to_string(),
            row_count: batch.len(),
        })
    }

    /// Rename the staged dataset into the destination, then persist the
    /// metadata document next to it. The dataset rename is the commit point.
    pub fn commit(&self, staged: StagedDataset, meta: &RunMetadata) -> Result<OutputArtifact> {
        let dataset_path = self.output.dir.join(&staged.file_name);
        fs::rename(&staged.staged_file, &dataset_path).with_context(|| {
            format!("failed to move staged dataset to {}", dataset_path.display())
        })?;

        let meta_path = self
            .output
            .dir
            .join(format!("{}.meta.json", self.output.dataset));
        let tmp_path = self
            .output
            .dir
            .join(format!("{}.meta.json.tmp", self.output.dataset));
        fs::write(&tmp_path, meta.to_json()?)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &meta_path)
            .with_context(|| format!("failed to move metadata to {}", meta_path.display()))?;

        // Empty after the rename unless something else wrote into it; a
        // non-empty dir is kept for inspection.
        if let Err(err) = fs::remove_dir(&staged.staging_dir) {
            log::warn!(
                "retaining staging dir {}: {err}",
                staged.staging_dir.display()
            );
        }

        Ok(OutputArtifact {
            dataset_path,
            meta_path,
            row_count: staged.row_count,
            dataset_blake3: staged.dataset_blake3,
        })
    }

    /// Declared columns in contract order, then the three system columns.
    fn build_columns(&self, batch: &CanonicalBatch) -> Vec<ArrayRef> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.contract.columns.len() + 3);
        for col in &self.contract.columns {
            columns.push(build_column(&batch.records, col));
        }
        let sources: Vec<&str> = batch.records.iter().map(Record::source_system).collect();
        columns.push(Arc::new(StringArray::from(sources)));
        columns.push(Arc::new(StringArray::from(batch.key_hashes.clone())));
        columns.push(Arc::new(StringArray::from(batch.row_hashes.clone())));
        columns
    }
}

/// Arrow schema for a contract: declared columns in contract order plus
/// `source_system`, `hash_business_key`, and `hash_row`.
pub fn arrow_schema(contract: &SchemaContract) -> Schema {
    let mut fields: Vec<Field> = Vec::with_capacity(contract.columns.len() + 3);
    for col in &contract.columns {
        let data_type = match col.ty {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Text => DataType::Utf8,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            // Nested values are stored as canonical JSON text.
            ColumnType::Json => DataType::Utf8,
        };
        fields.push(Field::new(&col.name, data_type, col.nullable));
    }
    fields.push(Field::new("source_system", DataType::Utf8, false));
    fields.push(Field::new("hash_business_key", DataType::Utf8, false));
    fields.push(Field::new("hash_row", DataType::Utf8, false));
    Schema::new(fields)
}

/// One arrow array for a declared column. Canonicalization already folded
/// coercions and materialized explicit nulls, so every arm is a direct map.
fn build_column(records: &[Record], col: &ColumnSpec) -> ArrayRef {
    match col.ty {
        ColumnType::Bool => {
            let values: Vec<Option<bool>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect();
            Arc::new(BooleanArray::from(values))
        }
        ColumnType::Int => {
            let values: Vec<Option<i64>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect();
            Arc::new(Int64Array::from(values))
        }
        ColumnType::Float => {
            let values: Vec<Option<f64>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Float(f)) => Some(*f),
                    _ => None,
                })
                .collect();
            Arc::new(Float64Array::from(values))
        }
        ColumnType::Text => {
            let values: Vec<Option<&str>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Text(s)) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
        ColumnType::Timestamp => {
            let values: Vec<Option<i64>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Timestamp(ts)) => Some(ts.timestamp_millis()),
                    _ => None,
                })
                .collect();
            Arc::new(TimestampMillisecondArray::from(values).with_timezone("UTC"))
        }
        ColumnType::Json => {
            let values: Vec<Option<String>> = records
                .iter()
                .map(|r| match r.get(&col.name) {
                    Some(Value::Json(v)) => Some(canonical_json(v)),
                    _ => None,
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
    }
}

/// Whether a parquet file exists and carries a readable footer.
pub fn is_valid_parquet(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    SerializedFileReader::new(file).is_ok()
}

/// Remove staging directories and temp files a crashed prior run left
/// behind. Called at run start, before any new staging is created.
pub fn sweep_orphaned_staging(out_dir: &Path) -> io::Result<()> {
    if !out_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() && name.starts_with(STAGING_PREFIX) {
            log::warn!("removing orphaned staging dir {}", path.display());
            fs::remove_dir_all(&path)?;
        } else if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("removing stale tmp file {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

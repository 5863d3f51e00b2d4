//! End-to-end pipeline runs against in-process sources. No network: the
//! adapters serve scripted pages, and every scenario checks what actually
//! lands on disk.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::array::{Array, StringArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;

use reproline_artifact::RunMetadata;
use reproline_contract::contract::{
    ColumnSpec, ColumnType, ContractRegistry, ContractVersion, SchemaContract,
};
use reproline_contract::migrate::{FnMigration, MigrationRegistry};
use reproline_core::config::PipelineConfig;
use reproline_core::context::RunContext;
use reproline_core::progress::ProgressContext;
use reproline_core::record::{Batch, Record, Value};
use reproline_fetch::{
    ExtractionRequest, FetchError, MappedItem, Page, PageFetcher, PageQuery, PageStrategy,
    RecordMapper, SourceAdapter,
};
use reproline_pipeline::Pipeline;

const RELEASE: &str = "2026-08-01";

fn contract_v1() -> SchemaContract {
    SchemaContract {
        id: "compound".to_string(),
        version: ContractVersion::new(1, 0, 0),
        columns: vec![
            ColumnSpec::new("compound_id", ColumnType::Text, false),
            ColumnSpec::new("name", ColumnType::Text, true),
            ColumnSpec::new("mass", ColumnType::Float, true),
            ColumnSpec::new("fetch_diagnostics", ColumnType::Json, true),
        ],
        business_key: vec!["compound_id".to_string()],
        sort_keys: vec!["compound_id".to_string()],
        references: Vec::new(),
    }
}

/// v2 adds one nullable column; otherwise identical to v1.
fn contract_v2() -> SchemaContract {
    let mut contract = contract_v1();
    contract.version = ContractVersion::new(2, 0, 0);
    contract
        .columns
        .push(ColumnSpec::new("verified", ColumnType::Bool, true));
    contract
}

fn base_config(out_dir: &Path) -> PipelineConfig {
    let mut config: PipelineConfig = toml::from_str(
        r#"
workers = 2

[source]
name = "PUBCHEM"
rps = 10000.0
burst = 1000
diagnostics_column = "fetch_diagnostics"

[source.retry]
max_attempts = 1
base_delay_ms = 1
max_delay_ms = 1

[contract]
id = "compound"
version = "1.0.0"

[output]
dir = "placeholder"
dataset = "compounds"
"#,
    )
    .unwrap();
    config.output.dir = out_dir.to_path_buf();
    config
}

fn pipeline(config: &PipelineConfig) -> Pipeline {
    let mut contracts = ContractRegistry::new();
    contracts.register(contract_v1()).unwrap();
    Pipeline::new(config.clone(), contracts).unwrap()
}

fn compound_items(n: usize) -> Vec<serde_json::Value> {
    (0..n)
        .map(|i| {
            json!({
                "cid": format!("CID{i:04}"),
                "name": format!("compound {i}"),
                "mass": 100.0 + i as f64,
            })
        })
        .collect()
}

fn listing_request() -> ExtractionRequest {
    ExtractionRequest {
        label: "compounds".to_string(),
        endpoint: "/compounds".to_string(),
        params: Vec::new(),
        strategy: PageStrategy::Cursor { page_size: 100 },
        id_field: "cid".to_string(),
        identifiers: Vec::new(),
    }
}

fn identifier_request(ids: &[&str]) -> ExtractionRequest {
    ExtractionRequest {
        label: "compound batch".to_string(),
        endpoint: "/compounds/batch".to_string(),
        params: Vec::new(),
        strategy: PageStrategy::Cursor { page_size: 100 },
        id_field: "cid".to_string(),
        identifiers: ids.iter().map(|s| s.to_string()).collect(),
    }
}

fn map_compound(raw: &serde_json::Value) -> MappedItem {
    let Some(id) = raw.get("cid").and_then(|v| v.as_str()) else {
        return MappedItem::flagged(Vec::new());
    };
    let mut record = Record::new("PUBCHEM");
    record.set("compound_id", Value::Text(id.to_string()));
    if let Some(name) = raw.get("name").and_then(|v| v.as_str()) {
        record.set("name", Value::Text(name.to_string()));
    }
    if let Some(mass) = raw.get("mass").and_then(|v| v.as_f64()) {
        record.set("mass", Value::Float(mass));
    }
    MappedItem::one(record)
}

/// Cursor-paginated in-memory source serving a fixed item list.
struct ListingSource {
    items: Vec<serde_json::Value>,
    calls: AtomicUsize,
}

impl ListingSource {
    fn new(items: Vec<serde_json::Value>) -> Self {
        Self {
            items,
            calls: AtomicUsize::new(0),
        }
    }
}

impl PageFetcher for ListingSource {
    fn fetch_page(
        &self,
        _ctx: &RunContext,
        _request: &ExtractionRequest,
        query: &PageQuery,
    ) -> Result<Page, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (cursor, limit) = match query {
            PageQuery::Cursor { cursor, limit } => (cursor.clone(), *limit),
            other => {
                return Err(FetchError::Malformed(format!(
                    "expected a cursor query, got {other:?}"
                )))
            }
        };
        let start: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| FetchError::Malformed(format!("bad cursor '{c}'")))?,
            None => 0,
        };
        let end = (start + limit).min(self.items.len());
        let mut page = Page::of_items(self.items[start..end].to_vec());
        if end < self.items.len() {
            page.next_cursor = Some(end.to_string());
        }
        Ok(page)
    }
}

impl RecordMapper for ListingSource {
    fn map_item(&self, raw: &serde_json::Value) -> MappedItem {
        map_compound(raw)
    }
}

impl SourceAdapter for ListingSource {
    fn resolve_release(&self) -> Result<String, FetchError> {
        Ok(RELEASE.to_string())
    }

    fn schema_version(&self) -> &str {
        "1.0.0"
    }
}

/// Source whose every page request fails with a permanent error.
struct RefusingSource;

impl PageFetcher for RefusingSource {
    fn fetch_page(
        &self,
        _ctx: &RunContext,
        _request: &ExtractionRequest,
        _query: &PageQuery,
    ) -> Result<Page, FetchError> {
        Err(FetchError::Http {
            status: Some(404),
            message: "not found".to_string(),
            retry_after: None,
        })
    }
}

impl RecordMapper for RefusingSource {
    fn map_item(&self, _raw: &serde_json::Value) -> MappedItem {
        MappedItem::default()
    }
}

impl SourceAdapter for RefusingSource {
    fn resolve_release(&self) -> Result<String, FetchError> {
        Ok(RELEASE.to_string())
    }

    fn schema_version(&self) -> &str {
        "1.0.0"
    }
}

/// Source sneaking a column into its records that no contract declares.
struct UndeclaredColumnSource {
    inner: ListingSource,
}

impl PageFetcher for UndeclaredColumnSource {
    fn fetch_page(
        &self,
        ctx: &RunContext,
        request: &ExtractionRequest,
        query: &PageQuery,
    ) -> Result<Page, FetchError> {
        self.inner.fetch_page(ctx, request, query)
    }
}

impl RecordMapper for UndeclaredColumnSource {
    fn map_item(&self, raw: &serde_json::Value) -> MappedItem {
        let mut mapped = map_compound(raw);
        for record in &mut mapped.records {
            record.set("solubility", Value::Float(1.5));
        }
        mapped
    }
}

impl SourceAdapter for UndeclaredColumnSource {
    fn resolve_release(&self) -> Result<String, FetchError> {
        Ok(RELEASE.to_string())
    }

    fn schema_version(&self) -> &str {
        "1.0.0"
    }
}

fn synonyms_contract() -> SchemaContract {
    SchemaContract {
        id: "synonyms".to_string(),
        version: ContractVersion::new(1, 0, 0),
        columns: vec![
            ColumnSpec::new("compound_id", ColumnType::Text, false),
            ColumnSpec::new("synonym_index", ColumnType::Int, false),
            ColumnSpec::new("synonym", ColumnType::Text, true),
        ],
        business_key: vec!["compound_id".to_string(), "synonym_index".to_string()],
        sort_keys: vec!["compound_id".to_string(), "synonym_index".to_string()],
        references: Vec::new(),
    }
}

/// Source whose items carry nested arrays; the mapper expands them to long
/// format with the array index as an explicit column.
struct SynonymSource {
    items: Vec<serde_json::Value>,
}

impl PageFetcher for SynonymSource {
    fn fetch_page(
        &self,
        _ctx: &RunContext,
        _request: &ExtractionRequest,
        _query: &PageQuery,
    ) -> Result<Page, FetchError> {
        Ok(Page::of_items(self.items.clone()))
    }
}

impl RecordMapper for SynonymSource {
    fn map_item(&self, raw: &serde_json::Value) -> MappedItem {
        let (Some(id), Some(synonyms)) = (
            raw.get("cid").and_then(|v| v.as_str()),
            raw.get("synonyms").and_then(|v| v.as_array()),
        ) else {
            return MappedItem::flagged(Vec::new());
        };
        let records = synonyms
            .iter()
            .enumerate()
            .map(|(i, synonym)| {
                Record::new("PUBCHEM")
                    .with("compound_id", Value::Text(id.to_string()))
                    .with("synonym_index", Value::Int(i as i64))
                    .with(
                        "synonym",
                        Value::Text(synonym.as_str().unwrap_or_default().to_string()),
                    )
            })
            .collect();
        MappedItem::many(records)
    }
}

impl SourceAdapter for SynonymSource {
    fn resolve_release(&self) -> Result<String, FetchError> {
        Ok(RELEASE.to_string())
    }

    fn schema_version(&self) -> &str {
        "1.0.0"
    }
}

/// Read one string-typed column of the committed dataset, in row order.
fn read_string_column(path: &Path, index: usize) -> Vec<Option<String>> {
    let file = fs::File::open(path).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.unwrap();
        let col = batch
            .column(index)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        for i in 0..col.len() {
            out.push((!col.is_null(i)).then(|| col.value(i).to_string()));
        }
    }
    out
}

#[test]
fn repeated_runs_commit_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let source = ListingSource::new(compound_items(150));
    let hidden = ProgressContext::hidden();

    let first = pipeline(&config)
        .run(&source, vec![listing_request()], &hidden)
        .unwrap();
    let first_bytes = fs::read(&first.artifact.dataset_path).unwrap();

    let second = pipeline(&config)
        .run(&source, vec![listing_request()], &hidden)
        .unwrap();

    assert_eq!(first.hash_row, second.hash_row);
    assert_eq!(first.hash_business_key, second.hash_business_key);
    assert_eq!(
        first_bytes,
        fs::read(&second.artifact.dataset_path).unwrap()
    );

    // The metadata document belongs to the committing run.
    let meta = RunMetadata::read_from(&second.artifact.meta_path).unwrap();
    assert_eq!(meta.run_id, second.run_id);
    assert_eq!(meta.hash_row, second.hash_row);
    assert_eq!(meta.row_count, 150);
    assert_eq!(meta.source_release, RELEASE);
}

#[test]
fn arrival_order_never_reaches_the_artifact() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let hidden = ProgressContext::hidden();

    let forward = ListingSource::new(compound_items(150));
    let mut shuffled_items = compound_items(150);
    shuffled_items.reverse();
    let shuffled = ListingSource::new(shuffled_items);

    let a = pipeline(&base_config(dir_a.path()))
        .run(&forward, vec![listing_request()], &hidden)
        .unwrap();
    let b = pipeline(&base_config(dir_b.path()))
        .run(&shuffled, vec![listing_request()], &hidden)
        .unwrap();

    assert_eq!(a.hash_row, b.hash_row);
    assert_eq!(
        fs::read(&a.artifact.dataset_path).unwrap(),
        fs::read(&b.artifact.dataset_path).unwrap()
    );
}

#[test]
fn cursor_traversal_fetches_exactly_the_pages_it_needs() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let source = ListingSource::new(compound_items(150));

    let summary = pipeline(&config)
        .run(&source, vec![listing_request()], &ProgressContext::hidden())
        .unwrap();

    // 150 items at page size 100: one full page, one short page.
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.stats.network_calls, 2);
    assert_eq!(summary.stats.pages, 2);
    assert_eq!(summary.stats.items, 150);
    assert_eq!(summary.row_count, 150);

    let ids = read_string_column(&summary.artifact.dataset_path, 0);
    assert_eq!(ids.first().unwrap().as_deref(), Some("CID0000"));
    assert_eq!(ids.last().unwrap().as_deref(), Some("CID0149"));
}

#[test]
fn identical_requests_are_served_from_the_release_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.workers = 1;
    let source = ListingSource::new(compound_items(150));

    let summary = pipeline(&config)
        .run(
            &source,
            vec![listing_request(), listing_request()],
            &ProgressContext::hidden(),
        )
        .unwrap();

    // The second traversal replays both pages from the cache.
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.stats.network_calls, 2);
    assert_eq!(summary.stats.cache_hits, 2);
    assert_eq!(summary.stats.requests, 2);
    assert_eq!(summary.row_count, 300);
}

#[test]
fn refused_identifiers_come_back_as_fallback_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());

    let summary = pipeline(&config)
        .run(
            &RefusingSource,
            vec![identifier_request(&["CID0003", "CID0001", "CID0002"])],
            &ProgressContext::hidden(),
        )
        .unwrap();

    assert_eq!(summary.stats.fallbacks, 3);
    assert_eq!(summary.row_count, 3);

    let ids = read_string_column(&summary.artifact.dataset_path, 0);
    let ids: Vec<&str> = ids.iter().map(|v| v.as_deref().unwrap()).collect();
    assert_eq!(ids, ["CID0001", "CID0002", "CID0003"]);

    let sources = read_string_column(&summary.artifact.dataset_path, 4);
    assert!(sources
        .iter()
        .all(|s| s.as_deref() == Some("PUBCHEM_FALLBACK")));

    let diagnostics = read_string_column(&summary.artifact.dataset_path, 3);
    let detail = diagnostics[0].as_ref().unwrap();
    assert!(detail.contains("http_client"));
    assert!(detail.contains("404"));
}

#[test]
fn absent_identifiers_fall_back_without_an_upstream_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let source = ListingSource::new(compound_items(2));

    let summary = pipeline(&config)
        .run(
            &source,
            vec![identifier_request(&["CID0000", "CID0001", "CID9999"])],
            &ProgressContext::hidden(),
        )
        .unwrap();

    assert_eq!(summary.stats.fallbacks, 1);
    assert_eq!(summary.row_count, 3);

    let ids = read_string_column(&summary.artifact.dataset_path, 0);
    assert_eq!(ids.last().unwrap().as_deref(), Some("CID9999"));
    let diagnostics = read_string_column(&summary.artifact.dataset_path, 3);
    assert!(diagnostics
        .last()
        .unwrap()
        .as_ref()
        .unwrap()
        .contains("absent_upstream"));
}

#[test]
fn undeclared_columns_abort_the_run_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let hidden = ProgressContext::hidden();

    let good = ListingSource::new(compound_items(3));
    let first = pipeline(&config)
        .run(&good, vec![listing_request()], &hidden)
        .unwrap();
    let before = fs::read(&first.artifact.dataset_path).unwrap();

    let bad = UndeclaredColumnSource {
        inner: ListingSource::new(compound_items(3)),
    };
    let err = pipeline(&config)
        .run(&bad, vec![listing_request()], &hidden)
        .unwrap_err()
        .to_string();

    assert!(err.contains("solubility"));
    assert!(err.contains("not declared"));
    // The previously committed artifact is untouched.
    assert_eq!(fs::read(&first.artifact.dataset_path).unwrap(), before);
}

#[test]
fn trailing_schema_versions_migrate_to_the_pin() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.contract.version = "2.0.0".to_string();
    config.contract.allow_migration = true;

    let mut contracts = ContractRegistry::new();
    contracts.register(contract_v1()).unwrap();
    contracts.register(contract_v2()).unwrap();
    let mut migrations = MigrationRegistry::new();
    migrations
        .register(Box::new(FnMigration::new(
            ContractVersion::new(1, 0, 0),
            ContractVersion::new(2, 0, 0),
            // Additive column bump: records pass through unchanged.
            |batch: Batch| Ok(batch),
        )))
        .unwrap();

    let source = ListingSource::new(compound_items(5));
    let summary = Pipeline::new(config, contracts)
        .unwrap()
        .with_migrations(migrations)
        .run(&source, vec![listing_request()], &ProgressContext::hidden())
        .unwrap();

    assert_eq!(summary.migration_hops, vec!["1.0.0 -> 2.0.0".to_string()]);
    let meta = RunMetadata::read_from(&summary.artifact.meta_path).unwrap();
    assert_eq!(meta.schema_version, "2.0.0");
    assert_eq!(meta.migration_hops, vec!["1.0.0 -> 2.0.0".to_string()]);
}

#[test]
fn nested_arrays_expand_to_long_format() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.contract.id = "synonyms".to_string();
    config.output.dataset = "synonyms".to_string();
    config.source.diagnostics_column = None;

    let mut contracts = ContractRegistry::new();
    contracts.register(synonyms_contract()).unwrap();
    let source = SynonymSource {
        items: vec![
            json!({ "cid": "CID0002", "synonyms": ["acetylsalicylic acid", "aspirin"] }),
            json!({ "cid": "CID0001", "synonyms": ["caffeine"] }),
        ],
    };

    let summary = Pipeline::new(config, contracts)
        .unwrap()
        .run(&source, vec![listing_request()], &ProgressContext::hidden())
        .unwrap();

    // One record per array element, ordered by (compound_id, index).
    assert_eq!(summary.row_count, 3);
    let ids = read_string_column(&summary.artifact.dataset_path, 0);
    let ids: Vec<&str> = ids.iter().map(|v| v.as_deref().unwrap()).collect();
    assert_eq!(ids, ["CID0001", "CID0002", "CID0002"]);
    let synonyms = read_string_column(&summary.artifact.dataset_path, 2);
    let synonyms: Vec<&str> = synonyms.iter().map(|v| v.as_deref().unwrap()).collect();
    assert_eq!(synonyms, ["caffeine", "acetylsalicylic acid", "aspirin"]);
}

#[test]
fn malformed_items_are_flagged_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let mut items = compound_items(4);
    items.push(json!({ "name": "mystery item" }));
    let source = ListingSource::new(items);

    let summary = pipeline(&config)
        .run(&source, vec![listing_request()], &ProgressContext::hidden())
        .unwrap();

    assert_eq!(summary.malformed_items, 1);
    assert_eq!(summary.row_count, 4);
}

#[test]
fn stale_staging_state_is_swept_at_run_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    fs::create_dir_all(dir.path().join(".staging-run-dead")).unwrap();
    fs::write(dir.path().join(".staging-run-dead/partial.parquet"), b"junk").unwrap();
    fs::write(dir.path().join("compounds.meta.json.tmp"), b"junk").unwrap();

    let source = ListingSource::new(compound_items(3));
    pipeline(&config)
        .run(&source, vec![listing_request()], &ProgressContext::hidden())
        .unwrap();

    assert!(!dir.path().join(".staging-run-dead").exists());
    assert!(!dir.path().join("compounds.meta.json.tmp").exists());
    assert!(dir.path().join("compounds.parquet").exists());
}

#[cfg(unix)]
#[test]
fn staging_failure_leaves_the_destination_untouched() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let source = ListingSource::new(compound_items(10));
    let hidden = ProgressContext::hidden();

    let first = pipeline(&config)
        .run(&source, vec![listing_request()], &hidden)
        .unwrap();
    let before = fs::read(&first.artifact.dataset_path).unwrap();

    // A read-only output directory makes the staging mkdir fail.
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).unwrap();
    let result = pipeline(&config).run(&source, vec![listing_request()], &hidden);
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();

    assert!(result.is_err());
    assert_eq!(fs::read(&first.artifact.dataset_path).unwrap(), before);
    let meta = RunMetadata::read_from(&first.artifact.meta_path).unwrap();
    assert_eq!(meta.run_id, first.run_id);
}

//! End-of-run reporting.
//!
//! One `RunSummary` per completed run, rendered as a rich table on a TTY
//! and as plain log lines everywhere else.

use std::collections::BTreeMap;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};

use reproline_artifact::OutputArtifact;
use reproline_core::progress::{fmt_num, ProgressContext};
use reproline_fetch::FetchStats;

/// Everything an operator wants to see once a run has committed.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub source_release: String,
    pub stats: FetchStats,
    pub row_count: usize,
    pub malformed_items: usize,
    pub reference_warnings: usize,
    pub migration_hops: Vec<String>,
    pub stage_durations_ms: BTreeMap<String, u64>,
    pub hash_row: String,
    pub hash_business_key: String,
    pub artifact: OutputArtifact,
}

impl RunSummary {
    /// Render as a formatted table string (for TTY display).
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Metric")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
            ]);

        table.add_row(vec![Cell::new("Run"), Cell::new(&self.run_id)]);
        table.add_row(vec![
            Cell::new("Source release"),
            Cell::new(&self.source_release),
        ]);
        table.add_row(vec![
            Cell::new("Requests"),
            Cell::new(fmt_num(self.stats.requests)),
        ]);
        table.add_row(vec![
            Cell::new("Pages"),
            Cell::new(fmt_num(self.stats.pages)),
        ]);
        table.add_row(vec![
            Cell::new("Network calls"),
            Cell::new(fmt_num(self.stats.network_calls)),
        ]);
        table.add_row(vec![
            Cell::new("Cache hits"),
            Cell::new(format!(
                "{} ({:.1}%)",
                fmt_num(self.stats.cache_hits),
                pct(self.stats.cache_hits, self.stats.pages)
            )),
        ]);
        table.add_row(vec![
            Cell::new("Retries"),
            Cell::new(fmt_num(self.stats.retries)),
        ]);
        table.add_row(vec![
            Cell::new("Fallback rows"),
            Cell::new(fmt_num(self.stats.fallbacks)),
        ]);
        table.add_row(vec![
            Cell::new("Duplicates dropped"),
            Cell::new(fmt_num(self.stats.duplicates_dropped)),
        ]);
        table.add_row(vec![
            Cell::new("Malformed items"),
            Cell::new(fmt_num(self.malformed_items)),
        ]);
        table.add_row(vec![
            Cell::new("Reference warnings"),
            Cell::new(fmt_num(self.reference_warnings)),
        ]);
        if !self.migration_hops.is_empty() {
            table.add_row(vec![
                Cell::new("Migrations"),
                Cell::new(self.migration_hops.join(", ")),
            ]);
        }
        for (stage, ms) in &self.stage_durations_ms {
            table.add_row(vec![
                Cell::new(format!("{stage} (ms)")),
                Cell::new(fmt_num(*ms as usize)),
            ]);
        }
        table.add_row(vec![
            Cell::new("Rows written").fg(Color::Green),
            Cell::new(fmt_num(self.row_count)).fg(Color::Green),
        ]);
        table.add_row(vec![Cell::new("Row hash"), Cell::new(&self.hash_row)]);
        table.add_row(vec![
            Cell::new("Business-key hash"),
            Cell::new(&self.hash_business_key),
        ]);
        table.add_row(vec![
            Cell::new("Dataset"),
            Cell::new(self.artifact.dataset_path.display().to_string()),
        ]);

        format!("\n{table}")
    }

    /// Plain log-line rendition for non-TTY environments.
    pub fn log(&self) {
        log::info!(
            "run {} against release {} complete",
            self.run_id,
            self.source_release
        );
        log::info!(
            "fetch: {} requests, {} pages, {} network calls, {} cache hits ({:.1}%), {} retries",
            fmt_num(self.stats.requests),
            fmt_num(self.stats.pages),
            fmt_num(self.stats.network_calls),
            fmt_num(self.stats.cache_hits),
            pct(self.stats.cache_hits, self.stats.pages),
            fmt_num(self.stats.retries)
        );
        log::info!(
            "rows: {} written, {} fallbacks, {} duplicates dropped, {} malformed, {} reference warnings",
            fmt_num(self.row_count),
            fmt_num(self.stats.fallbacks),
            fmt_num(self.stats.duplicates_dropped),
            fmt_num(self.malformed_items),
            fmt_num(self.reference_warnings)
        );
        if !self.migration_hops.is_empty() {
            log::info!("migrations: {}", self.migration_hops.join(", "));
        }
        for (stage, ms) in &self.stage_durations_ms {
            log::info!("{stage}: {ms} ms");
        }
        log::info!("hash_row {}", self.hash_row);
        log::info!("hash_business_key {}", self.hash_business_key);
        log::info!("dataset {}", self.artifact.dataset_path.display());
    }

    /// Pick the rendition matching the terminal.
    pub fn render(&self, progress: &ProgressContext) {
        if progress.is_tty() {
            progress.println(self.format_table());
        } else {
            self.log();
        }
    }
}

/// Calculate percentage safely.
fn pct(part: usize, total: usize) -> f64 {
    if total > 0 {
        part as f64 * 100.0 / total as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> RunSummary {
        let mut durations = BTreeMap::new();
        durations.insert("extract".to_string(), 1_200);
        durations.insert("write".to_string(), 80);
        RunSummary {
            run_id: "run-deadbeef".to_string(),
            source_release: "2026-03-01".to_string(),
            stats: FetchStats {
                requests: 3,
                pages: 5,
                cache_hits: 1,
                network_calls: 4,
                retries: 2,
                fallbacks: 1,
                duplicates_dropped: 0,
                items: 412,
            },
            row_count: 1_234,
            malformed_items: 2,
            reference_warnings: 1,
            migration_hops: vec!["1.0.0 -> 1.1.0".to_string()],
            stage_durations_ms: durations,
            hash_row: "aa".repeat(32),
            hash_business_key: "bb".repeat(32),
            artifact: OutputArtifact {
                dataset_path: PathBuf::from("/data/works.parquet"),
                meta_path: PathBuf::from("/data/works.meta.json"),
                row_count: 1_234,
                dataset_blake3: "cc".repeat(32),
            },
        }
    }

    #[test]
    fn table_carries_counts_hashes_and_durations() {
        let rendered = sample().format_table();
        assert!(rendered.contains("run-deadbeef"));
        assert!(rendered.contains("1,234"));
        assert!(rendered.contains("1.0.0 -> 1.1.0"));
        assert!(rendered.contains("extract (ms)"));
        assert!(rendered.contains(&"aa".repeat(32)));
        assert!(rendered.contains("works.parquet"));
        // 1 cache hit over 5 pages
        assert!(rendered.contains("(20.0%)"));
    }

    #[test]
    fn pct_handles_zero_total() {
        assert_eq!(pct(100, 0), 0.0);
        assert!((pct(25, 100) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn migrations_row_is_omitted_when_no_hops() {
        let mut summary = sample();
        summary.migration_hops.clear();
        assert!(!summary.format_table().contains("Migrations"));
    }

    #[test]
    fn render_off_tty_does_not_panic() {
        sample().render(&ProgressContext::hidden());
    }
}

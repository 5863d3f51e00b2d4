//! The schema gate sits between transform and write: a batch either
//! satisfies the pinned contract or the run fails before anything is
//! canonicalized.
//!
//! The gate first aligns the batch's declared schema version with the
//! contract (dispatching through the [`MigrationRegistry`] when the run
//! allows it), then checks every record against the contract. Violations
//! are collected in full, so one failed run reports every problem in the
//! batch, not just the first.

use std::fmt;

use anyhow::{bail, Context, Result};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use reproline_core::config::{ContractRef, ValidationConfig};
use reproline_core::record::{Batch, Record, Value};

use crate::contract::{ColumnType, ContractVersion, SchemaContract, ValueDomain};
use crate::migrate::{MigrationHop, MigrationRegistry};

/// How many violations are rendered into the error message before the rest
/// are summarized as a count.
const MAX_RENDERED_VIOLATIONS: usize = 25;

/// One reason a record cannot pass the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    /// Strict-column mode found a field the contract does not declare.
    UndeclaredColumn { row: usize, column: String },
    /// A non-nullable column is null or absent.
    NullInRequired { row: usize, column: String },
    /// The value's type neither matches nor coerces into the declared type.
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
        found: &'static str,
    },
    /// The value violates the column's declared domain.
    DomainViolation {
        row: usize,
        column: String,
        detail: String,
    },
    /// A reference-checked value resolves to no key in its enrichment set.
    UnresolvedReference {
        row: usize,
        column: String,
        enrichment: String,
        value: String,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::UndeclaredColumn { row, column } => {
                write!(f, "row {row}: column '{column}' is not declared by the contract")
            }
            SchemaViolation::NullInRequired { row, column } => {
                write!(f, "row {row}: non-nullable column '{column}' is null or missing")
            }
            SchemaViolation::TypeMismatch {
                row,
                column,
                expected,
                found,
            } => {
                write!(
                    f,
                    "row {row}: column '{column}' expects {expected}, found {found}"
                )
            }
            SchemaViolation::DomainViolation {
                row,
                column,
                detail,
            } => {
                write!(f, "row {row}: column '{column}': {detail}")
            }
            SchemaViolation::UnresolvedReference {
                row,
                column,
                enrichment,
                value,
            } => {
                write!(
                    f,
                    "row {row}: column '{column}': value '{value}' not found in enrichment set '{enrichment}'"
                )
            }
        }
    }
}

/// A batch that passed the gate, plus what happened to it on the way
/// through.
#[derive(Debug)]
pub struct GateOutcome {
    pub batch: Batch,
    /// Migration hops taken to reach the contract version, empty when the
    /// batch already matched.
    pub hops: Vec<MigrationHop>,
    /// Reference mismatches that were logged instead of failing the run.
    pub reference_warnings: usize,
}

/// Validates batches against one pinned contract.
pub struct SchemaGate<'a> {
    contract: &'a SchemaContract,
    migrations: &'a MigrationRegistry,
    pin: &'a ContractRef,
    validation: &'a ValidationConfig,
}

impl<'a> SchemaGate<'a> {
    pub fn new(
        contract: &'a SchemaContract,
        migrations: &'a MigrationRegistry,
        pin: &'a ContractRef,
        validation: &'a ValidationConfig,
    ) -> Self {
        Self {
            contract,
            migrations,
            pin,
            validation,
        }
    }

    /// Run the full gate: version alignment, column checks, domain checks,
    /// and reference checks. Fails with every violation found, or returns
    /// the (possibly migrated) batch ready for canonicalization.
    pub fn validate(
        &self,
        batch: Batch,
        enrichments: &FxHashMap<String, FxHashSet<String>>,
    ) -> Result<GateOutcome> {
        let (batch, hops) = self.align_version(batch)?;

        let patterns = self.compile_patterns()?;
        let mut violations = Vec::new();
        for (row, record) in batch.records.iter().enumerate() {
            self.check_record(row, record, &patterns, &mut violations);
        }
        let reference_warnings = self.check_references(&batch, enrichments, &mut violations);

        if !violations.is_empty() {
            let shown: Vec<String> = violations
                .iter()
                .take(MAX_RENDERED_VIOLATIONS)
                .map(|v| v.to_string())
                .collect();
            let omitted = violations.len().saturating_sub(MAX_RENDERED_VIOLATIONS);
            let tail = if omitted > 0 {
                format!("\n  ... and {omitted} more")
            } else {
                String::new()
            };
            bail!(
                "batch rejected by contract '{}' {}: {} violation(s)\n  - {}{}",
                self.contract.id,
                self.contract.version,
                violations.len(),
                shown.join("\n  - "),
                tail
            );
        }

        Ok(GateOutcome {
            batch,
            hops,
            reference_warnings,
        })
    }

    /// Bring the batch to the contract's version, or fail explaining why it
    /// cannot get there.
    fn align_version(&self, batch: Batch) -> Result<(Batch, Vec<MigrationHop>)> {
        let declared = ContractVersion::parse(&batch.schema_version)
            .context("batch declares an invalid schema version")?;
        if declared == self.contract.version {
            return Ok((batch, Vec::new()));
        }
        if !self.pin.allow_migration {
            bail!(
                "batch is at schema version {declared} but contract '{}' pins {} and migration is disabled",
                self.contract.id,
                self.contract.version
            );
        }
        match self
            .migrations
            .migrate(batch, self.contract.version, self.pin.max_migration_hops)
        {
            Some(result) => result.with_context(|| {
                format!(
                    "migration from {declared} to {} failed",
                    self.contract.version
                )
            }),
            None => bail!(
                "no migration path from {declared} to {} within {} hops",
                self.contract.version,
                self.pin.max_migration_hops
            ),
        }
    }

    fn compile_patterns(&self) -> Result<FxHashMap<&str, Regex>> {
        let mut patterns = FxHashMap::default();
        for col in &self.contract.columns {
            if let Some(ValueDomain::Pattern { regex }) = &col.domain {
                let compiled = Regex::new(regex)
                    .with_context(|| format!("column '{}': invalid pattern", col.name))?;
                patterns.insert(col.name.as_str(), compiled);
            }
        }
        Ok(patterns)
    }

    fn check_record(
        &self,
        row: usize,
        record: &Record,
        patterns: &FxHashMap<&str, Regex>,
        violations: &mut Vec<SchemaViolation>,
    ) {
        if self.validation.strict_columns {
            for (name, _) in record.fields() {
                if !self.contract.has_column(name) {
                    violations.push(SchemaViolation::UndeclaredColumn {
                        row,
                        column: name.to_string(),
                    });
                }
            }
        }

        for col in &self.contract.columns {
            // Absent fields read as null.
            let value = record.get(&col.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !col.nullable {
                    violations.push(SchemaViolation::NullInRequired {
                        row,
                        column: col.name.clone(),
                    });
                }
                continue;
            }
            if !col.ty.accepts(value) && !col.ty.coerces(value) {
                violations.push(SchemaViolation::TypeMismatch {
                    row,
                    column: col.name.clone(),
                    expected: col.ty,
                    found: value.type_name(),
                });
                continue;
            }
            if let Some(domain) = &col.domain {
                if let Some(detail) = domain_violation(domain, value, patterns.get(col.name.as_str()))
                {
                    violations.push(SchemaViolation::DomainViolation {
                        row,
                        column: col.name.clone(),
                        detail,
                    });
                }
            }
        }
    }

    /// Reference checks are advisory by default: mismatches are logged and
    /// counted, and only fail the run when the configuration promotes them.
    fn check_references(
        &self,
        batch: &Batch,
        enrichments: &FxHashMap<String, FxHashSet<String>>,
        violations: &mut Vec<SchemaViolation>,
    ) -> usize {
        let mut warnings = 0usize;
        for reference in &self.contract.references {
            let Some(keys) = enrichments.get(&reference.enrichment) else {
                log::warn!(
                    "no enrichment set '{}' supplied; skipping reference check on column '{}'",
                    reference.enrichment,
                    reference.column
                );
                continue;
            };
            let mut unresolved_in_column = 0usize;
            for (row, record) in batch.records.iter().enumerate() {
                let value = record.get(&reference.column).unwrap_or(&Value::Null);
                if value.is_null() {
                    continue;
                }
                let key = value.canonical_text();
                if keys.contains(&key) {
                    continue;
                }
                if self.validation.references_fatal {
                    violations.push(SchemaViolation::UnresolvedReference {
                        row,
                        column: reference.column.clone(),
                        enrichment: reference.enrichment.clone(),
                        value: key,
                    });
                } else {
                    if unresolved_in_column < 3 {
                        log::warn!(
                            "row {row}: column '{}': value '{key}' not found in enrichment set '{}'",
                            reference.column,
                            reference.enrichment
                        );
                    }
                    unresolved_in_column += 1;
                }
            }
            if unresolved_in_column > 0 {
                log::warn!(
                    "column '{}': {unresolved_in_column} value(s) unresolved against enrichment set '{}'",
                    reference.column,
                    reference.enrichment
                );
                warnings += unresolved_in_column;
            }
        }
        warnings
    }
}

fn domain_violation(
    domain: &ValueDomain,
    value: &Value,
    pattern: Option<&Regex>,
) -> Option<String> {
    match domain {
        ValueDomain::Range { min, max } => {
            let numeric = match value {
                Value::Int(i) => *i as f64,
                Value::Float(f) => *f,
                _ => return None,
            };
            if let Some(lo) = min {
                if numeric < *lo {
                    return Some(format!("value {numeric} below declared minimum {lo}"));
                }
            }
            if let Some(hi) = max {
                if numeric > *hi {
                    return Some(format!("value {numeric} above declared maximum {hi}"));
                }
            }
            None
        }
        ValueDomain::OneOf { values } => {
            let text = value.canonical_text();
            if values.iter().any(|v| v == &text) {
                None
            } else {
                Some(format!("value '{text}' not in declared set"))
            }
        }
        ValueDomain::Pattern { .. } => {
            let Value::Text(text) = value else {
                return None;
            };
            // Compiled once per validate call; absent only for non-pattern
            // domains, which this arm never sees.
            let regex = pattern?;
            if regex.is_match(text) {
                None
            } else {
                Some(format!("value '{text}' does not match declared pattern"))
            }
        }
    }
}

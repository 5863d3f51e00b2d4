//! Versioned schema contracts and the registry that resolves them.
//!
//! A [`SchemaContract`] is the full description of what a written batch must
//! look like: the total column order with types and nullability, the
//! business-key columns, the sort-key tuple, and any declared value domains
//! or referential expectations. Contracts are plain data (serde), so they
//! can live in configuration next to the pipeline definition.
//!
//! Resolution is an explicit lookup in a [`ContractRegistry`]: an
//! identifier maps to registered contract versions, nothing is conjured
//! from strings at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use reproline_core::config::ContractRef;
use reproline_core::record::Value;

/// Semantic contract version, ordered so "newer" is well-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ContractVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            bail!("invalid contract version '{s}': expected MAJOR.MINOR.PATCH");
        }
        let num = |p: &str| -> Result<u32> {
            p.parse::<u32>()
                .with_context(|| format!("invalid contract version '{s}': bad component '{p}'"))
        };
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ContractVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ContractVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContractVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Declared column type. `Int` coerces into a declared `Float` column; no
/// other cross-type coercion exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Whether a non-null value satisfies this type as declared.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Bool, Value::Bool(_))
                | (ColumnType::Int, Value::Int(_))
                | (ColumnType::Float, Value::Float(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Timestamp, Value::Timestamp(_))
                | (ColumnType::Json, Value::Json(_))
        )
    }

    /// Whether a value can be coerced into this type (beyond `accepts`).
    pub fn coerces(&self, value: &Value) -> bool {
        matches!((self, value), (ColumnType::Float, Value::Int(_)))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Optional per-column value constraint beyond the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValueDomain {
    /// Inclusive numeric bounds; either side may be open.
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Closed enumeration over canonical textual values.
    OneOf { values: Vec<String> },
    /// Regular-expression shape over text values.
    Pattern { regex: String },
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub domain: Option<ValueDomain>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: ValueDomain) -> Self {
        self.domain = Some(domain);
        self
    }
}

/// Declared referential expectation: values of `column` should resolve to a
/// key in the named enrichment set supplied at validation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCheck {
    pub column: String,
    pub enrichment: String,
}

/// The versioned, ordered, typed shape a batch must satisfy before write.
/// `columns` is the total column order for the written dataset;
/// system columns (`source_system` and the two hash columns) are appended
/// after it by the writer and are not declared here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub id: String,
    pub version: ContractVersion,
    pub columns: Vec<ColumnSpec>,
    /// Minimal column subset uniquely identifying a logical record.
    pub business_key: Vec<String>,
    /// Sort-key tuple for canonicalization; the first entry must be a
    /// business-key column.
    pub sort_keys: Vec<String>,
    #[serde(default)]
    pub references: Vec<ReferenceCheck>,
}

impl SchemaContract {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_order(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Structural self-check, run once when a contract is registered.
    pub fn check(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("contract id must not be empty".to_string());
        }
        if self.columns.is_empty() {
            errors.push("contract declares no columns".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                errors.push(format!("duplicate column '{}'", col.name));
            }
        }
        if self.business_key.is_empty() {
            errors.push("contract declares no business key".to_string());
        }
        for key in &self.business_key {
            if !self.has_column(key) {
                errors.push(format!("business key '{key}' is not a declared column"));
            }
        }
        if self.sort_keys.is_empty() {
            errors.push("contract declares no sort keys".to_string());
        }
        for key in &self.sort_keys {
            if !self.has_column(key) {
                errors.push(format!("sort key '{key}' is not a declared column"));
            }
        }
        if let Some(first) = self.sort_keys.first() {
            if !self.business_key.contains(first) {
                errors.push(format!(
                    "first sort key '{first}' must be a business-key column"
                ));
            }
        }
        for reference in &self.references {
            if !self.has_column(&reference.column) {
                errors.push(format!(
                    "reference check on undeclared column '{}'",
                    reference.column
                ));
            }
        }
        for col in &self.columns {
            if let Some(ValueDomain::Pattern { regex }) = &col.domain {
                if let Err(e) = regex::Regex::new(regex) {
                    errors.push(format!("column '{}': invalid pattern: {e}", col.name));
                }
            }
        }

        if !errors.is_empty() {
            bail!(
                "invalid contract '{}':\n  - {}",
                self.id,
                errors.join("\n  - ")
            );
        }
        Ok(())
    }
}

/// Explicit mapping from contract identifier to its registered versions.
#[derive(Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, BTreeMap<ContractVersion, SchemaContract>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract after structural checks. Re-registering the same
    /// (id, version) is an error; contracts are immutable artifacts.
    pub fn register(&mut self, contract: SchemaContract) -> Result<()> {
        contract.check()?;
        let versions = self.contracts.entry(contract.id.clone()).or_default();
        if versions.contains_key(&contract.version) {
            bail!(
                "contract '{}' version {} is already registered",
                contract.id,
                contract.version
            );
        }
        versions.insert(contract.version, contract);
        Ok(())
    }

    pub fn latest(&self, id: &str) -> Option<&SchemaContract> {
        self.contracts
            .get(id)
            .and_then(|versions| versions.values().next_back())
    }

    pub fn get(&self, id: &str, version: ContractVersion) -> Option<&SchemaContract> {
        self.contracts.get(id).and_then(|v| v.get(&version))
    }

    /// Resolve the contract a run pins. Fails when the id is unknown, the
    /// pinned version is not registered, or a newer contract exists while
    /// migration is disabled.
    pub fn resolve(&self, pin: &ContractRef) -> Result<&SchemaContract> {
        let pinned = ContractVersion::parse(&pin.version)?;
        let versions = self
            .contracts
            .get(&pin.id)
            .with_context(|| format!("no contract registered under id '{}'", pin.id))?;
        let contract = versions.get(&pinned).with_context(|| {
            let available: Vec<String> = versions.keys().map(|v| v.to_string()).collect();
            format!(
                "contract '{}' has no version {} (available: {})",
                pin.id,
                pinned,
                available.join(", ")
            )
        })?;
        // Latest is never below the pinned version here, since pinned exists.
        let latest = versions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(pinned);
        if latest != pinned && !pin.allow_migration {
            bail!(
                "contract '{}' pinned at {} but live version is {} and migration is disabled",
                pin.id,
                pinned,
                latest
            );
        }
        Ok(contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn compound_contract() -> SchemaContract {
        SchemaContract {
            id: "compound".to_string(),
            version: ContractVersion::new(1, 0, 0),
            columns: vec![
                ColumnSpec::new("compound_id", ColumnType::Text, false),
                ColumnSpec::new("name", ColumnType::Text, true),
                ColumnSpec::new("mass", ColumnType::Float, true).with_domain(
                    ValueDomain::Range {
                        min: Some(0.0),
                        max: None,
                    },
                ),
            ],
            business_key: vec!["compound_id".to_string()],
            sort_keys: vec!["compound_id".to_string()],
            references: vec![],
        }
    }

    #[test]
    fn version_parse_and_order() {
        let v1 = ContractVersion::parse("1.2.3").unwrap();
        assert_eq!(v1, ContractVersion::new(1, 2, 3));
        assert_eq!(v1.to_string(), "1.2.3");
        assert!(ContractVersion::new(1, 10, 0) > ContractVersion::new(1, 9, 9));
        assert!(ContractVersion::parse("1.2").is_err());
        assert!(ContractVersion::parse("1.2.x").is_err());
    }

    #[test]
    fn version_serde_as_string() {
        let v: ContractVersion = serde_json::from_str("\"2.0.1\"").unwrap();
        assert_eq!(v, ContractVersion::new(2, 0, 1));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"2.0.1\"");
    }

    #[test]
    fn column_type_accepts_and_coerces() {
        assert!(ColumnType::Float.accepts(&Value::Float(1.0)));
        assert!(!ColumnType::Float.accepts(&Value::Int(1)));
        assert!(ColumnType::Float.coerces(&Value::Int(1)));
        assert!(!ColumnType::Int.coerces(&Value::Float(1.0)));
        assert!(ColumnType::Text.accepts(&Value::from("x")));
    }

    #[test]
    fn contract_check_accepts_valid() {
        assert!(compound_contract().check().is_ok());
    }

    #[test]
    fn contract_check_rejects_bad_keys() {
        let mut c = compound_contract();
        c.sort_keys = vec!["nonexistent".to_string()];
        let err = c.check().unwrap_err().to_string();
        assert!(err.contains("nonexistent"));

        let mut c = compound_contract();
        c.sort_keys = vec!["name".to_string()];
        let err = c.check().unwrap_err().to_string();
        assert!(err.contains("business-key"));
    }

    #[test]
    fn contract_check_rejects_duplicate_columns() {
        let mut c = compound_contract();
        c.columns
            .push(ColumnSpec::new("name", ColumnType::Text, true));
        let err = c.check().unwrap_err().to_string();
        assert!(err.contains("duplicate column 'name'"));
    }

    #[test]
    fn contract_deserializes_from_toml() {
        let toml = r#"
id = "compound"
version = "1.0.0"
business_key = ["compound_id"]
sort_keys = ["compound_id", "synonym_rank"]

[[columns]]
name = "compound_id"
type = "text"

[[columns]]
name = "synonym_rank"
type = "int"
nullable = true

[[columns]]
name = "state"
type = "text"
nullable = true
domain = { kind = "oneof", values = ["solid", "liquid", "gas"] }
"#;
        let contract: SchemaContract = toml::from_str(toml).unwrap();
        assert!(contract.check().is_ok());
        assert_eq!(contract.columns.len(), 3);
        assert!(matches!(
            contract.column("state").unwrap().domain,
            Some(ValueDomain::OneOf { .. })
        ));
    }

    #[test]
    fn registry_resolves_pinned_version() {
        let mut registry = ContractRegistry::new();
        registry.register(compound_contract()).unwrap();

        let pin = ContractRef {
            id: "compound".to_string(),
            version: "1.0.0".to_string(),
            allow_migration: false,
            max_migration_hops: 3,
        };
        let resolved = registry.resolve(&pin).unwrap();
        assert_eq!(resolved.version, ContractVersion::new(1, 0, 0));
    }

    #[test]
    fn registry_rejects_unknown_pin() {
        let mut registry = ContractRegistry::new();
        registry.register(compound_contract()).unwrap();

        let pin = ContractRef {
            id: "compound".to_string(),
            version: "9.0.0".to_string(),
            allow_migration: false,
            max_migration_hops: 3,
        };
        let err = registry.resolve(&pin).unwrap_err().to_string();
        assert!(err.contains("no version 9.0.0"));
        assert!(err.contains("1.0.0"));
    }

    #[test]
    fn registry_flags_newer_live_contract() {
        let mut registry = ContractRegistry::new();
        registry.register(compound_contract()).unwrap();
        let mut v2 = compound_contract();
        v2.version = ContractVersion::new(2, 0, 0);
        registry.register(v2).unwrap();

        let mut pin = ContractRef {
            id: "compound".to_string(),
            version: "1.0.0".to_string(),
            allow_migration: false,
            max_migration_hops: 3,
        };
        let err = registry.resolve(&pin).unwrap_err().to_string();
        assert!(err.contains("live version is 2.0.0"));

        pin.allow_migration = true;
        assert!(registry.resolve(&pin).is_ok());
    }

    #[test]
    fn registry_rejects_duplicate_registration() {
        let mut registry = ContractRegistry::new();
        registry.register(compound_contract()).unwrap();
        let err = registry
            .register(compound_contract())
            .unwrap_err()
            .to_string();
        assert!(err.contains("already registered"));
    }
}

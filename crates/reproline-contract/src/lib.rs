//! Schema contracts, migrations, and the validation gate.
//!
//! A pipeline pins one contract (id + version). Batches that declare an
//! older schema version are lifted through registered migration steps, then
//! validated column by column before they are allowed anywhere near the
//! writer.

pub mod contract;
pub mod gate;
pub mod migrate;

pub use contract::{
    ColumnSpec, ColumnType, ContractRegistry, ContractVersion, ReferenceCheck, SchemaContract,
    ValueDomain,
};
pub use gate::{GateOutcome, SchemaGate, SchemaViolation};
pub use migrate::{BatchMigration, FnMigration, MigrationHop, MigrationRegistry};

//! Artifact production: canonical batch form, content digests, and atomic
//! parquet output with a self-describing metadata document.

pub mod canonical;
pub mod hash;
pub mod meta;
pub mod writer;

pub use canonical::{CanonicalBatch, CanonicalizationEngine};
pub use meta::RunMetadata;
pub use writer::{
    arrow_schema, is_valid_parquet, sweep_orphaned_staging, AtomicWriter, OutputArtifact,
    StagedDataset,
};

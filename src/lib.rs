// Library exports for the replicar reproducibility engine
pub mod config;
pub mod pipeline;
pub mod report;

// Re-export key types for convenience
pub use config::ReplicarConfig;
pub use pipeline::{
    declare_stage, parse_manifest, validate_manifest, DataRef, Driver, Environment, Manifest,
    PipelineError, RunConfig, Stage, StageKind,
};
pub use report::{NodeOutcome, RunReport};

//! Replicar pipeline engine — declarative stages compiled into a
//! cacheable dependency graph.
//!
//! BLAKE3 fingerprints over code, environment specs, and data decide what
//! is stale; environments are reconciled against their specs immediately
//! before use; execution walks the graph sequentially and reports
//! succeeded / skipped / failed / blocked per node.

pub mod driver;
pub mod error;
pub mod eventlog;
pub mod fingerprint;
pub mod graph;
pub mod host;
pub mod kernel;
pub mod lockstore;
pub mod parser;
pub mod reconcile;
pub mod staleness;
pub mod store;
pub mod types;

pub use driver::{Driver, RunConfig};
pub use error::{PipelineError, Result};
pub use graph::{build_graph, Graph};
pub use host::{ExecutionHost, LocalHost, ToolchainBackend};
pub use kernel::{InMemoryKernel, KernelClient};
pub use lockstore::LockStore;
pub use parser::{declare_stage, parse_manifest, parse_manifest_file, validate_manifest};
pub use reconcile::{EnvironmentBackend, Reconciler};
pub use store::{FsObjectStore, ObjectStore};
pub use types::{
    DataRef, Environment, LockRecord, Manifest, RealizedState, RunStatus, Stage, StageKind,
    StaleReason,
};

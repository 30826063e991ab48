//! Manifest, lock, and event types.
//!
//! The declarative manifest parses into a closed set of tagged variants —
//! one per environment kind, one per stage kind — so an unrecognized kind
//! fails at load time instead of propagating as an open dictionary.
//! Lock records and realized environment state are derived artifacts,
//! regenerated by runs and never hand-edited.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Manifest root
// ============================================================================

/// Top-level declarative pipeline manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version (must be "1")
    pub version: String,

    /// Human-readable pipeline name
    pub name: String,

    /// Named computational environments
    #[serde(default)]
    pub environments: IndexMap<String, Environment>,

    /// Pipeline stages (order-preserving; declaration order breaks
    /// topological ties)
    #[serde(default)]
    pub stages: IndexMap<String, Stage>,
}

// ============================================================================
// Environments
// ============================================================================

/// A named, reproducible computational context.
///
/// The `kind` tag selects the variant; unknown kinds are a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Environment {
    /// Container image, optionally built from a dockerfile
    Container {
        image: String,
        #[serde(default)]
        dockerfile: Option<PathBuf>,
    },
    /// Conda-style environment from a dependency file and/or inline packages
    Conda {
        #[serde(default)]
        file: Option<PathBuf>,
        #[serde(default)]
        packages: Vec<String>,
    },
    /// Virtualenv-style environment
    Virtualenv {
        #[serde(default)]
        python: Option<String>,
        #[serde(default)]
        requirements: Option<PathBuf>,
        #[serde(default)]
        packages: Vec<String>,
    },
    /// Remote shell host
    Remote {
        host: String,
        #[serde(default)]
        user: Option<String>,
    },
    /// Cluster job submission context
    Cluster {
        scheduler: String,
        #[serde(default)]
        queue: Option<String>,
    },
}

impl Environment {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::Conda { .. } => "conda",
            Self::Virtualenv { .. } => "virtualenv",
            Self::Remote { .. } => "remote",
            Self::Cluster { .. } => "cluster",
        }
    }
}

/// Realized environment state — the lock side of an `Environment`.
///
/// Replaced wholesale on every successful reconciliation; never hand-edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedState {
    /// Fingerprint of the spec this state was realized from
    pub spec_fingerprint: String,

    /// Image digest or equivalent single identity, when the kind has one
    #[serde(default)]
    pub digest: Option<String>,

    /// Exact resolved facts (package → version, prefix path, host key, …),
    /// stable order for diff-friendly lock files
    #[serde(default)]
    pub resolved: IndexMap<String, String>,

    /// ISO 8601 timestamp of the reconciliation that produced this state
    pub realized_at: String,
}

// ============================================================================
// Stages
// ============================================================================

/// One unit of computation with declared inputs/outputs and a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Stage kind (script by default)
    #[serde(default)]
    pub kind: StageKind,

    /// Environment name (from manifest.environments), or none for the
    /// ambient shell
    #[serde(default)]
    pub environment: Option<String>,

    /// Opaque command passed to the environment's execution mechanism
    pub command: String,

    /// Input references: filesystem paths or `var:` kernel variables
    #[serde(default)]
    pub inputs: Vec<DataRef>,

    /// Output declarations
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,

    /// Variant list — the stage template expands into one graph node per
    /// variant, with `{{variant}}` substituted into command and refs
    #[serde(default)]
    pub foreach: Option<Vec<String>>,

    /// Kernel session identity, required for notebook stages that read or
    /// write variables
    #[serde(default)]
    pub kernel: Option<String>,
}

/// Stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    #[default]
    Script,
    NotebookCell,
    Notebook,
    Manual,
    RemoteJob,
}

impl StageKind {
    /// Kinds whose execution may outlive the driver process and therefore
    /// record a resumable job id.
    pub fn is_detachable(self) -> bool {
        matches!(self, Self::RemoteJob)
    }
}

/// A path or variable reference.
///
/// Serialized as a plain string: `data/raw.csv`, `var:metrics`, or
/// `env:training` (the last only as an output of environment-build stages).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataRef {
    Path(String),
    Var(String),
    Env(String),
}

impl From<String> for DataRef {
    fn from(s: String) -> Self {
        if let Some(name) = s.strip_prefix("var:") {
            Self::Var(name.to_string())
        } else if let Some(name) = s.strip_prefix("env:") {
            Self::Env(name.to_string())
        } else {
            Self::Path(s)
        }
    }
}

impl From<DataRef> for String {
    fn from(r: DataRef) -> Self {
        r.to_string()
    }
}

impl fmt::Display for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p),
            Self::Var(v) => write!(f, "var:{}", v),
            Self::Env(e) => write!(f, "env:{}", e),
        }
    }
}

/// Output declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    /// What this stage produces
    #[serde(rename = "ref")]
    pub target: DataRef,

    /// Semantic class of the artifact
    #[serde(default)]
    pub class: Option<OutputClass>,

    /// Fingerprint mode for file outputs. `metadata` (size+mtime) is an
    /// explicitly weaker guarantee for very large files.
    #[serde(default)]
    pub checksum: ChecksumMode,

    /// Serialization format, required for variable outputs
    #[serde(default)]
    pub format: Option<VarFormat>,
}

impl OutputDecl {
    pub fn path(p: impl Into<String>) -> Self {
        Self {
            target: DataRef::Path(p.into()),
            class: None,
            checksum: ChecksumMode::Content,
            format: None,
        }
    }
}

/// Semantic artifact classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputClass {
    Dataset,
    Figure,
    Model,
    Environment,
}

/// File fingerprint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Content hash of file bytes (default)
    #[default]
    Content,
    /// Size + mtime only — cheap but weakens staleness and idempotence
    /// guarantees for that output
    Metadata,
}

/// Serialization formats for kernel variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarFormat {
    Pickle,
    Arrow,
}

impl fmt::Display for VarFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pickle => write!(f, "pickle"),
            Self::Arrow => write!(f, "arrow"),
        }
    }
}

// ============================================================================
// Expanded graph nodes
// ============================================================================

/// One executable node: a stage, or one variant of a foreach stage.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique key: `stage` or `stage@variant`
    pub key: String,

    /// Declared stage name this node expanded from
    pub stage_name: String,

    /// Variant identity, folded into the key and fingerprints
    pub variant: Option<String>,

    /// Stage definition with the variant substituted in
    pub stage: Stage,

    /// Declaration index in the manifest (topological tie-breaker)
    pub decl_index: usize,
}

// ============================================================================
// Lock records
// ============================================================================

/// Terminal and in-flight statuses recorded in the lock tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Running,
}

/// Fingerprint of one input or output reference at lock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefLock {
    #[serde(rename = "ref")]
    pub target: String,
    pub fingerprint: String,
}

/// Persisted record of the fingerprints present at a node's last run.
///
/// A full record (all fingerprints) is written only after the command
/// exits successfully with every declared output present. `failed` and
/// `running` markers never satisfy a freshness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub status: RunStatus,

    pub code_fingerprint: String,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub environment_fingerprint: Option<String>,

    #[serde(default)]
    pub inputs: Vec<RefLock>,

    #[serde(default)]
    pub outputs: Vec<RefLock>,

    #[serde(default)]
    pub started_at: Option<String>,

    #[serde(default)]
    pub completed_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// Opaque external job identity for detachable stages; lets a restarted
    /// driver resume waiting instead of resubmitting
    #[serde(default)]
    pub job_id: Option<String>,
}

// ============================================================================
// Staleness
// ============================================================================

/// Why a node must rerun.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No lock record exists
    NoRecord,
    /// Previous run did not complete successfully
    PreviousRunIncomplete { status: String },
    /// Command/cell source changed
    CodeChanged { old: String, new: String },
    /// Environment spec fingerprint changed
    EnvironmentChanged { old: String, new: String },
    /// A declared input's fingerprint changed
    InputChanged {
        target: String,
        old: String,
        new: String,
    },
    /// A declared output is gone
    OutputMissing { target: String },
    /// A producing ancestor is itself stale
    UpstreamStale { node: String },
    /// Forced re-run
    Forced,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecord => write!(f, "no lock record"),
            Self::PreviousRunIncomplete { status } => {
                write!(f, "previous run status: {}", status)
            }
            Self::CodeChanged { old, new } => {
                write!(f, "code changed: {} → {}", short(old), short(new))
            }
            Self::EnvironmentChanged { old, new } => {
                write!(f, "environment spec changed: {} → {}", short(old), short(new))
            }
            Self::InputChanged { target, old, new } => {
                write!(
                    f,
                    "input '{}' changed: {} → {}",
                    target,
                    short(old),
                    short(new)
                )
            }
            Self::OutputMissing { target } => write!(f, "output '{}' is missing", target),
            Self::UpstreamStale { node } => write!(f, "upstream '{}' is stale", node),
            Self::Forced => write!(f, "forced re-run (--force)"),
        }
    }
}

fn short(fp: &str) -> &str {
    let trimmed = fp.strip_prefix("blake3:").unwrap_or(fp);
    if trimmed.is_empty() {
        "(absent)"
    } else {
        &trimmed[..trimmed.len().min(8)]
    }
}

// ============================================================================
// Run events (JSONL event log)
// ============================================================================

/// Pipeline execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        manifest: String,
        run_id: String,
        engine_version: String,
    },
    RunCompleted {
        manifest: String,
        run_id: String,
        succeeded: u32,
        skipped: u32,
        failed: u32,
        blocked: u32,
        total_seconds: f64,
    },
    NodeSkipped {
        node: String,
    },
    NodeStarted {
        node: String,
        stale_reasons: String,
    },
    NodeCompleted {
        node: String,
        duration_seconds: f64,
    },
    NodeFailed {
        node: String,
        exit_code: Option<i32>,
        error: String,
    },
    NodeBlocked {
        node: String,
        on: String,
    },
    EnvironmentReconciled {
        environment: String,
        spec_fingerprint: String,
        rebuilt: bool,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// ISO 8601 timestamp
    pub ts: String,

    #[serde(flatten)]
    pub event: PipelineEvent,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_serde_roundtrip() {
        let yaml = r#"
version: "1"
name: demo
environments:
  py:
    kind: virtualenv
    packages: [pandas, matplotlib]
stages:
  collect:
    command: "python collect.py"
    outputs:
      - ref: data/raw.csv
"#;
        let m: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(m.version, "1");
        assert_eq!(m.environments.len(), 1);
        assert!(matches!(
            m.environments["py"],
            Environment::Virtualenv { .. }
        ));
        assert_eq!(
            m.stages["collect"].outputs[0].target,
            DataRef::Path("data/raw.csv".to_string())
        );
    }

    #[test]
    fn test_unknown_environment_kind_rejected_at_parse() {
        let yaml = r#"
kind: flatpak
image: whatever
"#;
        assert!(serde_yaml::from_str::<Environment>(yaml).is_err());
    }

    #[test]
    fn test_unknown_stage_kind_rejected_at_parse() {
        let yaml = r#"
kind: interpretive-dance
command: "echo hi"
"#;
        assert!(serde_yaml::from_str::<Stage>(yaml).is_err());
    }

    #[test]
    fn test_data_ref_string_forms() {
        assert_eq!(
            DataRef::from("data/x.csv".to_string()),
            DataRef::Path("data/x.csv".to_string())
        );
        assert_eq!(
            DataRef::from("var:metrics".to_string()),
            DataRef::Var("metrics".to_string())
        );
        assert_eq!(
            DataRef::from("env:training".to_string()),
            DataRef::Env("training".to_string())
        );
        assert_eq!(DataRef::Var("m".to_string()).to_string(), "var:m");
    }

    #[test]
    fn test_stage_defaults() {
        let yaml = r#"
command: "echo hi"
"#;
        let stage: Stage = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(stage.kind, StageKind::Script);
        assert!(stage.environment.is_none());
        assert!(stage.inputs.is_empty());
        assert!(stage.outputs.is_empty());
        assert!(stage.foreach.is_none());
        assert!(stage.kernel.is_none());
    }

    #[test]
    fn test_output_decl_defaults() {
        let yaml = r#"
ref: data/big.bin
"#;
        let out: OutputDecl = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(out.checksum, ChecksumMode::Content);
        assert!(out.class.is_none());

        let yaml2 = r#"
ref: data/huge.bin
checksum: metadata
class: dataset
"#;
        let out2: OutputDecl = serde_yaml::from_str(yaml2).unwrap();
        assert_eq!(out2.checksum, ChecksumMode::Metadata);
        assert_eq!(out2.class, Some(OutputClass::Dataset));
    }

    #[test]
    fn test_lock_record_serde_roundtrip() {
        let rec = LockRecord {
            status: RunStatus::Succeeded,
            code_fingerprint: "blake3:abc".to_string(),
            environment: Some("py".to_string()),
            environment_fingerprint: Some("blake3:env".to_string()),
            inputs: vec![RefLock {
                target: "data/raw.csv".to_string(),
                fingerprint: "blake3:in".to_string(),
            }],
            outputs: vec![RefLock {
                target: "figures/plot.png".to_string(),
                fingerprint: "blake3:out".to_string(),
            }],
            started_at: Some("2026-08-04T10:00:00Z".to_string()),
            completed_at: Some("2026-08-04T10:00:05Z".to_string()),
            duration_seconds: Some(5.0),
            job_id: None,
        };
        let yaml = serde_yaml::to_string(&rec).unwrap();
        let back: LockRecord = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.status, RunStatus::Succeeded);
        assert_eq!(back.inputs[0].target, "data/raw.csv");
    }

    #[test]
    fn test_stale_reason_display() {
        assert_eq!(StaleReason::NoRecord.to_string(), "no lock record");
        assert_eq!(
            StaleReason::OutputMissing {
                target: "data/x".to_string()
            }
            .to_string(),
            "output 'data/x' is missing"
        );
        let r = StaleReason::CodeChanged {
            old: "blake3:aaaaaaaaaaaa".to_string(),
            new: "blake3:bbbbbbbbbbbb".to_string(),
        };
        assert_eq!(r.to_string(), "code changed: aaaaaaaa → bbbbbbbb");
    }

    #[test]
    fn test_pipeline_event_serde() {
        let event = PipelineEvent::NodeStarted {
            node: "train@fold1".to_string(),
            stale_reasons: "no lock record".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"node_started\""));
        assert!(json.contains("train@fold1"));
    }

    #[test]
    fn test_detachable_kinds() {
        assert!(StageKind::RemoteJob.is_detachable());
        assert!(!StageKind::Script.is_detachable());
        assert!(!StageKind::NotebookCell.is_detachable());
    }
}

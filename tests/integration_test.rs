//! End-to-end scenarios: a manifest on disk, a real local shell, and
//! repeated driver passes over the same lock tree.

use async_trait::async_trait;
use indexmap::IndexMap;
use replicar::pipeline::{
    Driver, Environment, EnvironmentBackend, LocalHost, RealizedState, RunConfig,
};
use replicar::report::NodeOutcome;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Backend that never touches a real toolchain: always healthy, counts
/// rebuilds.
struct RecordingBackend {
    realizes: AtomicUsize,
}

impl RecordingBackend {
    fn new() -> Self {
        Self {
            realizes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EnvironmentBackend for RecordingBackend {
    async fn probe(
        &self,
        _name: &str,
        _env: &Environment,
        _state: &RealizedState,
    ) -> replicar::pipeline::Result<bool> {
        Ok(true)
    }

    async fn realize(
        &self,
        _name: &str,
        _env: &Environment,
    ) -> replicar::pipeline::Result<RealizedState> {
        self.realizes.fetch_add(1, Ordering::SeqCst);
        Ok(RealizedState {
            spec_fingerprint: String::new(),
            digest: None,
            resolved: IndexMap::new(),
            realized_at: "2026-08-04T10:00:00Z".to_string(),
        })
    }
}

fn write_manifest(path: &Path, yaml: &str) {
    std::fs::write(path, yaml).unwrap();
}

async fn run(
    backend: &RecordingBackend,
    manifest_path: &PathBuf,
) -> replicar::report::RunReport {
    let host = LocalHost::new();
    let driver = Driver::new(backend, &host);
    driver
        .run(&RunConfig::new(manifest_path.clone()))
        .await
        .unwrap()
}

/// The collect/plot lifecycle: first run executes both in order, an
/// unchanged second run skips both, an environment edit reruns the whole
/// chain, and a code edit on the leaf reruns only the leaf.
#[tokio::test]
async fn test_collect_then_plot_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("data").join("raw.csv");
    let plot = dir.path().join("figures").join("plot.png");
    std::fs::create_dir_all(raw.parent().unwrap()).unwrap();
    std::fs::create_dir_all(plot.parent().unwrap()).unwrap();
    let manifest_path = dir.path().join("pipeline.yaml");

    let manifest_v1 = format!(
        r#"
version: "1"
name: paper
environments:
  py:
    kind: conda
    packages: [pandas, matplotlib]
stages:
  collect:
    environment: py
    command: "printf 'a,b;1,2' > {raw}"
    outputs:
      - ref: {raw}
        class: dataset
  plot:
    environment: py
    command: "cat {raw} > {plot}"
    inputs: [{raw}]
    outputs:
      - ref: {plot}
        class: figure
"#,
        raw = raw.display(),
        plot = plot.display()
    );
    write_manifest(&manifest_path, &manifest_v1);

    // First run: both execute, collect before plot
    let backend = RecordingBackend::new();
    let first = run(&backend, &manifest_path).await;
    assert_eq!(first.succeeded(), 2);
    let order: Vec<&String> = first.nodes.keys().collect();
    assert_eq!(order, vec!["collect", "plot"]);
    assert!(raw.exists());
    assert!(plot.exists());

    // Second run, no changes: both skipped
    let second = run(&backend, &manifest_path).await;
    assert_eq!(second.skipped(), 2);
    assert_eq!(second.succeeded(), 0);

    // Third run: collect's environment spec changed. collect reconciles
    // and reruns; plot reruns because the chain above it went stale.
    let manifest_v2 = manifest_v1.replace("packages: [pandas, matplotlib]", "packages: [pandas=2.2, matplotlib]");
    write_manifest(&manifest_path, &manifest_v2);
    let before = backend.realizes.load(Ordering::SeqCst);
    let third = run(&backend, &manifest_path).await;
    assert_eq!(third.succeeded(), 2);
    assert_eq!(backend.realizes.load(Ordering::SeqCst), before + 1);

    // Fourth run: only plot's command changes; collect skips, plot reruns
    let manifest_v3 = manifest_v2.replace("cat ", "head -c 3 ");
    write_manifest(&manifest_path, &manifest_v3);
    let fourth = run(&backend, &manifest_path).await;
    assert_eq!(fourth.nodes["collect"], NodeOutcome::Skipped);
    assert!(matches!(
        fourth.nodes["plot"],
        NodeOutcome::Succeeded { .. }
    ));
}

/// Editing an external input file makes only its consumers stale.
#[tokio::test]
async fn test_external_input_edit_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("notes.txt");
    let upper = dir.path().join("upper.txt");
    std::fs::write(&source, "hello\n").unwrap();
    let manifest_path = dir.path().join("pipeline.yaml");
    write_manifest(
        &manifest_path,
        &format!(
            r#"
version: "1"
name: notes
stages:
  shout:
    command: "tr a-z A-Z < {src} > {upper}"
    inputs: [{src}]
    outputs: [{{ref: {upper}}}]
"#,
            src = source.display(),
            upper = upper.display()
        ),
    );

    let backend = RecordingBackend::new();
    assert_eq!(run(&backend, &manifest_path).await.succeeded(), 1);
    assert_eq!(run(&backend, &manifest_path).await.skipped(), 1);

    std::fs::write(&source, "changed\n").unwrap();
    let report = run(&backend, &manifest_path).await;
    assert_eq!(report.succeeded(), 1);
    assert_eq!(std::fs::read_to_string(&upper).unwrap(), "CHANGED\n");
}

/// Three independent stages; the middle one fails. The other two still
/// run and nothing is blocked.
#[tokio::test]
async fn test_partial_failure_isolates_branches() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let c = dir.path().join("c.txt");
    let manifest_path = dir.path().join("pipeline.yaml");
    write_manifest(
        &manifest_path,
        &format!(
            r#"
version: "1"
name: islands
stages:
  a:
    command: "printf a > {a}"
    outputs: [{{ref: {a}}}]
  b:
    command: "exit 9"
  c:
    command: "printf c > {c}"
    outputs: [{{ref: {c}}}]
"#,
            a = a.display(),
            c = c.display()
        ),
    );

    let backend = RecordingBackend::new();
    let report = run(&backend, &manifest_path).await;
    assert!(matches!(report.nodes["a"], NodeOutcome::Succeeded { .. }));
    assert!(matches!(report.nodes["b"], NodeOutcome::Failed { .. }));
    assert!(matches!(report.nodes["c"], NodeOutcome::Succeeded { .. }));
    assert_eq!(report.blocked(), 0);
}

/// A cycle aborts before anything runs.
#[tokio::test]
async fn test_cycle_aborts_with_zero_executions() {
    let dir = tempfile::tempdir().unwrap();
    let witness = dir.path().join("executed");
    let manifest_path = dir.path().join("pipeline.yaml");
    write_manifest(
        &manifest_path,
        &format!(
            r#"
version: "1"
name: ouroboros
stages:
  x:
    command: "touch {w}"
    inputs: [y.out]
    outputs: [{{ref: x.out}}]
  y:
    command: "touch {w}"
    inputs: [x.out]
    outputs: [{{ref: y.out}}]
"#,
            w = witness.display()
        ),
    );

    let backend = RecordingBackend::new();
    let host = LocalHost::new();
    let driver = Driver::new(&backend, &host);
    let err = driver
        .run(&RunConfig::new(manifest_path))
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("cycle"), "unexpected error: {msg}");
    assert!(!witness.exists());
}

/// Foreach variants run as independent nodes; editing the shared template
/// reruns every variant.
#[tokio::test]
async fn test_foreach_variants_rerun_together() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("pipeline.yaml");
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    let template = format!(
        r#"
version: "1"
name: folds
stages:
  train:
    command: "printf {{{{variant}}}} > {out}/{{{{variant}}}}.txt"
    foreach: [f1, f2, f3]
    outputs:
      - ref: {out}/{{{{variant}}}}.txt
"#,
        out = out.display()
    );
    write_manifest(&manifest_path, &template);

    let backend = RecordingBackend::new();
    let first = run(&backend, &manifest_path).await;
    assert_eq!(first.succeeded(), 3);
    assert_eq!(
        std::fs::read_to_string(out.join("f2.txt")).unwrap(),
        "f2"
    );

    let second = run(&backend, &manifest_path).await;
    assert_eq!(second.skipped(), 3);

    // Template edit invalidates every variant
    write_manifest(&manifest_path, &template.replace("printf ", "printf x"));
    let third = run(&backend, &manifest_path).await;
    assert_eq!(third.succeeded(), 3);
    assert_eq!(
        std::fs::read_to_string(out.join("f2.txt")).unwrap(),
        "xf2"
    );
}

/// Deleting a declared output makes only that stage rerun.
#[tokio::test]
async fn test_deleted_output_reruns_producer() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("artifact.txt");
    let manifest_path = dir.path().join("pipeline.yaml");
    write_manifest(
        &manifest_path,
        &format!(
            r#"
version: "1"
name: restore
stages:
  produce:
    command: "printf artifact > {out}"
    outputs: [{{ref: {out}}}]
"#,
            out = out.display()
        ),
    );

    let backend = RecordingBackend::new();
    assert_eq!(run(&backend, &manifest_path).await.succeeded(), 1);
    assert_eq!(run(&backend, &manifest_path).await.skipped(), 1);

    std::fs::remove_file(&out).unwrap();
    let report = run(&backend, &manifest_path).await;
    assert_eq!(report.succeeded(), 1);
    assert!(out.exists());
}

//! Sequential execution driver.
//!
//! Walks the topological order once per pass. Per node:
//! `pending → (skipped | reconciling → running → (succeeded | failed))`,
//! with `blocked` for every descendant of a failure. Reconciliation is
//! memoized per environment for the pass. Lock records are written only
//! after a command exits zero with every declared output present; the
//! driver never retries — a failed run is re-invoked by the caller and
//! staleness evaluation naturally limits the rework to the failed branch.

use super::error::{PipelineError, Result};
use super::eventlog;
use super::graph::{self, Graph};
use super::host::{ExecutionContext, ExecutionHost, JobHandle};
use super::kernel::KernelClient;
use super::lockstore::LockStore;
use super::parser;
use super::reconcile::{EnvironmentBackend, Reconciler};
use super::staleness::{self, FingerprintOracle};
use super::store::ObjectStore;
use super::types::*;
use crate::report::{NodeOutcome, RunReport};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Configuration for one driver pass.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Path to the manifest YAML
    pub manifest_path: PathBuf,

    /// Only run these stages (matched by stage name or node key; None = all)
    pub stage_filter: Option<Vec<String>>,

    /// Ignore lock records and rerun everything
    pub force: bool,
}

impl RunConfig {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            stage_filter: None,
            force: false,
        }
    }
}

/// The driver and its collaborators. Build one per process; `run` may be
/// called repeatedly.
pub struct Driver<'a> {
    backend: &'a dyn EnvironmentBackend,
    host: &'a dyn ExecutionHost,
    kernel: Option<&'a dyn KernelClient>,
    store: Option<&'a dyn ObjectStore>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> Driver<'a> {
    pub fn new(backend: &'a dyn EnvironmentBackend, host: &'a dyn ExecutionHost) -> Self {
        Self {
            backend,
            host,
            kernel: None,
            store: None,
            interrupt: None,
        }
    }

    pub fn with_kernel(mut self, kernel: &'a dyn KernelClient) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_store(mut self, store: &'a dyn ObjectStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Cooperative cancellation: checked between nodes, and spawned
    /// children are killed on drop so an interrupt reaches the process.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Execute one pass over the manifest.
    pub async fn run(&self, config: &RunConfig) -> Result<RunReport> {
        let pass_start = Instant::now();

        let manifest = parser::parse_manifest_file(&config.manifest_path)?;
        parser::validate_manifest(&manifest)?;
        let graph = graph::build_graph(&manifest)?;

        let locks = LockStore::for_manifest(&config.manifest_path);
        let run_id = eventlog::generate_run_id();
        let _ = eventlog::append_event(
            &config.manifest_path,
            PipelineEvent::RunStarted {
                manifest: manifest.name.clone(),
                run_id: run_id.clone(),
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );

        let env_fps = staleness::environment_fingerprints(&manifest);
        let oracle = FingerprintOracle::new(&graph, self.kernel, self.store);
        let labels = staleness::evaluate_pass(&graph, &env_fps, &locks, &oracle, config.force)?;

        let selected = select_nodes(&graph, &config.stage_filter);
        let mut reconciler = Reconciler::new(self.backend, &locks);
        let mut outcomes: IndexMap<String, NodeOutcome> = IndexMap::new();
        // failed or blocked node → root-cause node
        let mut broken: HashMap<String, String> = HashMap::new();

        for key in &selected {
            if self.interrupted() {
                tracing::warn!(node = key.as_str(), "run interrupted, not executed");
                outcomes.insert(key.clone(), NodeOutcome::Cancelled);
                continue;
            }

            let node = graph.node(key).expect("selected nodes exist");

            // Blocked: an ancestor failed this pass
            let blocked_on: Option<String> = graph
                .predecessors
                .get(key)
                .and_then(|preds| preds.iter().find_map(|p| broken.get(p).cloned()));
            if let Some(root) = blocked_on {
                broken.insert(key.clone(), root.clone());
                let _ = eventlog::append_event(
                    &config.manifest_path,
                    PipelineEvent::NodeBlocked {
                        node: key.clone(),
                        on: root.clone(),
                    },
                );
                println!("  {} BLOCKED (ancestor '{}' failed)", key, root);
                outcomes.insert(key.clone(), NodeOutcome::Blocked { on: root });
                continue;
            }

            let mut reasons = labels.get(key).cloned().unwrap_or_default();

            // Upstream-only staleness: the upstream has completed by now, so
            // re-check this node's own record against fresh input
            // fingerprints. An upstream that reproduced identical outputs
            // lets this node skip.
            if !reasons.is_empty()
                && reasons
                    .iter()
                    .all(|r| matches!(r, StaleReason::UpstreamStale { .. }))
            {
                reasons = self.re_evaluate(node, &env_fps, &locks, &oracle)?;
            }

            if reasons.is_empty() {
                let _ = eventlog::append_event(
                    &config.manifest_path,
                    PipelineEvent::NodeSkipped { node: key.clone() },
                );
                println!("  {} SKIPPED", key);
                outcomes.insert(key.clone(), NodeOutcome::Skipped);
                continue;
            }

            let reason_str = reasons
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("; ");

            match self
                .execute_node(node, &manifest, &locks, &oracle, &env_fps, &mut reconciler, config, &reason_str)
                .await
            {
                Ok(duration_seconds) => {
                    println!("  {} COMPLETED ({:.1}s)", key, duration_seconds);
                    outcomes.insert(key.clone(), NodeOutcome::Succeeded { duration_seconds });
                }
                Err(err) if err.is_branch_local() => {
                    eprintln!("  {} FAILED: {}", key, err);
                    broken.insert(key.clone(), key.clone());
                    outcomes.insert(
                        key.clone(),
                        NodeOutcome::Failed {
                            error: err.to_string(),
                        },
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let report = RunReport {
            manifest: manifest.name.clone(),
            run_id: run_id.clone(),
            nodes: outcomes,
            wall_seconds: pass_start.elapsed().as_secs_f64(),
        };

        let _ = eventlog::append_event(
            &config.manifest_path,
            PipelineEvent::RunCompleted {
                manifest: manifest.name,
                run_id,
                succeeded: report.succeeded(),
                skipped: report.skipped(),
                failed: report.failed(),
                blocked: report.blocked(),
                total_seconds: report.wall_seconds,
            },
        );

        Ok(report)
    }

    /// Fresh staleness check for one node after its upstreams completed.
    fn re_evaluate(
        &self,
        node: &Node,
        env_fps: &HashMap<String, String>,
        locks: &LockStore,
        oracle: &FingerprintOracle<'_>,
    ) -> Result<Vec<StaleReason>> {
        let record = locks.load_stage(&node.key)?;
        let current_inputs = oracle.all_input_fingerprints(node)?;
        let missing = match &record {
            Some(r) if r.status == RunStatus::Succeeded => oracle.missing_outputs(node, r),
            _ => Vec::new(),
        };
        let env = node
            .stage
            .environment
            .as_deref()
            .and_then(|name| env_fps.get(name).map(|fp| (name, fp.as_str())));
        Ok(staleness::evaluate_node(
            &staleness::node_code_fingerprint(node),
            env,
            record.as_ref(),
            &current_inputs,
            &missing,
            &[],
            false,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_node(
        &self,
        node: &Node,
        manifest: &Manifest,
        locks: &LockStore,
        oracle: &FingerprintOracle<'_>,
        env_fps: &HashMap<String, String>,
        reconciler: &mut Reconciler<'_>,
        config: &RunConfig,
        stale_reasons: &str,
    ) -> Result<f64> {
        let key = &node.key;
        let code_fp = staleness::node_code_fingerprint(node);
        let env_pair = node
            .stage
            .environment
            .as_deref()
            .and_then(|n| env_fps.get(n).map(|fp| (n.to_string(), fp.clone())));

        // Reconcile lazily, memoized per environment for the pass
        let reconciled: Option<(String, RealizedState)> = match &node.stage.environment {
            Some(name) => {
                let env = &manifest.environments[name.as_str()];
                let outcome = reconciler.reconcile(name, env).await?;
                let _ = eventlog::append_event(
                    &config.manifest_path,
                    PipelineEvent::EnvironmentReconciled {
                        environment: name.clone(),
                        spec_fingerprint: outcome.state.spec_fingerprint.clone(),
                        rebuilt: outcome.rebuilt,
                    },
                );
                Some((name.clone(), outcome.state))
            }
            None => None,
        };

        let _ = eventlog::append_event(
            &config.manifest_path,
            PipelineEvent::NodeStarted {
                node: key.clone(),
                stale_reasons: stale_reasons.to_string(),
            },
        );
        println!("  {} RUNNING ({})", key, stale_reasons);

        let ctx = ExecutionContext {
            node: key,
            command: &node.stage.command,
            kind: node.stage.kind,
            environment: reconciled
                .as_ref()
                .map(|(name, state)| (name.as_str(), &manifest.environments[name.as_str()], state)),
        };

        let started_at = eventlog::now_iso8601();
        let start = Instant::now();

        // A surviving external job is resumed, never resubmitted
        let prior_job = locks
            .load_stage(key)?
            .filter(|r| r.status == RunStatus::Running && node.stage.kind.is_detachable())
            .and_then(|r| r.job_id);

        let handle: JobHandle = match prior_job {
            Some(job_id) => match self.host.reattach(&job_id).await {
                Some(h) => {
                    tracing::info!(
                        node = key.as_str(),
                        job_id = job_id.as_str(),
                        "resuming external job"
                    );
                    h
                }
                None => self.launch(node, &ctx).await?,
            },
            None => self.launch(node, &ctx).await?,
        };

        if node.stage.kind.is_detachable() {
            locks.save_stage(
                key,
                &LockRecord {
                    status: RunStatus::Running,
                    code_fingerprint: code_fp.clone(),
                    environment: env_pair.as_ref().map(|(n, _)| n.clone()),
                    environment_fingerprint: env_pair.as_ref().map(|(_, fp)| fp.clone()),
                    inputs: vec![],
                    outputs: vec![],
                    started_at: Some(started_at.clone()),
                    completed_at: None,
                    duration_seconds: None,
                    job_id: handle.job_id.clone(),
                },
            )?;
        }

        if let Err(failure) = self.host.wait(handle).await {
            let duration = start.elapsed().as_secs_f64();
            self.record_failure(locks, node, &code_fp, &env_pair, &started_at, duration)?;
            let _ = eventlog::append_event(
                &config.manifest_path,
                PipelineEvent::NodeFailed {
                    node: key.clone(),
                    exit_code: failure.exit_code,
                    error: failure.stderr.clone(),
                },
            );
            return Err(PipelineError::Execution {
                node: key.clone(),
                exit_code: failure.exit_code,
                message: failure.stderr,
            });
        }

        let duration = start.elapsed().as_secs_f64();

        // Verify declared outputs and fingerprint them; a missing output or
        // an unserializable variable fails the stage
        let mut output_locks = Vec::with_capacity(node.stage.outputs.len());
        for out in &node.stage.outputs {
            match oracle.output_fingerprint(node, out) {
                Ok(fp) => output_locks.push(RefLock {
                    target: out.target.to_string(),
                    fingerprint: fp,
                }),
                Err(err) => {
                    self.record_failure(locks, node, &code_fp, &env_pair, &started_at, duration)?;
                    let _ = eventlog::append_event(
                        &config.manifest_path,
                        PipelineEvent::NodeFailed {
                            node: key.clone(),
                            exit_code: None,
                            error: err.to_string(),
                        },
                    );
                    return Err(err);
                }
            }
        }

        let input_locks: Vec<RefLock> = oracle
            .all_input_fingerprints(node)?
            .into_iter()
            .map(|(target, fingerprint)| RefLock {
                target,
                fingerprint,
            })
            .collect();

        locks.save_stage(
            key,
            &LockRecord {
                status: RunStatus::Succeeded,
                code_fingerprint: code_fp,
                environment: env_pair.as_ref().map(|(n, _)| n.clone()),
                environment_fingerprint: env_pair.as_ref().map(|(_, fp)| fp.clone()),
                inputs: input_locks,
                outputs: output_locks,
                started_at: Some(started_at),
                completed_at: Some(eventlog::now_iso8601()),
                duration_seconds: Some(duration),
                job_id: None,
            },
        )?;

        let _ = eventlog::append_event(
            &config.manifest_path,
            PipelineEvent::NodeCompleted {
                node: key.clone(),
                duration_seconds: duration,
            },
        );

        Ok(duration)
    }

    /// Spawn failures count as execution failures for the node.
    async fn launch(&self, node: &Node, ctx: &ExecutionContext<'_>) -> Result<JobHandle> {
        self.host
            .launch(ctx)
            .await
            .map_err(|failure| PipelineError::Execution {
                node: node.key.clone(),
                exit_code: failure.exit_code,
                message: failure.stderr,
            })
    }

    fn record_failure(
        &self,
        locks: &LockStore,
        node: &Node,
        code_fp: &str,
        env_pair: &Option<(String, String)>,
        started_at: &str,
        duration: f64,
    ) -> Result<()> {
        locks.save_stage(
            &node.key,
            &LockRecord {
                status: RunStatus::Failed,
                code_fingerprint: code_fp.to_string(),
                environment: env_pair.as_ref().map(|(n, _)| n.clone()),
                environment_fingerprint: env_pair.as_ref().map(|(_, fp)| fp.clone()),
                inputs: vec![],
                outputs: vec![],
                started_at: Some(started_at.to_string()),
                completed_at: Some(eventlog::now_iso8601()),
                duration_seconds: Some(duration),
                job_id: None,
            },
        )
    }
}

/// Topological order restricted to the stage filter.
fn select_nodes(graph: &Graph, filter: &Option<Vec<String>>) -> Vec<String> {
    match filter {
        None => graph.topo_order.clone(),
        Some(names) => graph
            .topo_order
            .iter()
            .filter(|key| {
                let node = graph.node(key).expect("topo order covers nodes");
                names.contains(&node.stage_name) || names.contains(key)
            })
            .cloned()
            .collect(),
    }
}

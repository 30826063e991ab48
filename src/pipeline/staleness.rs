//! Staleness evaluation: lock records vs current fingerprints.
//!
//! A node is stale when any fingerprint it depends on no longer matches
//! its lock record, or when a producing ancestor is itself stale —
//! staleness is monotonic forward through the graph. The labeling is
//! computed once per pass in topological order; the driver re-evaluates a
//! single node only after its upstreams complete, never mid-run rescans.

use super::error::{PipelineError, Result};
use super::fingerprint;
use super::graph::Graph;
use super::kernel::KernelClient;
use super::lockstore::LockStore;
use super::store::ObjectStore;
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;

/// Current spec fingerprint for every declared environment.
pub fn environment_fingerprints(manifest: &Manifest) -> HashMap<String, String> {
    manifest
        .environments
        .iter()
        .map(|(name, env)| (name.clone(), fingerprint::fingerprint_environment(env)))
        .collect()
}

/// Code fingerprint for a node, with foreach variant identity folded in.
pub fn node_code_fingerprint(node: &Node) -> String {
    let code = fingerprint::fingerprint_code(&node.stage.command);
    match &node.variant {
        Some(v) => fingerprint::combine(&[code, format!("variant={}", v)]),
        None => code,
    }
}

/// Computes current fingerprints for data refs: files from disk, variables
/// through the kernel seam, cached variable blobs through the object store.
pub struct FingerprintOracle<'a> {
    kernel: Option<&'a dyn KernelClient>,
    store: Option<&'a dyn ObjectStore>,
    /// Scoped output ref → (checksum mode, variable format) declared by the
    /// producing stage; consumers inherit the producer's mode.
    declared: HashMap<String, (ChecksumMode, Option<VarFormat>)>,
}

impl<'a> FingerprintOracle<'a> {
    pub fn new(
        graph: &Graph,
        kernel: Option<&'a dyn KernelClient>,
        store: Option<&'a dyn ObjectStore>,
    ) -> Self {
        let mut declared = HashMap::new();
        for node in graph.nodes.values() {
            for out in &node.stage.outputs {
                declared.insert(
                    super::parser::scoped_output_key(&node.stage, &out.target),
                    (out.checksum, out.format),
                );
            }
        }
        Self {
            kernel,
            store,
            declared,
        }
    }

    fn declared_for(&self, stage: &Stage, target: &DataRef) -> (ChecksumMode, Option<VarFormat>) {
        self.declared
            .get(&super::parser::scoped_output_key(stage, target))
            .copied()
            .unwrap_or((ChecksumMode::Content, None))
    }

    /// Current fingerprint of an input. Absent inputs (file not yet
    /// produced, variable not yet defined) fingerprint as the empty string,
    /// which can never match a recorded value.
    pub fn input_fingerprint(&self, node: &Node, input: &DataRef) -> Result<String> {
        match input {
            DataRef::Path(p) => {
                let (mode, _) = self.declared_for(&node.stage, input);
                let path = Path::new(p);
                if path.exists() {
                    fingerprint::fingerprint_file(path, mode)
                } else {
                    Ok(String::new())
                }
            }
            DataRef::Var(v) => {
                let session = node.stage.kernel.as_deref().unwrap_or_default();
                let (_, format) = self.declared_for(&node.stage, input);
                let format = format.unwrap_or(VarFormat::Pickle);
                match self.kernel {
                    Some(kernel) => match kernel.serialize(session, v, format) {
                        Ok(bytes) => Ok(fingerprint::fingerprint_bytes(&bytes)),
                        Err(_) => Ok(String::new()),
                    },
                    None => Ok(String::new()),
                }
            }
            // environment dependencies are edges, not fingerprinted inputs
            DataRef::Env(_) => Ok(String::new()),
        }
    }

    pub fn all_input_fingerprints(&self, node: &Node) -> Result<Vec<(String, String)>> {
        node.stage
            .inputs
            .iter()
            .map(|r| Ok((r.to_string(), self.input_fingerprint(node, r)?)))
            .collect()
    }

    /// Fingerprint a declared output after a successful run. Files must
    /// exist; variables are serialized through the kernel and cached in the
    /// object store.
    pub fn output_fingerprint(&self, node: &Node, out: &OutputDecl) -> Result<String> {
        match &out.target {
            DataRef::Path(p) => {
                let path = Path::new(p);
                if !path.exists() {
                    return Err(PipelineError::Execution {
                        node: node.key.clone(),
                        exit_code: None,
                        message: format!("declared output '{}' does not exist", p),
                    });
                }
                fingerprint::fingerprint_file(path, out.checksum)
            }
            DataRef::Var(v) => {
                let session = node.stage.kernel.as_deref().unwrap_or_default();
                let format = out.format.unwrap_or(VarFormat::Pickle);
                let kernel = self.kernel.ok_or_else(|| PipelineError::Serialization {
                    variable: v.clone(),
                    format: format.to_string(),
                    message: "no kernel session attached".to_string(),
                })?;
                let bytes = kernel.serialize(session, v, format).map_err(|e| {
                    PipelineError::Serialization {
                        variable: v.clone(),
                        format: format.to_string(),
                        message: e.message,
                    }
                })?;
                if let Some(store) = self.store {
                    store.put(&bytes)?;
                }
                Ok(fingerprint::fingerprint_bytes(&bytes))
            }
            // environment outputs are realized through reconciliation
            DataRef::Env(_) => Ok(String::new()),
        }
    }

    /// Declared outputs that are gone, judged against the lock record.
    pub fn missing_outputs(&self, node: &Node, record: &LockRecord) -> Vec<String> {
        let mut missing = Vec::new();
        for out in &node.stage.outputs {
            match &out.target {
                DataRef::Path(p) => {
                    if !Path::new(p).exists() {
                        missing.push(out.target.to_string());
                    }
                }
                DataRef::Var(_) => {
                    let recorded = record
                        .outputs
                        .iter()
                        .find(|o| o.target == out.target.to_string())
                        .map(|o| o.fingerprint.as_str());
                    let cached = match (recorded, self.store) {
                        (Some(fp), Some(store)) => store.contains(fp),
                        _ => false,
                    };
                    if !cached {
                        missing.push(out.target.to_string());
                    }
                }
                DataRef::Env(_) => {}
            }
        }
        missing
    }
}

/// Pure staleness check for one node. Empty result = fresh.
pub fn evaluate_node(
    code_fingerprint: &str,
    environment: Option<(&str, &str)>,
    record: Option<&LockRecord>,
    current_inputs: &[(String, String)],
    missing_outputs: &[String],
    stale_upstreams: &[String],
    force: bool,
) -> Vec<StaleReason> {
    let mut reasons = Vec::new();

    if force {
        reasons.push(StaleReason::Forced);
        return reasons;
    }

    for upstream in stale_upstreams {
        reasons.push(StaleReason::UpstreamStale {
            node: upstream.clone(),
        });
    }
    if !reasons.is_empty() {
        return reasons;
    }

    let record = match record {
        Some(r) => r,
        None => {
            reasons.push(StaleReason::NoRecord);
            return reasons;
        }
    };

    if record.status != RunStatus::Succeeded {
        reasons.push(StaleReason::PreviousRunIncomplete {
            status: match record.status {
                RunStatus::Failed => "failed".to_string(),
                RunStatus::Running => "running".to_string(),
                RunStatus::Succeeded => unreachable!(),
            },
        });
        return reasons;
    }

    if record.code_fingerprint != code_fingerprint {
        reasons.push(StaleReason::CodeChanged {
            old: record.code_fingerprint.clone(),
            new: code_fingerprint.to_string(),
        });
    }

    if let Some((_, current_env_fp)) = environment {
        let recorded = record.environment_fingerprint.as_deref().unwrap_or("");
        if recorded != current_env_fp {
            reasons.push(StaleReason::EnvironmentChanged {
                old: recorded.to_string(),
                new: current_env_fp.to_string(),
            });
        }
    }

    for (target, current) in current_inputs {
        let recorded = record
            .inputs
            .iter()
            .find(|i| &i.target == target)
            .map(|i| i.fingerprint.as_str())
            .unwrap_or("");
        if recorded != current {
            reasons.push(StaleReason::InputChanged {
                target: target.clone(),
                old: recorded.to_string(),
                new: current.clone(),
            });
        }
    }

    for target in missing_outputs {
        reasons.push(StaleReason::OutputMissing {
            target: target.clone(),
        });
    }

    reasons
}

/// Frozen stale/fresh labeling for the whole graph, in topological order.
pub fn evaluate_pass(
    graph: &Graph,
    env_fingerprints: &HashMap<String, String>,
    locks: &LockStore,
    oracle: &FingerprintOracle<'_>,
    force: bool,
) -> Result<IndexMap<String, Vec<StaleReason>>> {
    let mut labels: IndexMap<String, Vec<StaleReason>> = IndexMap::new();

    for key in &graph.topo_order {
        let node = graph.node(key).expect("topo order covers nodes");
        let record = locks.load_stage(key)?;

        let stale_upstreams: Vec<String> = graph
            .predecessors
            .get(key)
            .map(|preds| {
                preds
                    .iter()
                    .filter(|p| labels.get(*p).map(|r| !r.is_empty()).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let current_inputs = oracle.all_input_fingerprints(node)?;
        let missing = match &record {
            Some(r) if r.status == RunStatus::Succeeded => oracle.missing_outputs(node, r),
            _ => Vec::new(),
        };

        let env = node.stage.environment.as_deref().and_then(|name| {
            env_fingerprints
                .get(name)
                .map(|fp| (name, fp.as_str()))
        });

        let reasons = evaluate_node(
            &node_code_fingerprint(node),
            env,
            record.as_ref(),
            &current_inputs,
            &missing,
            &stale_upstreams,
            force,
        );
        labels.insert(key.clone(), reasons);
    }

    Ok(labels)
}

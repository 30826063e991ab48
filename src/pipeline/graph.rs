//! Dependency graph construction from declared inputs/outputs.
//!
//! Edges come only from declared data: a path output consumed as an input,
//! a kernel variable produced and read within the same session, or an
//! environment built by one stage and used by another. Physical notebook
//! cell order is never a correctness signal. Foreach stages expand into one
//! node per variant before edge-building. Topological ties break by
//! declaration order, so the execution order is reproducible across runs.

use super::error::{PipelineError, Result};
use super::parser::scoped_output_key;
use super::types::{DataRef, Manifest, Node, Stage};
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// The compiled dependency graph.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Expanded nodes, keyed by node key, in declaration order
    pub nodes: IndexMap<String, Node>,

    /// Node keys in topological execution order
    pub topo_order: Vec<String>,

    /// Node → nodes that must complete before it
    pub predecessors: HashMap<String, Vec<String>>,

    /// Node → nodes that depend on it
    pub successors: HashMap<String, Vec<String>>,

    /// Scoped output ref → producing node key
    pub producers: HashMap<String, String>,
}

impl Graph {
    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Producing node for one of `node`'s inputs, if any stage declares it.
    pub fn producer_of(&self, consumer: &Node, input: &DataRef) -> Option<&String> {
        self.producers.get(&scoped_input_key(&consumer.stage, input))
    }
}

/// Scope key under which an input ref is matched against producers.
/// Mirrors `scoped_output_key`: variables resolve within the consumer's
/// kernel session.
pub fn scoped_input_key(stage: &Stage, input: &DataRef) -> String {
    scoped_output_key(stage, input)
}

/// Replace `{{variant}}` placeholders, leaving all other `{{…}}` text
/// untouched (commands are opaque and may contain their own braces).
pub fn substitute_variant(s: &str, variant: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if after[..end].trim() == "variant" => {
                out.push_str(&rest[..start]);
                out.push_str(variant);
                rest = &after[end + 2..];
            }
            Some(end) => {
                out.push_str(&rest[..start + 2 + end + 2]);
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn substitute_ref(r: &DataRef, variant: &str) -> DataRef {
    DataRef::from(substitute_variant(&r.to_string(), variant))
}

/// Expand stages into executable nodes, one per foreach variant.
pub fn expand_manifest(manifest: &Manifest) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    for (name, stage) in &manifest.stages {
        match &stage.foreach {
            None => nodes.push(Node {
                key: name.clone(),
                stage_name: name.clone(),
                variant: None,
                stage: stage.clone(),
                decl_index: nodes.len(),
            }),
            Some(variants) => {
                for variant in variants {
                    let mut expanded = stage.clone();
                    expanded.command = substitute_variant(&stage.command, variant);
                    expanded.inputs = stage
                        .inputs
                        .iter()
                        .map(|r| substitute_ref(r, variant))
                        .collect();
                    for out in &mut expanded.outputs {
                        out.target = substitute_ref(&out.target, variant);
                    }
                    expanded.foreach = None;
                    nodes.push(Node {
                        key: format!("{}@{}", name, variant),
                        stage_name: name.clone(),
                        variant: Some(variant.clone()),
                        stage: expanded,
                        decl_index: nodes.len(),
                    });
                }
            }
        }
    }

    Ok(nodes)
}

/// Build the dependency graph: expand, map producers, wire edges, order.
pub fn build_graph(manifest: &Manifest) -> Result<Graph> {
    let expanded = expand_manifest(manifest)?;

    let mut nodes: IndexMap<String, Node> = IndexMap::new();
    let mut producers: HashMap<String, String> = HashMap::new();

    for node in expanded {
        for out in &node.stage.outputs {
            let scoped = scoped_output_key(&node.stage, &out.target);
            if let Some(existing) = producers.insert(scoped, node.key.clone()) {
                return Err(PipelineError::schema(format!(
                    "output '{}' is produced by both '{}' and '{}'",
                    out.target, existing, node.key
                )));
            }
        }
        nodes.insert(node.key.clone(), node);
    }

    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    for key in nodes.keys() {
        predecessors.insert(key.clone(), Vec::new());
        successors.insert(key.clone(), Vec::new());
    }

    for (key, node) in &nodes {
        for input in &node.stage.inputs {
            if let Some(producer) = producers.get(&scoped_input_key(&node.stage, input)) {
                if producer != key {
                    add_edge(&mut predecessors, &mut successors, producer, key);
                }
            }
            // inputs not produced by any stage are external files — no edge
        }
        if let Some(env) = &node.stage.environment {
            if let Some(producer) = producers.get(&format!("env:{}", env)) {
                if producer != key {
                    add_edge(&mut predecessors, &mut successors, producer, key);
                }
            }
        }
    }

    let topo_order = toposort(&nodes, &predecessors)?;

    Ok(Graph {
        nodes,
        topo_order,
        predecessors,
        successors,
        producers,
    })
}

fn add_edge(
    predecessors: &mut HashMap<String, Vec<String>>,
    successors: &mut HashMap<String, Vec<String>>,
    from: &str,
    to: &str,
) {
    let preds = predecessors.entry(to.to_string()).or_default();
    if !preds.contains(&from.to_string()) {
        preds.push(from.to_string());
    }
    let succs = successors.entry(from.to_string()).or_default();
    if !succs.contains(&to.to_string()) {
        succs.push(to.to_string());
    }
}

/// Kahn's algorithm with a declaration-order ready queue, so equal-rank
/// nodes always run in the order they were declared.
fn toposort(
    nodes: &IndexMap<String, Node>,
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for key in nodes.keys() {
        in_degree.insert(key, predecessors.get(key.as_str()).map_or(0, |p| p.len()));
    }

    let mut ready: BinaryHeap<Reverse<(usize, String)>> = nodes
        .values()
        .filter(|n| in_degree[n.key.as_str()] == 0)
        .map(|n| Reverse((n.decl_index, n.key.clone())))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());

    while let Some(Reverse((_, key))) = ready.pop() {
        order.push(key.clone());
        for (succ_key, preds) in predecessors {
            if preds.contains(&key) {
                let deg = in_degree.get_mut(succ_key.as_str()).expect("known node");
                *deg -= 1;
                if *deg == 0 {
                    let succ = &nodes[succ_key.as_str()];
                    ready.push(Reverse((succ.decl_index, succ.key.clone())));
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let stages: Vec<String> = nodes
            .values()
            .filter(|n| !order.contains(&n.key))
            .map(|n| n.key.clone())
            .collect();
        return Err(PipelineError::Cycle { stages });
    }

    Ok(order)
}

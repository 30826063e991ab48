//! Manifest parsing, structural validation, and in-place stage declaration.
//!
//! Validation enforces the closed-world rules: every stage's environment
//! must be declared, no two stages may produce the same output reference,
//! variable refs need a kernel session, and variable outputs need a
//! serialization format. `declare_stage` is a pure merge — it returns the
//! updated manifest and leaves the single filesystem write to the caller.

use super::error::{PipelineError, Result};
use super::types::*;
use std::collections::HashMap;
use std::path::Path;

pub const MANIFEST_VERSION: &str = "1";

/// Parse a manifest from a YAML file path.
pub fn parse_manifest_file(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::schema(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_manifest(&content)
}

/// Parse a manifest from a YAML string. Unknown environment or stage kinds
/// fail here, at load time.
pub fn parse_manifest(yaml: &str) -> Result<Manifest> {
    serde_yaml::from_str(yaml)
        .map_err(|e| PipelineError::schema(format!("invalid manifest: {}", e)))
}

/// Validate a parsed manifest.
pub fn validate_manifest(m: &Manifest) -> Result<()> {
    if m.version != MANIFEST_VERSION {
        return Err(PipelineError::schema(format!(
            "unsupported manifest version '{}', expected '{}'",
            m.version, MANIFEST_VERSION
        )));
    }
    if m.name.is_empty() {
        return Err(PipelineError::schema("manifest name must not be empty"));
    }

    // Scoped output ref → declaring stage, for duplicate detection.
    // Paths and environments are project-global; variables are scoped to
    // their kernel session.
    let mut declared_outputs: HashMap<String, &str> = HashMap::new();

    for (name, stage) in &m.stages {
        validate_stage(m, name, stage)?;

        for out in &stage.outputs {
            let scoped = scoped_output_key(stage, &out.target);
            if let Some(other) = declared_outputs.insert(scoped, name.as_str()) {
                return Err(PipelineError::schema(format!(
                    "output '{}' is declared by both '{}' and '{}'",
                    out.target, other, name
                )));
            }
        }
    }

    Ok(())
}

fn validate_stage(m: &Manifest, name: &str, stage: &Stage) -> Result<()> {
    if stage.command.trim().is_empty() {
        return Err(PipelineError::schema(format!(
            "stage '{}' has an empty command",
            name
        )));
    }

    if let Some(env) = &stage.environment {
        if !m.environments.contains_key(env) {
            return Err(PipelineError::schema(format!(
                "stage '{}' references undeclared environment '{}'",
                name, env
            )));
        }
    }

    let uses_vars = stage
        .inputs
        .iter()
        .chain(stage.outputs.iter().map(|o| &o.target))
        .any(|r| matches!(r, DataRef::Var(_)));
    if uses_vars && stage.kernel.is_none() {
        return Err(PipelineError::schema(format!(
            "stage '{}' references kernel variables but declares no kernel session",
            name
        )));
    }

    for input in &stage.inputs {
        if let DataRef::Env(e) = input {
            return Err(PipelineError::schema(format!(
                "stage '{}' lists 'env:{}' as an input; depend on environments via the environment field",
                name, e
            )));
        }
    }

    for out in &stage.outputs {
        match &out.target {
            DataRef::Var(v) => {
                if out.format.is_none() {
                    return Err(PipelineError::schema(format!(
                        "stage '{}' variable output 'var:{}' must declare a serialization format",
                        name, v
                    )));
                }
            }
            DataRef::Env(e) => {
                if !m.environments.contains_key(e) {
                    return Err(PipelineError::schema(format!(
                        "stage '{}' builds undeclared environment '{}'",
                        name, e
                    )));
                }
            }
            DataRef::Path(_) => {}
        }
    }

    if let Some(variants) = &stage.foreach {
        if variants.is_empty() {
            return Err(PipelineError::schema(format!(
                "stage '{}' has an empty foreach list",
                name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for v in variants {
            if !seen.insert(v.as_str()) {
                return Err(PipelineError::schema(format!(
                    "stage '{}' repeats foreach variant '{}'",
                    name, v
                )));
            }
        }
    } else if references_variant(&stage.command)
        || stage.inputs.iter().any(|r| references_variant(&r.to_string()))
        || stage
            .outputs
            .iter()
            .any(|o| references_variant(&o.target.to_string()))
    {
        return Err(PipelineError::schema(format!(
            "stage '{}' uses {{{{variant}}}} without a foreach list",
            name
        )));
    }

    Ok(())
}

/// Does the string contain a `{{variant}}` placeholder?
pub fn references_variant(s: &str) -> bool {
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            if after[..end].trim() == "variant" {
                return true;
            }
            rest = &after[end + 2..];
        } else {
            return false;
        }
    }
    false
}

/// Scope key under which an output ref must be unique.
pub fn scoped_output_key(stage: &Stage, target: &DataRef) -> String {
    match target {
        DataRef::Path(p) => format!("path:{}", p),
        DataRef::Var(v) => format!(
            "var:{}:{}",
            stage.kernel.as_deref().unwrap_or_default(),
            v
        ),
        DataRef::Env(e) => format!("env:{}", e),
    }
}

/// Parse a single-stage snippet: a one-key YAML mapping `name: stage`.
pub fn parse_stage_snippet(yaml: &str) -> Result<(String, Stage)> {
    let map: indexmap::IndexMap<String, Stage> = serde_yaml::from_str(yaml)
        .map_err(|e| PipelineError::schema(format!("invalid stage snippet: {}", e)))?;
    if map.len() != 1 {
        return Err(PipelineError::schema(format!(
            "stage snippet must declare exactly one stage, found {}",
            map.len()
        )));
    }
    let (name, stage) = map.into_iter().next().unwrap();
    Ok((name, stage))
}

/// Merge one stage definition into a manifest by key, leaving unrelated
/// entries untouched. Pure: the caller performs the write.
pub fn declare_stage(manifest: &Manifest, name: &str, stage: Stage) -> Result<Manifest> {
    let mut merged = manifest.clone();
    merged.stages.insert(name.to_string(), stage);
    validate_manifest(&merged)?;
    Ok(merged)
}

/// Serialize a manifest back to YAML with stable ordering.
pub fn render_manifest(manifest: &Manifest) -> Result<String> {
    serde_yaml::to_string(manifest)
        .map_err(|e| PipelineError::Lock(format!("failed to serialize manifest: {}", e)))
}

//! Project configuration, read from `.replicar.yaml` in the working
//! directory. Everything has a default; the file is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".replicar.yaml";

/// Replicar project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicarConfig {
    /// Configuration file version
    pub version: String,

    /// Project metadata
    #[serde(default)]
    pub project: ProjectConfig,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Default for ReplicarConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            project: ProjectConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,

    /// Project description
    pub description: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "untitled".to_string(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Pipeline manifest (relative to the config file)
    pub manifest: PathBuf,

    /// Content-addressed object store root
    pub objects: PathBuf,

    /// Where virtualenv prefixes are created
    pub envs: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("pipeline.yaml"),
            objects: PathBuf::from(".replicar/objects"),
            envs: PathBuf::from(".replicar/envs"),
        }
    }
}

impl ReplicarConfig {
    /// Load from `<dir>/.replicar.yaml`, or defaults when absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicarConfig::default();
        assert_eq!(config.version, "1");
        assert_eq!(config.paths.manifest, PathBuf::from("pipeline.yaml"));
        assert_eq!(config.project.name, "untitled");
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicarConfig::load(dir.path()).unwrap();
        assert_eq!(config.version, "1");
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
version: "1"
project:
  name: climate-model
  description: ~
"#,
        )
        .unwrap();
        let config = ReplicarConfig::load(dir.path()).unwrap();
        assert_eq!(config.project.name, "climate-model");
        assert_eq!(config.paths.objects, PathBuf::from(".replicar/objects"));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "version: [not, a, string]").unwrap();
        assert!(ReplicarConfig::load(dir.path()).is_err());
    }
}

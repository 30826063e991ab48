//! Lock tree persistence.
//!
//! Lock records live beside the manifest in `<stem>.lock/`, one YAML file
//! per node under `stages/` and one per environment under `environments/`.
//! Files keep stable field order so the external version-control system
//! shows meaningful diffs. Writes are atomic (temp file + rename).

use super::error::{PipelineError, Result};
use super::types::{LockRecord, RealizedState};
use std::path::{Path, PathBuf};

/// Handle to a manifest's lock directory tree.
#[derive(Debug, Clone)]
pub struct LockStore {
    root: PathBuf,
}

impl LockStore {
    /// Derive the lock tree path from a manifest path: `pipeline.yaml` →
    /// `pipeline.lock/`.
    pub fn for_manifest(manifest_path: &Path) -> Self {
        let stem = manifest_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy();
        Self {
            root: manifest_path.with_file_name(format!("{}.lock", stem)),
        }
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stage_path(&self, key: &str) -> PathBuf {
        self.root.join("stages").join(format!("{}.yaml", file_name(key)))
    }

    fn environment_path(&self, name: &str) -> PathBuf {
        self.root
            .join("environments")
            .join(format!("{}.yaml", file_name(name)))
    }

    pub fn load_stage(&self, key: &str) -> Result<Option<LockRecord>> {
        read_yaml(&self.stage_path(key))
    }

    pub fn save_stage(&self, key: &str, record: &LockRecord) -> Result<()> {
        write_yaml(&self.stage_path(key), record)
    }

    pub fn remove_stage(&self, key: &str) -> Result<()> {
        let path = self.stage_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn load_environment(&self, name: &str) -> Result<Option<RealizedState>> {
        read_yaml(&self.environment_path(name))
    }

    pub fn save_environment(&self, name: &str, state: &RealizedState) -> Result<()> {
        write_yaml(&self.environment_path(name), state)
    }

    /// Node keys with persisted records, sorted for stable listings.
    pub fn list_stages(&self) -> Result<Vec<String>> {
        let dir = self.root.join("stages");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".yaml") {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Sanitize a node key into a file name. Keys may carry `@variant` and
/// variables carry `:`; path separators must not escape the tree.
fn file_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Lock(format!("failed to read {}: {}", path.display(), e)))?;
    let value = serde_yaml::from_str(&content)
        .map_err(|e| PipelineError::Lock(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(value))
}

fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let yaml = serde_yaml::to_string(value)
        .map_err(|e| PipelineError::Lock(format!("failed to serialize {}: {}", path.display(), e)))?;

    let temp = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    std::fs::write(&temp, yaml.as_bytes())
        .map_err(|e| PipelineError::Lock(format!("failed to write {}: {}", temp.display(), e)))?;
    std::fs::rename(&temp, path)
        .map_err(|e| PipelineError::Lock(format!("failed to rename {}: {}", path.display(), e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{RefLock, RunStatus};
    use indexmap::IndexMap;

    fn record() -> LockRecord {
        LockRecord {
            status: RunStatus::Succeeded,
            code_fingerprint: "blake3:code".to_string(),
            environment: None,
            environment_fingerprint: None,
            inputs: vec![],
            outputs: vec![RefLock {
                target: "out.txt".to_string(),
                fingerprint: "blake3:out".to_string(),
            }],
            started_at: None,
            completed_at: None,
            duration_seconds: Some(0.5),
            job_id: None,
        }
    }

    #[test]
    fn test_lock_root_derivation() {
        let store = LockStore::for_manifest(Path::new("/work/pipeline.yaml"));
        assert_eq!(store.root(), Path::new("/work/pipeline.lock"));
    }

    #[test]
    fn test_stage_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::for_manifest(&dir.path().join("p.yaml"));

        assert!(store.load_stage("collect").unwrap().is_none());
        store.save_stage("collect", &record()).unwrap();
        let loaded = store.load_stage("collect").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(loaded.outputs[0].target, "out.txt");
    }

    #[test]
    fn test_variant_keys_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::for_manifest(&dir.path().join("p.yaml"));

        store.save_stage("train@f1", &record()).unwrap();
        store.save_stage("train@f2", &record()).unwrap();
        assert!(store.load_stage("train@f1").unwrap().is_some());
        assert!(store.load_stage("train@f2").unwrap().is_some());
        assert_eq!(
            store.list_stages().unwrap(),
            vec!["train@f1".to_string(), "train@f2".to_string()]
        );
    }

    #[test]
    fn test_environment_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::for_manifest(&dir.path().join("p.yaml"));

        let mut resolved = IndexMap::new();
        resolved.insert("numpy".to_string(), "1.26.4".to_string());
        let state = RealizedState {
            spec_fingerprint: "blake3:env".to_string(),
            digest: None,
            resolved,
            realized_at: "2026-08-04T10:00:00Z".to_string(),
        };
        store.save_environment("py", &state).unwrap();
        let loaded = store.load_environment("py").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::for_manifest(&dir.path().join("p.yaml"));
        store.save_stage("a", &record()).unwrap();
        store.save_stage("a", &record()).unwrap();

        let stages_dir = store.root().join("stages");
        let leftovers: Vec<_> = std::fs::read_dir(&stages_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::for_manifest(&dir.path().join("p.yaml"));
        store.save_stage("gone", &record()).unwrap();
        store.remove_stage("gone").unwrap();
        assert!(store.load_stage("gone").unwrap().is_none());
    }
}

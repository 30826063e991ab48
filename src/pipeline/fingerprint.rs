//! BLAKE3 fingerprints for code, environment specs, files, and variables.
//!
//! All fingerprints are formatted as `"blake3:{hex}"` and are stable across
//! runs and machines for the same logical input. Code is normalized before
//! hashing: trailing whitespace is stripped from each line and trailing
//! blank lines are dropped. Comments are NOT stripped — a comment edit is a
//! code change. File hashing streams to avoid OOM on large files; the
//! `metadata` mode (size + mtime) is a documented weaker alternative for
//! outputs where content hashing is too costly.

use super::error::{PipelineError, Result};
use super::types::{ChecksumMode, Environment};
use std::io::Read;
use std::path::Path;

pub const PREFIX: &str = "blake3:";

fn finish(hasher: blake3::Hasher) -> String {
    format!("{}{}", PREFIX, hasher.finalize().to_hex())
}

/// Fingerprint arbitrary bytes (serialized variables, object store blobs).
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{}{}", PREFIX, blake3::hash(bytes).to_hex())
}

/// Fingerprint command/cell source after whitespace normalization.
pub fn fingerprint_code(source: &str) -> String {
    let mut normalized: Vec<&str> = source.lines().map(|l| l.trim_end()).collect();
    while normalized.last() == Some(&"") {
        normalized.pop();
    }
    let mut hasher = blake3::Hasher::new();
    for line in &normalized {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    finish(hasher)
}

/// Fingerprint an environment spec, independent of key ordering in the
/// source document.
///
/// Canonical form: one `key=value` line per fact, package lists sorted,
/// referenced dependency files folded in by content hash so an edited
/// `environment.yml` changes the fingerprint even when the path does not.
pub fn fingerprint_environment(env: &Environment) -> String {
    let mut lines: Vec<String> = vec![format!("kind={}", env.kind())];

    match env {
        Environment::Container { image, dockerfile } => {
            lines.push(format!("image={}", image));
            if let Some(df) = dockerfile {
                lines.push(format!("dockerfile={}", file_or_path_token(df)));
            }
        }
        Environment::Conda { file, packages } => {
            if let Some(f) = file {
                lines.push(format!("file={}", file_or_path_token(f)));
            }
            let mut pkgs = packages.clone();
            pkgs.sort();
            for p in pkgs {
                lines.push(format!("package={}", p));
            }
        }
        Environment::Virtualenv {
            python,
            requirements,
            packages,
        } => {
            if let Some(py) = python {
                lines.push(format!("python={}", py));
            }
            if let Some(req) = requirements {
                lines.push(format!("requirements={}", file_or_path_token(req)));
            }
            let mut pkgs = packages.clone();
            pkgs.sort();
            for p in pkgs {
                lines.push(format!("package={}", p));
            }
        }
        Environment::Remote { host, user } => {
            lines.push(format!("host={}", host));
            if let Some(u) = user {
                lines.push(format!("user={}", u));
            }
        }
        Environment::Cluster { scheduler, queue } => {
            lines.push(format!("scheduler={}", scheduler));
            if let Some(q) = queue {
                lines.push(format!("queue={}", q));
            }
        }
    }

    let mut hasher = blake3::Hasher::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    finish(hasher)
}

/// Content hash of a referenced spec file, or the bare path when the file
/// is not readable (the mismatch then surfaces at reconciliation).
fn file_or_path_token(path: &Path) -> String {
    match hash_file_streaming(path) {
        Ok(h) => h,
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Fingerprint a file or directory according to the declared checksum mode.
pub fn fingerprint_file(path: &Path, mode: ChecksumMode) -> Result<String> {
    match mode {
        ChecksumMode::Content => fingerprint_tree(path),
        ChecksumMode::Metadata => fingerprint_metadata(path),
    }
}

/// Size + mtime fingerprint. Weaker: a same-size in-place rewrite within
/// mtime granularity goes undetected.
fn fingerprint_metadata(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).map_err(|e| {
        PipelineError::Lock(format!("failed to stat {}: {}", path.display(), e))
    })?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("len={};mtime={}", meta.len(), mtime).as_bytes());
    Ok(finish(hasher))
}

/// Content hash of a file, or of a directory walked in sorted order with
/// relative paths folded in for determinism.
fn fingerprint_tree(path: &Path) -> Result<String> {
    if !path.is_dir() {
        return hash_file_streaming(path);
    }

    let mut files: Vec<std::path::PathBuf> = Vec::new();
    collect_files_sorted(path, &mut files)?;

    let mut hasher = blake3::Hasher::new();
    for file in &files {
        let rel = file.strip_prefix(path).unwrap_or(file);
        hasher.update(rel.to_string_lossy().as_bytes());
        stream_into(&mut hasher, file)?;
    }
    Ok(finish(hasher))
}

fn hash_file_streaming(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    stream_into(&mut hasher, path)?;
    Ok(finish(hasher))
}

fn stream_into(hasher: &mut blake3::Hasher, path: &Path) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn collect_files_sorted(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    let mut entries: Vec<std::path::PathBuf> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        // Skip symlinks to avoid circular references
        if entry.file_type()?.is_symlink() {
            continue;
        }
        entries.push(entry.path());
    }

    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            collect_files_sorted(&entry, out)?;
        } else {
            out.push(entry);
        }
    }

    Ok(())
}

/// Fold component fingerprints into one. Order matters.
pub fn combine(parts: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update(b"\n");
    }
    finish(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_code_fingerprint_deterministic() {
        let a = fingerprint_code("python train.py --epochs 10");
        let b = fingerprint_code("python train.py --epochs 10");
        assert_eq!(a, b);
        assert!(a.starts_with("blake3:"));
    }

    #[test]
    fn test_code_fingerprint_normalizes_trailing_whitespace() {
        let a = fingerprint_code("line one\nline two");
        let b = fingerprint_code("line one   \nline two\n\n\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_code_fingerprint_keeps_comments() {
        let a = fingerprint_code("x = 1");
        let b = fingerprint_code("x = 1  # tuned by hand");
        assert_ne!(a, b);
    }

    #[test]
    fn test_code_fingerprint_leading_whitespace_significant() {
        // Indentation is meaning in notebook cells
        let a = fingerprint_code("if x:\n    y()");
        let b = fingerprint_code("if x:\ny()");
        assert_ne!(a, b);
    }

    #[test]
    fn test_environment_fingerprint_ignores_package_order() {
        let a = Environment::Conda {
            file: None,
            packages: vec!["numpy=1.26".to_string(), "pandas=2.2".to_string()],
        };
        let b = Environment::Conda {
            file: None,
            packages: vec!["pandas=2.2".to_string(), "numpy=1.26".to_string()],
        };
        assert_eq!(fingerprint_environment(&a), fingerprint_environment(&b));
    }

    #[test]
    fn test_environment_fingerprint_distinguishes_kinds() {
        let conda = Environment::Conda {
            file: None,
            packages: vec![],
        };
        let venv = Environment::Virtualenv {
            python: None,
            requirements: None,
            packages: vec![],
        };
        assert_ne!(
            fingerprint_environment(&conda),
            fingerprint_environment(&venv)
        );
    }

    #[test]
    fn test_environment_fingerprint_tracks_dependency_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("environment.yml");
        std::fs::write(&file, "dependencies:\n  - numpy=1.26\n").unwrap();

        let env = Environment::Conda {
            file: Some(file.clone()),
            packages: vec![],
        };
        let before = fingerprint_environment(&env);

        std::fs::write(&file, "dependencies:\n  - numpy=2.0\n").unwrap();
        let after = fingerprint_environment(&env);

        assert_ne!(before, after);
    }

    #[test]
    fn test_file_fingerprint_content_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();

        let h1 = fingerprint_file(&file, ChecksumMode::Content).unwrap();
        let h2 = fingerprint_file(&file, ChecksumMode::Content).unwrap();
        assert_eq!(h1, h2);

        std::fs::write(&file, b"a,b\n3,4\n").unwrap();
        let h3 = fingerprint_file(&file, ChecksumMode::Content).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_directory_fingerprint_sorted_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bee").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"ay").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), b"sea").unwrap();

        let h1 = fingerprint_file(dir.path(), ChecksumMode::Content).unwrap();
        let h2 = fingerprint_file(dir.path(), ChecksumMode::Content).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_metadata_mode_misses_same_size_rewrite() {
        // The documented weakness: equal length, mtime at second granularity
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.bin");
        std::fs::write(&file, b"aaaa").unwrap();
        let h1 = fingerprint_file(&file, ChecksumMode::Metadata).unwrap();
        std::fs::write(&file, b"bbbb").unwrap();
        let h2 = fingerprint_file(&file, ChecksumMode::Metadata).unwrap();
        // Content differs but metadata fingerprints may collide within the
        // same second; content mode always detects it
        let c1 = fingerprint_file(&file, ChecksumMode::Content).unwrap();
        assert_ne!(c1, h1);
        let _ = h2;
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(fingerprint_file(Path::new("/nonexistent/x"), ChecksumMode::Content).is_err());
        assert!(fingerprint_file(Path::new("/nonexistent/x"), ChecksumMode::Metadata).is_err());
    }

    #[test]
    fn test_combine_order_matters() {
        let a = combine(&["blake3:x".to_string(), "blake3:y".to_string()]);
        let b = combine(&["blake3:y".to_string(), "blake3:x".to_string()]);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_code_fingerprint_stable_under_trailing_blank_lines(
            body in "[a-z ]{0,40}",
            blanks in 0usize..4
        ) {
            let padded = format!("{}{}", body, "\n".repeat(blanks));
            prop_assert_eq!(fingerprint_code(&body), fingerprint_code(&padded));
        }

        #[test]
        fn prop_bytes_fingerprint_injective_on_observed(a in any::<Vec<u8>>(), b in any::<Vec<u8>>()) {
            if a != b {
                prop_assert_ne!(fingerprint_bytes(&a), fingerprint_bytes(&b));
            } else {
                prop_assert_eq!(fingerprint_bytes(&a), fingerprint_bytes(&b));
            }
        }
    }
}

//! Append-only JSONL event log for pipeline runs.
//!
//! Each run appends timestamped events to a `.events.jsonl` file beside
//! the manifest, tagged with a run ID.

use super::error::{PipelineError, Result};
use super::types::{PipelineEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Derive the event log path from a manifest path: `.yaml` → `.events.jsonl`
pub fn event_log_path(manifest_path: &Path) -> PathBuf {
    let stem = manifest_path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy();
    manifest_path.with_file_name(format!("{}.events.jsonl", stem))
}

/// Generate a unique run ID: `"r-{short_hex}"`
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let seed = now.as_nanos() ^ (std::process::id() as u128);
    format!("r-{:012x}", seed & 0xFFFF_FFFF_FFFF)
}

/// Current UTC timestamp in ISO 8601 format.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Append a pipeline event to the run's event log.
pub fn append_event(manifest_path: &Path, event: PipelineEvent) -> Result<()> {
    let path = event_log_path(manifest_path);
    let timestamped = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };

    let json = serde_json::to_string(&timestamped)
        .map_err(|e| PipelineError::Lock(format!("failed to serialize event: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PipelineError::Lock(format!("failed to open event log: {}", e)))?;

    writeln!(file, "{}", json)
        .map_err(|e| PipelineError::Lock(format!("failed to write event: {}", e)))?;

    Ok(())
}

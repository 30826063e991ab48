//! Error taxonomy for the pipeline engine.
//!
//! Schema and cycle errors abort before any execution. Reconciliation,
//! execution, and serialization errors block dependent stages only —
//! independent branches keep running and the outcomes land in the run
//! report.

use thiserror::Error;

/// Result alias used throughout the pipeline engine.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// All failures the engine can surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad manifest — must be fixed by the user, never retryable.
    #[error("schema error: {0}")]
    Schema(String),

    /// The declared dependency graph contains a cycle.
    #[error("dependency cycle through stages: {}", stages.join(" → "))]
    Cycle { stages: Vec<String> },

    /// Environment build/update failed. Carries the underlying tool output.
    #[error("environment '{environment}' reconciliation failed: {message}")]
    Reconciliation { environment: String, message: String },

    /// Stage command failed or a declared output is missing.
    #[error("stage '{node}' failed{}: {message}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Execution {
        node: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// A variable output could not be encoded in the requested format.
    #[error("variable '{variable}' could not be serialized as {format}: {message}")]
    Serialization {
        variable: String,
        format: String,
        message: String,
    },

    /// Lock tree or object store persistence failure.
    #[error("lock store error: {0}")]
    Lock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// True for errors that poison dependents but spare independent branches.
    pub fn is_branch_local(&self) -> bool {
        matches!(
            self,
            Self::Reconciliation { .. } | Self::Execution { .. } | Self::Serialization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_names_stages() {
        let err = PipelineError::Cycle {
            stages: vec!["x".to_string(), "y".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle through stages: x → y");
    }

    #[test]
    fn test_execution_display_with_exit_code() {
        let err = PipelineError::Execution {
            node: "train".to_string(),
            exit_code: Some(2),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "stage 'train' failed (exit code 2): boom");
    }

    #[test]
    fn test_branch_local_classification() {
        assert!(PipelineError::Reconciliation {
            environment: "e".to_string(),
            message: "m".to_string()
        }
        .is_branch_local());
        assert!(!PipelineError::Schema("bad".to_string()).is_branch_local());
        assert!(!PipelineError::Cycle { stages: vec![] }.is_branch_local());
    }
}

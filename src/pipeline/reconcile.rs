//! Environment reconciliation: bring realized state into agreement with
//! the spec, lazily and at most once per environment per execution pass.
//!
//! The cheap path is the common one: when the spec fingerprint matches the
//! stored realized state and the backend reports the environment healthy,
//! nothing is rebuilt. Rebuild results — and failures — are memoized for
//! the pass, so every stage sharing an environment sees one reconciliation
//! outcome. Failures are fatal only for dependent stages; independent
//! branches keep running.

use super::error::{PipelineError, Result};
use super::fingerprint;
use super::lockstore::LockStore;
use super::types::{Environment, RealizedState};
use async_trait::async_trait;
use std::collections::HashMap;

/// Kind-specific build/probe operations against a pre-existing toolchain.
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Does the realized environment still exist and look healthy?
    async fn probe(&self, name: &str, env: &Environment, state: &RealizedState) -> Result<bool>;

    /// Build or update the environment to match its spec, returning the
    /// newly realized state (resolved versions, image digest, …).
    async fn realize(&self, name: &str, env: &Environment) -> Result<RealizedState>;
}

/// What a reconciliation produced.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub state: RealizedState,
    /// False when the cached realized state was returned untouched
    pub rebuilt: bool,
}

/// Per-pass reconciler. Holds the memo table; build one per driver run.
pub struct Reconciler<'a> {
    backend: &'a dyn EnvironmentBackend,
    locks: &'a LockStore,
    memo: HashMap<String, std::result::Result<ReconcileOutcome, String>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(backend: &'a dyn EnvironmentBackend, locks: &'a LockStore) -> Self {
        Self {
            backend,
            locks,
            memo: HashMap::new(),
        }
    }

    /// Reconcile `name` against its spec. Memoized: repeated calls within
    /// the pass return the first outcome, including failures.
    pub async fn reconcile(&mut self, name: &str, env: &Environment) -> Result<ReconcileOutcome> {
        if let Some(prior) = self.memo.get(name) {
            return match prior {
                Ok(outcome) => Ok(ReconcileOutcome {
                    state: outcome.state.clone(),
                    rebuilt: false,
                }),
                Err(message) => Err(PipelineError::Reconciliation {
                    environment: name.to_string(),
                    message: message.clone(),
                }),
            };
        }

        let outcome = self.reconcile_uncached(name, env).await;
        match outcome {
            Ok(outcome) => {
                self.memo.insert(
                    name.to_string(),
                    Ok(ReconcileOutcome {
                        state: outcome.state.clone(),
                        rebuilt: outcome.rebuilt,
                    }),
                );
                Ok(outcome)
            }
            Err(err) => {
                let message = match &err {
                    PipelineError::Reconciliation { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.memo.insert(name.to_string(), Err(message));
                Err(err)
            }
        }
    }

    async fn reconcile_uncached(
        &self,
        name: &str,
        env: &Environment,
    ) -> Result<ReconcileOutcome> {
        let current_fp = fingerprint::fingerprint_environment(env);
        let stored = self.locks.load_environment(name)?;

        if let Some(state) = stored {
            if state.spec_fingerprint == current_fp {
                let healthy = self
                    .backend
                    .probe(name, env, &state)
                    .await
                    .unwrap_or(false);
                if healthy {
                    tracing::debug!(environment = name, "realized state matches spec, no rebuild");
                    return Ok(ReconcileOutcome {
                        state,
                        rebuilt: false,
                    });
                }
                tracing::info!(environment = name, "realized environment missing or unhealthy");
            } else {
                tracing::info!(environment = name, "environment spec changed");
            }
        }

        let mut state =
            self.backend
                .realize(name, env)
                .await
                .map_err(|e| PipelineError::Reconciliation {
                    environment: name.to_string(),
                    message: match e {
                        PipelineError::Reconciliation { message, .. } => message,
                        other => other.to_string(),
                    },
                })?;

        // The lock carries the fingerprint of the spec that was realized,
        // regardless of what the backend filled in.
        state.spec_fingerprint = current_fp;
        self.locks.save_environment(name, &state)?;

        Ok(ReconcileOutcome {
            state,
            rebuilt: true,
        })
    }
}

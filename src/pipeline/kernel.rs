//! Notebook-kernel seam: an opaque variable store keyed by session identity.
//!
//! The engine never inspects live variables. It asks the kernel to
//! serialize a named variable in a declared format (to fingerprint and
//! cache it) or to deserialize cached bytes back into the session. The
//! store is always passed in explicitly so multiple notebooks can be
//! evaluated concurrently in tests — there is no process-wide singleton.

use super::types::VarFormat;
use std::collections::HashMap;
use std::sync::Mutex;

/// A failed variable encode/decode, surfaced as a serialization error for
/// the owning stage.
#[derive(Debug, Clone)]
pub struct KernelFailure {
    pub message: String,
}

impl KernelFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Opaque variable store for one or more kernel sessions.
pub trait KernelClient: Send + Sync {
    /// Encode `variable` from `session` into `format`.
    fn serialize(
        &self,
        session: &str,
        variable: &str,
        format: VarFormat,
    ) -> std::result::Result<Vec<u8>, KernelFailure>;

    /// Decode cached bytes back into `variable` in `session`.
    fn deserialize(
        &self,
        session: &str,
        variable: &str,
        format: VarFormat,
        bytes: &[u8],
    ) -> std::result::Result<(), KernelFailure>;
}

/// In-memory kernel used by tests and the embedding API: variables are the
/// bytes their session last stored.
#[derive(Debug, Default)]
pub struct InMemoryKernel {
    vars: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// Variables that refuse to serialize, for failure-path tests
    poisoned: Mutex<Vec<(String, String)>>,
}

impl InMemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: &str, variable: &str, bytes: Vec<u8>) {
        self.vars
            .lock()
            .expect("kernel lock")
            .insert((session.to_string(), variable.to_string()), bytes);
    }

    pub fn get(&self, session: &str, variable: &str) -> Option<Vec<u8>> {
        self.vars
            .lock()
            .expect("kernel lock")
            .get(&(session.to_string(), variable.to_string()))
            .cloned()
    }

    /// Mark a variable as unserializable (e.g. holds an open socket).
    pub fn poison(&self, session: &str, variable: &str) {
        self.poisoned
            .lock()
            .expect("kernel lock")
            .push((session.to_string(), variable.to_string()));
    }
}

impl KernelClient for InMemoryKernel {
    fn serialize(
        &self,
        session: &str,
        variable: &str,
        _format: VarFormat,
    ) -> std::result::Result<Vec<u8>, KernelFailure> {
        let key = (session.to_string(), variable.to_string());
        if self.poisoned.lock().expect("kernel lock").contains(&key) {
            return Err(KernelFailure::new(format!(
                "variable '{}' holds an unserializable object",
                variable
            )));
        }
        self.vars
            .lock()
            .expect("kernel lock")
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                KernelFailure::new(format!(
                    "variable '{}' is not defined in session '{}'",
                    variable, session
                ))
            })
    }

    fn deserialize(
        &self,
        session: &str,
        variable: &str,
        _format: VarFormat,
        bytes: &[u8],
    ) -> std::result::Result<(), KernelFailure> {
        self.set(session, variable, bytes.to_vec());
        Ok(())
    }
}

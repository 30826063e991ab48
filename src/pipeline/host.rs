//! External toolchain collaborators: command execution and environment
//! build/probe against pre-existing toolchains.
//!
//! The engine treats both as opaque. `ExecutionHost` turns an opaque
//! command plus a realized environment into a concrete invocation
//! (`sh -c`, `conda run`, `docker run`, `ssh`) and reports the exit.
//! `ToolchainBackend` implements `EnvironmentBackend` by shelling out to
//! the kind's own tooling — it never reimplements a package manager.

use super::error::{PipelineError, Result};
use super::eventlog;
use super::reconcile::EnvironmentBackend;
use super::types::{Environment, RealizedState, StageKind};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Failure of an external command.
#[derive(Debug, Clone, thiserror::Error)]
#[error("command failed (exit code: {exit_code:?}): {stderr}")]
pub struct CommandFailure {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl CommandFailure {
    fn spawn(message: impl std::fmt::Display) -> Self {
        Self {
            exit_code: None,
            stderr: message.to_string(),
        }
    }
}

/// Everything a host needs to run one node's command.
pub struct ExecutionContext<'a> {
    pub node: &'a str,
    pub command: &'a str,
    pub kind: StageKind,
    pub environment: Option<(&'a str, &'a Environment, &'a RealizedState)>,
}

/// An in-flight external job. `job_id` is set by hosts that can find the
/// job again after a driver restart.
pub struct JobHandle {
    pub job_id: Option<String>,
    child: Option<tokio::process::Child>,
}

impl JobHandle {
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            child: None,
        }
    }
}

/// Opaque `execute(command, environment) -> exit` collaborator, split into
/// launch/wait so the driver can persist a job id before blocking, and
/// reattach to a surviving job instead of resubmitting.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn launch(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> std::result::Result<JobHandle, CommandFailure>;

    async fn wait(&self, handle: JobHandle) -> std::result::Result<(), CommandFailure>;

    /// Find a previously submitted job. `None` means the host cannot
    /// resume it and the driver falls back to a fresh launch.
    async fn reattach(&self, job_id: &str) -> Option<JobHandle>;
}

// ============================================================================
// Local host
// ============================================================================

/// Runs commands on this machine, wrapping them for the node's
/// environment kind. Children are killed on drop so a user interrupt
/// propagates to the spawned process.
#[derive(Debug, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn new() -> Self {
        Self
    }

    fn wrap(&self, ctx: &ExecutionContext<'_>) -> Command {
        match ctx.environment {
            None => sh(ctx.command),
            Some((name, env, state)) => match env {
                Environment::Conda { .. } => {
                    let mut cmd = Command::new("conda");
                    cmd.args(["run", "-n", name, "sh", "-c", ctx.command]);
                    cmd
                }
                Environment::Virtualenv { .. } => {
                    match state.resolved.get("prefix") {
                        Some(prefix) => {
                            sh(&format!(". {}/bin/activate && {}", prefix, ctx.command))
                        }
                        None => sh(ctx.command),
                    }
                }
                Environment::Container { image, .. } => {
                    let image_ref = state.digest.as_deref().unwrap_or(image);
                    let mut cmd = Command::new("docker");
                    cmd.args(["run", "--rm", image_ref, "sh", "-c", ctx.command]);
                    cmd
                }
                Environment::Remote { host, user } => {
                    let target = match user {
                        Some(u) => format!("{}@{}", u, host),
                        None => host.clone(),
                    };
                    let mut cmd = Command::new("ssh");
                    cmd.arg(target).arg(ctx.command);
                    cmd
                }
                // Cluster commands are already submit invocations
                Environment::Cluster { .. } => sh(ctx.command),
            },
        }
    }
}

fn sh(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

#[async_trait]
impl ExecutionHost for LocalHost {
    async fn launch(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> std::result::Result<JobHandle, CommandFailure> {
        let mut cmd = self.wrap(ctx);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(CommandFailure::spawn)?;
        Ok(JobHandle {
            job_id: None,
            child: Some(child),
        })
    }

    async fn wait(&self, handle: JobHandle) -> std::result::Result<(), CommandFailure> {
        let child = handle
            .child
            .ok_or_else(|| CommandFailure::spawn("no attached process to wait on"))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(CommandFailure::spawn)?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(CommandFailure {
            exit_code: output.status.code(),
            stderr: if stderr.is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr
            },
        })
    }

    async fn reattach(&self, _job_id: &str) -> Option<JobHandle> {
        // Local processes do not survive the driver
        None
    }
}

// ============================================================================
// Toolchain-backed environment reconciliation
// ============================================================================

/// `EnvironmentBackend` that drives the kind's own tooling.
#[derive(Debug)]
pub struct ToolchainBackend {
    /// Where virtualenv prefixes are created
    pub env_root: PathBuf,
}

impl ToolchainBackend {
    pub fn new(env_root: PathBuf) -> Self {
        Self { env_root }
    }
}

/// Run a tool, returning stdout on success and a message carrying stderr
/// on failure.
async fn run_tool(mut cmd: Command) -> std::result::Result<String, String> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to spawn: {}", e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "exit code {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ))
    }
}

fn reconciliation_error(name: &str, message: String) -> PipelineError {
    PipelineError::Reconciliation {
        environment: name.to_string(),
        message,
    }
}

/// Parse `name==version` / `name=version=build` listings into a sorted map.
fn parse_package_listing(listing: &str) -> IndexMap<String, String> {
    let mut pairs: Vec<(String, String)> = listing
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let mut parts = l.splitn(3, |c| c == '=').filter(|p| !p.is_empty());
            let name = parts.next()?.trim().to_string();
            let version = parts.next()?.trim().to_string();
            Some((name, version))
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs.into_iter().collect()
}

#[async_trait]
impl EnvironmentBackend for ToolchainBackend {
    async fn probe(&self, name: &str, env: &Environment, state: &RealizedState) -> Result<bool> {
        match env {
            Environment::Conda { .. } => {
                let mut cmd = Command::new("conda");
                cmd.args(["env", "list"]);
                match run_tool(cmd).await {
                    Ok(listing) => Ok(listing.lines().any(|l| {
                        l.split_whitespace().next() == Some(name)
                    })),
                    Err(_) => Ok(false),
                }
            }
            Environment::Virtualenv { .. } => Ok(state
                .resolved
                .get("prefix")
                .map(|p| PathBuf::from(p).join("bin").exists())
                .unwrap_or(false)),
            Environment::Container { image, .. } => {
                let image_ref = state.digest.as_deref().unwrap_or(image);
                let mut cmd = Command::new("docker");
                cmd.args(["image", "inspect", image_ref]);
                Ok(run_tool(cmd).await.is_ok())
            }
            Environment::Remote { host, user } => {
                let target = match user {
                    Some(u) => format!("{}@{}", u, host),
                    None => host.clone(),
                };
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", &target, "true"]);
                Ok(run_tool(cmd).await.is_ok())
            }
            // A submission context holds no local state to go unhealthy
            Environment::Cluster { .. } => Ok(true),
        }
    }

    async fn realize(&self, name: &str, env: &Environment) -> Result<RealizedState> {
        let mut resolved = IndexMap::new();
        let mut digest = None;

        match env {
            Environment::Conda { file, packages } => {
                let build = match file {
                    Some(f) => {
                        let mut cmd = Command::new("conda");
                        cmd.args(["env", "update", "-n", name, "-f"])
                            .arg(f)
                            .arg("--prune");
                        cmd
                    }
                    None => {
                        let mut cmd = Command::new("conda");
                        cmd.args(["create", "-y", "-n", name]).args(packages);
                        cmd
                    }
                };
                run_tool(build)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;

                let mut list = Command::new("conda");
                list.args(["list", "-n", name, "--export"]);
                let listing = run_tool(list)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;
                resolved = parse_package_listing(&listing);
            }
            Environment::Virtualenv {
                python,
                requirements,
                packages,
            } => {
                let prefix = self.env_root.join(name);
                let python = python.as_deref().unwrap_or("python3");
                let mut venv = Command::new(python);
                venv.args(["-m", "venv", "--clear"]).arg(&prefix);
                run_tool(venv)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;

                let pip = prefix.join("bin").join("pip");
                if let Some(req) = requirements {
                    let mut install = Command::new(&pip);
                    install.arg("install").arg("-r").arg(req);
                    run_tool(install)
                        .await
                        .map_err(|e| reconciliation_error(name, e))?;
                }
                if !packages.is_empty() {
                    let mut install = Command::new(&pip);
                    install.arg("install").args(packages);
                    run_tool(install)
                        .await
                        .map_err(|e| reconciliation_error(name, e))?;
                }

                let mut freeze = Command::new(&pip);
                freeze.arg("freeze");
                let listing = run_tool(freeze)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;
                resolved = parse_package_listing(&listing);
                resolved.insert("prefix".to_string(), prefix.to_string_lossy().into_owned());
                resolved.sort_keys();
            }
            Environment::Container { image, dockerfile } => {
                match dockerfile {
                    Some(df) => {
                        let context = df
                            .parent()
                            .map(|p| p.to_path_buf())
                            .unwrap_or_else(|| PathBuf::from("."));
                        let mut build = Command::new("docker");
                        build.args(["build", "-t", image, "-f"]).arg(df).arg(context);
                        run_tool(build)
                            .await
                            .map_err(|e| reconciliation_error(name, e))?;
                    }
                    None => {
                        let mut pull = Command::new("docker");
                        pull.args(["pull", image]);
                        run_tool(pull)
                            .await
                            .map_err(|e| reconciliation_error(name, e))?;
                    }
                }
                let mut inspect = Command::new("docker");
                inspect.args(["image", "inspect", "--format", "{{.Id}}", image]);
                let id = run_tool(inspect)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;
                digest = Some(id.trim().to_string());
            }
            Environment::Remote { host, user } => {
                let target = match user {
                    Some(u) => format!("{}@{}", u, host),
                    None => host.clone(),
                };
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", &target, "uname -sr"]);
                let uname = run_tool(cmd)
                    .await
                    .map_err(|e| reconciliation_error(name, e))?;
                resolved.insert("host".to_string(), target);
                resolved.insert("uname".to_string(), uname.trim().to_string());
            }
            Environment::Cluster { scheduler, queue } => {
                resolved.insert("scheduler".to_string(), scheduler.clone());
                if let Some(q) = queue {
                    resolved.insert("queue".to_string(), q.clone());
                }
            }
        }

        Ok(RealizedState {
            // Overwritten by the reconciler with the spec fingerprint
            spec_fingerprint: String::new(),
            digest,
            resolved,
            realized_at: eventlog::now_iso8601(),
        })
    }
}

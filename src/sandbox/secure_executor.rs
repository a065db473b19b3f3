//! SecureExecutor — runs untrusted code inside a hardened Docker container,
//! or refuses to run it at all.
//!
//! Grounded on `core_runtime/docker_capability.py`'s Docker-availability
//! gate and the sanitized-context convention it shares with
//! `kernel_context_builder.py`. In [`SecurityMode::Strict`] (the production
//! default) a missing or unreachable Docker daemon is a hard error; in
//! [`SecurityMode::Permissive`] the caller may fall back to host execution,
//! but every such fallback is logged at `warn` so it can't go unnoticed in
//! production logs.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

use crate::config::SecurityMode;
use crate::error::{Error, Result};
use crate::sandbox::docker_builder::DockerRunBuilder;

/// Keys that survive [`sanitize_context`]'s allowlist filter. Everything
/// else in a kernel context (service handles, in-process callables, whole
/// registries) has no meaning inside a container and must never cross the
/// boundary.
const CONTEXT_ALLOWED_KEYS: &[&str] =
    &["phase", "ts", "ids", "paths", "_source_component", "chat_id", "payload"];

const DOCKER_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Strip a kernel context down to the JSON-safe subset a sandboxed process
/// is allowed to see.
pub fn sanitize_context(context: &Value) -> Value {
    let Value::Object(map) = context else { return Value::Object(Default::default()) };
    let allowed: BTreeSet<&str> = CONTEXT_ALLOWED_KEYS.iter().copied().collect();
    let mut out = serde_json::Map::new();
    for (k, v) in map {
        if allowed.contains(k.as_str()) {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// The result of a single sandboxed run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Executes prepared [`DockerRunBuilder`] commands, enforcing the
/// strict/permissive policy around Docker's availability.
pub struct SecureExecutor {
    mode: SecurityMode,
}

impl SecureExecutor {
    pub fn new(mode: SecurityMode) -> Self {
        Self { mode }
    }

    /// Probe `docker info` under a short timeout.
    pub async fn docker_available(&self) -> bool {
        let run = Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(tokio::time::timeout(DOCKER_INFO_TIMEOUT, run).await, Ok(Ok(status)) if status.success())
    }

    /// Run `builder` under `timeout`, honoring strict/permissive policy.
    /// In strict mode, a missing Docker daemon is a [`Error::Sandbox`]; in
    /// permissive mode it's a logged warning and the caller receives the
    /// same error, since this executor performs no unsandboxed fallback of
    /// its own — that decision belongs to higher-level capability handlers
    /// that know what host-side fallback (if any) is safe for their call.
    pub async fn run(&self, builder: &DockerRunBuilder, timeout: Duration) -> Result<ExecutionOutput> {
        if !self.docker_available().await {
            match self.mode {
                SecurityMode::Strict => {
                    return Err(Error::Sandbox("docker is unavailable; refusing to execute".to_string()));
                }
                SecurityMode::Permissive => {
                    tracing::warn!("docker unavailable in permissive mode; execution refused");
                    return Err(Error::Sandbox("docker is unavailable".to_string()));
                }
            }
        }

        let argv = builder.build()?;
        let [bin, rest @ ..] = argv.as_slice() else {
            return Err(Error::Internal("empty docker argv".to_string()));
        };

        let mut cmd = Command::new(bin);
        cmd.args(rest).stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| Error::Sandbox(format!("failed to spawn docker: {e}")))?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|e| Error::Sandbox(format!("docker execution failed: {e}")))?;

        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Write a sanitized context to a temp file for mounting read-only into
    /// a container, returning the file's path. Callers are responsible for
    /// the file's lifetime (it typically lives as long as the container
    /// run and is cleaned up by the caller's `tempfile::TempDir`).
    pub fn write_sanitized_context(dir: &Path, context: &Value) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let sanitized = sanitize_context(context);
        let path = dir.join("context.json");
        std::fs::write(&path, serde_json::to_vec(&sanitized)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_context_drops_everything_outside_the_allowlist() {
        let context = json!({
            "phase": "runtime_boot",
            "ts": "2026-07-28T00:00:00Z",
            "di_container": "should not survive",
            "event_bus": "should not survive",
            "payload": {"x": 1},
        });
        let sanitized = sanitize_context(&context);
        assert_eq!(sanitized["phase"], "runtime_boot");
        assert_eq!(sanitized["payload"]["x"], 1);
        assert!(sanitized.get("di_container").is_none());
        assert!(sanitized.get("event_bus").is_none());
    }

    #[test]
    fn sanitize_context_handles_non_object_input() {
        let sanitized = sanitize_context(&Value::Null);
        assert_eq!(sanitized, json!({}));
    }

    #[tokio::test]
    async fn write_sanitized_context_writes_allowlisted_json() {
        let dir = tempfile::tempdir().unwrap();
        let context = json!({"phase": "setup", "secret_token": "nope"});
        let path = SecureExecutor::write_sanitized_context(dir.path(), &context).unwrap();
        let written: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(written["phase"], "setup");
        assert!(written.get("secret_token").is_none());
    }
}

//! CapabilityProxy — one Unix-domain-socket per principal, dispatching the
//! typed requests a sandboxed pack may issue: `secrets.read`,
//! `docker.{run,exec,stop,logs,list}`, and `flow.run`. Every request is
//! checked against [`CapabilityUsageStore::check_and_consume`] before its
//! side effect runs.
//!
//! Grounded on spec section 4.10 and `core_runtime/container_orchestrator.py`'s
//! socket-mounting conventions; handler wiring is injected by the kernel so
//! this module stays decoupled from `DockerCapabilityHandler`/flow
//! execution specifics. Wire format is [`super::protocol`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};

use crate::audit::{AuditEntry, AuditLog, Severity};
use crate::error::{Error, Result};
use crate::grants::capability::CapabilityGrantManager;
use crate::usage::CapabilityUsageStore;

use super::protocol::{read_frame, write_frame};

/// A single capability action handler. Receives the request's `params`
/// object and returns the response value placed under `result` in the
/// frame sent back to the pack.
pub type CapabilityHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CapabilityRequest {
    action: String,
    #[serde(default)]
    params: Value,
}

/// Per-action default quota, consulted when the principal has no explicit
/// `capability` grant config for that action. `0` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionQuota {
    pub max_count: u64,
    pub max_daily: u64,
}

/// Dispatches typed capability requests for one principal, gating each on
/// a capability grant and usage quota before running its handler.
pub struct CapabilityProxy {
    principal_id: String,
    socket_path: PathBuf,
    handlers: HashMap<String, (CapabilityHandlerFn, ActionQuota)>,
    capability_grants: Arc<CapabilityGrantManager>,
    usage: Arc<CapabilityUsageStore>,
    audit: AuditLog,
}

impl CapabilityProxy {
    pub fn new(base_dir: &Path, principal_id: &str, capability_grants: Arc<CapabilityGrantManager>, usage: Arc<CapabilityUsageStore>, audit_dir: &Path) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            socket_path: base_dir.join(format!("{principal_id}.sock")),
            handlers: HashMap::new(),
            capability_grants,
            usage,
            audit: AuditLog::new(audit_dir.to_path_buf()),
        }
    }

    /// Register the handler invoked for `action` (e.g. `"docker.run"`),
    /// with the quota applied when no explicit grant config overrides it.
    pub fn register(&mut self, action: impl Into<String>, handler: CapabilityHandlerFn, default_quota: ActionQuota) {
        self.handlers.insert(action.into(), (handler, default_quota));
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            set_dir_mode_0700(parent)?;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = proxy.handle_connection(stream).await {
                    tracing::warn!(principal_id = %proxy.principal_id, %error, "capability connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let frame = read_frame(&mut stream).await?;
        let request: CapabilityRequest = serde_json::from_value(frame)?;
        let response = self.dispatch(&request.action, request.params).await;
        let body = match response {
            Ok(result) => serde_json::json!({"success": true, "result": result}),
            Err(error) => serde_json::json!({"success": false, "error": error.sanitize()}),
        };
        write_frame(&mut stream, &body).await?;
        Ok(())
    }

    async fn dispatch(&self, action: &str, params: Value) -> Result<Value> {
        let Some((handler, quota)) = self.handlers.get(action) else {
            return Err(Error::Validation(format!("no handler registered for action '{action}'")));
        };

        let config = self.capability_grants.check_access(&self.principal_id, action);
        if config.is_none() {
            let entry = AuditEntry::new("capability.dispatch", &self.principal_id, false, "no capability grant for action")
                .with_severity(Severity::Warning)
                .with_detail(serde_json::json!({"action": action}));
            let _ = self.audit.record(&entry);
            return Err(Error::Authorization(format!("no capability grant for action '{action}'")));
        }
        let config = config.unwrap_or(Value::Null);
        let max_count = config.get("max_count").and_then(Value::as_u64).unwrap_or(quota.max_count);
        let max_daily = config.get("max_daily").and_then(Value::as_u64).unwrap_or(quota.max_daily);

        let consumed = self.usage.check_and_consume(&self.principal_id, action, "default", max_count, max_daily, None);
        if !consumed.allowed {
            let entry = AuditEntry::new("capability.dispatch", &self.principal_id, false, consumed.reason.map(|r| r.as_str()).unwrap_or("denied"))
                .with_severity(Severity::Warning)
                .with_detail(serde_json::json!({"action": action}));
            let _ = self.audit.record(&entry);
            return Err(Error::Authorization(format!("usage quota exceeded for action '{action}'")));
        }

        let entry = AuditEntry::new("capability.dispatch", &self.principal_id, true, "dispatched").with_detail(serde_json::json!({"action": action}));
        let _ = self.audit.record(&entry);
        handler(params).await
    }
}

#[cfg(unix)]
fn set_dir_mode_0700(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(dir)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(dir, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode_0700(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathResolver;
    use crate::signer::HmacSigner;

    fn proxy(dir: &Path) -> CapabilityProxy {
        let resolver = PathResolver::new(dir);
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let capability_grants = Arc::new(CapabilityGrantManager::new(&resolver, signer.clone()));
        let usage = Arc::new(CapabilityUsageStore::new(&resolver, signer));
        CapabilityProxy::new(&dir.join("sockets"), "pack-a", capability_grants, usage, &dir.join("audit"))
    }

    #[tokio::test]
    async fn dispatch_without_grant_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = proxy(dir.path());
        p.register("docker.run", Arc::new(|_params| Box::pin(async { Ok(serde_json::json!({"ok": true})) })), ActionQuota::default());
        let err = p.dispatch("docker.run", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "authorization");
    }

    #[tokio::test]
    async fn dispatch_with_grant_and_quota_succeeds_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = proxy(dir.path());
        p.capability_grants.grant("pack-a", "docker.run", serde_json::json!({"max_count": 1}), "system").unwrap();
        p.register("docker.run", Arc::new(|_params| Box::pin(async { Ok(serde_json::json!({"ok": true})) })), ActionQuota::default());

        assert!(p.dispatch("docker.run", Value::Null).await.is_ok());
        let err = p.dispatch("docker.run", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "authorization");
    }

    #[tokio::test]
    async fn unknown_action_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(dir.path());
        let err = p.dispatch("mystery.action", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}

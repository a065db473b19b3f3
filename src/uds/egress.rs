//! EgressProxy — one Unix-domain-socket listener per pack, mounted into
//! that pack's `--network=none` container as the only path for outbound
//! network I/O. Every connection is authorized against
//! [`NetworkGrantManager`] before the kernel opens the real TCP socket on
//! the pack's behalf.
//!
//! Grounded on `core_runtime/container_orchestrator.py`'s socket-mounting
//! conventions (one socket path per pack, directory mode 0700); the framed
//! request/response body is [`super::protocol`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::{TcpStream, UnixListener, UnixStream};

use crate::audit::{AuditEntry, AuditLog, Severity};
use crate::error::Result;
use crate::grants::network::NetworkGrantManager;

use super::protocol::{read_frame, write_frame};

#[derive(Debug, Deserialize)]
struct EgressRequest {
    domain: String,
    port: u16,
}

/// Listens for one pack's outbound connection requests and either relays
/// them to the requested `domain:port` or denies them with an
/// audit-logged reason.
pub struct EgressProxy {
    pack_id: String,
    socket_path: PathBuf,
    network_grants: Arc<NetworkGrantManager>,
    audit: AuditLog,
}

impl EgressProxy {
    /// Create (but do not yet bind) a proxy for `pack_id`, whose socket
    /// will live at `<base_dir>/<pack_id>.sock`.
    pub fn new(base_dir: &Path, pack_id: &str, network_grants: Arc<NetworkGrantManager>, audit_dir: &Path) -> Self {
        Self {
            pack_id: pack_id.to_string(),
            socket_path: base_dir.join(format!("{pack_id}.sock")),
            network_grants,
            audit: AuditLog::new(audit_dir.to_path_buf()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the listener, creating its parent directory at mode 0700. The
    /// returned listener must be driven by [`Self::serve`] (or a caller's
    /// own accept loop) to actually process connections.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            set_dir_mode_0700(parent)?;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        Ok(listener)
    }

    /// Accept connections forever, handling each on its own task. Returns
    /// only on a listener-level I/O error (the socket was removed out from
    /// under us, etc).
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = proxy.handle_connection(stream).await {
                    tracing::warn!(pack_id = %proxy.pack_id, %error, "egress connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let frame = read_frame(&mut stream).await?;
        let request: EgressRequest = serde_json::from_value(frame)?;

        let check = self.network_grants.check_access(&self.pack_id, &request.domain, request.port);
        let entry = AuditEntry::new("egress.connect", &self.pack_id, check.allowed, check.reason.clone())
            .with_severity(if check.allowed { Severity::Info } else { Severity::Warning })
            .with_detail(serde_json::json!({"domain": request.domain, "port": request.port}));
        let _ = self.audit.record(&entry);

        if !check.allowed {
            write_frame(&mut stream, &serde_json::json!({"allowed": false, "reason": check.reason})).await?;
            return Ok(());
        }

        let outbound = match TcpStream::connect((request.domain.as_str(), request.port)).await {
            Ok(s) => s,
            Err(e) => {
                write_frame(&mut stream, &serde_json::json!({"allowed": true, "error": e.to_string()})).await?;
                return Ok(());
            }
        };
        write_frame(&mut stream, &serde_json::json!({"allowed": true})).await?;

        let (mut outbound_r, mut outbound_w) = tokio::io::split(outbound);
        let (mut local_r, mut local_w) = tokio::io::split(stream);
        tokio::select! {
            res = tokio::io::copy(&mut local_r, &mut outbound_w) => { res?; }
            res = tokio::io::copy(&mut outbound_r, &mut local_w) => { res?; }
        }
        Ok(())
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
    use tokio::io::AsyncWriteExt;

    fn managers(dir: &Path) -> Arc<NetworkGrantManager> {
        let resolver = PathResolver::new(dir);
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        Arc::new(NetworkGrantManager::new(&resolver, signer))
    }

    #[tokio::test]
    async fn denies_domain_not_on_the_grant() {
        let dir = tempfile::tempdir().unwrap();
        let network = managers(dir.path());
        network.grant("pack-a", vec!["allowed.example.com".to_string()], vec![0], "system").unwrap();

        let base = dir.path().join("sockets");
        let proxy = Arc::new(EgressProxy::new(&base, "pack-a", network, &dir.path().join("audit")));
        let listener = proxy.bind().unwrap();
        let socket_path = proxy.socket_path().to_path_buf();
        tokio::spawn(proxy.serve(listener));

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        write_frame(&mut client, &serde_json::json!({"domain": "blocked.example.com", "port": 443})).await.unwrap();
        let response = read_frame(&mut client).await.unwrap();
        assert_eq!(response["allowed"], false);
    }
}

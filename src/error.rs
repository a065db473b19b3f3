//! Crate-wide error type.
//!
//! Mirrors the five error kinds from the governance model: validation,
//! integrity, authorization, sandbox, and resource errors are all local and
//! recoverable; only `Internal` indicates a bug. Call [`Error::sanitize`]
//! before handing an error across a proxy boundary (UDS responses, the HTTP
//! admin surface) so implementation details never leak to a pack.

use thiserror::Error;

/// Result alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the kernel's governance and execution machinery.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed YAML/JSON, schema violation, unknown action.
    #[error("validation error: {0}")]
    Validation(String),

    /// HMAC mismatch, file-hash mismatch, tampered grant/usage record.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Grant denied, usage exceeded, protected key, principal not owner.
    #[error("authorization denied: {0}")]
    Authorization(String),

    /// Docker unavailable in strict mode, container timeout, OOM kill.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Cycle, depth/chain overflow.
    #[error("resource limit exceeded: {0}")]
    Resource(String),

    /// Flow-level timeout.
    #[error("flow timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(String),

    /// Unexpected internal failure; should never surface to a pack.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Strip implementation detail before exposing an error to a pack or
    /// across a capability proxy. Safe-to-expose kinds pass their message
    /// through; everything else collapses to a generic string.
    #[must_use]
    pub fn sanitize(&self) -> String {
        match self {
            Error::Validation(m) => format!("validation error: {m}"),
            Error::Integrity(_) => "integrity check failed".to_string(),
            Error::Authorization(m) => format!("authorization denied: {m}"),
            Error::Sandbox(m) => format!("sandbox error: {m}"),
            Error::Resource(m) => format!("resource limit exceeded: {m}"),
            Error::Timeout(_) => "operation timed out".to_string(),
            Error::Io(_) => "system error".to_string(),
            Error::Json(_) => "system error".to_string(),
            Error::Yaml(_) => "system error".to_string(),
            Error::Internal(_) => "internal error".to_string(),
        }
    }

    /// The error kind as used in audit entries and diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Integrity(_) => "integrity",
            Error::Authorization(_) => "authorization",
            Error::Sandbox(_) => "sandbox",
            Error::Resource(_) => "resource",
            Error::Timeout(_) => "resource",
            Error::Io(_) => "internal",
            Error::Json(_) => "internal",
            Error::Yaml(_) => "internal",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_hides_integrity_detail() {
        let err = Error::Integrity("hash mismatch for /etc/passwd".to_string());
        let msg = err.sanitize();
        assert_eq!(msg, "integrity check failed");
        assert!(!msg.contains("passwd"));
    }

    #[test]
    fn kind_maps_to_stable_string() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation");
        assert_eq!(Error::Resource("x".into()).kind(), "resource");
        assert_eq!(Error::Timeout(std::time::Duration::from_secs(1)).kind(), "resource");
    }
}

//! Kernel-wide configuration, sourced from the environment variables in
//! spec section 6.
//!
//! Follows the teacher's secure-defaults-with-validate() pattern
//! (`dashflow-wasm-executor::config::WasmExecutorConfig`).

use serde::{Deserialize, Serialize};

/// Security mode: whether sandboxed execution requires Docker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityMode {
    /// Require Docker; refuse to execute otherwise. Production default.
    #[default]
    Strict,
    /// Execute on the host with no isolation, loudly warning every call.
    /// Development only.
    Permissive,
}

impl SecurityMode {
    fn from_env_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" => SecurityMode::Permissive,
            _ => SecurityMode::Strict,
        }
    }
}

/// Kernel configuration assembled from environment variables.
///
/// See spec section 6 for the authoritative list of variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// `RUMI_SECURITY_MODE` — strict (default) or permissive.
    pub security_mode: SecurityMode,

    /// `RUMI_HMAC_SECRET` — overrides the signing key when >= 32 chars.
    pub hmac_secret_override: Option<String>,

    /// `RUMI_DIAGNOSTICS_VERBOSE` — emit per-file skip diagnostics.
    pub diagnostics_verbose: bool,

    /// `RUMI_LOCAL_PACK_MODE` — `require_approval` enables the legacy
    /// ecosystem-wide modifier directory via the `local_pack` pseudo-pack.
    pub local_pack_mode_require_approval: bool,

    /// `RUMI_ALLOW_WILDCARD_MODIFIERS` — bypass per-pack wildcard opt-in.
    pub allow_wildcard_modifiers: bool,

    /// `RUMI_BLOCK_PROTECTED_KEYS` — escalate protected-key registration
    /// warnings to hard errors.
    pub block_protected_keys: bool,

    /// `RUMI_SAFE_CONTEXT` — hand sanitized contexts to pack handlers.
    pub safe_context: bool,

    /// `RUMI_MAX_MODIFIER_FILE_BYTES` — per-file YAML byte cap.
    pub max_modifier_file_bytes: u64,
}

const DEFAULT_MAX_MODIFIER_FILE_BYTES: u64 = 1024 * 1024;

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::Strict,
            hmac_secret_override: None,
            diagnostics_verbose: false,
            local_pack_mode_require_approval: false,
            allow_wildcard_modifiers: false,
            block_protected_keys: false,
            safe_context: false,
            max_modifier_file_bytes: DEFAULT_MAX_MODIFIER_FILE_BYTES,
        }
    }
}

impl KernelConfig {
    /// Build configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RUMI_SECURITY_MODE") {
            cfg.security_mode = SecurityMode::from_env_str(&v);
        }
        if let Ok(v) = std::env::var("RUMI_HMAC_SECRET") {
            if v.len() >= 32 {
                cfg.hmac_secret_override = Some(v);
            }
        }
        cfg.diagnostics_verbose = env_flag("RUMI_DIAGNOSTICS_VERBOSE");
        cfg.local_pack_mode_require_approval = std::env::var("RUMI_LOCAL_PACK_MODE")
            .map(|v| v == "require_approval")
            .unwrap_or(false);
        cfg.allow_wildcard_modifiers = env_flag("RUMI_ALLOW_WILDCARD_MODIFIERS");
        cfg.block_protected_keys = env_flag("RUMI_BLOCK_PROTECTED_KEYS");
        cfg.safe_context = env_flag("RUMI_SAFE_CONTEXT");
        if let Ok(v) = std::env::var("RUMI_MAX_MODIFIER_FILE_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.max_modifier_file_bytes = n;
            }
        }

        cfg
    }

    /// A relaxed configuration suitable for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Validate the configuration, returning an error message on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(secret) = &self.hmac_secret_override {
            if secret.len() < 32 {
                return Err("RUMI_HMAC_SECRET must be at least 32 characters".to_string());
            }
        }
        if self.max_modifier_file_bytes == 0 {
            return Err("max_modifier_file_bytes must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("TRUE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_strict_and_valid() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.security_mode, SecurityMode::Strict);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_hmac_override_rejected() {
        let mut cfg = KernelConfig::for_testing();
        cfg.hmac_secret_override = Some("short".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_byte_cap_rejected() {
        let mut cfg = KernelConfig::for_testing();
        cfg.max_modifier_file_bytes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn security_mode_parses_permissive() {
        assert_eq!(SecurityMode::from_env_str("permissive"), SecurityMode::Permissive);
        assert_eq!(SecurityMode::from_env_str("PERMISSIVE"), SecurityMode::Permissive);
        assert_eq!(SecurityMode::from_env_str("strict"), SecurityMode::Strict);
        assert_eq!(SecurityMode::from_env_str("garbage"), SecurityMode::Strict);
    }
}

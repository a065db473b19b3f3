//! HMACSigner — deterministic signing key lifecycle and canonical JSON
//! signing.
//!
//! Key lookup order, per spec section 4.1: environment variable (>= 32
//! chars) -> OS keyring -> `grants_dir/.secret_key` file (mode 0600) ->
//! freshly generated 32 random bytes, persisted. Once loaded the key is
//! cached in memory for the process lifetime; rotation requires a restart.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const KEYRING_SERVICE: &str = "rumi-kernel";
const KEYRING_USER: &str = "hmac-signing-key";

/// Holds the process-lifetime signing key and signs/verifies canonical JSON.
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    /// Load or create the signing key following the documented lookup
    /// order, persisting the grants directory's `.secret_key` file when a
    /// key must be freshly generated.
    pub fn load_or_create(grants_dir: &std::path::Path, env_override: Option<&str>) -> Result<Self> {
        if let Some(v) = env_override.filter(|v| v.len() >= 32) {
            return Ok(Self { key: v.as_bytes().to_vec() });
        }
        if let Ok(v) = std::env::var("RUMI_HMAC_SECRET") {
            if v.len() >= 32 {
                return Ok(Self { key: v.into_bytes() });
            }
        }
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) {
            if let Ok(secret) = entry.get_password() {
                if secret.len() >= 32 {
                    return Ok(Self { key: secret.into_bytes() });
                }
            }
        }

        let key_file = grants_dir.join(".secret_key");
        if let Ok(contents) = std::fs::read_to_string(&key_file) {
            let hex_key = contents.trim();
            if let Ok(bytes) = hex::decode(hex_key) {
                return Ok(Self { key: bytes });
            }
        }

        std::fs::create_dir_all(grants_dir)?;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex_key = hex::encode(bytes);
        write_key_file(&key_file, &hex_key)?;

        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) {
            let _ = entry.set_password(&hex_key);
        }

        Ok(Self { key: bytes.to_vec() })
    }

    /// Build a signer directly from raw key bytes, bypassing the lookup
    /// order. Used in tests and where the caller already manages the key.
    pub fn from_key(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Canonicalize `value` (sorted keys, no whitespace) and compute its
    /// HMAC-SHA256 signature, hex-encoded.
    pub fn sign(&self, value: &Value) -> Result<String> {
        let canonical = canonicalize(value)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("invalid HMAC key length: {e}")))?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify `signature` against `value` in constant time.
    pub fn verify(&self, value: &Value, signature: &str) -> Result<bool> {
        let expected = self.sign(value)?;
        let expected_bytes = expected.as_bytes();
        let actual_bytes = signature.as_bytes();
        if expected_bytes.len() != actual_bytes.len() {
            return Ok(false);
        }
        Ok(expected_bytes.ct_eq(actual_bytes).into())
    }

    /// Sign `value` and return it with a `_hmac_signature` field appended,
    /// matching the envelope format used by every grant file.
    pub fn seal(&self, mut value: Value) -> Result<Value> {
        let signature = self.sign(&value)?;
        if let Value::Object(map) = &mut value {
            map.insert("_hmac_signature".to_string(), Value::String(signature));
        } else {
            return Err(Error::Internal("seal() requires a JSON object".to_string()));
        }
        Ok(value)
    }

    /// Verify and strip the envelope produced by [`Self::seal`]. Returns the
    /// unsigned payload on success.
    pub fn unseal(&self, mut envelope: Value) -> Result<Value> {
        let Value::Object(map) = &mut envelope else {
            return Err(Error::Integrity("grant envelope is not a JSON object".to_string()));
        };
        let signature = map
            .remove("_hmac_signature")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Integrity("grant envelope missing _hmac_signature".to_string()))?;
        if !self.verify(&envelope, &signature)? {
            return Err(Error::Integrity("grant signature verification failed".to_string()));
        }
        Ok(envelope)
    }
}

/// Canonicalize a JSON value: object keys sorted, no extraneous whitespace.
/// Matches Python's `json.dumps(data, sort_keys=True, ensure_ascii=False)`.
fn canonicalize(value: &Value) -> Result<String> {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).map_err(Error::from)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(unix)]
fn write_key_file(path: &std::path::Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &std::path::Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

//! Grant managers — parallel, per-principal signed-JSON stores for network,
//! secret, capability, and host-privilege authorization.
//!
//! Each manager follows the same shape described in spec section 4.2, using
//! `NetworkGrantManager` as the exemplar: one JSON file per principal under
//! `user_data/permissions/<kind>/<safe_id>.json`, HMAC-signed, with a
//! `disabled_packs` set that is authoritative over an otherwise-valid grant.

pub mod capability;
pub mod host_privilege;
pub mod network;
pub mod secrets;

/// Escape a principal id into a safe filename component, per spec: replace
/// `/` and `:` with `_`.
pub fn safe_id(principal_id: &str) -> String {
    principal_id.replace(['/', ':'], "_")
}

/// Read and HMAC-verify a grant file. Returns `Ok(None)` if the file does
/// not exist, and `Err` if it exists but fails signature verification (the
/// caller logs this as a security event and treats it as "grant not
/// found").
pub(crate) fn read_signed_json(path: &std::path::Path, signer: &crate::signer::HmacSigner) -> crate::error::Result<Option<serde_json::Value>> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Ok(None);
    };
    let envelope: serde_json::Value = serde_json::from_str(&raw)?;
    Ok(Some(signer.unseal(envelope)?))
}

/// Seal and write a grant file. Writes are last-writer-wins; atomicity is
/// not required for these small per-principal files.
pub(crate) fn write_signed_json(path: &std::path::Path, value: serde_json::Value, signer: &crate::signer::HmacSigner) -> crate::error::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let sealed = signer.seal(value)?;
    std::fs::write(path, serde_json::to_string_pretty(&sealed)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_id_escapes_path_and_colon_separators() {
        assert_eq!(safe_id("github:user/pack"), "github_user_pack");
    }
}

//! Deterministic UUIDv5 generation for packs and components.
//!
//! The namespace constant is project-specific and must never change —
//! changing it would silently re-identify every installed pack.

use uuid::Uuid;

/// Fixed namespace UUID for pack identity hashing. Do not change.
pub const PACK_NAMESPACE_UUID: Uuid = Uuid::from_bytes([
    0xa3, 0xe9, 0xf8, 0xc2, 0x7b, 0x4d, 0x5e, 0x1a, 0x9c, 0x6f, 0x2d, 0x8b, 0x4a, 0x7e, 0x3f, 0x1c,
]);

const COMPONENT_PREFIX: &str = "component";

/// Generate a deterministic pack UUID from its `pack_identity` string.
///
/// # Errors
/// Returns an error if `pack_identity` is empty.
pub fn generate_pack_uuid(pack_identity: &str) -> crate::error::Result<Uuid> {
    if pack_identity.is_empty() {
        return Err(crate::error::Error::Validation(
            "pack_identity must be a non-empty string".to_string(),
        ));
    }
    Ok(Uuid::new_v5(&PACK_NAMESPACE_UUID, pack_identity.as_bytes()))
}

/// Generate a deterministic component UUID scoped to a pack.
///
/// # Errors
/// Returns an error if `component_type` or `component_id` is empty.
pub fn generate_component_uuid(
    pack_uuid: Uuid,
    component_type: &str,
    component_id: &str,
) -> crate::error::Result<Uuid> {
    if component_type.is_empty() {
        return Err(crate::error::Error::Validation(
            "component_type must be a non-empty string".to_string(),
        ));
    }
    if component_id.is_empty() {
        return Err(crate::error::Error::Validation(
            "component_id must be a non-empty string".to_string(),
        ));
    }
    let name = format!("{COMPONENT_PREFIX}:{component_type}:{component_id}");
    Ok(Uuid::new_v5(&pack_uuid, name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_uuid_is_deterministic() {
        let a = generate_pack_uuid("github:user/pack").unwrap();
        let b = generate_pack_uuid("github:user/pack").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_identities_yield_different_uuids() {
        let a = generate_pack_uuid("github:user/pack-a").unwrap();
        let b = generate_pack_uuid("github:user/pack-b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn component_uuid_scoped_to_pack() {
        let pack_a = generate_pack_uuid("pack-a").unwrap();
        let pack_b = generate_pack_uuid("pack-b").unwrap();
        let comp_a = generate_component_uuid(pack_a, "tool_pack", "id1").unwrap();
        let comp_b = generate_component_uuid(pack_b, "tool_pack", "id1").unwrap();
        assert_ne!(comp_a, comp_b);

        let comp_a_again = generate_component_uuid(pack_a, "tool_pack", "id1").unwrap();
        assert_eq!(comp_a, comp_a_again);
    }

    #[test]
    fn empty_identity_rejected() {
        assert!(generate_pack_uuid("").is_err());
    }
}

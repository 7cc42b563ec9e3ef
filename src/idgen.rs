//! Deterministic identity derivation for chains, steps and legacy points.
//!
//! Chain ids are UUIDv5 over the whitespace-normalized chain label, so any
//! two documents minting the same label collide on the same chain id. Step
//! ids are random UUIDv4 and are regenerated on every (re)mint.

use uuid::Uuid;

/// Namespace for all UUIDv5 derivations. Changing this value orphans every
/// previously stored chain id.
pub const KAIROS_NAMESPACE: Uuid = Uuid::from_u128(0x9f2c_1e8a_5d4b_4c3f_8a61_7e0b_2d94_c155);

/// Trim and collapse internal whitespace runs to a single space.
pub fn normalize_chain_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Chain id as a pure function of the chain label.
pub fn chain_id(label: &str) -> Uuid {
    Uuid::new_v5(&KAIROS_NAMESPACE, normalize_chain_label(label).as_bytes())
}

/// Random, globally unique step identity.
pub fn step_id() -> Uuid {
    Uuid::new_v4()
}

/// Point id for resource ingestion, derived from the resource URI.
pub fn point_id(uri: &str) -> Uuid {
    Uuid::new_v5(&KAIROS_NAMESPACE, uri.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_is_deterministic() {
        assert_eq!(chain_id("Deploy The Thing"), chain_id("Deploy The Thing"));
        assert_ne!(chain_id("Deploy The Thing"), chain_id("Deploy The Thong"));
    }

    #[test]
    fn chain_id_normalizes_whitespace() {
        assert_eq!(chain_id("  Deploy   The\tThing "), chain_id("Deploy The Thing"));
    }

    #[test]
    fn step_ids_are_unique() {
        assert_ne!(step_id(), step_id());
    }

    #[test]
    fn ids_serialize_canonically() {
        let id = chain_id("A");
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert!(s.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert!(!s.chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn point_id_differs_from_chain_id_for_same_text() {
        // Point ids hash the raw URI, chain ids hash the normalized label.
        assert_eq!(point_id("kairos://mem/x"), point_id("kairos://mem/x"));
    }
}

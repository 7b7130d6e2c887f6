use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::model::BubbleStateSnapshot;

/// Canonical JSON encoding used for fingerprinting: stable key order is the
/// struct's declared field order (§3.3), preserved by `serde_json` for
/// ordinary structs (no `HashMap` involved), arrays preserved as written.
pub fn canonical_json(snapshot: &BubbleStateSnapshot) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(snapshot).map_err(|e| CoreError::schema(e.to_string()))
}

pub fn fingerprint_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn fingerprint_of(snapshot: &BubbleStateSnapshot) -> Result<String, CoreError> {
    Ok(fingerprint_hex(&canonical_json(snapshot)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_snapshots() {
        let a = BubbleStateSnapshot::new_created("b1");
        let b = BubbleStateSnapshot::new_created("b1");
        assert_eq!(fingerprint_of(&a).unwrap(), fingerprint_of(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = BubbleStateSnapshot::new_created("b1");
        let mut b = BubbleStateSnapshot::new_created("b1");
        b.round = 1;
        assert_ne!(fingerprint_of(&a).unwrap(), fingerprint_of(&b).unwrap());
    }
}

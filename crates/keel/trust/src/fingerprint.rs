use keel_types::canonical_json;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Content fingerprint of an engine manifest.
pub struct ManifestFingerprint;

impl ManifestFingerprint {
    /// SHA-256 hex of the manifest's canonical JSON.
    pub fn compute(manifest: &Value) -> String {
        hex::encode(Sha256::digest(canonical_json(manifest).as_bytes()))
    }

    pub fn matches(manifest: &Value, expected: &str) -> bool {
        Self::compute(manifest) == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let a = json!({"engine_id": "accounting", "version": "1.0.0", "actions": []});
        let b = json!({"version": "1.0.0", "actions": [], "engine_id": "accounting"});
        assert_eq!(ManifestFingerprint::compute(&a), ManifestFingerprint::compute(&b));
        assert_eq!(ManifestFingerprint::compute(&a).len(), 64);
    }

    #[test]
    fn any_change_is_detected() {
        let a = json!({"engine_id": "accounting", "version": "1.0.0"});
        let fingerprint = ManifestFingerprint::compute(&a);
        assert!(ManifestFingerprint::matches(&a, &fingerprint));
        assert!(!ManifestFingerprint::matches(
            &json!({"engine_id": "accounting", "version": "1.0.1"}),
            &fingerprint
        ));
    }
}

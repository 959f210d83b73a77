use chrono::{DateTime, SecondsFormat, Utc};
use keel_types::{canonical_json, ActionId, TenantId};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// RFC 3339 timestamp with millisecond precision, as covered by the hash.
pub fn hash_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SHA-256 hex over the canonical JSON of the chained fields.
pub fn compute_record_hash(
    prev_hash: &str,
    tenant_id: &TenantId,
    actor_id: &str,
    action_id: &ActionId,
    payload: &Value,
    created_at: &DateTime<Utc>,
) -> String {
    let body = json!({
        "prevHash": prev_hash,
        "tenantId": tenant_id.as_str(),
        "actorId": actor_id,
        "actionId": action_id.as_str(),
        "payload": payload,
        "timestamp": hash_timestamp(created_at),
    });
    hex::encode(Sha256::digest(canonical_json(&body).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_key_order_does_not_matter() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let tenant = TenantId::new("t-1");
        let action = ActionId::new("accounting.create_journal_entry");
        let a = compute_record_hash(
            "GENESIS",
            &tenant,
            "u-1",
            &action,
            &json!({"amount": 10, "memo": "rent"}),
            &at,
        );
        let b = compute_record_hash(
            "GENESIS",
            &tenant,
            "u-1",
            &action,
            &json!({"memo": "rent", "amount": 10}),
            &at,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(hash_timestamp(&at), "2026-01-02T03:04:05.000Z");
    }
}

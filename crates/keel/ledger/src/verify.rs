use crate::hash::compute_record_hash;
use keel_storage::{AuditRecord, GENESIS_HASH};
use keel_types::TenantId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainErrorKind {
    /// Stored `prev_hash` does not link to the previous record.
    PrevHashMismatch { expected: String, found: String },
    /// Stored `hash` does not match the recomputed one.
    HashMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    /// Zero-based position within the tenant's chain.
    pub position: usize,
    pub record_id: String,
    #[serde(flatten)]
    pub kind: ChainErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub tenant_id: TenantId,
    pub valid: bool,
    pub total: usize,
    pub errors: Vec<ChainError>,
}

/// Walk `records` (one tenant, insertion order) and report every break.
///
/// Verification continues past the first error. After each record the
/// expected previous hash advances to the record's stored hash, so one
/// tampered record yields errors at its own position without masking later,
/// independent breaks.
pub fn verify_records(tenant_id: &TenantId, records: &[AuditRecord]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut expected_prev = GENESIS_HASH.to_string();

    for (position, record) in records.iter().enumerate() {
        if record.prev_hash != expected_prev {
            errors.push(ChainError {
                position,
                record_id: record.id.clone(),
                kind: ChainErrorKind::PrevHashMismatch {
                    expected: expected_prev.clone(),
                    found: record.prev_hash.clone(),
                },
            });
        }

        let recomputed = compute_record_hash(
            &record.prev_hash,
            &record.tenant_id,
            &record.actor_id,
            &record.action_id,
            &record.payload,
            &record.created_at,
        );
        if recomputed != record.hash {
            errors.push(ChainError {
                position,
                record_id: record.id.clone(),
                kind: ChainErrorKind::HashMismatch {
                    expected: recomputed,
                    found: record.hash.clone(),
                },
            });
        }

        expected_prev = record.hash.clone();
    }

    ChainVerification {
        tenant_id: tenant_id.clone(),
        valid: errors.is_empty(),
        total: records.len(),
        errors,
    }
}

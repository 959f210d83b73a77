//! Keel Ledger - tamper-evident audit trail.
//!
//! Every tenant owns one linear chain of audit records. Each record's hash
//! covers its predecessor's hash, so editing, dropping or reordering any
//! record breaks verification from that point on.
//!
//! Appends for one tenant are serialized in-process by a per-tenant mutex and,
//! in multi-process deployments, by the distributed lock. The store itself
//! rejects an append whose `prev_hash` is not the current tail.
//!
//! A corrupted chain is reported by [`AuditLedger::verify`], never repaired.

#![deny(unsafe_code)]

mod error;
mod hash;
mod ledger;
mod verify;

pub use error::{LedgerError, Result};
pub use hash::{compute_record_hash, hash_timestamp};
pub use keel_storage::GENESIS_HASH;
pub use ledger::{AuditEntry, AuditLedger, FallbackEntry, LedgerOptions};
pub use verify::{verify_records, ChainError, ChainErrorKind, ChainVerification};

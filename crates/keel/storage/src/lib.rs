//! Keel storage abstractions.
//!
//! The kernel reaches persistence only through the narrow traits defined here:
//! - append-only, hash-linked audit records (system of record)
//! - engine records keyed by `(tenant, engine, version)`
//! - API credentials mapped from a hashed secret
//! - a key-value cache with TTLs, windowed counters and set-if-absent
//! - tenant-scoped data access handed to sandboxed handlers
//!
//! Design stance:
//! - PostgreSQL is the transactional source of truth (`postgres` feature).
//! - The in-memory adapter is deterministic and test-friendly; it is not durable.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use model::{
    ApiCredential, AuditAppend, AuditQuery, AuditRecord, EngineRecord, EngineStatus, WindowCount,
    GENESIS_HASH,
};
pub use traits::{
    AuditStore, CredentialStore, EngineStore, KeelStorage, KeyValueStore, TenantDataStore,
};

use crate::model::{
    ApiCredential, AuditAppend, AuditQuery, AuditRecord, EngineRecord, EngineStatus, WindowCount,
};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_types::{EngineId, TenantId};
use serde_json::Value;
use std::time::Duration;

/// Storage interface for append-only audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record to its tenant's chain.
    ///
    /// Fails with `Conflict` when `event.prev_hash` is not the current tail of
    /// the tenant's chain (or `GENESIS` for an empty chain).
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord>;

    /// Latest hash for a tenant, `None` when the tenant has no records.
    async fn tail_hash(&self, tenant_id: &TenantId) -> StorageResult<Option<String>>;

    /// All records of one tenant in insertion order.
    async fn tenant_chain(&self, tenant_id: &TenantId) -> StorageResult<Vec<AuditRecord>>;

    /// Filtered read, newest first.
    async fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditRecord>>;
}

/// Storage interface for engine records.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Insert or replace the row keyed by `(tenant, engine_id, version)`.
    /// `created_at` of an existing row is preserved.
    async fn upsert_engine(&self, record: EngineRecord) -> StorageResult<EngineRecord>;

    /// Every stored version of one engine within one tenant scope.
    async fn engine_versions(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
    ) -> StorageResult<Vec<EngineRecord>>;

    /// Every row within one tenant scope (`None` = platform-wide rows).
    async fn list_engines(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<EngineRecord>>;

    async fn update_engine_status(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
        version: &str,
        status: EngineStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<EngineRecord>;
}

/// Storage interface for API credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put_credential(&self, credential: ApiCredential) -> StorageResult<()>;
    async fn find_credential(&self, secret_hash: &str) -> StorageResult<Option<ApiCredential>>;
    async fn revoke_credential(&self, secret_hash: &str, at: DateTime<Utc>) -> StorageResult<()>;
}

/// Distributed-cache style key-value interface.
///
/// Every operation must be atomic with respect to concurrent callers in all
/// processes sharing the store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Increment-and-read. The expiry is set on the first increment of a
    /// window and is not extended by later increments.
    async fn increment_window(&self, key: &str, window: Duration) -> StorageResult<WindowCount>;

    /// Set `key` only if it holds no live value. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &Value) -> StorageResult<bool>;
}

/// Tenant-partitioned data access used behind the sandbox data proxy.
#[async_trait]
pub trait TenantDataStore: Send + Sync {
    /// Records of `collection` whose fields equal every field of `filter`.
    async fn fetch(
        &self,
        tenant_id: &TenantId,
        collection: &str,
        filter: &Value,
    ) -> StorageResult<Vec<Value>>;

    /// Insert a record and return it as stored.
    async fn insert(
        &self,
        tenant_id: &TenantId,
        collection: &str,
        record: Value,
    ) -> StorageResult<Value>;
}

/// Unified storage bundle used by the kernel assembly.
pub trait KeelStorage:
    AuditStore + EngineStore + CredentialStore + KeyValueStore + TenantDataStore + Send + Sync
{
}

impl<T> KeelStorage for T where
    T: AuditStore + EngineStore + CredentialStore + KeyValueStore + TenantDataStore + Send + Sync
{
}

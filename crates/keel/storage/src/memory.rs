//! In-memory reference implementation for Keel storage traits.
//!
//! This adapter is deterministic and test-friendly. It is not durable:
//! production deployments use the PostgreSQL adapter for audit, engine and
//! credential data. TTLs are measured with `tokio::time::Instant` so tests can
//! drive expiry with a paused clock.

use crate::model::{
    ApiCredential, AuditAppend, AuditQuery, AuditRecord, EngineRecord, EngineStatus, WindowCount,
    GENESIS_HASH,
};
use crate::traits::{AuditStore, CredentialStore, EngineStore, KeyValueStore, TenantDataStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_types::{EngineId, TenantId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

type EngineKey = (Option<TenantId>, EngineId, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Writes between sweeps of expired cache entries.
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Default)]
struct CacheMap {
    entries: HashMap<String, CacheEntry>,
    writes_since_sweep: u64,
}

impl CacheMap {
    // Every write counts toward the next sweep.
    fn note_write(&mut self, now: Instant) {
        self.writes_since_sweep += 1;
        if self.writes_since_sweep >= SWEEP_INTERVAL {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        self.writes_since_sweep = 0;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}

/// In-memory Keel storage adapter.
#[derive(Default)]
pub struct InMemoryStorage {
    audits: RwLock<HashMap<TenantId, Vec<AuditRecord>>>,
    engines: RwLock<HashMap<EngineKey, EngineRecord>>,
    credentials: RwLock<HashMap<String, ApiCredential>>,
    cache: RwLock<CacheMap>,
    data: RwLock<HashMap<(TenantId, String), Vec<Value>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored audit record in place, bypassing the append-only guard.
    ///
    /// Exists so tamper detection can be exercised; `position` is zero-based.
    #[cfg(any(test, feature = "test-util"))]
    pub fn tamper_audit_record(
        &self,
        tenant_id: &TenantId,
        position: usize,
        mutate: impl FnOnce(&mut AuditRecord),
    ) -> StorageResult<()> {
        let mut guard = self
            .audits
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        let record = guard
            .get_mut(tenant_id)
            .and_then(|chain| chain.get_mut(position))
            .ok_or_else(|| StorageError::NotFound(format!("audit record {position}")))?;
        mutate(record);
        Ok(())
    }

    /// Drop expired cache entries now. Writes also sweep every
    /// `SWEEP_INTERVAL` calls, and reads skip expired entries.
    pub fn purge_expired(&self) -> StorageResult<usize> {
        let now = Instant::now();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        Ok(guard.sweep(now))
    }

    /// Number of cache entries held, expired or not.
    #[cfg(any(test, feature = "test-util"))]
    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|guard| guard.entries.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AuditStore for InMemoryStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut guard = self
            .audits
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        let chain = guard.entry(event.tenant_id.clone()).or_default();
        let tail = chain
            .last()
            .map(|record| record.hash.as_str())
            .unwrap_or(GENESIS_HASH);
        if event.prev_hash != tail {
            return Err(StorageError::StaleTail {
                tenant_id: event.tenant_id.clone(),
                expected: tail.to_string(),
                found: event.prev_hash.clone(),
            });
        }

        let record = AuditRecord {
            id: event.id,
            sequence: chain.len() as u64 + 1,
            tenant_id: event.tenant_id,
            actor_id: event.actor_id,
            action_id: event.action_id,
            payload: event.payload,
            prev_hash: event.prev_hash,
            hash: event.hash,
            created_at: event.created_at,
        };
        chain.push(record.clone());
        Ok(record)
    }

    async fn tail_hash(&self, tenant_id: &TenantId) -> StorageResult<Option<String>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard
            .get(tenant_id)
            .and_then(|chain| chain.last())
            .map(|record| record.hash.clone()))
    }

    async fn tenant_chain(&self, tenant_id: &TenantId) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        let mut matched: Vec<AuditRecord> = match query.tenant_id {
            Some(ref tenant) => guard
                .get(tenant)
                .map(|chain| chain.iter().filter(|r| query.matches(r)).cloned().collect())
                .unwrap_or_default(),
            None => guard
                .values()
                .flatten()
                .filter(|r| query.matches(r))
                .cloned()
                .collect(),
        };
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });

        let iter = matched.into_iter().skip(query.offset);
        Ok(if query.limit == 0 {
            iter.collect()
        } else {
            iter.take(query.limit).collect()
        })
    }
}

#[async_trait]
impl EngineStore for InMemoryStorage {
    async fn upsert_engine(&self, mut record: EngineRecord) -> StorageResult<EngineRecord> {
        let mut guard = self
            .engines
            .write()
            .map_err(|_| StorageError::Backend("engines lock poisoned".to_string()))?;
        let key = (
            record.tenant_id.clone(),
            record.engine_id.clone(),
            record.version.clone(),
        );
        if let Some(existing) = guard.get(&key) {
            record.created_at = existing.created_at;
        }
        guard.insert(key, record.clone());
        Ok(record)
    }

    async fn engine_versions(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
    ) -> StorageResult<Vec<EngineRecord>> {
        let guard = self
            .engines
            .read()
            .map_err(|_| StorageError::Backend("engines lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .filter(|r| r.tenant_id.as_ref() == tenant_id && &r.engine_id == engine_id)
            .cloned()
            .collect())
    }

    async fn list_engines(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<EngineRecord>> {
        let guard = self
            .engines
            .read()
            .map_err(|_| StorageError::Backend("engines lock poisoned".to_string()))?;
        let mut rows: Vec<EngineRecord> = guard
            .values()
            .filter(|r| r.tenant_id.as_ref() == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.engine_id
                .as_str()
                .cmp(b.engine_id.as_str())
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(rows)
    }

    async fn update_engine_status(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
        version: &str,
        status: EngineStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<EngineRecord> {
        let mut guard = self
            .engines
            .write()
            .map_err(|_| StorageError::Backend("engines lock poisoned".to_string()))?;
        let key = (tenant_id.cloned(), engine_id.clone(), version.to_string());
        let record = guard
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(format!("engine {engine_id}@{version}")))?;
        record.status = status;
        record.updated_at = updated_at;
        Ok(record.clone())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStorage {
    async fn put_credential(&self, credential: ApiCredential) -> StorageResult<()> {
        let mut guard = self
            .credentials
            .write()
            .map_err(|_| StorageError::Backend("credentials lock poisoned".to_string()))?;
        if guard.contains_key(&credential.secret_hash) {
            return Err(StorageError::Conflict(
                "credential with this secret already exists".to_string(),
            ));
        }
        guard.insert(credential.secret_hash.clone(), credential);
        Ok(())
    }

    async fn find_credential(&self, secret_hash: &str) -> StorageResult<Option<ApiCredential>> {
        let guard = self
            .credentials
            .read()
            .map_err(|_| StorageError::Backend("credentials lock poisoned".to_string()))?;
        Ok(guard.get(secret_hash).cloned())
    }

    async fn revoke_credential(&self, secret_hash: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let mut guard = self
            .credentials
            .write()
            .map_err(|_| StorageError::Backend("credentials lock poisoned".to_string()))?;
        let credential = guard
            .get_mut(secret_hash)
            .ok_or_else(|| StorageError::NotFound("credential".to_string()))?;
        credential.revoked_at.get_or_insert(at);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let now = Instant::now();
        let guard = self
            .cache
            .read()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        Ok(guard
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        guard.note_write(now);
        guard.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        Ok(guard.entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StorageResult<WindowCount> {
        let now = Instant::now();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        guard.note_write(now);

        let entry = guard
            .entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.is_live(now) {
                    *entry = CacheEntry {
                        value: Value::from(0u64),
                        expires_at: Some(now + window),
                    };
                }
            })
            .or_insert_with(|| CacheEntry {
                value: Value::from(0u64),
                expires_at: Some(now + window),
            });

        let current = entry.value.as_u64().ok_or_else(|| {
            StorageError::Corrupt(format!("key {key} does not hold a counter"))
        })?;
        let count = current + 1;
        entry.value = Value::from(count);
        let reset_after = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);

        Ok(WindowCount { count, reset_after })
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<bool> {
        let now = Instant::now();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        if guard.entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        guard.note_write(now);
        guard.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &Value) -> StorageResult<bool> {
        let now = Instant::now();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| StorageError::Backend("cache lock poisoned".to_string()))?;
        let owned = guard
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && &entry.value == expected);
        if owned {
            guard.entries.remove(key);
        }
        Ok(owned)
    }
}

#[async_trait]
impl TenantDataStore for InMemoryStorage {
    async fn fetch(
        &self,
        tenant_id: &TenantId,
        collection: &str,
        filter: &Value,
    ) -> StorageResult<Vec<Value>> {
        let guard = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("data lock poisoned".to_string()))?;
        let Some(rows) = guard.get(&(tenant_id.clone(), collection.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| matches_filter(row, filter))
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        tenant_id: &TenantId,
        collection: &str,
        mut record: Value,
    ) -> StorageResult<Value> {
        let Some(fields) = record.as_object_mut() else {
            return Err(StorageError::InvalidInput(
                "tenant data records must be JSON objects".to_string(),
            ));
        };
        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));

        let mut guard = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("data lock poisoned".to_string()))?;
        guard
            .entry((tenant_id.clone(), collection.to_string()))
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

fn matches_filter(row: &Value, filter: &Value) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(expected) => expected
            .iter()
            .all(|(key, value)| row.get(key) == Some(value)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::ActionId;
    use serde_json::json;

    fn append(tenant: &str, prev: &str, hash: &str) -> AuditAppend {
        AuditAppend {
            id: Uuid::new_v4().to_string(),
            tenant_id: TenantId::new(tenant),
            actor_id: "u-1".into(),
            action_id: ActionId::new("accounting.create_journal_entry"),
            payload: json!({"effect": "allow"}),
            prev_hash: prev.into(),
            hash: hash.into(),
            created_at: Utc::now(),
        }
    }

    fn engine(tenant: Option<&str>, version: &str) -> EngineRecord {
        let now = Utc::now();
        EngineRecord {
            tenant_id: tenant.map(TenantId::new),
            engine_id: EngineId::new("accounting"),
            name: "Accounting".into(),
            version: version.into(),
            manifest: json!({}),
            fingerprint: "f".into(),
            signature: None,
            status: EngineStatus::Installed,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn audit_append_enforces_tail() {
        let store = InMemoryStorage::new();
        let first = store
            .append_audit(append("t-1", GENESIS_HASH, "h1"))
            .await
            .unwrap();
        assert_eq!(first.sequence, 1);

        let stale = store.append_audit(append("t-1", GENESIS_HASH, "h2")).await;
        assert!(matches!(stale, Err(StorageError::StaleTail { .. })));

        let second = store.append_audit(append("t-1", "h1", "h2")).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(
            store.tail_hash(&TenantId::new("t-1")).await.unwrap(),
            Some("h2".to_string())
        );

        // other tenants start their own chain
        store
            .append_audit(append("t-2", GENESIS_HASH, "x1"))
            .await
            .unwrap();
        assert_eq!(store.tenant_chain(&TenantId::new("t-1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn audit_query_is_newest_first_and_paged() {
        let store = InMemoryStorage::new();
        store.append_audit(append("t-1", GENESIS_HASH, "h1")).await.unwrap();
        store.append_audit(append("t-1", "h1", "h2")).await.unwrap();
        store.append_audit(append("t-1", "h2", "h3")).await.unwrap();

        let page = store
            .query_audit(&AuditQuery {
                limit: 2,
                ..AuditQuery::for_tenant("t-1")
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].hash, "h3");
    }

    #[tokio::test]
    async fn engine_upsert_preserves_created_at() {
        let store = InMemoryStorage::new();
        let first = store.upsert_engine(engine(Some("t-1"), "1.0.0")).await.unwrap();
        let mut again = engine(Some("t-1"), "1.0.0");
        again.name = "Renamed".into();
        let second = store.upsert_engine(again).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.name, "Renamed");

        store.upsert_engine(engine(None, "1.0.0")).await.unwrap();
        assert_eq!(store.list_engines(Some(&TenantId::new("t-1"))).await.unwrap().len(), 1);
        assert_eq!(store.list_engines(None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_counter_expires() {
        let store = InMemoryStorage::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.increment_window("k", window).await.unwrap().count, 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = store.increment_window("k", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.reset_after, Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(51)).await;
        assert_eq!(store.increment_window("k", window).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_and_owner_checked_delete() {
        let store = InMemoryStorage::new();
        let ttl = Duration::from_secs(5);
        assert!(store.set_if_absent("lock", json!("a"), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", json!("b"), ttl).await.unwrap());
        assert!(!store.delete_if_equals("lock", &json!("b")).await.unwrap());
        assert!(store.delete_if_equals("lock", &json!("a")).await.unwrap());

        assert!(store.set_if_absent("lock", json!("a"), ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_if_absent("lock", json!("b"), ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_swept_by_later_writes() {
        let store = InMemoryStorage::new();
        let ttl = Duration::from_secs(1);
        for i in 0..SWEEP_INTERVAL {
            assert!(store.set_if_absent(&format!("lock:{i}"), json!("owner"), ttl).await.unwrap());
        }
        assert_eq!(store.cache_len(), SWEEP_INTERVAL as usize);

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..SWEEP_INTERVAL {
            store.increment_window("rate:global", Duration::from_secs(60)).await.unwrap();
        }
        // Only the live counter survives; none of the stale lock keys were touched again.
        assert_eq!(store.cache_len(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[tokio::test]
    async fn tenant_data_is_partitioned() {
        let store = InMemoryStorage::new();
        let t1 = TenantId::new("t-1");
        let t2 = TenantId::new("t-2");
        let stored = store
            .insert(&t1, "journal", json!({"memo": "rent", "amount": 10}))
            .await
            .unwrap();
        assert!(stored.get("id").is_some());

        assert_eq!(store.fetch(&t1, "journal", &Value::Null).await.unwrap().len(), 1);
        assert!(store.fetch(&t2, "journal", &Value::Null).await.unwrap().is_empty());
        assert!(store
            .fetch(&t1, "journal", &json!({"memo": "other"}))
            .await
            .unwrap()
            .is_empty());
        assert!(store.insert(&t1, "journal", json!(5)).await.is_err());
    }
}

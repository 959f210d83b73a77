use crate::error::{LedgerError, Result};
use crate::hash::compute_record_hash;
use crate::verify::{verify_records, ChainVerification};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_guard::DistributedLock;
use keel_storage::{AuditAppend, AuditQuery, AuditRecord, AuditStore, StorageError, GENESIS_HASH};
use keel_types::{ActionId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// What the caller supplies; chaining fields are filled in by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    pub actor_id: String,
    pub action_id: ActionId,
    pub payload: Value,
}

impl AuditEntry {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        actor_id: impl Into<String>,
        action_id: impl Into<ActionId>,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            action_id: action_id.into(),
            payload,
        }
    }
}

/// An entry that could not be persisted. Held in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub entry: AuditEntry,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Upper bound of the fallback buffer; the oldest entry is dropped first.
    pub fallback_capacity: usize,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    /// Attempts per append when the store reports a moved tail.
    pub max_attempts: usize,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            fallback_capacity: 1_000,
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// Per-tenant hash-chained audit ledger.
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    tenant_locks: DashMap<TenantId, Arc<AsyncMutex<()>>>,
    distributed_lock: Option<Arc<DistributedLock>>,
    options: LedgerOptions,
    fallback: Mutex<VecDeque<FallbackEntry>>,
    failures: AtomicU64,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self::with_options(store, LedgerOptions::default())
    }

    pub fn with_options(store: Arc<dyn AuditStore>, options: LedgerOptions) -> Self {
        Self {
            store,
            tenant_locks: DashMap::new(),
            distributed_lock: None,
            options,
            fallback: Mutex::new(VecDeque::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Also serialize appends across processes sharing the lock's store.
    pub fn with_distributed_lock(mut self, lock: Arc<DistributedLock>) -> Self {
        self.distributed_lock = Some(lock);
        self
    }

    /// Append one record to the tenant's chain and return it.
    pub async fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let tenant_lock = self
            .tenant_locks
            .entry(entry.tenant_id.clone())
            .or_default()
            .clone();
        let _serialized = tenant_lock.lock().await;

        match &self.distributed_lock {
            Some(lock) => {
                let key = format!("audit:{}", entry.tenant_id);
                lock.with_lock(&key, self.options.lock_ttl, self.options.lock_wait, || {
                    self.append_serialized(&entry)
                })
                .await?
            }
            None => self.append_serialized(&entry).await,
        }
    }

    async fn append_serialized(&self, entry: &AuditEntry) -> Result<AuditRecord> {
        let attempts = self.options.max_attempts.max(1);
        for attempt in 1..=attempts {
            let prev_hash = self
                .store
                .tail_hash(&entry.tenant_id)
                .await?
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            let created_at = now_millis();
            let hash = compute_record_hash(
                &prev_hash,
                &entry.tenant_id,
                &entry.actor_id,
                &entry.action_id,
                &entry.payload,
                &created_at,
            );

            let append = AuditAppend {
                id: Uuid::new_v4().to_string(),
                tenant_id: entry.tenant_id.clone(),
                actor_id: entry.actor_id.clone(),
                action_id: entry.action_id.clone(),
                payload: entry.payload.clone(),
                prev_hash,
                hash,
                created_at,
            };

            match self.store.append_audit(append).await {
                Ok(record) => {
                    tracing::debug!(
                        tenant_id = %record.tenant_id,
                        sequence = record.sequence,
                        action_id = %record.action_id,
                        "audit record appended"
                    );
                    return Ok(record);
                }
                Err(StorageError::StaleTail { found, .. }) => {
                    tracing::debug!(
                        tenant_id = %entry.tenant_id,
                        attempt,
                        stale_tail = %found,
                        "audit tail moved, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LedgerError::Contended(entry.tenant_id.to_string()))
    }

    /// Append without surfacing failures.
    ///
    /// A failed write is logged, counted and kept in the fallback buffer.
    /// The buffer is lost on restart.
    pub async fn record(&self, entry: AuditEntry) -> Option<AuditRecord> {
        match self.append(entry.clone()).await {
            Ok(record) => Some(record),
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!(
                    "keel_audit_write_failures_total",
                    "tenant_id" => entry.tenant_id.to_string()
                );
                tracing::error!(
                    tenant_id = %entry.tenant_id,
                    action_id = %entry.action_id,
                    error = %err,
                    "audit write failed; entry kept in fallback buffer"
                );
                self.push_fallback(FallbackEntry {
                    entry,
                    error: err.to_string(),
                    failed_at: Utc::now(),
                });
                None
            }
        }
    }

    fn push_fallback(&self, item: FallbackEntry) {
        let capacity = self.options.fallback_capacity;
        if capacity == 0 {
            return;
        }
        let mut buffer = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(item);
    }

    pub fn fallback_entries(&self) -> Vec<FallbackEntry> {
        let buffer = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
        buffer.iter().cloned().collect()
    }

    /// Number of writes that have failed since start.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Retry buffered entries in arrival order. Stops at the first failure,
    /// leaving it and everything after it buffered. Returns how many landed.
    pub async fn replay_fallback(&self) -> Result<usize> {
        let pending: Vec<FallbackEntry> = {
            let mut buffer = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
            buffer.drain(..).collect()
        };

        let mut replayed = 0;
        let mut remaining = pending.into_iter();
        while let Some(item) = remaining.next() {
            if let Err(err) = self.append(item.entry.clone()).await {
                let mut buffer = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
                let mut requeue: VecDeque<FallbackEntry> =
                    std::iter::once(item).chain(remaining).collect();
                requeue.extend(buffer.drain(..));
                *buffer = requeue;
                return Err(err);
            }
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(replayed, "fallback audit entries replayed");
        }
        Ok(replayed)
    }

    /// Recompute the tenant's chain and report every break.
    pub async fn verify(&self, tenant_id: &TenantId) -> Result<ChainVerification> {
        let records = self.store.tenant_chain(tenant_id).await?;
        let report = verify_records(tenant_id, &records);
        if !report.valid {
            tracing::warn!(
                tenant_id = %tenant_id,
                errors = report.errors.len(),
                total = report.total,
                "audit chain verification failed"
            );
        }
        Ok(report)
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        Ok(self.store.query_audit(query).await?)
    }
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::ChainErrorKind;
    use async_trait::async_trait;
    use keel_storage::{InMemoryStorage, KeyValueStore, StorageResult};
    use proptest::prelude::*;
    use serde_json::json;

    fn entry(tenant: &str, n: u64) -> AuditEntry {
        AuditEntry::new(
            tenant,
            "u-1",
            "accounting.create_journal_entry",
            json!({"effect": "allow", "n": n}),
        )
    }

    #[tokio::test]
    async fn first_record_anchors_at_genesis() {
        let ledger = AuditLedger::new(Arc::new(InMemoryStorage::new()));
        let first = ledger.append(entry("t-1", 0)).await.unwrap();
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(first.sequence, 1);

        let second = ledger.append(entry("t-1", 1)).await.unwrap();
        assert_eq!(second.prev_hash, first.hash);
    }

    #[tokio::test]
    async fn appended_chain_verifies() {
        let ledger = AuditLedger::new(Arc::new(InMemoryStorage::new()));
        for n in 0..5 {
            ledger.append(entry("t-1", n)).await.unwrap();
        }
        let report = ledger.verify(&TenantId::new("t-1")).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total, 5);
    }

    #[tokio::test]
    async fn empty_chain_is_valid() {
        let ledger = AuditLedger::new(Arc::new(InMemoryStorage::new()));
        let report = ledger.verify(&TenantId::new("nobody")).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total, 0);
    }

    #[tokio::test]
    async fn payload_edit_is_reported_at_its_position() {
        let store = Arc::new(InMemoryStorage::new());
        let ledger = AuditLedger::new(store.clone());
        for n in 0..4 {
            ledger.append(entry("t-1", n)).await.unwrap();
        }
        let tenant = TenantId::new("t-1");
        store
            .tamper_audit_record(&tenant, 2, |r| r.payload = json!({"effect": "deny"}))
            .unwrap();

        let report = ledger.verify(&tenant).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].position, 2);
        assert!(matches!(report.errors[0].kind, ChainErrorKind::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn rewritten_hash_breaks_the_next_link() {
        let store = Arc::new(InMemoryStorage::new());
        let ledger = AuditLedger::new(store.clone());
        for n in 0..3 {
            ledger.append(entry("t-1", n)).await.unwrap();
        }
        let tenant = TenantId::new("t-1");
        store
            .tamper_audit_record(&tenant, 0, |r| r.hash = "0".repeat(64))
            .unwrap();

        let report = ledger.verify(&tenant).await.unwrap();
        let positions: Vec<usize> = report.errors.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1]);
        assert!(matches!(report.errors[1].kind, ChainErrorKind::PrevHashMismatch { .. }));
    }

    #[tokio::test]
    async fn tenants_chain_independently() {
        let store = Arc::new(InMemoryStorage::new());
        let ledger = AuditLedger::new(store.clone());
        ledger.append(entry("t-a", 0)).await.unwrap();
        let b = ledger.append(entry("t-b", 0)).await.unwrap();
        ledger.append(entry("t-a", 1)).await.unwrap();
        assert_eq!(b.prev_hash, GENESIS_HASH);

        store
            .tamper_audit_record(&TenantId::new("t-a"), 0, |r| r.actor_id = "mallory".into())
            .unwrap();
        assert!(!ledger.verify(&TenantId::new("t-a")).await.unwrap().valid);
        assert!(ledger.verify(&TenantId::new("t-b")).await.unwrap().valid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_stay_linear() {
        let ledger = Arc::new(AuditLedger::new(Arc::new(InMemoryStorage::new())));
        let mut handles = Vec::new();
        for n in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.append(entry("t-1", n)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let report = ledger.verify(&TenantId::new("t-1")).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ledgers_sharing_a_lock_store_stay_linear() {
        let store = Arc::new(InMemoryStorage::new());
        let kv: Arc<dyn KeyValueStore> = store.clone();
        let a = Arc::new(
            AuditLedger::new(store.clone())
                .with_distributed_lock(Arc::new(DistributedLock::new(kv.clone()))),
        );
        let b = Arc::new(
            AuditLedger::new(store.clone()).with_distributed_lock(Arc::new(DistributedLock::new(kv))),
        );

        let mut handles = Vec::new();
        for n in 0..10 {
            let ledger = if n % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move { ledger.append(entry("t-1", n)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(a.verify(&TenantId::new("t-1")).await.unwrap().valid);
    }

    #[tokio::test]
    async fn query_filters_by_effect() {
        let ledger = AuditLedger::new(Arc::new(InMemoryStorage::new()));
        ledger.append(entry("t-1", 0)).await.unwrap();
        ledger
            .append(AuditEntry::new(
                "t-1",
                "u-2",
                "engine.install",
                json!({"effect": "deny"}),
            ))
            .await
            .unwrap();

        let denied = ledger
            .query(&AuditQuery::for_tenant("t-1").with_effect(keel_types::Effect::Deny))
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].actor_id, "u-2");
    }

    /// Fails every append until `healthy` is flipped.
    struct FlakyStore {
        inner: InMemoryStorage,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("connection refused".into()));
            }
            self.inner.append_audit(event).await
        }
        async fn tail_hash(&self, tenant_id: &TenantId) -> StorageResult<Option<String>> {
            self.inner.tail_hash(tenant_id).await
        }
        async fn tenant_chain(&self, tenant_id: &TenantId) -> StorageResult<Vec<AuditRecord>> {
            self.inner.tenant_chain(tenant_id).await
        }
        async fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditRecord>> {
            self.inner.query_audit(query).await
        }
    }

    #[tokio::test]
    async fn failed_writes_land_in_bounded_fallback() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStorage::new(),
            healthy: false.into(),
        });
        let ledger = AuditLedger::with_options(
            store.clone(),
            LedgerOptions {
                fallback_capacity: 2,
                ..LedgerOptions::default()
            },
        );

        for n in 0..3 {
            assert!(ledger.record(entry("t-1", n)).await.is_none());
        }
        assert_eq!(ledger.failure_count(), 3);
        let buffered = ledger.fallback_entries();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].entry.payload["n"], 1);

        store.healthy.store(true, Ordering::SeqCst);
        assert_eq!(ledger.replay_fallback().await.unwrap(), 2);
        assert!(ledger.fallback_entries().is_empty());
        let report = ledger.verify(&TenantId::new("t-1")).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn failed_replay_keeps_entries_buffered() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStorage::new(),
            healthy: false.into(),
        });
        let ledger = AuditLedger::new(store);
        ledger.record(entry("t-1", 0)).await;
        ledger.record(entry("t-1", 1)).await;

        assert!(ledger.replay_fallback().await.is_err());
        let buffered = ledger.fallback_entries();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].entry.payload["n"], 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_single_edit_is_detected(len in 1usize..8, pick in 0usize..8, actor in "[a-z]{1,8}") {
            let position = pick % len;
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let report = runtime.block_on(async {
                let store = Arc::new(InMemoryStorage::new());
                let ledger = AuditLedger::new(store.clone());
                for n in 0..len as u64 {
                    ledger.append(entry("t-1", n)).await.unwrap();
                }
                store
                    .tamper_audit_record(&TenantId::new("t-1"), position, |r| {
                        r.actor_id = format!("x-{actor}");
                    })
                    .unwrap();
                ledger.verify(&TenantId::new("t-1")).await.unwrap()
            });
            prop_assert!(!report.valid);
            prop_assert_eq!(report.errors[0].position, position);
        }
    }
}

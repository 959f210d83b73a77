//! PostgreSQL adapter for Keel storage.
//!
//! Transactional source-of-truth backend. Audit appends take a per-tenant
//! advisory transaction lock and re-check the chain tail inside the
//! transaction, so concurrent writers in other processes cannot fork a chain.
//! The key-value and tenant-data traits are backed by plain tables so a single
//! database can serve a multi-process deployment.

use crate::model::{
    ApiCredential, AuditAppend, AuditQuery, AuditRecord, EngineRecord, EngineStatus, WindowCount,
    GENESIS_HASH,
};
use crate::traits::{AuditStore, CredentialStore, EngineStore, KeyValueStore, TenantDataStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_types::{ActionId, EngineId, RoleId, TenantId};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS keel_audit_records (
                id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL,
                tenant_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                action_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, sequence)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keel_engines (
                tenant_key TEXT NOT NULL,
                engine_id TEXT NOT NULL,
                version TEXT NOT NULL,
                name TEXT NOT NULL,
                manifest JSONB NOT NULL,
                fingerprint TEXT NOT NULL,
                signature TEXT,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_key, engine_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keel_api_credentials (
                secret_hash TEXT PRIMARY KEY,
                tenant_id TEXT,
                subject_id TEXT NOT NULL,
                scopes JSONB NOT NULL,
                roles JSONB NOT NULL,
                expires_at TIMESTAMPTZ,
                revoked_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keel_kv (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keel_tenant_data (
                tenant_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                record JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (tenant_id, collection, record_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS keel_audit_records_created_idx ON keel_audit_records (created_at DESC)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(event.tenant_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM keel_audit_records WHERE tenant_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(event.tenant_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, tail) = match last {
            Some(row) => {
                let seq: i64 = row
                    .try_get("sequence")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let hash: String = row
                    .try_get("hash")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                (seq + 1, hash)
            }
            None => (1_i64, GENESIS_HASH.to_string()),
        };

        if event.prev_hash != tail {
            return Err(StorageError::StaleTail {
                tenant_id: event.tenant_id.clone(),
                expected: tail.to_string(),
                found: event.prev_hash.clone(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO keel_audit_records
                (id, sequence, tenant_id, actor_id, action_id, payload, prev_hash, hash, created_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id.clone())
        .bind(sequence)
        .bind(event.tenant_id.as_str())
        .bind(event.actor_id.clone())
        .bind(event.action_id.as_str())
        .bind(event.payload.clone())
        .bind(event.prev_hash.clone())
        .bind(event.hash.clone())
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(AuditRecord {
            id: event.id,
            sequence: sequence as u64,
            tenant_id: event.tenant_id,
            actor_id: event.actor_id,
            action_id: event.action_id,
            payload: event.payload,
            prev_hash: event.prev_hash,
            hash: event.hash,
            created_at: event.created_at,
        })
    }

    async fn tail_hash(&self, tenant_id: &TenantId) -> StorageResult<Option<String>> {
        let row = sqlx::query(
            "SELECT hash FROM keel_audit_records WHERE tenant_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| {
            row.try_get("hash")
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .transpose()
    }

    async fn tenant_chain(&self, tenant_id: &TenantId) -> StorageResult<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, tenant_id, actor_id, action_id, payload, prev_hash, hash, created_at
              FROM keel_audit_records
             WHERE tenant_id = $1
             ORDER BY sequence ASC
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditRecord>> {
        let limit = if query.limit == 0 {
            None
        } else {
            Some(to_i64(query.limit)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, tenant_id, actor_id, action_id, payload, prev_hash, hash, created_at
              FROM keel_audit_records
             WHERE ($1::TEXT IS NULL OR tenant_id = $1)
               AND ($2::TEXT IS NULL OR action_id = $2)
               AND ($3::TEXT IS NULL OR actor_id = $3)
               AND ($4::TEXT IS NULL OR payload->>'effect' = $4)
               AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
             ORDER BY created_at DESC, sequence DESC
             LIMIT $6 OFFSET $7
            "#,
        )
        .bind(query.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(query.action_id.as_ref().map(|a| a.as_str().to_string()))
        .bind(query.principal_id.clone())
        .bind(query.effect.clone())
        .bind(query.since)
        .bind(limit)
        .bind(to_i64(query.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(audit_row_to_record).collect()
    }
}

#[async_trait]
impl EngineStore for PostgresStorage {
    async fn upsert_engine(&self, record: EngineRecord) -> StorageResult<EngineRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO keel_engines
                (tenant_key, engine_id, version, name, manifest, fingerprint, signature, status, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant_key, engine_id, version) DO UPDATE SET
                name = EXCLUDED.name,
                manifest = EXCLUDED.manifest,
                fingerprint = EXCLUDED.fingerprint,
                signature = EXCLUDED.signature,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            RETURNING created_at
            "#,
        )
        .bind(tenant_key(record.tenant_id.as_ref()))
        .bind(record.engine_id.as_str())
        .bind(record.version.clone())
        .bind(record.name.clone())
        .bind(record.manifest.clone())
        .bind(record.fingerprint.clone())
        .bind(record.signature.clone())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(EngineRecord {
            created_at,
            ..record
        })
    }

    async fn engine_versions(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
    ) -> StorageResult<Vec<EngineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_key, engine_id, version, name, manifest, fingerprint, signature, status, created_at, updated_at
              FROM keel_engines
             WHERE tenant_key = $1 AND engine_id = $2
            "#,
        )
        .bind(tenant_key(tenant_id))
        .bind(engine_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(engine_row_to_record).collect()
    }

    async fn list_engines(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<EngineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_key, engine_id, version, name, manifest, fingerprint, signature, status, created_at, updated_at
              FROM keel_engines
             WHERE tenant_key = $1
             ORDER BY engine_id ASC, version ASC
            "#,
        )
        .bind(tenant_key(tenant_id))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(engine_row_to_record).collect()
    }

    async fn update_engine_status(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
        version: &str,
        status: EngineStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<EngineRecord> {
        let row = sqlx::query(
            r#"
            UPDATE keel_engines
               SET status = $4, updated_at = $5
             WHERE tenant_key = $1 AND engine_id = $2 AND version = $3
            RETURNING tenant_key, engine_id, version, name, manifest, fingerprint, signature, status, created_at, updated_at
            "#,
        )
        .bind(tenant_key(tenant_id))
        .bind(engine_id.as_str())
        .bind(version)
        .bind(status.as_str())
        .bind(updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => engine_row_to_record(row),
            None => Err(StorageError::NotFound(format!(
                "engine {engine_id}@{version}"
            ))),
        }
    }
}

#[async_trait]
impl CredentialStore for PostgresStorage {
    async fn put_credential(&self, credential: ApiCredential) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_api_credentials
                (secret_hash, tenant_id, subject_id, scopes, roles, expires_at, revoked_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(credential.secret_hash.clone())
        .bind(credential.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(credential.subject_id.clone())
        .bind(serde_json::to_value(&credential.scopes)?)
        .bind(serde_json::to_value(&credential.roles)?)
        .bind(credential.expires_at)
        .bind(credential.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn find_credential(&self, secret_hash: &str) -> StorageResult<Option<ApiCredential>> {
        let row = sqlx::query(
            r#"
            SELECT secret_hash, tenant_id, subject_id, scopes, roles, expires_at, revoked_at
              FROM keel_api_credentials
             WHERE secret_hash = $1
            "#,
        )
        .bind(secret_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(credential_row_to_record).transpose()
    }

    async fn revoke_credential(&self, secret_hash: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE keel_api_credentials SET revoked_at = COALESCE(revoked_at, $2) WHERE secret_hash = $1",
        )
        .bind(secret_hash)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("credential".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PostgresStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let row = sqlx::query(
            "SELECT value FROM keel_kv WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| {
            row.try_get("value")
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_kv (key, value, expires_at)
            VALUES ($1, $2, CASE WHEN $3::FLOAT8 IS NULL THEN NULL ELSE now() + make_interval(secs => $3) END)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(|ttl| ttl.as_secs_f64()))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            "DELETE FROM keel_kv WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StorageResult<WindowCount> {
        let row = sqlx::query(
            r#"
            INSERT INTO keel_kv (key, value, expires_at)
            VALUES ($1, '1'::JSONB, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN keel_kv.expires_at IS NOT NULL AND keel_kv.expires_at <= now() THEN '1'::JSONB
                    ELSE to_jsonb((keel_kv.value #>> '{}')::BIGINT + 1)
                END,
                expires_at = CASE
                    WHEN keel_kv.expires_at IS NOT NULL AND keel_kv.expires_at <= now() THEN EXCLUDED.expires_at
                    ELSE keel_kv.expires_at
                END
            RETURNING
                (value #>> '{}')::BIGINT AS count,
                GREATEST(0, EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::BIGINT AS reset_ms
            "#,
        )
        .bind(key)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = row
            .try_get("count")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let reset_ms: Option<i64> = row
            .try_get("reset_ms")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(WindowCount {
            count: u64::try_from(count).unwrap_or(0),
            reset_after: reset_ms
                .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
                .unwrap_or(window),
        })
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO keel_kv (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE keel_kv.expires_at IS NOT NULL AND keel_kv.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &Value) -> StorageResult<bool> {
        let result = sqlx::query(
            "DELETE FROM keel_kv WHERE key = $1 AND value = $2 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(expected.clone())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TenantDataStore for PostgresStorage {
    async fn fetch(
        &self,
        tenant_id: &TenantId,
        collection: &str,
        filter: &Value,
    ) -> StorageResult<Vec<Value>> {
        let filter = match filter {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => filter.clone(),
            _ => {
                return Err(StorageError::InvalidInput(
                    "filter must be a JSON object".to_string(),
                ))
            }
        };
        let rows = sqlx::query(
            r#"
            SELECT record FROM keel_tenant_data
             WHERE tenant_id = $1 AND collection = $2 AND record @> $3
             ORDER BY inserted_at ASC
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(collection)
        .bind(filter)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                row.try_get("record")
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
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
        let record_id = match fields.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                fields.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        sqlx::query(
            "INSERT INTO keel_tenant_data (tenant_id, collection, record_id, record) VALUES ($1, $2, $3, $4)",
        )
        .bind(tenant_id.as_str())
        .bind(collection)
        .bind(record_id)
        .bind(record.clone())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(record)
    }
}

fn tenant_key(tenant_id: Option<&TenantId>) -> String {
    tenant_id.map(|t| t.as_str().to_string()).unwrap_or_default()
}

fn audit_row_to_record(row: PgRow) -> StorageResult<AuditRecord> {
    let tenant_id: String = row
        .try_get("tenant_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let action_id: String = row
        .try_get("action_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(AuditRecord {
        id: row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        sequence: row
            .try_get::<i64, _>("sequence")
            .map_err(|e| StorageError::Backend(e.to_string()))? as u64,
        tenant_id: TenantId::new(tenant_id),
        actor_id: row
            .try_get("actor_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        action_id: ActionId::new(action_id),
        payload: row
            .try_get("payload")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        prev_hash: row
            .try_get("prev_hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        hash: row
            .try_get("hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn engine_row_to_record(row: PgRow) -> StorageResult<EngineRecord> {
    let tenant_key: String = row
        .try_get("tenant_key")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let engine_id: String = row
        .try_get("engine_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(EngineRecord {
        tenant_id: (!tenant_key.is_empty()).then(|| TenantId::new(tenant_key)),
        engine_id: EngineId::new(engine_id),
        name: row
            .try_get("name")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        version: row
            .try_get("version")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        manifest: row
            .try_get("manifest")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        fingerprint: row
            .try_get("fingerprint")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        signature: row
            .try_get("signature")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        status: EngineStatus::parse(&status).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown engine status {status}"))
        })?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn credential_row_to_record(row: PgRow) -> StorageResult<ApiCredential> {
    let tenant_id: Option<String> = row
        .try_get("tenant_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let scopes: Value = row
        .try_get("scopes")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let roles: Value = row
        .try_get("roles")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(ApiCredential {
        secret_hash: row
            .try_get("secret_hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        tenant_id: tenant_id.map(TenantId::new),
        subject_id: row
            .try_get("subject_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        scopes: serde_json::from_value(scopes)?,
        roles: serde_json::from_value::<Vec<RoleId>>(roles)?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        revoked_at: row
            .try_get("revoked_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

use crate::error::{DependencyIssue, RegistryError, Result};
use crate::manifest::{manifest_schema, EngineManifest};
use crate::schema::CompiledSchema;
use chrono::Utc;
use keel_guard::DistributedLock;
use keel_policy::{PolicyEngine, PolicyError, PolicyRequest};
use keel_storage::{EngineRecord, EngineStatus, EngineStore, KeyValueStore};
use keel_trust::{ManifestFingerprint, SignedPayload, SigningAuthority};
use keel_types::{ActionContract, ActionId, EngineId, Principal, TenantId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Engine installation is itself a governed action.
pub const ENGINE_INSTALL_ACTION: &str = "engine.install";

const CACHE_PREFIX: &str = "keel:registry:";
const GLOBAL_SCOPE: &str = "_global";

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_secs(2),
        }
    }
}

pub struct EngineRegistry {
    engines: Arc<dyn EngineStore>,
    cache: Arc<dyn KeyValueStore>,
    lock: Arc<DistributedLock>,
    authority: Arc<SigningAuthority>,
    policy: PolicyEngine,
    manifest_schema: CompiledSchema,
    options: RegistryOptions,
}

impl EngineRegistry {
    pub fn new(
        engines: Arc<dyn EngineStore>,
        cache: Arc<dyn KeyValueStore>,
        lock: Arc<DistributedLock>,
        authority: Arc<SigningAuthority>,
        options: RegistryOptions,
    ) -> Result<Self> {
        Ok(Self {
            engines,
            cache,
            lock,
            authority,
            policy: PolicyEngine::new(),
            manifest_schema: CompiledSchema::compile(&manifest_schema())?,
            options,
        })
    }

    /// Validate, verify and store a manifest. `tenant_id = None` publishes a
    /// platform-wide engine.
    ///
    /// New versions start `installed`. Re-submitting an identical manifest for
    /// a published version is a no-op apart from `updated_at`; a different
    /// manifest under the same version is rejected.
    pub async fn register(
        &self,
        tenant_id: Option<&TenantId>,
        manifest: Value,
        signature: Option<&SignedPayload>,
    ) -> Result<EngineRecord> {
        let violations = self.manifest_schema.violations(&manifest);
        if !violations.is_empty() {
            return Err(RegistryError::InvalidManifest(violations));
        }
        let parsed = EngineManifest::from_value(&manifest)?;
        let fingerprint = ManifestFingerprint::compute(&manifest);

        if let Some(signed) = signature {
            if signed.payload != fingerprint {
                return Err(RegistryError::SignatureInvalid(
                    "signature does not cover this manifest".to_string(),
                ));
            }
            if !self.authority.verify(signed, None) {
                return Err(RegistryError::SignatureInvalid(format!(
                    "unknown or invalid key {}",
                    signed.key_fingerprint
                )));
            }
        }

        let engine_id = parsed.engine_id.clone();
        let lock_key = registry_lock_key(tenant_id, &engine_id);
        let record = self
            .lock
            .with_lock(&lock_key, self.options.lock_ttl, self.options.lock_wait, || async {
                let existing = self
                    .engines
                    .engine_versions(tenant_id, &engine_id)
                    .await?
                    .into_iter()
                    .find(|r| r.version == parsed.version);
                let now = Utc::now();
                let record = match existing {
                    Some(current) if current.fingerprint != fingerprint => {
                        return Err(RegistryError::VersionConflict {
                            engine_id: engine_id.clone(),
                            version: parsed.version.clone(),
                        });
                    }
                    Some(current) => EngineRecord {
                        updated_at: now,
                        signature: signature.map(|s| s.signature.clone()).or(current.signature.clone()),
                        ..current
                    },
                    None => EngineRecord {
                        tenant_id: tenant_id.cloned(),
                        engine_id: engine_id.clone(),
                        name: parsed.name.clone(),
                        version: parsed.version.clone(),
                        manifest,
                        fingerprint: fingerprint.clone(),
                        signature: signature.map(|s| s.signature.clone()),
                        status: EngineStatus::Installed,
                        created_at: now,
                        updated_at: now,
                    },
                };
                let stored = self.engines.upsert_engine(record).await?;
                self.invalidate(tenant_id, &engine_id).await;
                Ok::<_, RegistryError>(stored)
            })
            .await??;

        tracing::info!(
            tenant_id = scope_name(tenant_id),
            engine_id = %record.engine_id,
            version = %record.version,
            fingerprint = %record.fingerprint,
            signed = record.signature.is_some(),
            "engine registered"
        );
        Ok(record)
    }

    /// `register` behind a policy check for `engine.install`.
    pub async fn register_for_principal(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        manifest: Value,
        signature: Option<&SignedPayload>,
    ) -> Result<EngineRecord> {
        let request = PolicyRequest::new(principal.clone(), ENGINE_INSTALL_ACTION, tenant_id.clone());
        self.policy.enforce(&request).map_err(|err| match err {
            PolicyError::Denied(decision) => {
                tracing::info!(
                    principal_id = %principal.id,
                    tenant_id = %tenant_id,
                    reason = %decision.reason,
                    "engine installation denied"
                );
                RegistryError::Denied(decision)
            }
        })?;
        self.register(Some(tenant_id), manifest, signature).await
    }

    /// Newest non-deprecated version of one engine in one scope. Cache first.
    pub async fn engine(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
    ) -> Result<Option<EngineRecord>> {
        let key = engine_cache_key(tenant_id, engine_id);
        if let Some(record) = self.cached::<EngineRecord>(&key).await {
            return Ok(Some(record));
        }
        let versions = self.engines.engine_versions(tenant_id, engine_id).await?;
        let newest = newest_live(versions);
        if let Some(ref record) = newest {
            self.fill(&key, record).await;
        }
        Ok(newest)
    }

    /// Newest non-deprecated version of every engine in one scope, by engine id.
    pub async fn list_by_tenant(&self, tenant_id: Option<&TenantId>) -> Result<Vec<EngineRecord>> {
        let key = list_cache_key(tenant_id);
        if let Some(list) = self.cached::<Vec<EngineRecord>>(&key).await {
            return Ok(list);
        }
        let rows = self.engines.list_engines(tenant_id).await?;
        let mut by_engine: BTreeMap<EngineId, Vec<EngineRecord>> = BTreeMap::new();
        for row in rows {
            by_engine.entry(row.engine_id.clone()).or_default().push(row);
        }
        let list: Vec<EngineRecord> = by_engine.into_values().filter_map(newest_live).collect();
        self.fill(&key, &list).await;
        Ok(list)
    }

    /// Enabled engines visible to a tenant. A tenant engine shadows a
    /// platform engine with the same id.
    pub async fn list_enabled(&self, tenant_id: &TenantId) -> Result<Vec<EngineRecord>> {
        let mut visible: BTreeMap<EngineId, EngineRecord> = BTreeMap::new();
        for record in self.list_by_tenant(None).await? {
            visible.insert(record.engine_id.clone(), record);
        }
        for record in self.list_by_tenant(Some(tenant_id)).await? {
            visible.insert(record.engine_id.clone(), record);
        }
        Ok(visible
            .into_values()
            .filter(|r| r.status == EngineStatus::Enabled)
            .collect())
    }

    /// Every declared dependency must resolve, tenant scope first, to an
    /// installed or enabled engine.
    pub async fn validate_dependencies(
        &self,
        tenant_id: Option<&TenantId>,
        manifest: &EngineManifest,
    ) -> Result<()> {
        let mut issues = Vec::new();
        for dependency in &manifest.dependencies {
            match self.resolve(tenant_id, dependency).await? {
                None => issues.push(DependencyIssue::Missing {
                    dependency: dependency.clone(),
                }),
                Some(record) if !record.status.is_active() => issues.push(DependencyIssue::Inactive {
                    dependency: dependency.clone(),
                    status: record.status.as_str().to_string(),
                }),
                Some(_) => {}
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Dependencies {
                engine_id: manifest.engine_id.clone(),
                issues,
            })
        }
    }

    /// Move one version to a new status. Enabling checks dependencies first.
    pub async fn set_status(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
        version: &str,
        status: EngineStatus,
    ) -> Result<EngineRecord> {
        if status == EngineStatus::Enabled {
            let record = self
                .engines
                .engine_versions(tenant_id, engine_id)
                .await?
                .into_iter()
                .find(|r| r.version == version)
                .ok_or_else(|| RegistryError::NotFound(format!("{engine_id}@{version}")))?;
            let manifest = EngineManifest::from_value(&record.manifest)?;
            self.validate_dependencies(tenant_id, &manifest).await?;
        }

        let lock_key = registry_lock_key(tenant_id, engine_id);
        let record = self
            .lock
            .with_lock(&lock_key, self.options.lock_ttl, self.options.lock_wait, || async {
                let updated = self
                    .engines
                    .update_engine_status(tenant_id, engine_id, version, status, Utc::now())
                    .await
                    .map_err(|err| match err {
                        keel_storage::StorageError::NotFound(what) => RegistryError::NotFound(what),
                        other => other.into(),
                    })?;
                self.invalidate(tenant_id, engine_id).await;
                Ok::<_, RegistryError>(updated)
            })
            .await??;

        tracing::info!(
            tenant_id = scope_name(tenant_id),
            engine_id = %engine_id,
            version,
            status = status.as_str(),
            "engine status changed"
        );
        Ok(record)
    }

    /// Contract of `action_id` served by `engine_id`, as visible to a tenant.
    ///
    /// An active tenant engine shadows the platform engine with the same id.
    pub async fn contract(
        &self,
        tenant_id: &TenantId,
        engine_id: &EngineId,
        action_id: &ActionId,
    ) -> Result<Option<ActionContract>> {
        let Some(record) = self.resolve(Some(tenant_id), engine_id).await? else {
            return Ok(None);
        };
        if !record.status.is_active() {
            return Ok(None);
        }
        let manifest = EngineManifest::from_value(&record.manifest)?;
        Ok(manifest.contract(action_id))
    }

    async fn resolve(
        &self,
        tenant_id: Option<&TenantId>,
        engine_id: &EngineId,
    ) -> Result<Option<EngineRecord>> {
        if let Some(tenant) = tenant_id {
            if let Some(record) = self.engine(Some(tenant), engine_id).await? {
                return Ok(Some(record));
            }
        }
        self.engine(None, engine_id).await
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "registry cache read failed");
                None
            }
        }
    }

    async fn fill<T: serde::Serialize>(&self, key: &str, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        if let Err(err) = self.cache.set(key, value, Some(self.options.cache_ttl)).await {
            tracing::warn!(key, error = %err, "registry cache fill failed");
        }
    }

    async fn invalidate(&self, tenant_id: Option<&TenantId>, engine_id: &EngineId) {
        for key in [engine_cache_key(tenant_id, engine_id), list_cache_key(tenant_id)] {
            if let Err(err) = self.cache.delete(&key).await {
                tracing::warn!(key, error = %err, "registry cache invalidation failed");
            }
        }
    }
}

// Highest semver among non-deprecated rows; unparsable versions rank lowest.
fn newest_live(records: Vec<EngineRecord>) -> Option<EngineRecord> {
    records
        .into_iter()
        .filter(|r| r.status != EngineStatus::Deprecated)
        .max_by(|a, b| {
            let va = semver::Version::parse(&a.version).ok();
            let vb = semver::Version::parse(&b.version).ok();
            va.cmp(&vb).then(a.updated_at.cmp(&b.updated_at))
        })
}

fn scope_name(tenant_id: Option<&TenantId>) -> &str {
    tenant_id.map_or(GLOBAL_SCOPE, |t| t.as_str())
}

fn engine_cache_key(tenant_id: Option<&TenantId>, engine_id: &EngineId) -> String {
    format!("{CACHE_PREFIX}{}:engine:{engine_id}", scope_name(tenant_id))
}

fn list_cache_key(tenant_id: Option<&TenantId>) -> String {
    format!("{CACHE_PREFIX}{}:list", scope_name(tenant_id))
}

fn registry_lock_key(tenant_id: Option<&TenantId>, engine_id: &EngineId) -> String {
    format!("registry:{}:{engine_id}", scope_name(tenant_id))
}

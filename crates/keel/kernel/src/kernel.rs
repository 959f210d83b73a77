use crate::config::{KernelConfig, StorageConfig};
use crate::error::{KernelError, Result};
use chrono::{DateTime, Utc};
use keel_dispatch::{
    ActionHandler, ActionOutcome, ActionRequest, DispatchError, Dispatcher, DispatcherConfig,
    DispatcherDeps, ErrorBody, EventSink, FacadeMetrics, HandlerRegistry, MetricsSink,
    TracingEventSink,
};
use keel_guard::{BreakerSnapshot, ResourceGuard};
use keel_ledger::{AuditLedger, ChainVerification, FallbackEntry, LedgerOptions};
use keel_policy::{PolicyEngine, PolicyError, PolicyRequest};
use keel_registry::{EngineRegistry, RegistryError, RegistryOptions};
use keel_storage::{
    ApiCredential, AuditQuery, AuditRecord, CredentialStore, EngineRecord, EngineStatus,
    InMemoryStorage, KeelStorage, KeyValueStore,
};
use keel_trust::{
    ChainRequest, ExecutionToken, ExecutionTokenManager, IdentityChain, IdentityChainManager,
    ManifestFingerprint, SignedPayload, SigningAuthority, TrustVerifier,
};
use keel_types::{
    AccessType, ActionId, AuthMethod, Effect, EngineId, PermissionId, PolicyDecision, Principal,
    RoleId, TenantId,
};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Policy action gating credential issue and revocation.
pub const CREDENTIAL_MANAGE_ACTION: &str = "tenant.manage_credentials";
/// Policy action gating engine status changes.
pub const ENGINE_STATUS_ACTION: &str = "engine.set_status";
/// Policy action gating audit queries.
pub const AUDIT_QUERY_ACTION: &str = "audit.query";
/// Policy action gating chain verification.
pub const AUDIT_VERIFY_ACTION: &str = "audit.verify";

const SECRET_PREFIX: &str = "keel_";

/// SHA-256 hex of an API secret. Only this form is ever stored.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// What a new API credential grants.
#[derive(Debug, Clone, Default)]
pub struct CredentialGrant {
    /// `None` for platform credentials, which only the kernel may issue.
    pub tenant_id: Option<TenantId>,
    pub subject_id: String,
    pub roles: Vec<RoleId>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly issued credential. The secret is not recoverable afterwards.
pub struct IssuedCredential {
    pub secret: String,
    pub credential: ApiCredential,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("secret", &"<redacted>")
            .field("credential", &self.credential)
            .finish()
    }
}

/// A failed invocation as handed back to the caller.
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub error: DispatchError,
    pub body: ErrorBody,
}

impl InvocationFailure {
    fn new(error: DispatchError, action_id: &ActionId) -> Self {
        let body = error.body(action_id);
        Self { error, body }
    }

    pub fn status_code(&self) -> u16 {
        self.error.status_code()
    }
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.body.message, self.status_code())
    }
}

impl std::error::Error for InvocationFailure {}

/// Assembles a [`Kernel`] over one storage bundle.
pub struct KernelBuilder {
    config: KernelConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    events: Option<Arc<dyn EventSink>>,
    authority: Option<Arc<SigningAuthority>>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            metrics: None,
            events: None,
            authority: None,
        }
    }

    /// Defaults to the `metrics` facade.
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Defaults to structured log lines.
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Share a signing authority instead of generating a fresh key pair.
    pub fn authority(mut self, authority: Arc<SigningAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn build<S>(self, storage: Arc<S>) -> Result<Kernel>
    where
        S: KeelStorage + 'static,
    {
        let config = self.config;
        config.validate()?;

        let cache: Arc<dyn KeyValueStore> = storage.clone();
        let guard = Arc::new(ResourceGuard::new(
            cache.clone(),
            config.rate_limits.clone(),
            config.circuit_breaker.clone(),
        )?);

        let authority = match self.authority {
            Some(authority) => authority,
            None => Arc::new(SigningAuthority::new(config.trust.token_ttl())?),
        };
        let verifier = Arc::new(TrustVerifier::new(
            Arc::new(IdentityChainManager::new(config.trust.chain_capacity)),
            Arc::new(ExecutionTokenManager::with_limits(
                authority.clone(),
                config.trust.token_ttl(),
                config.trust.nonce_capacity,
            )),
        ));

        let mut ledger = AuditLedger::with_options(
            storage.clone(),
            LedgerOptions {
                fallback_capacity: config.ledger.fallback_capacity,
                lock_ttl: config.ledger.lock_ttl(),
                ..LedgerOptions::default()
            },
        );
        if config.ledger.distributed_lock {
            ledger = ledger.with_distributed_lock(guard.lock().clone());
        }
        let ledger = Arc::new(ledger);

        let registry = Arc::new(EngineRegistry::new(
            storage.clone(),
            cache.clone(),
            guard.lock().clone(),
            authority.clone(),
            RegistryOptions {
                cache_ttl: config.registry.cache_ttl(),
                ..RegistryOptions::default()
            },
        )?);

        let handlers = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(
            DispatcherDeps {
                contracts: registry.clone(),
                guard: guard.clone(),
                ledger: ledger.clone(),
                handlers: handlers.clone(),
                data: storage.clone(),
                cache,
                events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>),
                metrics: self.metrics.unwrap_or_else(|| Arc::new(FacadeMetrics) as Arc<dyn MetricsSink>),
                trust: Some(verifier.clone()),
            },
            DispatcherConfig {
                execution_timeout: config.dispatcher.execution_timeout(),
                require_trust: config.trust.require_token,
            },
        );

        tracing::info!(
            storage = storage_kind(&config.storage),
            distributed_lock = config.ledger.distributed_lock,
            require_token = config.trust.require_token,
            key_fingerprint = authority.fingerprint().as_deref().unwrap_or("none"),
            "keel kernel assembled"
        );

        Ok(Kernel {
            config,
            credentials: storage,
            authority,
            verifier,
            guard,
            ledger,
            registry,
            handlers,
            dispatcher,
            policy: PolicyEngine::new(),
            shut_down: AtomicBool::new(false),
        })
    }
}

fn storage_kind(storage: &StorageConfig) -> &'static str {
    match storage {
        StorageConfig::Memory => "memory",
        StorageConfig::Postgres { .. } => "postgres",
    }
}

/// The governance kernel: every side-effecting action goes through here.
pub struct Kernel {
    config: KernelConfig,
    credentials: Arc<dyn CredentialStore>,
    authority: Arc<SigningAuthority>,
    verifier: Arc<TrustVerifier>,
    guard: Arc<ResourceGuard>,
    ledger: Arc<AuditLedger>,
    registry: Arc<EngineRegistry>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    policy: PolicyEngine,
    shut_down: AtomicBool,
}

impl Kernel {
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// Build a kernel over the storage the configuration selects.
    pub async fn connect(config: KernelConfig) -> Result<Self> {
        match config.storage.clone() {
            StorageConfig::Memory => {
                KernelBuilder::new(config).build(Arc::new(InMemoryStorage::new()))
            }
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                let store = keel_storage::postgres::PostgresStorage::connect_with_options(
                    &url,
                    max_connections,
                    connect_timeout_secs,
                )
                .await?;
                KernelBuilder::new(config).build(Arc::new(store))
            }
            #[cfg(not(feature = "postgres"))]
            StorageConfig::Postgres { .. } => Err(KernelError::InvalidConfig(
                "postgres storage requires the `postgres` feature".to_string(),
            )),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn authority(&self) -> &Arc<SigningAuthority> {
        &self.authority
    }

    pub fn verifier(&self) -> &Arc<TrustVerifier> {
        &self.verifier
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }
        Ok(())
    }

    fn authorize(
        &self,
        principal: &Principal,
        action_id: &str,
        tenant_id: &TenantId,
        access_type: Option<AccessType>,
    ) -> Result<PolicyDecision> {
        let mut request = PolicyRequest::new(principal.clone(), action_id, tenant_id.clone());
        if let Some(access) = access_type {
            request = request.with_access_type(access);
        }
        self.policy.enforce(&request).map_err(|err| match err {
            PolicyError::Denied(decision) => KernelError::Forbidden(decision),
        })
    }

    // ----- credentials -----

    /// Resolve an API secret into a principal.
    pub async fn authenticate(&self, secret: &str) -> Result<Principal> {
        self.ensure_running()?;
        let Some(credential) = self.credentials.find_credential(&hash_secret(secret)).await? else {
            tracing::info!("authentication failed: unknown credential");
            return Err(KernelError::Unauthenticated("unknown credential".to_string()));
        };
        if !credential.is_usable_at(Utc::now()) {
            tracing::info!(
                subject_id = %credential.subject_id,
                revoked = credential.revoked_at.is_some(),
                "authentication failed: credential not usable"
            );
            return Err(KernelError::Unauthenticated(
                "credential revoked or expired".to_string(),
            ));
        }

        let mut principal = Principal::new(credential.subject_id, AuthMethod::ApiKey);
        if let Some(tenant_id) = credential.tenant_id {
            principal = principal.in_tenant(tenant_id);
        }
        for role in credential.roles {
            principal = principal.with_role(role);
        }
        for scope in credential.scopes {
            principal = principal.with_scope(scope);
        }
        tracing::debug!(principal_id = %principal.id, "principal authenticated");
        Ok(principal)
    }

    pub async fn issue_api_credential(
        &self,
        issuer: &Principal,
        grant: CredentialGrant,
    ) -> Result<IssuedCredential> {
        self.ensure_running()?;
        if grant.subject_id.is_empty() {
            return Err(KernelError::InvalidRequest("subject_id is empty".to_string()));
        }
        self.authorize_credential_scope(issuer, grant.tenant_id.as_ref())?;
        if let Some(role) = grant
            .roles
            .iter()
            .find(|role| is_platform_role(role) && !issuer.is_kernel() && !issuer.roles.contains(*role))
        {
            return Err(KernelError::Forbidden(kernel_only(format!(
                "role_escalation:{}",
                role.as_str()
            ))));
        }

        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let secret = format!("{SECRET_PREFIX}{}", hex::encode(bytes));
        let credential = ApiCredential {
            secret_hash: hash_secret(&secret),
            tenant_id: grant.tenant_id,
            subject_id: grant.subject_id,
            scopes: grant.scopes,
            roles: grant.roles,
            expires_at: grant.expires_at,
            revoked_at: None,
        };
        self.credentials.put_credential(credential.clone()).await?;
        tracing::info!(
            issuer_id = %issuer.id,
            subject_id = %credential.subject_id,
            tenant_id = credential.tenant_id.as_ref().map(|t| t.as_str()).unwrap_or("platform"),
            "api credential issued"
        );
        Ok(IssuedCredential { secret, credential })
    }

    pub async fn revoke_api_credential(&self, issuer: &Principal, secret_hash: &str) -> Result<()> {
        self.ensure_running()?;
        let credential = self
            .credentials
            .find_credential(secret_hash)
            .await?
            .ok_or_else(|| KernelError::InvalidRequest("unknown credential".to_string()))?;
        self.authorize_credential_scope(issuer, credential.tenant_id.as_ref())?;
        self.credentials.revoke_credential(secret_hash, Utc::now()).await?;
        tracing::info!(
            issuer_id = %issuer.id,
            subject_id = %credential.subject_id,
            "api credential revoked"
        );
        Ok(())
    }

    fn authorize_credential_scope(&self, issuer: &Principal, tenant_id: Option<&TenantId>) -> Result<()> {
        match tenant_id {
            Some(tenant_id) => {
                self.authorize(issuer, CREDENTIAL_MANAGE_ACTION, tenant_id, Some(AccessType::Admin))?;
            }
            None if issuer.is_kernel() => {}
            None => {
                return Err(KernelError::Forbidden(kernel_only(
                    "platform_credential_requires_kernel".to_string(),
                )))
            }
        }
        Ok(())
    }

    // ----- invocation -----

    /// Run one action and return its data, or the error body for the caller.
    pub async fn invoke(
        &self,
        engine_id: impl Into<EngineId>,
        action_id: impl Into<ActionId>,
        tenant_id: impl Into<TenantId>,
        principal: Principal,
        input: Value,
    ) -> std::result::Result<Value, InvocationFailure> {
        let request = ActionRequest::new(engine_id, action_id, tenant_id, principal, input);
        let action_id = request.action_id.clone();
        self.dispatch(request)
            .await
            .map(|outcome| outcome.data)
            .map_err(|err| InvocationFailure::new(err, &action_id))
    }

    /// Run one action with full control over trust evidence and cancellation.
    pub async fn dispatch(&self, request: ActionRequest) -> keel_dispatch::Result<ActionOutcome> {
        if self.is_shut_down() {
            tracing::warn!(action_id = %request.action_id, "invocation rejected after shutdown");
            return Err(DispatchError::Internal("kernel is shut down".to_string()));
        }
        self.dispatcher.invoke(request).await
    }

    pub fn register_handler(
        &self,
        engine_id: impl Into<EngineId>,
        action_id: impl Into<ActionId>,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.handlers.register(engine_id, action_id, handler);
    }

    // ----- trust -----

    /// Signature over a manifest's fingerprint, accepted by registration.
    pub fn sign_manifest(&self, manifest: &Value) -> Result<SignedPayload> {
        Ok(self.authority.sign(ManifestFingerprint::compute(manifest))?)
    }

    /// Register an identity chain and issue a token bound to it.
    pub fn issue_execution_token(
        &self,
        request: ChainRequest,
        scopes: Vec<String>,
    ) -> Result<(IdentityChain, ExecutionToken)> {
        self.ensure_running()?;
        let chain = self.verifier.chains().create(request)?;
        let token = self.verifier.tokens().issue(&chain, scopes, None)?;
        Ok((chain, token))
    }

    /// Returns the new key fingerprint.
    pub fn rotate_signing_key(&self) -> Result<String> {
        self.ensure_running()?;
        Ok(self.authority.rotate()?)
    }

    // ----- registry -----

    /// Install a tenant engine on behalf of `principal`.
    pub async fn register_engine(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        manifest: Value,
        signature: Option<&SignedPayload>,
    ) -> Result<EngineRecord> {
        self.ensure_running()?;
        self.registry
            .register_for_principal(principal, tenant_id, manifest, signature)
            .await
            .map_err(|err| match err {
                RegistryError::Denied(decision) => KernelError::Forbidden(decision),
                other => KernelError::Registry(other),
            })
    }

    /// Publish an engine visible to every tenant.
    pub async fn register_platform_engine(
        &self,
        manifest: Value,
        signature: Option<&SignedPayload>,
    ) -> Result<EngineRecord> {
        self.ensure_running()?;
        Ok(self.registry.register(None, manifest, signature).await?)
    }

    pub async fn set_engine_status(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        engine_id: &EngineId,
        version: &str,
        status: EngineStatus,
    ) -> Result<EngineRecord> {
        self.ensure_running()?;
        self.authorize(principal, ENGINE_STATUS_ACTION, tenant_id, None)?;
        Ok(self
            .registry
            .set_status(Some(tenant_id), engine_id, version, status)
            .await?)
    }

    pub async fn list_enabled_engines(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
    ) -> Result<Vec<EngineRecord>> {
        self.authorize(principal, "engine.list_enabled", tenant_id, None)?;
        Ok(self.registry.list_enabled(tenant_id).await?)
    }

    // ----- audit -----

    /// Tenant-scoped audit query. The query must name its tenant.
    pub async fn query_audit(&self, principal: &Principal, query: AuditQuery) -> Result<Vec<AuditRecord>> {
        let tenant_id = query
            .tenant_id
            .clone()
            .ok_or_else(|| KernelError::InvalidRequest("audit query requires a tenant".to_string()))?;
        self.authorize(principal, AUDIT_QUERY_ACTION, &tenant_id, None)?;
        Ok(self.ledger.query(&query).await?)
    }

    pub async fn verify_audit(&self, principal: &Principal, tenant_id: &TenantId) -> Result<ChainVerification> {
        self.authorize(principal, AUDIT_VERIFY_ACTION, tenant_id, None)?;
        Ok(self.ledger.verify(tenant_id).await?)
    }

    pub fn audit_fallback(&self) -> Vec<FallbackEntry> {
        self.ledger.fallback_entries()
    }

    /// Retry buffered audit entries. Returns how many were written.
    pub async fn replay_audit_fallback(&self) -> Result<usize> {
        Ok(self.ledger.replay_fallback().await?)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.guard.breakers().snapshots()
    }

    /// Stop accepting work and destroy the signing key.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.authority.shutdown();
        let pending = self.ledger.fallback_entries().len();
        if pending > 0 {
            tracing::warn!(pending, "shutting down with unpersisted audit entries");
        }
        tracing::info!("keel kernel shut down");
    }
}

fn is_platform_role(role: &RoleId) -> bool {
    matches!(role, RoleId::PlatformAdmin | RoleId::PlatformAuditor)
}

fn kernel_only(reason: String) -> PolicyDecision {
    PolicyDecision {
        effect: Effect::Deny,
        reason,
        required_permissions: vec![PermissionId::TenantAdmin],
        bypass: false,
    }
}

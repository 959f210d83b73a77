use crate::error::{DispatchError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::handler::HandlerRegistry;
use crate::observe::{MetricsSink, ObservedEffect, Observation};
use crate::sandbox::{CancellationSignal, Sandbox, SandboxParts, TenantSandbox};
use crate::state::DispatchState;
use async_trait::async_trait;
use futures::FutureExt;
use keel_guard::{CircuitBreaker, ResourceGuard};
use keel_ledger::{AuditEntry, AuditLedger};
use keel_policy::{PolicyEngine, PolicyRequest};
use keel_registry::{EngineRegistry, SchemaCache};
use keel_storage::{KeyValueStore, TenantDataStore};
use keel_trust::{
    ExecutionToken, IdentityChain, ManifestFingerprint, TrustVerifier, VerificationRequest,
};
use keel_types::{ActionContract, ActionId, EngineId, PolicyDecision, Principal, TenantId};
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Where contracts come from.
#[async_trait]
pub trait ContractResolver: Send + Sync {
    async fn resolve_contract(
        &self,
        tenant_id: &TenantId,
        engine_id: &EngineId,
        action_id: &ActionId,
    ) -> keel_registry::Result<Option<ActionContract>>;
}

#[async_trait]
impl ContractResolver for EngineRegistry {
    async fn resolve_contract(
        &self,
        tenant_id: &TenantId,
        engine_id: &EngineId,
        action_id: &ActionId,
    ) -> keel_registry::Result<Option<ActionContract>> {
        self.contract(tenant_id, engine_id, action_id).await
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Applies to the executing stage only. Contracts may override it.
    pub execution_timeout: Duration,
    /// Reject calls that carry no trust evidence.
    pub require_trust: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            require_trust: false,
        }
    }
}

/// Proof that a call is bound to a manifest and an identity.
#[derive(Debug, Clone)]
pub struct TrustEvidence {
    pub manifest: Value,
    pub expected_fingerprint: String,
    pub chain: IdentityChain,
    pub token: ExecutionToken,
    pub required_scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub engine_id: EngineId,
    pub action_id: ActionId,
    pub tenant_id: TenantId,
    pub principal: Principal,
    pub input: Value,
    pub trust: Option<TrustEvidence>,
    pub cancellation: CancellationSignal,
}

impl ActionRequest {
    pub fn new(
        engine_id: impl Into<EngineId>,
        action_id: impl Into<ActionId>,
        tenant_id: impl Into<TenantId>,
        principal: Principal,
        input: Value,
    ) -> Self {
        Self {
            engine_id: engine_id.into(),
            action_id: action_id.into(),
            tenant_id: tenant_id.into(),
            principal,
            input,
            trust: None,
            cancellation: CancellationSignal::never(),
        }
    }

    pub fn with_trust(mut self, evidence: TrustEvidence) -> Self {
        self.trust = Some(evidence);
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = signal;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub invocation_id: String,
    pub data: Value,
    pub decision: PolicyDecision,
    /// `None` when the audit write failed and the entry went to the fallback buffer.
    pub audit_hash: Option<String>,
    pub duration: Duration,
}

/// Collaborators of the dispatcher.
pub struct DispatcherDeps {
    pub contracts: Arc<dyn ContractResolver>,
    pub guard: Arc<ResourceGuard>,
    pub ledger: Arc<AuditLedger>,
    pub handlers: Arc<HandlerRegistry>,
    pub data: Arc<dyn TenantDataStore>,
    pub cache: Arc<dyn KeyValueStore>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub trust: Option<Arc<TrustVerifier>>,
}

/// Drives each invocation through the governed pipeline.
///
/// Whatever the outcome, a terminal invocation produces exactly one audit
/// record, one domain event and one metric observation.
pub struct Dispatcher {
    contracts: Arc<dyn ContractResolver>,
    policy: PolicyEngine,
    guard: Arc<ResourceGuard>,
    ledger: Arc<AuditLedger>,
    handlers: Arc<HandlerRegistry>,
    data: Arc<dyn TenantDataStore>,
    cache: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    trust: Option<Arc<TrustVerifier>>,
    schemas: SchemaCache,
    config: DispatcherConfig,
}

// What an invocation accumulated before it stopped.
#[derive(Default)]
struct Progress {
    state: Option<DispatchState>,
    contract_version: Option<String>,
    decision: Option<PolicyDecision>,
    // Admitted by the breaker and not yet settled.
    breaker: Option<Arc<CircuitBreaker>>,
    trust_verified: bool,
}

impl Progress {
    fn reach(&mut self, state: DispatchState) {
        tracing::trace!(state = state.as_str(), "dispatch state");
        self.state = Some(state);
    }

    fn current(&self) -> DispatchState {
        self.state.unwrap_or(DispatchState::Received)
    }
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        Self {
            contracts: deps.contracts,
            policy: PolicyEngine::new(),
            guard: deps.guard,
            ledger: deps.ledger,
            handlers: deps.handlers,
            data: deps.data,
            cache: deps.cache,
            events: deps.events,
            metrics: deps.metrics,
            trust: deps.trust,
            schemas: SchemaCache::new(),
            config,
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub async fn invoke(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let invocation_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "dispatch",
            invocation_id = %invocation_id,
            tenant_id = %request.tenant_id,
            engine_id = %request.engine_id,
            action_id = %request.action_id,
        );

        async {
            let started = Instant::now();
            let mut progress = Progress::default();
            let result = self.run(&request, &invocation_id, &mut progress).await;
            if let Some(breaker) = progress.breaker.take() {
                breaker.release();
            }
            self.finish(&request, &invocation_id, progress, result, started.elapsed())
                .await
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &ActionRequest,
        invocation_id: &str,
        progress: &mut Progress,
    ) -> Result<(Value, PolicyDecision)> {
        progress.reach(DispatchState::Received);
        self.check_cancelled(request, progress)?;

        let contract = self
            .contracts
            .resolve_contract(&request.tenant_id, &request.engine_id, &request.action_id)
            .await
            .map_err(|err| DispatchError::Internal(format!("contract lookup failed: {err}")))?
            .ok_or_else(|| DispatchError::ContractNotFound {
                engine_id: request.engine_id.clone(),
                action_id: request.action_id.clone(),
            })?;
        if contract.deprecated {
            tracing::warn!(version = %contract.version, "invoking deprecated action");
        }
        progress.contract_version = Some(contract.version.clone());
        progress.reach(DispatchState::ContractLoaded);
        self.check_cancelled(request, progress)?;

        let decision = self.policy.evaluate(&PolicyRequest::for_contract(
            request.principal.clone(),
            &contract,
            request.tenant_id.clone(),
        ));
        progress.decision = Some(decision.clone());
        if !decision.is_allowed() {
            return Err(DispatchError::PolicyDenied(decision.reason.clone()));
        }
        progress.reach(DispatchState::PolicyEvaluated);
        self.check_cancelled(request, progress)?;

        match self.guard.check_quota(&request.tenant_id, &request.engine_id).await {
            Ok(outcome) => {
                if let Some(rejected) = outcome.rejected() {
                    return Err(DispatchError::QuotaExceeded {
                        layer: rejected.layer,
                        reset_ms: rejected.reset_ms,
                    });
                }
            }
            Err(err) => {
                // Fail open when the counter store is unavailable.
                tracing::error!(error = %err, "rate limit check failed; admitting call");
            }
        }
        let breaker = self.guard.breaker(&request.engine_id);
        if !breaker.allow_request() {
            return Err(DispatchError::CircuitOpen(request.engine_id.clone()));
        }
        progress.breaker = Some(breaker);
        progress.reach(DispatchState::QuotaChecked);

        self.verify_trust(request, progress)?;
        self.check_cancelled(request, progress)?;

        let input_schema = self.compiled(&contract.input_schema).map_err(|err| {
            DispatchError::InputValidationFailed(vec![format!("unusable input schema: {err}")])
        })?;
        let violations = input_schema.violations(&request.input);
        if !violations.is_empty() {
            return Err(DispatchError::InputValidationFailed(violations));
        }
        progress.reach(DispatchState::InputValidated);

        let handler = self
            .handlers
            .get(&request.engine_id, &request.action_id)
            .ok_or_else(|| DispatchError::HandlerNotFound(request.action_id.clone()))?;
        self.check_cancelled(request, progress)?;

        // From here on the breaker is settled by the outcome, not released.
        let breaker = progress.breaker.take();
        progress.reach(DispatchState::Executing);
        let timeout = contract
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.execution_timeout);
        let sandbox: Arc<dyn Sandbox> = Arc::new(TenantSandbox::new(SandboxParts {
            tenant_id: request.tenant_id.clone(),
            principal_id: request.principal.id.clone(),
            engine_id: request.engine_id.clone(),
            action_id: request.action_id.clone(),
            invocation_id: invocation_id.to_string(),
            data: self.data.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            cancellation: request.cancellation.clone(),
        }));

        let guarded =
            AssertUnwindSafe(handler.handle(request.input.clone(), sandbox)).catch_unwind();
        let executed = tokio::time::timeout(timeout, guarded).await;
        let output = match executed {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(err))) => {
                settle(breaker.as_deref(), false);
                return Err(DispatchError::HandlerExecutionFailed(format!("{err:#}")));
            }
            Ok(Err(panic)) => {
                settle(breaker.as_deref(), false);
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "handler panicked");
                return Err(DispatchError::HandlerExecutionFailed(format!(
                    "handler panicked: {message}"
                )));
            }
            Err(_) => {
                settle(breaker.as_deref(), false);
                return Err(DispatchError::HandlerExecutionFailed(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let output_check = self
            .compiled(&contract.output_schema)
            .map(|schema| schema.violations(&output))
            .unwrap_or_else(|err| vec![format!("unusable output schema: {err}")]);
        if !output_check.is_empty() {
            settle(breaker.as_deref(), false);
            return Err(DispatchError::OutputValidationFailed(output_check));
        }
        settle(breaker.as_deref(), true);
        progress.reach(DispatchState::OutputValidated);

        Ok((output, decision))
    }

    fn verify_trust(&self, request: &ActionRequest, progress: &mut Progress) -> Result<()> {
        let Some(evidence) = &request.trust else {
            if self.config.require_trust {
                return Err(DispatchError::TrustVerificationFailed(vec![
                    "execution token required".to_string(),
                ]));
            }
            return Ok(());
        };
        let Some(verifier) = &self.trust else {
            return Err(DispatchError::TrustVerificationFailed(vec![
                "no trust verifier configured".to_string(),
            ]));
        };

        let report = verifier.verify(&VerificationRequest {
            manifest: evidence.manifest.clone(),
            expected_fingerprint: evidence.expected_fingerprint.clone(),
            chain: evidence.chain.clone(),
            token: evidence.token.clone(),
            tenant_id: request.tenant_id.clone(),
            required_scopes: evidence.required_scopes.clone(),
        });
        if !report.verified {
            return Err(DispatchError::TrustVerificationFailed(report.errors()));
        }
        progress.trust_verified = true;
        progress.reach(DispatchState::TrustVerified);
        Ok(())
    }

    fn check_cancelled(&self, request: &ActionRequest, progress: &Progress) -> Result<()> {
        if request.cancellation.is_cancelled() {
            return Err(DispatchError::Cancelled(progress.current()));
        }
        Ok(())
    }

    // Content-addressed so identical schemas share one compiled validator.
    fn compiled(&self, schema: &Value) -> keel_registry::Result<Arc<keel_registry::CompiledSchema>> {
        let key = ManifestFingerprint::compute(schema);
        self.schemas.get_or_compile(&key, schema)
    }

    async fn finish(
        &self,
        request: &ActionRequest,
        invocation_id: &str,
        mut progress: Progress,
        result: Result<(Value, PolicyDecision)>,
        duration: Duration,
    ) -> Result<ActionOutcome> {
        let effect = match &result {
            Ok(_) => ObservedEffect::Allow,
            Err(err) if err.is_denial() => ObservedEffect::Deny,
            Err(_) => ObservedEffect::Error,
        };
        let error = result.as_ref().err();
        let decision = progress.decision.as_ref();

        let payload = json!({
            "invocation_id": invocation_id,
            "engine_id": request.engine_id,
            "effect": effect.as_str(),
            "outcome": error.map_or("completed", |e| e.kind()),
            "state": progress.current(),
            "executed": progress.current().has_executed(),
            "contract_version": progress.contract_version,
            "reason": decision.map(|d| d.reason.clone()),
            "bypass": decision.is_some_and(|d| d.bypass),
            "required_permissions": decision.map(|d| d.required_permissions.clone()),
            "trust_verified": progress.trust_verified,
            "error": error.map(|e| e.to_string()),
            "input_fingerprint": ManifestFingerprint::compute(&request.input),
            "duration_ms": duration.as_millis() as u64,
        });
        let audit = self
            .ledger
            .record(AuditEntry::new(
                request.tenant_id.clone(),
                request.principal.id.clone(),
                request.action_id.clone(),
                payload,
            ))
            .await;
        if result.is_ok() {
            progress.reach(DispatchState::Audited);
        }

        let event_name = match effect {
            ObservedEffect::Allow => "action.completed",
            ObservedEffect::Deny => "action.denied",
            ObservedEffect::Error => "action.failed",
        };
        let event = DomainEvent::new(
            event_name,
            request.tenant_id.clone(),
            request.action_id.clone(),
            invocation_id,
            json!({
                "engine_id": request.engine_id,
                "principal_id": request.principal.id,
                "outcome": error.map_or("completed", |e| e.kind()),
                "audit_hash": audit.as_ref().map(|r| r.hash.clone()),
            }),
        );
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(error = %err, "domain event dropped");
        }

        self.metrics.observe(&Observation {
            action_id: request.action_id.clone(),
            tenant_id: request.tenant_id.clone(),
            engine_id: request.engine_id.clone(),
            effect,
            error: error.map(|e| e.kind().to_string()),
            duration,
        });

        match result {
            Ok((data, decision)) => {
                progress.reach(DispatchState::Completed);
                tracing::info!(
                    duration_ms = duration.as_millis() as u64,
                    bypass = decision.bypass,
                    "action completed"
                );
                Ok(ActionOutcome {
                    invocation_id: invocation_id.to_string(),
                    data,
                    decision,
                    audit_hash: audit.map(|r| r.hash),
                    duration,
                })
            }
            Err(err) => {
                if err.is_denial() {
                    tracing::info!(kind = err.kind(), error = %err, "action refused");
                } else {
                    tracing::warn!(
                        kind = err.kind(),
                        state = progress.current().as_str(),
                        error = %err,
                        "action failed"
                    );
                }
                Err(err)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn settle(breaker: Option<&CircuitBreaker>, success: bool) {
    if let Some(breaker) = breaker {
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }
}

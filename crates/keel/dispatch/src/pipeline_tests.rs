use crate::*;
use async_trait::async_trait;
use keel_guard::{CircuitBreakerConfig, LayerLimit, RateLimitConfig, RateLimitLayer, ResourceGuard};
use keel_ledger::AuditLedger;
use keel_registry::{EngineRegistry, RegistryOptions};
use keel_storage::{
    AuditAppend, AuditQuery, AuditRecord, AuditStore, EngineStatus, InMemoryStorage, KeyValueStore,
    StorageError, StorageResult, TenantDataStore,
};
use keel_trust::{
    ChainRequest, ExecutionTokenManager, IdentityChainManager, ManifestFingerprint,
    SigningAuthority, TrustVerifier,
};
use keel_types::{AuthMethod, EngineId, Principal, RoleId, TenantId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ENGINE: &str = "accounting";
const JOURNAL: &str = "accounting.create_journal_entry";
const CLOSE: &str = "accounting.close_period";
const LIST: &str = "accounting.list_entries";
const TENANT: &str = "t-1";

fn manifest() -> Value {
    json!({
        "engine_id": ENGINE,
        "name": "Accounting",
        "version": "1.0.0",
        "actions": [
            {
                "action_id": JOURNAL,
                "name": "Create journal entry",
                "side_effect_level": "write",
                "input_schema": {
                    "type": "object",
                    "required": ["amount", "memo"],
                    "properties": {"amount": {"type": "number"}, "memo": {"type": "string"}}
                },
                "output_schema": {
                    "type": "object",
                    "required": ["entry_id"],
                    "properties": {"entry_id": {"type": "string"}}
                }
            },
            {
                "action_id": LIST,
                "name": "List entries",
                "input_schema": {"type": "object"},
                "output_schema": {"type": "array"}
            },
            {
                "action_id": CLOSE,
                "name": "Close period",
                "timeout_ms": 50,
                "input_schema": {"type": "object"},
                "output_schema": {"type": "object"}
            }
        ]
    })
}

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<InMemoryStorage>,
    metrics: Arc<InMemoryMetrics>,
    events: Arc<BroadcastEventSink>,
    calls: Arc<AtomicUsize>,
    authority: Arc<SigningAuthority>,
    verifier: Arc<TrustVerifier>,
}

struct Options {
    rate_limits: RateLimitConfig,
    breaker: CircuitBreakerConfig,
    require_trust: bool,
    audit: Option<Arc<dyn AuditStore>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            require_trust: false,
            audit: None,
        }
    }
}

async fn harness(options: Options) -> Harness {
    let store = Arc::new(InMemoryStorage::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let guard = Arc::new(ResourceGuard::new(kv.clone(), options.rate_limits, options.breaker).unwrap());
    let authority = Arc::new(SigningAuthority::new(Duration::from_secs(300)).unwrap());

    let registry = Arc::new(
        EngineRegistry::new(
            store.clone(),
            kv.clone(),
            guard.lock().clone(),
            authority.clone(),
            RegistryOptions::default(),
        )
        .unwrap(),
    );
    registry.register(None, manifest(), None).await.unwrap();
    registry
        .set_status(None, &EngineId::new(ENGINE), "1.0.0", EngineStatus::Enabled)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = Arc::new(HandlerRegistry::new());
    let counter = calls.clone();
    handlers.register(
        ENGINE,
        JOURNAL,
        handler_fn(move |input: Value, sandbox: Arc<dyn Sandbox>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if input["memo"] == "fail" {
                    anyhow::bail!("ledger offline");
                }
                if input["memo"] == "panic" {
                    panic!("handler bug");
                }
                if input["memo"] == "bad-output" {
                    return Ok(json!({"entry": 1}));
                }
                let row = sandbox.insert("journal", input).await?;
                sandbox.emit("journal.posted", json!({"id": row["id"]}));
                Ok::<_, anyhow::Error>(json!({"entry_id": row["id"]}))
            }
        }),
    );
    let counter = calls.clone();
    handlers.register(
        ENGINE,
        CLOSE,
        handler_fn(move |_input: Value, _sandbox: Arc<dyn Sandbox>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, anyhow::Error>(json!({}))
            }
        }),
    );

    let audit_store: Arc<dyn AuditStore> = options
        .audit
        .unwrap_or_else(|| store.clone() as Arc<dyn AuditStore>);
    let chains = Arc::new(IdentityChainManager::new(64));
    let tokens = Arc::new(ExecutionTokenManager::new(authority.clone()));
    let verifier = Arc::new(TrustVerifier::new(chains, tokens));
    let metrics = Arc::new(InMemoryMetrics::new());
    let events = Arc::new(BroadcastEventSink::new(64));

    let dispatcher = Dispatcher::new(
        DispatcherDeps {
            contracts: registry,
            guard,
            ledger: Arc::new(AuditLedger::new(audit_store)),
            handlers,
            data: store.clone(),
            cache: kv,
            events: events.clone(),
            metrics: metrics.clone(),
            trust: Some(verifier.clone()),
        },
        DispatcherConfig {
            require_trust: options.require_trust,
            ..DispatcherConfig::default()
        },
    );

    Harness {
        dispatcher,
        store,
        metrics,
        events,
        calls,
        authority,
        verifier,
    }
}

fn accountant() -> Principal {
    Principal::new("u-acct", AuthMethod::Session)
        .in_tenant(TENANT)
        .with_role(RoleId::TenantAccountant)
}

fn journal(principal: Principal, memo: &str) -> ActionRequest {
    ActionRequest::new(ENGINE, JOURNAL, TENANT, principal, json!({"amount": 125.5, "memo": memo}))
}

async fn audit_records(h: &Harness) -> Vec<AuditRecord> {
    h.store.tenant_chain(&TenantId::new(TENANT)).await.unwrap()
}

#[tokio::test]
async fn accountant_posts_journal_entry() {
    let h = harness(Options::default()).await;
    let mut events = h.events.subscribe();

    let outcome = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
    assert!(outcome.data["entry_id"].is_string());
    assert_eq!(outcome.decision.reason, "rbac_allow");

    let records = audit_records(&h).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].effect(), Some("allow"));
    assert_eq!(records[0].payload["outcome"], "completed");
    assert_eq!(outcome.audit_hash.as_deref(), Some(records[0].hash.as_str()));

    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].effect, ObservedEffect::Allow);

    let names: Vec<String> = [events.recv().await.unwrap(), events.recv().await.unwrap()]
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["journal.posted", "action.completed"]);

    let rows = h
        .store
        .fetch(&TenantId::new(TENANT), "journal", &Value::Null)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn viewer_is_denied_before_execution() {
    let h = harness(Options::default()).await;
    let viewer = Principal::new("u-view", AuthMethod::Session)
        .in_tenant(TENANT)
        .with_role(RoleId::TenantViewer);

    let err = h.dispatcher.invoke(journal(viewer, "rent")).await.unwrap_err();
    assert_eq!(err.status_code(), 403);
    match &err {
        DispatchError::PolicyDenied(reason) => {
            assert_eq!(reason, "missing_permissions:data.write_financial")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let records = audit_records(&h).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].effect(), Some("deny"));
    assert_eq!(records[0].payload["reason"], "missing_permissions:data.write_financial");
    assert_eq!(h.metrics.observations()[0].effect, ObservedEffect::Deny);
}

#[tokio::test]
async fn kernel_bypass_is_audited() {
    let h = harness(Options::default()).await;
    let outcome = h.dispatcher.invoke(journal(Principal::kernel(), "sweep")).await.unwrap();
    assert!(outcome.decision.bypass);
    let records = audit_records(&h).await;
    assert_eq!(records[0].payload["bypass"], true);
    assert_eq!(records[0].actor_id, "kernel");
}

#[tokio::test]
async fn unknown_action_is_not_found_and_audited() {
    let h = harness(Options::default()).await;
    let request = ActionRequest::new(ENGINE, "accounting.void_entry", TENANT, accountant(), json!({}));
    let err = h.dispatcher.invoke(request).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    let records = audit_records(&h).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].effect(), Some("error"));
    assert_eq!(records[0].payload["state"], "received");
}

#[tokio::test]
async fn input_must_match_contract() {
    let h = harness(Options::default()).await;
    let request = ActionRequest::new(ENGINE, JOURNAL, TENANT, accountant(), json!({"amount": "lots"}));
    let err = h.dispatcher.invoke(request).await.unwrap_err();
    assert_eq!(err.status_code(), 422);
    let body = err.body(&keel_types::ActionId::new(JOURNAL));
    assert_eq!(body.error, "input_validation_failed");
    assert_eq!(body.details.unwrap()["errors"].as_array().unwrap().len(), 2);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn output_violation_counts_against_the_engine() {
    let h = harness(Options {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 60_000,
        },
        ..Options::default()
    })
    .await;

    let err = h.dispatcher.invoke(journal(accountant(), "bad-output")).await.unwrap_err();
    assert!(matches!(err, DispatchError::OutputValidationFailed(_)));
    assert_eq!(err.status_code(), 500);

    let err = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen(_)));
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_then_admits_one_trial() {
    let h = harness(Options {
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 1_000,
        },
        ..Options::default()
    })
    .await;

    for _ in 0..2 {
        let err = h.dispatcher.invoke(journal(accountant(), "fail")).await.unwrap_err();
        assert!(matches!(err, DispatchError::HandlerExecutionFailed(ref cause) if cause.contains("ledger offline")));
    }
    let err = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
    h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn denied_call_does_not_consume_the_trial() {
    let h = harness(Options {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 1_000,
        },
        ..Options::default()
    })
    .await;
    h.dispatcher.invoke(journal(accountant(), "fail")).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1_001)).await;

    // Admitted by the half-open breaker, then rejected by input validation.
    let bad = ActionRequest::new(ENGINE, JOURNAL, TENANT, accountant(), json!({}));
    assert_eq!(h.dispatcher.invoke(bad).await.unwrap_err().status_code(), 422);

    h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_trial_is_contained_and_audited() {
    let h = harness(Options {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 1_000,
        },
        ..Options::default()
    })
    .await;
    h.dispatcher.invoke(journal(accountant(), "fail")).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1_001)).await;

    let err = h.dispatcher.invoke(journal(accountant(), "panic")).await.unwrap_err();
    match &err {
        DispatchError::HandlerExecutionFailed(cause) => {
            assert_eq!(cause, "handler panicked: handler bug")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.status_code(), 500);

    let records = audit_records(&h).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].payload["executed"], true);
    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 2);
    assert_eq!(observations[1].effect, ObservedEffect::Error);

    // The failed trial re-opens the breaker; the next cooldown admits a new trial.
    let err = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen(_)));
    tokio::time::advance(Duration::from_millis(1_001)).await;
    h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_is_a_handler_failure() {
    let h = harness(Options::default()).await;
    let request = ActionRequest::new(ENGINE, CLOSE, TENANT, Principal::kernel(), json!({}));
    let err = h.dispatcher.invoke(request).await.unwrap_err();
    match &err {
        DispatchError::HandlerExecutionFailed(cause) => assert!(cause.contains("timed out after 50ms")),
        other => panic!("unexpected {other:?}"),
    }
    let records = audit_records(&h).await;
    assert_eq!(records[0].payload["executed"], true);
}

#[tokio::test(start_paused = true)]
async fn tenant_quota_rejects_with_429() {
    let h = harness(Options {
        rate_limits: RateLimitConfig {
            tenant: LayerLimit::new(1, 60_000),
            ..RateLimitConfig::default()
        },
        ..Options::default()
    })
    .await;
    h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();

    let err = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert!(matches!(err, DispatchError::QuotaExceeded { layer: RateLimitLayer::Tenant, .. }));
    assert_eq!(audit_records(&h).await.len(), 2);
}

#[tokio::test]
async fn cancellation_before_execution_is_audited() {
    let h = harness(Options::default()).await;
    let (handle, signal) = CancellationSignal::pair();
    handle.cancel();

    let err = h
        .dispatcher
        .invoke(journal(accountant(), "rent").with_cancellation(signal))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled(DispatchState::Received)));
    assert_eq!(err.status_code(), 499);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    let records = audit_records(&h).await;
    assert_eq!(records[0].payload["outcome"], "cancelled");
}

#[tokio::test]
async fn contract_without_handler_is_501() {
    let h = harness(Options::default()).await;
    let request = ActionRequest::new(ENGINE, LIST, TENANT, accountant(), json!({}));
    let err = h.dispatcher.invoke(request).await.unwrap_err();
    assert!(matches!(err, DispatchError::HandlerNotFound(_)));
    assert_eq!(err.status_code(), 501);
    assert_eq!(audit_records(&h).await[0].payload["state"], "input_validated");
}

#[tokio::test]
async fn trust_required_rejects_bare_calls() {
    let h = harness(Options {
        require_trust: true,
        ..Options::default()
    })
    .await;
    let err = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap_err();
    assert_eq!(err.status_code(), 401);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verified_trust_evidence_is_accepted_once() {
    let h = harness(Options {
        require_trust: true,
        ..Options::default()
    })
    .await;
    let fingerprint = ManifestFingerprint::compute(&manifest());
    let chain = h
        .verifier
        .chains()
        .create(ChainRequest {
            user_id: "u-acct".into(),
            tenant_id: TenantId::new(TENANT),
            mcp_id: "mcp-1".into(),
            engine_id: EngineId::new(ENGINE),
            manifest_fingerprint: fingerprint.clone(),
            parent_chain_id: None,
        })
        .unwrap();
    let token = h
        .verifier
        .tokens()
        .issue(&chain, vec![JOURNAL.to_string()], None)
        .unwrap();
    let evidence = TrustEvidence {
        manifest: manifest(),
        expected_fingerprint: fingerprint,
        chain,
        token,
        required_scopes: vec![JOURNAL.to_string()],
    };

    h.dispatcher
        .invoke(journal(accountant(), "rent").with_trust(evidence.clone()))
        .await
        .unwrap();
    assert_eq!(audit_records(&h).await[0].payload["trust_verified"], true);

    let err = h
        .dispatcher
        .invoke(journal(accountant(), "rent").with_trust(evidence))
        .await
        .unwrap_err();
    match err {
        DispatchError::TrustVerificationFailed(errors) => {
            assert!(errors.iter().any(|e| e.contains("nonce")))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.authority.fingerprint().is_some());
}

/// Audit store that refuses every write.
struct DownAuditStore;

#[async_trait]
impl AuditStore for DownAuditStore {
    async fn append_audit(&self, _event: AuditAppend) -> StorageResult<AuditRecord> {
        Err(StorageError::Backend("audit database unreachable".into()))
    }
    async fn tail_hash(&self, _tenant_id: &TenantId) -> StorageResult<Option<String>> {
        Ok(None)
    }
    async fn tenant_chain(&self, _tenant_id: &TenantId) -> StorageResult<Vec<AuditRecord>> {
        Ok(Vec::new())
    }
    async fn query_audit(&self, _query: &AuditQuery) -> StorageResult<Vec<AuditRecord>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn audit_outage_does_not_fail_the_action() {
    let h = harness(Options {
        audit: Some(Arc::new(DownAuditStore)),
        ..Options::default()
    })
    .await;
    let outcome = h.dispatcher.invoke(journal(accountant(), "rent")).await.unwrap();
    assert!(outcome.audit_hash.is_none());
    assert_eq!(h.dispatcher.ledger().failure_count(), 1);
    assert_eq!(h.dispatcher.ledger().fallback_entries().len(), 1);
    assert_eq!(h.metrics.observations().len(), 1);
}

use keel_dispatch::{
    handler_fn, ActionRequest, BroadcastEventSink, InMemoryMetrics, ObservedEffect, Sandbox,
    TrustEvidence,
};
use keel_kernel::{CredentialGrant, Kernel, KernelConfig, KernelError, StorageConfig};
use keel_storage::{AuditQuery, EngineStatus, InMemoryStorage};
use keel_trust::{ChainRequest, ManifestFingerprint};
use keel_types::{AuthMethod, EngineId, Principal, RoleId, TenantId};
use serde_json::{json, Value};
use std::sync::Arc;

const ENGINE: &str = "accounting";
const JOURNAL: &str = "accounting.create_journal_entry";
const TENANT: &str = "t-1";

fn manifest() -> Value {
    json!({
        "engine_id": ENGINE,
        "name": "Accounting",
        "version": "1.0.0",
        "actions": [{
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
        }]
    })
}

struct Setup {
    kernel: Kernel,
    metrics: Arc<InMemoryMetrics>,
    events: Arc<BroadcastEventSink>,
}

async fn setup(config: KernelConfig) -> Setup {
    let metrics = Arc::new(InMemoryMetrics::new());
    let events = Arc::new(BroadcastEventSink::new(64));
    let kernel = Kernel::builder(config)
        .metrics(metrics.clone())
        .events(events.clone())
        .build(Arc::new(InMemoryStorage::new()))
        .unwrap();

    let manifest = manifest();
    let signature = kernel.sign_manifest(&manifest).unwrap();
    kernel
        .register_platform_engine(manifest, Some(&signature))
        .await
        .unwrap();
    kernel
        .registry()
        .set_status(None, &EngineId::new(ENGINE), "1.0.0", EngineStatus::Enabled)
        .await
        .unwrap();
    kernel.register_handler(
        ENGINE,
        JOURNAL,
        handler_fn(|input: Value, sandbox: Arc<dyn Sandbox>| async move {
            let row = sandbox.insert("journal", input).await?;
            Ok::<_, anyhow::Error>(json!({"entry_id": row["id"]}))
        }),
    );

    Setup {
        kernel,
        metrics,
        events,
    }
}

async fn credential_for(kernel: &Kernel, subject: &str, role: RoleId) -> Principal {
    let issued = kernel
        .issue_api_credential(
            &Principal::kernel(),
            CredentialGrant {
                tenant_id: Some(TenantId::new(TENANT)),
                subject_id: subject.to_string(),
                roles: vec![role],
                ..CredentialGrant::default()
            },
        )
        .await
        .unwrap();
    kernel.authenticate(&issued.secret).await.unwrap()
}

fn auditor() -> Principal {
    Principal::new("auditor-1", AuthMethod::Service).with_role(RoleId::PlatformAuditor)
}

#[tokio::test]
async fn accountant_journal_entry_completes_with_one_audit_record() {
    let s = setup(KernelConfig::default()).await;
    let mut events = s.events.subscribe();
    let accountant = credential_for(&s.kernel, "u-acct", RoleId::TenantAccountant).await;
    assert_eq!(accountant.auth_method, AuthMethod::ApiKey);

    let data = s
        .kernel
        .invoke(ENGINE, JOURNAL, TENANT, accountant, json!({"amount": 125.5, "memo": "rent"}))
        .await
        .unwrap();
    assert!(data["entry_id"].is_string());

    let verification = s.kernel.verify_audit(&auditor(), &TenantId::new(TENANT)).await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.total, 1);

    let observations = s.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert!(matches!(observations[0].effect, ObservedEffect::Allow));
    assert_eq!(events.recv().await.unwrap().name, "action.completed");
}

#[tokio::test]
async fn viewer_is_denied_and_the_denial_is_audited() {
    let s = setup(KernelConfig::default()).await;
    let viewer = credential_for(&s.kernel, "u-view", RoleId::TenantViewer).await;

    let failure = s
        .kernel
        .invoke(ENGINE, JOURNAL, TENANT, viewer, json!({"amount": 1, "memo": "x"}))
        .await
        .unwrap_err();
    assert_eq!(failure.status_code(), 403);
    assert_eq!(failure.body.error, "policy_denied");
    assert_eq!(failure.body.action_id.as_str(), JOURNAL);

    let denied = s
        .kernel
        .query_audit(
            &auditor(),
            AuditQuery {
                effect: Some("deny".to_string()),
                ..AuditQuery::for_tenant(TENANT)
            },
        )
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].actor_id, "u-view");
}

#[tokio::test]
async fn unknown_and_revoked_credentials_do_not_authenticate() {
    let s = setup(KernelConfig::default()).await;
    assert!(matches!(
        s.kernel.authenticate("keel_nope").await,
        Err(KernelError::Unauthenticated(_))
    ));

    let admin = credential_for(&s.kernel, "u-admin", RoleId::TenantAdmin).await;
    let issued = s
        .kernel
        .issue_api_credential(
            &admin,
            CredentialGrant {
                tenant_id: Some(TenantId::new(TENANT)),
                subject_id: "svc-import".to_string(),
                roles: vec![RoleId::TenantAccountant],
                ..CredentialGrant::default()
            },
        )
        .await
        .unwrap();
    assert!(!format!("{issued:?}").contains(&issued.secret));
    assert!(s.kernel.authenticate(&issued.secret).await.is_ok());

    s.kernel
        .revoke_api_credential(&admin, &issued.credential.secret_hash)
        .await
        .unwrap();
    assert!(matches!(
        s.kernel.authenticate(&issued.secret).await,
        Err(KernelError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn tenant_admins_cannot_escalate() {
    let s = setup(KernelConfig::default()).await;
    let admin = credential_for(&s.kernel, "u-admin", RoleId::TenantAdmin).await;

    let platform_role = s
        .kernel
        .issue_api_credential(
            &admin,
            CredentialGrant {
                tenant_id: Some(TenantId::new(TENANT)),
                subject_id: "u-2".to_string(),
                roles: vec![RoleId::PlatformAdmin],
                ..CredentialGrant::default()
            },
        )
        .await;
    match platform_role {
        Err(KernelError::Forbidden(decision)) => {
            assert_eq!(decision.reason, "role_escalation:platform.admin")
        }
        other => panic!("expected forbidden, got {other:?}"),
    }

    let other_tenant = s
        .kernel
        .issue_api_credential(
            &admin,
            CredentialGrant {
                tenant_id: Some(TenantId::new("t-2")),
                subject_id: "u-3".to_string(),
                ..CredentialGrant::default()
            },
        )
        .await;
    match other_tenant {
        Err(KernelError::Forbidden(decision)) => assert_eq!(decision.reason, "tenant_mismatch"),
        other => panic!("expected forbidden, got {other:?}"),
    }

    let platform = s
        .kernel
        .issue_api_credential(
            &admin,
            CredentialGrant {
                subject_id: "u-4".to_string(),
                ..CredentialGrant::default()
            },
        )
        .await;
    assert!(matches!(platform, Err(KernelError::Forbidden(_))));
}

#[tokio::test]
async fn engine_installation_is_policy_gated() {
    let s = setup(KernelConfig::default()).await;
    let tenant = TenantId::new(TENANT);
    let mut tenant_manifest = manifest();
    tenant_manifest["engine_id"] = json!("payroll");
    tenant_manifest["actions"][0]["action_id"] = json!("payroll.run");

    let viewer = credential_for(&s.kernel, "u-view", RoleId::TenantViewer).await;
    match s
        .kernel
        .register_engine(&viewer, &tenant, tenant_manifest.clone(), None)
        .await
    {
        Err(KernelError::Forbidden(decision)) => {
            assert_eq!(decision.reason, "missing_permissions:engine.install")
        }
        other => panic!("expected forbidden, got {other:?}"),
    }

    let admin = credential_for(&s.kernel, "u-admin", RoleId::TenantAdmin).await;
    let record = s
        .kernel
        .register_engine(&admin, &tenant, tenant_manifest, None)
        .await
        .unwrap();
    assert_eq!(record.status, EngineStatus::Installed);
    assert_eq!(record.tenant_id.as_ref(), Some(&tenant));

    let enabled = s
        .kernel
        .set_engine_status(&admin, &tenant, &EngineId::new("payroll"), "1.0.0", EngineStatus::Enabled)
        .await
        .unwrap();
    assert_eq!(enabled.status, EngineStatus::Enabled);

    let engines = s.kernel.list_enabled_engines(&viewer, &tenant).await.unwrap();
    let mut ids: Vec<_> = engines.iter().map(|e| e.engine_id.as_str().to_string()).collect();
    ids.sort();
    assert_eq!(ids, ["accounting", "payroll"]);

    assert!(matches!(
        s.kernel
            .set_engine_status(&viewer, &tenant, &EngineId::new("payroll"), "1.0.0", EngineStatus::Disabled)
            .await,
        Err(KernelError::Forbidden(_))
    ));
}

#[tokio::test]
async fn audit_access_requires_audit_permissions() {
    let s = setup(KernelConfig::default()).await;
    let tenant = TenantId::new(TENANT);
    let accountant = credential_for(&s.kernel, "u-acct", RoleId::TenantAccountant).await;
    s.kernel
        .invoke(ENGINE, JOURNAL, TENANT, accountant.clone(), json!({"amount": 3, "memo": "fee"}))
        .await
        .unwrap();

    assert!(matches!(
        s.kernel.query_audit(&accountant, AuditQuery::for_tenant(TENANT)).await,
        Err(KernelError::Forbidden(_))
    ));
    assert!(matches!(
        s.kernel.query_audit(&auditor(), AuditQuery::default()).await,
        Err(KernelError::InvalidRequest(_))
    ));

    let admin = credential_for(&s.kernel, "u-admin", RoleId::TenantAdmin).await;
    let records = s
        .kernel
        .query_audit(&admin, AuditQuery::for_tenant(TENANT))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    // Tenant admins read the ledger but cannot verify it.
    assert!(matches!(
        s.kernel.verify_audit(&admin, &tenant).await,
        Err(KernelError::Forbidden(_))
    ));
    assert!(s.kernel.verify_audit(&auditor(), &tenant).await.unwrap().valid);
}

#[tokio::test]
async fn required_tokens_bind_calls_to_an_identity_chain() {
    let mut config = KernelConfig::default();
    config.trust.require_token = true;
    let s = setup(config).await;
    let accountant = credential_for(&s.kernel, "u-acct", RoleId::TenantAccountant).await;
    let input = json!({"amount": 10, "memo": "audit fee"});

    let failure = s
        .kernel
        .invoke(ENGINE, JOURNAL, TENANT, accountant.clone(), input.clone())
        .await
        .unwrap_err();
    assert_eq!(failure.status_code(), 401);

    let manifest = manifest();
    let fingerprint = ManifestFingerprint::compute(&manifest);
    let (chain, token) = s
        .kernel
        .issue_execution_token(
            ChainRequest {
                user_id: accountant.id.clone(),
                tenant_id: TenantId::new(TENANT),
                mcp_id: "mcp-1".to_string(),
                engine_id: EngineId::new(ENGINE),
                manifest_fingerprint: fingerprint.clone(),
                parent_chain_id: None,
            },
            vec![JOURNAL.to_string()],
        )
        .unwrap();
    let outcome = s
        .kernel
        .dispatch(
            ActionRequest::new(ENGINE, JOURNAL, TENANT, accountant, input).with_trust(TrustEvidence {
                manifest,
                expected_fingerprint: fingerprint,
                chain,
                token,
                required_scopes: vec![JOURNAL.to_string()],
            }),
        )
        .await
        .unwrap();
    assert!(outcome.audit_hash.is_some());
}

#[tokio::test]
async fn shutdown_stops_new_work() {
    let s = setup(KernelConfig::default()).await;
    let accountant = credential_for(&s.kernel, "u-acct", RoleId::TenantAccountant).await;
    let rotated = s.kernel.rotate_signing_key().unwrap();
    assert_eq!(s.kernel.authority().fingerprint(), Some(rotated));

    s.kernel.shutdown();
    assert!(s.kernel.is_shut_down());
    assert!(s.kernel.authority().fingerprint().is_none());

    let failure = s
        .kernel
        .invoke(ENGINE, JOURNAL, TENANT, accountant, json!({"amount": 1, "memo": "late"}))
        .await
        .unwrap_err();
    assert_eq!(failure.body.error, "internal");
    assert!(matches!(
        s.kernel.rotate_signing_key(),
        Err(KernelError::ShutDown)
    ));
    assert!(s.kernel.audit_fallback().is_empty());
}

#[tokio::test]
async fn connect_selects_storage_from_config() {
    let kernel = Kernel::connect(KernelConfig::default()).await.unwrap();
    assert!(kernel.breaker_snapshots().is_empty());

    let env = [("KEEL_TELEMETRY__LOG_LEVEL", "warn"), ("KEEL_TRUST__REQUIRE_TOKEN", "true")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = KernelConfig::load_with_env(None, Some(env)).unwrap();
    assert!(config.trust.require_token);
    let kernel = Kernel::connect(config).await.unwrap();
    assert_eq!(kernel.config().telemetry.log_level, "warn");
}

#[cfg(not(feature = "postgres"))]
#[tokio::test]
async fn postgres_requires_the_feature() {
    let config = KernelConfig {
        storage: StorageConfig::Postgres {
            url: "postgres://localhost/keel".to_string(),
            max_connections: 4,
            connect_timeout_secs: 1,
        },
        ..KernelConfig::default()
    };
    assert!(matches!(
        Kernel::connect(config).await,
        Err(KernelError::InvalidConfig(_))
    ));
}

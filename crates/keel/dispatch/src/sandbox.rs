//! The only surface a handler sees while it runs.

use crate::events::{DomainEvent, EventSink};
use async_trait::async_trait;
use keel_storage::{KeyValueStore, TenantDataStore};
use keel_types::{ActionId, EngineId, TenantId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Read side of a cancellation signal. Never fires without a handle.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    receiver: Option<watch::Receiver<bool>>,
}

/// Write side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl CancellationSignal {
    pub fn pair() -> (CancelHandle, CancellationSignal) {
        let (sender, receiver) = watch::channel(false);
        (
            CancelHandle { sender },
            CancellationSignal {
                receiver: Some(receiver),
            },
        )
    }

    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested. Pending forever when the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(mut rx) = self.receiver.clone() else {
            return std::future::pending().await;
        };
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn tenant_id(&self) -> &TenantId;

    fn principal_id(&self) -> &str;

    /// Rows of `collection` in this tenant matching `filter` field-by-field.
    async fn fetch(&self, collection: &str, filter: Value) -> anyhow::Result<Vec<Value>>;

    async fn insert(&self, collection: &str, record: Value) -> anyhow::Result<Value>;

    async fn cache_get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn cache_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Queue a domain event attributed to this invocation.
    fn emit(&self, name: &str, payload: Value);

    fn log(&self, level: LogLevel, message: &str);

    fn cancellation(&self) -> &CancellationSignal;
}

/// Sandbox bound to one tenant and one invocation.
pub struct TenantSandbox {
    tenant_id: TenantId,
    principal_id: String,
    engine_id: EngineId,
    action_id: ActionId,
    invocation_id: String,
    data: Arc<dyn TenantDataStore>,
    cache: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    cancellation: CancellationSignal,
}

pub(crate) struct SandboxParts {
    pub tenant_id: TenantId,
    pub principal_id: String,
    pub engine_id: EngineId,
    pub action_id: ActionId,
    pub invocation_id: String,
    pub data: Arc<dyn TenantDataStore>,
    pub cache: Arc<dyn KeyValueStore>,
    pub events: Arc<dyn EventSink>,
    pub cancellation: CancellationSignal,
}

impl TenantSandbox {
    pub(crate) fn new(parts: SandboxParts) -> Self {
        Self {
            tenant_id: parts.tenant_id,
            principal_id: parts.principal_id,
            engine_id: parts.engine_id,
            action_id: parts.action_id,
            invocation_id: parts.invocation_id,
            data: parts.data,
            cache: parts.cache,
            events: parts.events,
            cancellation: parts.cancellation,
        }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("keel:tenant:{}:{}:{key}", self.tenant_id, self.engine_id)
    }
}

#[async_trait]
impl Sandbox for TenantSandbox {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    fn principal_id(&self) -> &str {
        &self.principal_id
    }

    async fn fetch(&self, collection: &str, filter: Value) -> anyhow::Result<Vec<Value>> {
        Ok(self.data.fetch(&self.tenant_id, collection, &filter).await?)
    }

    async fn insert(&self, collection: &str, record: Value) -> anyhow::Result<Value> {
        Ok(self.data.insert(&self.tenant_id, collection, record).await?)
    }

    async fn cache_get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.cache.get(&self.cache_key(key)).await?)
    }

    async fn cache_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()> {
        Ok(self.cache.set(&self.cache_key(key), value, ttl).await?)
    }

    fn emit(&self, name: &str, payload: Value) {
        let event = DomainEvent::new(
            name,
            self.tenant_id.clone(),
            self.action_id.clone(),
            self.invocation_id.clone(),
            payload,
        );
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(
                invocation_id = %self.invocation_id,
                event = name,
                error = %err,
                "handler event dropped"
            );
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        let tenant_id = self.tenant_id.as_str();
        let action_id = self.action_id.as_str();
        let invocation_id = self.invocation_id.as_str();
        match level {
            LogLevel::Debug => {
                tracing::debug!(target: "keel::handler", tenant_id, action_id, invocation_id, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(target: "keel::handler", tenant_id, action_id, invocation_id, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(target: "keel::handler", tenant_id, action_id, invocation_id, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(target: "keel::handler", tenant_id, action_id, invocation_id, "{message}")
            }
        }
    }

    fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }
}

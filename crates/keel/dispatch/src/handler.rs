use crate::sandbox::Sandbox;
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::{ActionId, EngineId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Executes one action. Side effects go through the sandbox only.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, input: Value, sandbox: Arc<dyn Sandbox>) -> anyhow::Result<Value>;
}

/// Adapter for closures returning a future.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value, Arc<dyn Sandbox>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, input: Value, sandbox: Arc<dyn Sandbox>) -> anyhow::Result<Value> {
        (self.0)(input, sandbox).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Value, Arc<dyn Sandbox>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by `(engine, action)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<(EngineId, ActionId), Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler it replaced, if any.
    pub fn register(
        &self,
        engine_id: impl Into<EngineId>,
        action_id: impl Into<ActionId>,
        handler: Arc<dyn ActionHandler>,
    ) -> Option<Arc<dyn ActionHandler>> {
        let key = (engine_id.into(), action_id.into());
        tracing::debug!(engine_id = %key.0, action_id = %key.1, "handler registered");
        self.handlers.insert(key, handler)
    }

    pub fn get(&self, engine_id: &EngineId, action_id: &ActionId) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&(engine_id.clone(), action_id.clone()))
            .map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

use keel_types::{ActionId, EngineId, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedEffect {
    Allow,
    Deny,
    Error,
}

impl ObservedEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedEffect::Allow => "allow",
            ObservedEffect::Deny => "deny",
            ObservedEffect::Error => "error",
        }
    }
}

/// One metric observation per terminal invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub action_id: ActionId,
    pub tenant_id: TenantId,
    pub engine_id: EngineId,
    pub effect: ObservedEffect,
    /// Error tag when the invocation did not complete.
    pub error: Option<String>,
    pub duration: Duration,
}

pub trait MetricsSink: Send + Sync {
    fn observe(&self, observation: &Observation);
}

/// Forwards to the `metrics` facade; whichever recorder is installed wins.
#[derive(Debug, Default)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn observe(&self, observation: &Observation) {
        let labels = [
            ("action_id", observation.action_id.to_string()),
            ("tenant_id", observation.tenant_id.to_string()),
            ("effect", observation.effect.as_str().to_string()),
        ];
        metrics::histogram!(
            "keel_action_duration_seconds",
            observation.duration.as_secs_f64(),
            &labels
        );
        metrics::counter!("keel_actions_total", 1, &labels);
    }
}

/// Keeps observations in memory for assertions.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    observations: Mutex<Vec<Observation>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn observe(&self, observation: &Observation) {
        self.observations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(observation.clone());
    }
}

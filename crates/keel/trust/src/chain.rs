//! Identity chains: one node per governed call, linked to the call that
//! caused it. Depth is bounded to stop unbounded recursive amplification.

use crate::error::{Result, TrustError};
use chrono::{DateTime, Utc};
use keel_types::{EngineId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;
use uuid::Uuid;

pub const MAX_CHAIN_DEPTH: u32 = 10;

/// How far in the future a chain timestamp may lie.
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityChain {
    pub chain_id: String,
    pub user_id: String,
    pub tenant_id: TenantId,
    pub mcp_id: String,
    pub engine_id: EngineId,
    pub manifest_fingerprint: String,
    pub parent_chain_id: Option<String>,
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
}

/// Inputs for a new chain node.
#[derive(Debug, Clone)]
pub struct ChainRequest {
    pub user_id: String,
    pub tenant_id: TenantId,
    pub mcp_id: String,
    pub engine_id: EngineId,
    pub manifest_fingerprint: String,
    pub parent_chain_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssue {
    MissingField { field: String },
    DepthExceeded { depth: u32, max: u32 },
    DepthMismatch { depth: u32, expected: u32 },
    ParentNotFound { parent_chain_id: String },
    TenantMismatch { tenant_id: TenantId, parent_tenant_id: TenantId },
    FutureTimestamp { timestamp: DateTime<Utc> },
}

impl fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainIssue::MissingField { field } => write!(f, "missing required field {field}"),
            ChainIssue::DepthExceeded { depth, max } => {
                write!(f, "chain depth {depth} exceeds maximum {max}")
            }
            ChainIssue::DepthMismatch { depth, expected } => {
                write!(f, "chain depth {depth} does not follow parent (expected {expected})")
            }
            ChainIssue::ParentNotFound { parent_chain_id } => {
                write!(f, "parent chain {parent_chain_id} not found")
            }
            ChainIssue::TenantMismatch {
                tenant_id,
                parent_tenant_id,
            } => write!(
                f,
                "chain tenant {tenant_id} differs from parent tenant {parent_tenant_id}"
            ),
            ChainIssue::FutureTimestamp { timestamp } => {
                write!(f, "chain timestamp {timestamp} is in the future")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidation {
    pub valid: bool,
    pub errors: Vec<ChainIssue>,
}

#[derive(Default)]
struct ChainRegistry {
    chains: HashMap<String, IdentityChain>,
    order: VecDeque<String>,
}

/// Creates, stores and validates identity chains.
///
/// The registry is bounded; when full, the oldest chain is evicted first.
pub struct IdentityChainManager {
    registry: RwLock<ChainRegistry>,
    capacity: usize,
}

impl IdentityChainManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: RwLock::new(ChainRegistry::default()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new chain node. Depth is derived from the parent.
    pub fn create(&self, request: ChainRequest) -> Result<IdentityChain> {
        let mut registry = self
            .registry
            .write()
            .map_err(|_| TrustError::Internal("chain registry lock poisoned".to_string()))?;

        let depth = match request.parent_chain_id {
            Some(ref parent_id) => {
                let parent = registry
                    .chains
                    .get(parent_id)
                    .ok_or_else(|| TrustError::ParentChainNotFound(parent_id.clone()))?;
                parent.depth + 1
            }
            None => 0,
        };

        let chain = IdentityChain {
            chain_id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            tenant_id: request.tenant_id,
            mcp_id: request.mcp_id,
            engine_id: request.engine_id,
            manifest_fingerprint: request.manifest_fingerprint,
            parent_chain_id: request.parent_chain_id,
            depth,
            timestamp: Utc::now(),
        };

        while registry.order.len() >= self.capacity {
            match registry.order.pop_front() {
                Some(evicted) => {
                    registry.chains.remove(&evicted);
                }
                None => break,
            }
        }
        registry.order.push_back(chain.chain_id.clone());
        registry
            .chains
            .insert(chain.chain_id.clone(), chain.clone());

        tracing::debug!(
            chain_id = %chain.chain_id,
            tenant_id = %chain.tenant_id,
            depth = chain.depth,
            "identity chain created"
        );
        Ok(chain)
    }

    pub fn get(&self, chain_id: &str) -> Option<IdentityChain> {
        self.registry
            .read()
            .ok()
            .and_then(|registry| registry.chains.get(chain_id).cloned())
    }

    pub fn validate(&self, chain: &IdentityChain) -> ChainValidation {
        let mut errors = Vec::new();

        let required = [
            ("chain_id", chain.chain_id.as_str()),
            ("user_id", chain.user_id.as_str()),
            ("tenant_id", chain.tenant_id.as_str()),
            ("mcp_id", chain.mcp_id.as_str()),
            ("engine_id", chain.engine_id.as_str()),
            ("manifest_fingerprint", chain.manifest_fingerprint.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                errors.push(ChainIssue::MissingField {
                    field: field.to_string(),
                });
            }
        }

        if chain.depth > MAX_CHAIN_DEPTH {
            errors.push(ChainIssue::DepthExceeded {
                depth: chain.depth,
                max: MAX_CHAIN_DEPTH,
            });
        }

        match chain.parent_chain_id {
            Some(ref parent_id) => match self.get(parent_id) {
                Some(parent) => {
                    if parent.tenant_id != chain.tenant_id {
                        errors.push(ChainIssue::TenantMismatch {
                            tenant_id: chain.tenant_id.clone(),
                            parent_tenant_id: parent.tenant_id.clone(),
                        });
                    }
                    if chain.depth != parent.depth + 1 {
                        errors.push(ChainIssue::DepthMismatch {
                            depth: chain.depth,
                            expected: parent.depth + 1,
                        });
                    }
                }
                None => errors.push(ChainIssue::ParentNotFound {
                    parent_chain_id: parent_id.clone(),
                }),
            },
            None if chain.depth != 0 => errors.push(ChainIssue::DepthMismatch {
                depth: chain.depth,
                expected: 0,
            }),
            None => {}
        }

        if chain.timestamp > Utc::now() + chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            errors.push(ChainIssue::FutureTimestamp {
                timestamp: chain.timestamp,
            });
        }

        ChainValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// The chain followed by its ancestors, ending at the root. Stops at the
    /// first ancestor no longer held in the registry.
    pub fn lineage(&self, chain_id: &str) -> Vec<IdentityChain> {
        let Ok(registry) = self.registry.read() else {
            return Vec::new();
        };
        let mut lineage = Vec::new();
        let mut next = registry.chains.get(chain_id);
        while let Some(chain) = next {
            lineage.push(chain.clone());
            if lineage.len() > MAX_CHAIN_DEPTH as usize + 1 {
                break;
            }
            next = chain
                .parent_chain_id
                .as_ref()
                .and_then(|parent| registry.chains.get(parent));
        }
        lineage
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .map(|registry| registry.chains.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(parent: Option<&IdentityChain>) -> ChainRequest {
        ChainRequest {
            user_id: "u-1".into(),
            tenant_id: TenantId::new("t-1"),
            mcp_id: "mcp-1".into(),
            engine_id: EngineId::new("accounting"),
            manifest_fingerprint: "abc".into(),
            parent_chain_id: parent.map(|p| p.chain_id.clone()),
        }
    }

    #[test]
    fn depth_follows_parent() {
        let manager = IdentityChainManager::new(64);
        let root = manager.create(request(None)).unwrap();
        let child = manager.create(request(Some(&root))).unwrap();
        assert_eq!(root.depth, 0);
        assert_eq!(child.depth, 1);
        assert!(manager.validate(&child).valid);
        assert_eq!(manager.lineage(&child.chain_id).len(), 2);
    }

    #[test]
    fn depth_eleven_is_flagged() {
        let manager = IdentityChainManager::new(64);
        let mut chain = manager.create(request(None)).unwrap();
        for _ in 0..11 {
            chain = manager.create(request(Some(&chain))).unwrap();
        }
        assert_eq!(chain.depth, 11);
        let validation = manager.validate(&chain);
        assert!(!validation.valid);
        assert!(validation
            .errors
            .contains(&ChainIssue::DepthExceeded { depth: 11, max: 10 }));
    }

    #[test]
    fn depth_ten_is_accepted() {
        let manager = IdentityChainManager::new(64);
        let mut chain = manager.create(request(None)).unwrap();
        for _ in 0..10 {
            chain = manager.create(request(Some(&chain))).unwrap();
        }
        assert!(manager.validate(&chain).valid);
    }

    #[test]
    fn missing_fields_and_future_timestamps_are_reported() {
        let manager = IdentityChainManager::new(8);
        let mut chain = manager.create(request(None)).unwrap();
        chain.user_id.clear();
        chain.timestamp = Utc::now() + chrono::Duration::seconds(120);
        let validation = manager.validate(&chain);
        assert_eq!(validation.errors.len(), 2);
        assert!(matches!(validation.errors[0], ChainIssue::MissingField { .. }));
        assert!(matches!(validation.errors[1], ChainIssue::FutureTimestamp { .. }));

        // past timestamps are fine
        let mut old = manager.create(request(None)).unwrap();
        old.timestamp = Utc::now() - chrono::Duration::days(3);
        assert!(manager.validate(&old).valid);
    }

    #[test]
    fn parent_must_share_tenant() {
        let manager = IdentityChainManager::new(8);
        let root = manager.create(request(None)).unwrap();
        let mut foreign = request(Some(&root));
        foreign.tenant_id = TenantId::new("t-2");
        let child = manager.create(foreign).unwrap();
        let validation = manager.validate(&child);
        assert!(matches!(
            validation.errors.as_slice(),
            [ChainIssue::TenantMismatch { .. }]
        ));
    }

    #[test]
    fn unknown_parent_is_rejected_at_creation() {
        let manager = IdentityChainManager::new(8);
        let mut orphan = request(None);
        orphan.parent_chain_id = Some("missing".into());
        assert!(matches!(
            manager.create(orphan),
            Err(TrustError::ParentChainNotFound(_))
        ));
    }

    #[test]
    fn registry_evicts_oldest() {
        let manager = IdentityChainManager::new(2);
        let first = manager.create(request(None)).unwrap();
        manager.create(request(None)).unwrap();
        manager.create(request(None)).unwrap();
        assert_eq!(manager.len(), 2);
        assert!(manager.get(&first.chain_id).is_none());
    }
}

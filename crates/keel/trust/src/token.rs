use crate::chain::IdentityChain;
use crate::error::{Result, TrustError};
use crate::signing::{SignedPayload, SigningAuthority};
use chrono::{DateTime, Utc};
use keel_types::{EngineId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_NONCE_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub chain_id: String,
    pub tenant_id: TenantId,
    pub mcp_id: String,
    pub engine_id: EngineId,
    pub manifest_fingerprint: String,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

/// Short-lived single-use capability bound to one identity chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub payload: TokenPayload,
    pub signature: SignedPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenIssue {
    Expired,
    InvalidSignature,
    PayloadMismatch,
    NonceReused,
}

impl fmt::Display for TokenIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenIssue::Expired => "token expired",
            TokenIssue::InvalidSignature => "token signature invalid",
            TokenIssue::PayloadMismatch => "token payload does not match signed payload",
            TokenIssue::NonceReused => "token nonce already used",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub expired: bool,
    pub signature_valid: bool,
    pub payload_matches: bool,
    pub nonce_reused: bool,
    pub errors: Vec<TokenIssue>,
}

impl TokenValidation {
    fn from_checks(expired: bool, signature_valid: bool, payload_matches: bool, nonce_reused: bool) -> Self {
        let mut errors = Vec::new();
        if expired {
            errors.push(TokenIssue::Expired);
        }
        if !signature_valid {
            errors.push(TokenIssue::InvalidSignature);
        }
        if !payload_matches {
            errors.push(TokenIssue::PayloadMismatch);
        }
        if nonce_reused {
            errors.push(TokenIssue::NonceReused);
        }
        Self {
            valid: errors.is_empty(),
            expired,
            signature_valid,
            payload_matches,
            nonce_reused,
            errors,
        }
    }
}

// Consumed nonces in arrival order. Trimmed to the newer half when full.
struct NonceLedger {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl NonceLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(2),
        }
    }

    fn contains(&self, nonce: &str) -> bool {
        self.seen.contains(nonce)
    }

    fn consume(&mut self, nonce: String) {
        if !self.seen.insert(nonce.clone()) {
            return;
        }
        self.order.push_back(nonce);
        if self.order.len() > self.capacity {
            let drop = self.order.len() / 2;
            for old in self.order.drain(..drop) {
                self.seen.remove(&old);
            }
            tracing::debug!(dropped = drop, "consumed nonce set trimmed");
        }
    }
}

/// Issues and validates execution tokens.
pub struct ExecutionTokenManager {
    authority: Arc<SigningAuthority>,
    default_ttl: Duration,
    nonces: Mutex<NonceLedger>,
}

impl ExecutionTokenManager {
    pub fn new(authority: Arc<SigningAuthority>) -> Self {
        Self::with_limits(authority, DEFAULT_TOKEN_TTL, DEFAULT_NONCE_CAPACITY)
    }

    pub fn with_limits(
        authority: Arc<SigningAuthority>,
        default_ttl: Duration,
        nonce_capacity: usize,
    ) -> Self {
        Self {
            authority,
            default_ttl,
            nonces: Mutex::new(NonceLedger::new(nonce_capacity)),
        }
    }

    pub fn authority(&self) -> &Arc<SigningAuthority> {
        &self.authority
    }

    /// Issue a token for `chain`. The signature covers exactly the
    /// JSON-serialized payload.
    pub fn issue(
        &self,
        chain: &IdentityChain,
        scopes: Vec<String>,
        ttl: Option<Duration>,
    ) -> Result<ExecutionToken> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| TrustError::Internal(format!("token ttl out of range: {e}")))?;

        let payload = TokenPayload {
            chain_id: chain.chain_id.clone(),
            tenant_id: chain.tenant_id.clone(),
            mcp_id: chain.mcp_id.clone(),
            engine_id: chain.engine_id.clone(),
            manifest_fingerprint: chain.manifest_fingerprint.clone(),
            scopes,
            issued_at,
            expires_at: issued_at + ttl,
            nonce: Uuid::new_v4().to_string(),
        };
        let signature = self.authority.sign(serde_json::to_string(&payload)?)?;
        tracing::debug!(
            chain_id = %payload.chain_id,
            tenant_id = %payload.tenant_id,
            expires_at = %payload.expires_at,
            "execution token issued"
        );
        Ok(ExecutionToken { payload, signature })
    }

    /// Check the token without consuming its nonce.
    pub fn inspect(&self, token: &ExecutionToken) -> TokenValidation {
        let (expired, signature_valid, payload_matches) = self.static_checks(token);
        let nonce_reused = self
            .nonces
            .lock()
            .map(|ledger| ledger.contains(&token.payload.nonce))
            .unwrap_or(true);
        TokenValidation::from_checks(expired, signature_valid, payload_matches, nonce_reused)
    }

    /// Check the token and, when every check passes, consume its nonce.
    pub fn validate(&self, token: &ExecutionToken) -> TokenValidation {
        let (expired, signature_valid, payload_matches) = self.static_checks(token);

        let Ok(mut ledger) = self.nonces.lock() else {
            tracing::error!("nonce ledger lock poisoned; rejecting token");
            return TokenValidation::from_checks(expired, signature_valid, payload_matches, true);
        };
        let nonce_reused = ledger.contains(&token.payload.nonce);
        let validation =
            TokenValidation::from_checks(expired, signature_valid, payload_matches, nonce_reused);
        if validation.valid {
            ledger.consume(token.payload.nonce.clone());
        } else {
            tracing::info!(
                chain_id = %token.payload.chain_id,
                errors = ?validation.errors,
                "execution token rejected"
            );
        }
        validation
    }

    fn static_checks(&self, token: &ExecutionToken) -> (bool, bool, bool) {
        let expired = Utc::now() >= token.payload.expires_at;
        let signature_valid = self.authority.verify(&token.signature, None);
        let payload_matches = serde_json::from_str::<TokenPayload>(&token.signature.payload)
            .map(|signed| signed == token.payload)
            .unwrap_or(false);
        (expired, signature_valid, payload_matches)
    }
}

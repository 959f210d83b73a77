use crate::chain::{IdentityChain, IdentityChainManager};
use crate::error::{Result, TrustError};
use crate::fingerprint::ManifestFingerprint;
use crate::token::{ExecutionToken, ExecutionTokenManager};
use keel_types::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Token scope that satisfies every requirement.
pub const WILDCARD_SCOPE: &str = "*";

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub manifest: Value,
    pub expected_fingerprint: String,
    pub chain: IdentityChain,
    pub token: ExecutionToken,
    pub tenant_id: TenantId,
    pub required_scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl CheckResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            passed: errors.is_empty(),
            errors,
        }
    }
}

/// Individual results of every trust check plus the overall verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub manifest_fingerprint: CheckResult,
    pub identity_chain: CheckResult,
    pub tenant_binding: CheckResult,
    pub token: CheckResult,
    pub scopes: CheckResult,
}

impl VerificationReport {
    /// Every failure across all checks, in check order.
    pub fn errors(&self) -> Vec<String> {
        [
            &self.manifest_fingerprint,
            &self.identity_chain,
            &self.tenant_binding,
            &self.token,
            &self.scopes,
        ]
        .into_iter()
        .flat_map(|check| check.errors.iter().cloned())
        .collect()
    }
}

pub struct TrustVerifier {
    chains: Arc<IdentityChainManager>,
    tokens: Arc<ExecutionTokenManager>,
}

impl TrustVerifier {
    pub fn new(chains: Arc<IdentityChainManager>, tokens: Arc<ExecutionTokenManager>) -> Self {
        Self { chains, tokens }
    }

    pub fn chains(&self) -> &Arc<IdentityChainManager> {
        &self.chains
    }

    pub fn tokens(&self) -> &Arc<ExecutionTokenManager> {
        &self.tokens
    }

    /// Run every check and aggregate the failures. The token's nonce is only
    /// consumed when all other checks pass and the token itself is valid.
    pub fn verify(&self, request: &VerificationRequest) -> VerificationReport {
        let manifest_fingerprint = CheckResult::from_errors(
            if ManifestFingerprint::matches(&request.manifest, &request.expected_fingerprint) {
                Vec::new()
            } else {
                vec!["manifest fingerprint mismatch".to_string()]
            },
        );

        let mut chain_errors: Vec<String> = self
            .chains
            .validate(&request.chain)
            .errors
            .iter()
            .map(ToString::to_string)
            .collect();
        if request.chain.manifest_fingerprint != request.expected_fingerprint {
            chain_errors.push("identity chain bound to a different manifest".to_string());
        }
        let identity_chain = CheckResult::from_errors(chain_errors);

        let mut binding_errors = Vec::new();
        if request.chain.tenant_id != request.tenant_id {
            binding_errors.push(format!(
                "identity chain tenant {} does not match {}",
                request.chain.tenant_id, request.tenant_id
            ));
        }
        if request.token.payload.tenant_id != request.tenant_id {
            binding_errors.push(format!(
                "token tenant {} does not match {}",
                request.token.payload.tenant_id, request.tenant_id
            ));
        }
        if request.token.payload.chain_id != request.chain.chain_id {
            binding_errors.push("token issued for a different identity chain".to_string());
        }
        let tenant_binding = CheckResult::from_errors(binding_errors);

        let granted = &request.token.payload.scopes;
        let wildcard = granted.iter().any(|s| s == WILDCARD_SCOPE);
        let scopes = CheckResult::from_errors(
            request
                .required_scopes
                .iter()
                .filter(|required| !wildcard && !granted.contains(required))
                .map(|missing| format!("missing scope {missing}"))
                .collect(),
        );

        let others_pass = manifest_fingerprint.passed
            && identity_chain.passed
            && tenant_binding.passed
            && scopes.passed;
        let validation = if others_pass {
            self.tokens.validate(&request.token)
        } else {
            self.tokens.inspect(&request.token)
        };
        let token = CheckResult::from_errors(
            validation.errors.iter().map(ToString::to_string).collect(),
        );

        let verified = others_pass && token.passed;
        if !verified {
            tracing::info!(
                tenant_id = %request.tenant_id,
                chain_id = %request.chain.chain_id,
                "trust verification failed"
            );
        }
        VerificationReport {
            verified,
            manifest_fingerprint,
            identity_chain,
            tenant_binding,
            token,
            scopes,
        }
    }

    pub fn verify_or_fail(&self, request: &VerificationRequest) -> Result<VerificationReport> {
        let report = self.verify(request);
        if report.verified {
            Ok(report)
        } else {
            Err(TrustError::VerificationFailed(Box::new(report)))
        }
    }
}

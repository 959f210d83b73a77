//! Keel Trust - cryptographic trust chain for governed calls.
//!
//! A call is trustworthy when:
//! - the engine manifest matches its registered fingerprint
//! - the call belongs to a valid identity chain (bounded nesting depth)
//! - it carries an unexpired, correctly signed, never-used execution token
//! - the token is bound to the same tenant and grants the required scopes
//!
//! Keys, chains and consumed nonces are held in memory only. A process
//! restart invalidates every outstanding token.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

mod chain;
mod error;
mod fingerprint;
mod signing;
mod token;
mod verifier;

pub use chain::{
    ChainIssue, ChainRequest, ChainValidation, IdentityChain, IdentityChainManager,
    MAX_CHAIN_DEPTH, MAX_CLOCK_SKEW_SECS,
};
pub use error::{Result, TrustError};
pub use fingerprint::ManifestFingerprint;
pub use signing::{key_fingerprint, SignedPayload, SigningAuthority, KEY_BITS, SIGNATURE_ALGORITHM};
pub use token::{
    ExecutionToken, ExecutionTokenManager, TokenIssue, TokenPayload, TokenValidation,
    DEFAULT_NONCE_CAPACITY, DEFAULT_TOKEN_TTL,
};
pub use verifier::{CheckResult, TrustVerifier, VerificationReport, VerificationRequest, WILDCARD_SCOPE};

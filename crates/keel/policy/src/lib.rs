//! # Keel Policy
//!
//! Role-based decision engine for governed actions.
//!
//! A decision is a pure function of the request: the principal's roles and
//! scopes produce an effective permission set, the action (or an explicit
//! access hint) produces a required permission set, and the request is
//! allowed iff every required permission is held.
//!
//! - [`PolicyEngine`]: evaluates [`PolicyRequest`]s into [`PolicyDecision`]s
//! - [`effective_permissions`]: role and scope expansion
//! - [`required_permissions`]: access hint and action prefix table
//!
//! The internal kernel principal bypasses evaluation. Bypasses are logged at
//! warn level and flagged on the decision so the audit entry carries them.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

mod engine;
mod error;
mod permissions;
mod request;
mod requirements;

pub use engine::{PolicyEngine, KERNEL_BYPASS_REASON, TENANT_MISMATCH_REASON};
pub use error::{PolicyError, Result};
pub use keel_types::PolicyDecision;
pub use permissions::{effective_permissions, SCOPE_PREFIX};
pub use request::PolicyRequest;
pub use requirements::{required_permissions, READ_VERB_PREFIXES};

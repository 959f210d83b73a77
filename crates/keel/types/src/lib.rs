//! Keel Types - the shared vocabulary of the governance kernel.
//!
//! Everything that crosses a crate boundary lives here:
//! - the closed permission and role catalogs
//! - principals (who is calling)
//! - action contracts (what they are calling)
//! - policy decisions (whether they may)
//! - canonical JSON, used wherever a value must hash identically
//!   regardless of key insertion order

#![deny(unsafe_code)]

pub mod canonical;
mod contract;
mod decision;
mod ids;
mod permission;
mod principal;
mod role;

pub use canonical::{canonical_json, canonical_value};
pub use contract::{ActionContract, ExecutionMode, RiskBand, SideEffectLevel};
pub use decision::{AccessType, Effect, PolicyDecision, MISSING_PERMISSIONS_PREFIX};
pub use ids::{ActionId, EngineId, TenantId};
pub use permission::{Permission, PermissionId, UnknownPermission};
pub use principal::{AuthMethod, Principal, KERNEL_PRINCIPAL_ID};
pub use role::{Role, RoleId, UnknownRole};

//! Keel Registry - the catalog of installable engines.
//!
//! An engine is registered by submitting a manifest: its identity, version,
//! declared dependencies, and the contracts of the actions it serves.
//! Manifests are schema-checked before anything is written, signatures are
//! checked against the signing authority, and every write invalidates the
//! read-through cache under the distributed lock.

#![deny(unsafe_code)]

mod error;
mod manifest;
mod registry;
pub mod schema;

pub use error::{DependencyIssue, RegistryError, Result};
pub use manifest::{manifest_schema, ActionDefinition, EngineManifest};
pub use registry::{EngineRegistry, RegistryOptions, ENGINE_INSTALL_ACTION};
pub use schema::{CompiledSchema, SchemaCache};

//! # Keel Kernel
//!
//! Assembles the governance pipeline from configuration:
//!
//! - [`KernelConfig`]: layered configuration (defaults, file, `KEEL_*` env)
//! - [`telemetry::init_tracing`]: global `tracing` subscriber
//! - [`Kernel`]: credential authentication, policy-gated registration and
//!   audit access, and the `invoke` entry point every action goes through
//!
//! ```no_run
//! # async fn run() -> keel_kernel::Result<()> {
//! use keel_kernel::{Kernel, KernelConfig};
//!
//! let config = KernelConfig::load(Some("keel.toml"))?;
//! keel_kernel::telemetry::init_tracing(&config.telemetry)?;
//! let _kernel = Kernel::connect(config).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod config;
mod error;
mod kernel;
pub mod telemetry;

pub use config::{
    DispatcherSettings, KernelConfig, LedgerSettings, RegistrySettings, StorageConfig,
    TelemetryConfig, TrustConfig,
};
pub use error::{KernelError, Result};
pub use kernel::{
    hash_secret, CredentialGrant, InvocationFailure, IssuedCredential, Kernel, KernelBuilder,
    AUDIT_QUERY_ACTION, AUDIT_VERIFY_ACTION, CREDENTIAL_MANAGE_ACTION, ENGINE_STATUS_ACTION,
};

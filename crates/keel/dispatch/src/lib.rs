//! Keel Dispatch - the governed execution pipeline.
//!
//! ```text
//! Received -> ContractLoaded -> PolicyEvaluated -> QuotaChecked
//!          -> [TrustVerified] -> InputValidated -> Executing
//!          -> OutputValidated -> Audited -> Completed
//! ```
//!
//! Any stage may end the invocation with a [`DispatchError`]. Denied, failed
//! and completed invocations alike are audited, published and measured once.

#![deny(unsafe_code)]

mod dispatcher;
mod error;
pub mod events;
mod handler;
pub mod observe;
pub mod sandbox;
mod state;

#[cfg(test)]
mod pipeline_tests;

pub use dispatcher::{
    ActionOutcome, ActionRequest, ContractResolver, Dispatcher, DispatcherConfig, DispatcherDeps,
    TrustEvidence,
};
pub use error::{DispatchError, ErrorBody, Result};
pub use events::{BroadcastEventSink, DomainEvent, EventError, EventSink, TracingEventSink};
pub use handler::{handler_fn, ActionHandler, FnHandler, HandlerRegistry};
pub use observe::{FacadeMetrics, InMemoryMetrics, MetricsSink, Observation, ObservedEffect};
pub use sandbox::{CancelHandle, CancellationSignal, LogLevel, Sandbox, TenantSandbox};
pub use state::DispatchState;

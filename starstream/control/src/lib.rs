#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Starstream control – the observe, plan, execute, verify loop.
//!
//! Every submitted intent runs its own state machine
//! (`Pending → Planned → Approved → Executing → Verifying → Converged`) on the
//! tokio runtime. Stages are plain calls into the planner, the policy
//! evaluator, an executor adapter, and the verifier; their typed results drive
//! the transitions and each one lands in the append-only [`CycleLog`].
//! [`ControlPlane`] is the public face: submission, cancellation, teardown,
//! expiry, and the telemetry feed.

/// Orchestrator states and control-plane errors.
#[path = "../state.rs"]
pub mod state;

/// Append-only cycle records.
#[path = "../cycle.rs"]
pub mod cycle;

/// Retry budget and backoff strategies.
#[path = "../retry.rs"]
pub mod retry;

/// Control configuration documents.
#[path = "../config.rs"]
pub mod config;

/// Per-intent control loop.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

/// Control-plane facade.
#[path = "../plane.rs"]
pub mod plane;

#[cfg(test)]
#[path = "../scenarios.rs"]
mod scenarios;

pub use config::{ControlConfig, StageTimeouts};
pub use cycle::{CycleLog, CycleRecord, Stage};
pub use orchestrator::IntentReport;
pub use plane::{ControlPlane, ControlPlaneBuilder, Submission};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state::{ControlError, IntentState};

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Starstream execution – the only layer that touches a substrate.
//!
//! [`ExecutorAdapter`]s apply approved allocations and either report the
//! observed state or roll back completely. The [`Verifier`] then closes the
//! loop by judging fresh telemetry against the original intent.

/// Adapter contract, results, and the adapter registry.
#[path = "../adapter.rs"]
pub mod adapter;

/// In-memory substrate with scripted faults and synthetic telemetry.
#[path = "../simulation.rs"]
pub mod simulation;

/// Post-execution verification against intent thresholds.
#[path = "../verifier.rs"]
pub mod verifier;

pub use adapter::{
    AdapterKind, AdapterRegistry, ExecutionError, ExecutionFailure, ExecutionResult,
    ExecutorAdapter, ObservedState,
};
pub use simulation::{FaultPlan, SimulationAdapter};
pub use verifier::{Outcome, Verifier, VerifierConfig, ViolatedConstraint};

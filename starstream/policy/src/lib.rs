#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Admission policy for Starstream allocations.
//!
//! A [`Policy`] is an ordered list of [`Constraint`]s loaded once per run.
//! [`evaluate`] checks a planned [`Candidate`](starstream_planning::Candidate)
//! against a topology snapshot and returns a [`Decision`]: approve, reject, or
//! approve after evicting lower-priority allocations.

/// Constraint definitions and policy documents.
#[path = "../constraint.rs"]
pub mod constraint;

/// Candidate evaluation and preemption selection.
#[path = "../evaluator.rs"]
pub mod evaluator;

pub use constraint::{Constraint, EvictionOrder, Policy, PolicyDocument, PreemptionRule};
pub use evaluator::{
    admissible_view, evaluate, reclaimable_view, Decision, PolicyEvaluator, RejectReason,
};

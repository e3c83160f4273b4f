#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Path planning for Starstream intents.
//!
//! The [`Planner`] turns an [`Intent`](starstream_fabric::Intent) and a
//! [`TopologyView`](starstream_fabric::TopologyView) into a [`Candidate`] path,
//! or names the first constraint that made the request [`Infeasible`]. The
//! [`placement`] module holds the substrate placement baselines used to pick a
//! compute substrate for a workload.

/// Constrained shortest-path planner.
#[path = "../planner.rs"]
pub mod planner;

/// Domain-boundary transition costs.
#[path = "../transitions.rs"]
pub mod transitions;

/// Substrate placement baselines.
#[path = "../placement.rs"]
pub mod placement;

pub use placement::{
    score, ConstrainedBestScore, ConstrainedEpsilonGreedy, Estimate, Estimator, Placement,
    PlacementMode, PlacementPolicy, Slo, Substrate, Workload,
};
pub use planner::{Candidate, Infeasible, InfeasibleReason, Planner, PlannerConfig};
pub use transitions::{TransitionCost, TransitionCosts, TransitionRule};

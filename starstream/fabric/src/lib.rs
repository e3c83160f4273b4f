#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Starstream fabric – the shared resource model the control loop plans against.
//!
//! Optical channels, electronic links, and compute-fabric ports are all
//! [`Resource`]s: capacity-bearing edges between endpoints, tagged with their
//! [`Domain`]. The [`ResourceModel`] serializes every mutation per resource,
//! [`TelemetryIngest`] is the only writer of operational state, and planners
//! work on immutable [`TopologyView`] snapshots.

/// Shared telemetry handle (structured logs + lifecycle events).
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Resource identifiers, domains, status, and errors.
#[path = "../resource.rs"]
pub mod resource;

/// Concurrent resource model with per-resource serialization.
#[path = "../model.rs"]
pub mod model;

/// Read-only topology snapshots consumed by planning and policy.
#[path = "../topology.rs"]
pub mod topology;

/// Declared bandwidth/latency intents.
#[path = "../intent.rs"]
pub mod intent;

/// Allocations (plans) and their lifecycle ledger.
#[path = "../allocation.rs"]
pub mod allocation;

/// Telemetry ingest normalizing adapter samples into the model.
#[path = "../ingest.rs"]
pub mod ingest;

/// Invariant audit across the model and the allocation ledger.
#[path = "../audit.rs"]
pub mod audit;

/// Topology configuration documents.
#[path = "../config.rs"]
pub mod config;

pub use allocation::{
    Allocation, AllocationError, AllocationId, AllocationLedger, AllocationState, Hop,
};
pub use audit::{audit, InvariantBreach};
pub use config::{ResourceEntry, TopologyDocument};
pub use ingest::{IngestOutcome, IngestSummary, TelemetryIngest, TelemetrySample};
pub use intent::{Intent, IntentError, IntentId, Priority, ValidityWindow};
pub use model::ResourceModel;
pub use resource::{
    Domain, EndpointId, Resource, ResourceError, ResourceId, ResourceSpec, ResourceStatus,
    CAPACITY_EPSILON,
};
pub use telemetry::{FabricTelemetry, FabricTelemetryBuilder};
pub use topology::{ActiveClaim, TopologyView};

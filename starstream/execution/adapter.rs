use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use starstream_fabric::{Allocation, AllocationId, ResourceError, ResourceId, TelemetrySample};
use thiserror::Error;

/// Capability tag an adapter registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// In-memory simulated substrate.
    Simulation,
    /// Slot reserved for hardware drivers.
    HardwareReserved,
}

impl AdapterKind {
    /// Label for logs and config.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            Self::HardwareReserved => "hardware-reserved",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Substrate state observed right after applying an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Allocation applied.
    pub allocation_id: AllocationId,
    /// One sample per resource on the path.
    pub samples: Vec<TelemetrySample>,
    /// When the substrate finished applying.
    pub applied_at: DateTime<Utc>,
}

/// Why an execution did not apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Human readable reason.
    pub reason: String,
    /// Resource that refused, if one did.
    pub resource: Option<ResourceId>,
    /// Segments that were applied and then rolled back before returning.
    pub rolled_back_hops: usize,
}

/// Result of [`ExecutorAdapter::execute`].
///
/// `Failed` always means the substrate is back in its pre-execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Every segment applied.
    Applied(ObservedState),
    /// Nothing remains applied.
    Failed(ExecutionFailure),
}

/// Adapter-level errors outside the applied/failed contract.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ExecutionError {
    /// No adapter registered for this kind.
    #[error("no executor adapter registered for `{0}`")]
    AdapterUnavailable(AdapterKind),
    /// The substrate model refused an operation.
    #[error("substrate error: {0}")]
    Resource(#[from] ResourceError),
    /// A stage did not finish in time.
    #[error("{stage} timed out after {after_ms} ms")]
    Timeout {
        /// Stage that timed out.
        stage: String,
        /// Timeout in milliseconds.
        after_ms: u64,
    },
}

/// Boundary between the control loop and a substrate.
///
/// Implementations are the only code allowed to change substrate state.
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    /// Capability tag.
    fn kind(&self) -> AdapterKind;

    /// Instance name.
    fn name(&self) -> &str;

    /// Applies an approved allocation, rolling back any partial application
    /// before reporting failure.
    async fn execute(&self, allocation: &Allocation) -> ExecutionResult;

    /// Removes an allocation from the substrate. Releasing an allocation that
    /// is not applied is a no-op.
    async fn release(&self, allocation: &Allocation) -> Result<(), ExecutionError>;

    /// Fresh telemetry for the resources of an allocation.
    async fn observe(&self, allocation: &Allocation) -> Result<Vec<TelemetrySample>, ExecutionError>;
}

/// Adapters keyed by capability tag.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: IndexMap<AdapterKind, Arc<dyn ExecutorAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.adapters.iter().map(|(kind, adapter)| (kind.label(), adapter.name())))
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its declared kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ExecutorAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ExecutorAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for `kind`.
    pub fn resolve(&self, kind: AdapterKind) -> Result<Arc<dyn ExecutorAdapter>, ExecutionError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(ExecutionError::AdapterUnavailable(kind))
    }

    /// Registered kinds in registration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<AdapterKind> {
        self.adapters.keys().copied().collect()
    }
}

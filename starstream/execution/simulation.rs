use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use starstream_fabric::{
    Allocation, AllocationId, FabricTelemetry, ResourceId, ResourceModel, ResourceStatus,
    TelemetrySample,
};

use crate::adapter::{
    AdapterKind, ExecutionError, ExecutionFailure, ExecutionResult, ExecutorAdapter,
    ObservedState,
};

/// Scripted faults for the simulated substrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultPlan {
    /// Fail this many upcoming executions before touching the substrate.
    pub fail_next: u32,
    /// Refuse to apply any allocation crossing these resources. Earlier
    /// segments are applied and then rolled back.
    pub fail_on: BTreeSet<ResourceId>,
    /// After the next application crossing a resource, report it degraded to
    /// the given usable capacity.
    pub degrade_after_apply: IndexMap<ResourceId, f64>,
    /// Sleep this long before applying.
    pub delay: Option<Duration>,
}

/// Executor over a private fork of the resource model.
///
/// The fork starts as a copy of the shared model and from then on plays the
/// role of the physical substrate: executions commit on it, scripted faults
/// alter it, and synthetic telemetry is read back from it.
pub struct SimulationAdapter {
    name: String,
    substrate: ResourceModel,
    faults: Mutex<FaultPlan>,
    rng: Mutex<SmallRng>,
    jitter_ms: f64,
    applied: Mutex<IndexMap<AllocationId, Vec<ResourceId>>>,
    telemetry: Option<FabricTelemetry>,
}

impl std::fmt::Debug for SimulationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationAdapter")
            .field("name", &self.name)
            .field("resources", &self.substrate.len())
            .field("applied", &self.applied.lock().len())
            .finish_non_exhaustive()
    }
}

impl SimulationAdapter {
    /// Adapter over a fork of `model`, with a seeded jitter source.
    #[must_use]
    pub fn new(model: &ResourceModel, seed: u64) -> Self {
        Self {
            name: "simulation".into(),
            substrate: model.fork(),
            faults: Mutex::new(FaultPlan::default()),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            jitter_ms: 0.0,
            applied: Mutex::new(IndexMap::new()),
            telemetry: None,
        }
    }

    /// Renames the adapter.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds uniform latency jitter in `[0, jitter_ms)` to every sample.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_ms: f64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Installs a fault plan.
    #[must_use]
    pub fn with_faults(self, faults: FaultPlan) -> Self {
        *self.faults.lock() = faults;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Fails the next `count` executions.
    pub fn fail_next(&self, count: u32) {
        self.faults.lock().fail_next = count;
    }

    /// Refuses allocations crossing `resource`.
    pub fn fail_on(&self, resource: impl Into<ResourceId>) {
        self.faults.lock().fail_on.insert(resource.into());
    }

    /// Clears every scripted fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    /// Degrades `resource` right after the next application crossing it.
    pub fn degrade_after_apply(&self, resource: impl Into<ResourceId>, capacity: f64) {
        self.faults
            .lock()
            .degrade_after_apply
            .insert(resource.into(), capacity);
    }

    /// Delays every execution.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Changes substrate state directly, as an outage would.
    pub fn set_state(
        &self,
        resource: &ResourceId,
        status: ResourceStatus,
        capacity: f64,
    ) -> Result<(), ExecutionError> {
        self.substrate.update_state(resource, status, capacity)?;
        Ok(())
    }

    /// Simulated substrate.
    #[must_use]
    pub const fn substrate(&self) -> &ResourceModel {
        &self.substrate
    }

    /// Whether an allocation is currently applied.
    #[must_use]
    pub fn is_applied(&self, allocation: AllocationId) -> bool {
        self.applied.lock().contains_key(&allocation)
    }

    fn samples(&self, path: &[ResourceId]) -> Result<Vec<TelemetrySample>, ExecutionError> {
        let mut samples = Vec::with_capacity(path.len());
        for id in path {
            let resource = self.substrate.get(id)?;
            let jitter = if self.jitter_ms > 0.0 {
                self.rng.lock().gen_range(0.0..self.jitter_ms)
            } else {
                0.0
            };
            samples.push(
                TelemetrySample::new(id.clone(), resource.status, resource.usable_capacity())
                    .with_latency(resource.latency_ms + jitter)
                    .with_loss(resource.loss),
            );
        }
        Ok(samples)
    }

    fn apply(&self, allocation: &Allocation) -> ExecutionResult {
        let path = allocation.resource_ids();
        let amount = allocation.bandwidth_gbps;
        let (fail_now, blocked) = {
            let mut faults = self.faults.lock();
            let fail_now = faults.fail_next > 0;
            if fail_now {
                faults.fail_next -= 1;
            }
            let blocked = path.iter().position(|id| faults.fail_on.contains(id));
            (fail_now, blocked)
        };
        if fail_now {
            return failed("scripted execution failure", None, 0);
        }
        if let Some(stop) = blocked {
            let applied = &path[..stop];
            if let Err(err) = self.substrate.commit_path(applied, amount) {
                return failed(&err.to_string(), Some(err.resource().clone()), 0);
            }
            let rolled_back = match self.substrate.release_path(applied, amount) {
                Ok(()) => applied.len(),
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        "execution.simulation.rollback_failed",
                        json!({ "allocation": allocation.id.to_string(), "error": err.to_string() }),
                    );
                    0
                }
            };
            return failed(
                &format!("substrate refused `{}`", path[stop]),
                Some(path[stop].clone()),
                rolled_back,
            );
        }
        if let Err(err) = self.substrate.commit_path(&path, amount) {
            return failed(&err.to_string(), Some(err.resource().clone()), 0);
        }
        self.applied.lock().insert(allocation.id, path.clone());

        let degrade: Vec<(ResourceId, f64)> = {
            let mut faults = self.faults.lock();
            path.iter()
                .filter_map(|id| faults.degrade_after_apply.shift_remove(id).map(|c| (id.clone(), c)))
                .collect()
        };
        for (id, capacity) in degrade {
            // Path resources were just committed, so the id is known.
            let _ = self
                .substrate
                .update_state(&id, ResourceStatus::Degraded, capacity);
        }

        match self.samples(&path) {
            Ok(samples) => ExecutionResult::Applied(ObservedState {
                allocation_id: allocation.id,
                samples,
                applied_at: Utc::now(),
            }),
            Err(err) => failed(&err.to_string(), None, 0),
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

fn failed(reason: &str, resource: Option<ResourceId>, rolled_back_hops: usize) -> ExecutionResult {
    ExecutionResult::Failed(ExecutionFailure {
        reason: reason.to_owned(),
        resource,
        rolled_back_hops,
    })
}

#[async_trait]
impl ExecutorAdapter for SimulationAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Simulation
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, allocation: &Allocation) -> ExecutionResult {
        let delay = self.faults.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.apply(allocation);
        match &result {
            ExecutionResult::Applied(observed) => {
                self.log(
                    LogLevel::Info,
                    "execution.simulation.applied",
                    json!({
                        "allocation": allocation.id.to_string(),
                        "hops": observed.samples.len()
                    }),
                );
                self.event(
                    "execution.simulation.applied",
                    json!({ "allocation": allocation.id.to_string() }),
                );
            }
            ExecutionResult::Failed(failure) => {
                self.log(
                    LogLevel::Warn,
                    "execution.simulation.failed",
                    json!({
                        "allocation": allocation.id.to_string(),
                        "reason": failure.reason,
                        "rolled_back_hops": failure.rolled_back_hops
                    }),
                );
                self.event(
                    "execution.simulation.failed",
                    json!({ "allocation": allocation.id.to_string(), "reason": failure.reason }),
                );
            }
        }
        result
    }

    async fn release(&self, allocation: &Allocation) -> Result<(), ExecutionError> {
        let Some(path) = self.applied.lock().shift_remove(&allocation.id) else {
            return Ok(());
        };
        self.substrate
            .release_path(&path, allocation.bandwidth_gbps)?;
        self.log(
            LogLevel::Info,
            "execution.simulation.released",
            json!({ "allocation": allocation.id.to_string() }),
        );
        Ok(())
    }

    async fn observe(&self, allocation: &Allocation) -> Result<Vec<TelemetrySample>, ExecutionError> {
        self.samples(&allocation.resource_ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starstream_fabric::{Domain, Intent, ResourceSpec, CAPACITY_EPSILON};
    use starstream_planning::Planner;

    fn model() -> ResourceModel {
        let model = ResourceModel::new();
        model
            .register(ResourceSpec::new("a-b", Domain::Optical, "A", "B", 100.0, 1.0))
            .unwrap();
        model
            .register(ResourceSpec::new("b-c", Domain::Optical, "B", "C", 100.0, 1.0))
            .unwrap();
        model
    }

    fn allocation(model: &ResourceModel, bw: f64) -> Allocation {
        Planner::default()
            .plan(&Intent::bandwidth("A", "C", bw), &model.view())
            .unwrap()
            .into_allocation()
    }

    fn committed(adapter: &SimulationAdapter, id: &str) -> f64 {
        adapter.substrate().get(&id.into()).unwrap().committed_capacity
    }

    #[tokio::test]
    async fn applies_and_releases() {
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7);
        let alloc = allocation(&model, 10.0);
        let ExecutionResult::Applied(observed) = adapter.execute(&alloc).await else {
            panic!("expected application");
        };
        assert_eq!(observed.samples.len(), 2);
        assert!((committed(&adapter, "b-c") - 10.0).abs() < CAPACITY_EPSILON);
        assert!(model.get(&"b-c".into()).unwrap().committed_capacity.abs() < CAPACITY_EPSILON);
        adapter.release(&alloc).await.unwrap();
        adapter.release(&alloc).await.unwrap();
        assert!(committed(&adapter, "b-c").abs() < CAPACITY_EPSILON);
        assert!(!adapter.is_applied(alloc.id));
    }

    #[tokio::test]
    async fn partial_application_is_rolled_back() {
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7);
        adapter.fail_on("b-c");
        let alloc = allocation(&model, 10.0);
        let ExecutionResult::Failed(failure) = adapter.execute(&alloc).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.rolled_back_hops, 1);
        assert_eq!(failure.resource, Some(ResourceId::new("b-c")));
        assert!(committed(&adapter, "a-b").abs() < CAPACITY_EPSILON);
    }

    #[tokio::test]
    async fn fail_next_is_consumed() {
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7);
        adapter.fail_next(1);
        let alloc = allocation(&model, 5.0);
        assert!(matches!(adapter.execute(&alloc).await, ExecutionResult::Failed(_)));
        assert!(matches!(adapter.execute(&alloc).await, ExecutionResult::Applied(_)));
    }

    #[tokio::test]
    async fn degradation_shows_in_samples() {
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7);
        adapter.degrade_after_apply("a-b", 4.0);
        let alloc = allocation(&model, 10.0);
        let ExecutionResult::Applied(observed) = adapter.execute(&alloc).await else {
            panic!("expected application");
        };
        let sample = &observed.samples[0];
        assert_eq!(sample.status, ResourceStatus::Degraded);
        assert!((sample.available_capacity - 4.0).abs() < CAPACITY_EPSILON);
    }

    #[tokio::test]
    async fn jitter_is_seeded() {
        let model = model();
        let alloc = allocation(&model, 1.0);
        let first = SimulationAdapter::new(&model, 42).with_jitter(0.5);
        let second = SimulationAdapter::new(&model, 42).with_jitter(0.5);
        let a = first.observe(&alloc).await.unwrap();
        let b = second.observe(&alloc).await.unwrap();
        assert_eq!(a[0].latency_ms, b[0].latency_ms);
        assert!(a[0].latency_ms.unwrap() >= 1.0);
    }

    #[tokio::test]
    async fn delay_outlasts_timeout() {
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7);
        adapter.set_delay(Some(Duration::from_millis(200)));
        let alloc = allocation(&model, 1.0);
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), adapter.execute(&alloc)).await;
        assert!(outcome.is_err());
        adapter.release(&alloc).await.unwrap();
        assert!(!adapter.is_applied(alloc.id));
    }

    #[tokio::test]
    async fn publishes_lifecycle_events() {
        let bus = std::sync::Arc::new(shared_event_bus::MemoryEventBus::new(16));
        let telemetry = FabricTelemetry::builder("execution")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let model = model();
        let adapter = SimulationAdapter::new(&model, 7).with_telemetry(telemetry);
        adapter.fail_next(1);
        let alloc = allocation(&model, 1.0);
        adapter.execute(&alloc).await;
        adapter.execute(&alloc).await;
        for _ in 0..20 {
            if bus.snapshot().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(bus.events_of("execution.simulation.failed").len(), 1);
        assert_eq!(bus.events_of("execution.simulation.applied").len(), 1);
    }
}

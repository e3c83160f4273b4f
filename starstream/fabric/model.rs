use std::sync::Arc;

use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    ingest::{IngestOutcome, TelemetrySample},
    resource::{
        EndpointId, Resource, ResourceError, ResourceId, ResourceSpec, ResourceStatus,
        CAPACITY_EPSILON,
    },
    telemetry::FabricTelemetry,
    topology::{ActiveClaim, TopologyView},
};

/// Shared mutable resource model.
///
/// The registry map is only write-locked to register resources; every
/// `commit`/`release`/`update_state` locks the single resource it touches, so
/// calls on one resource are totally ordered while different resources
/// proceed independently.
#[derive(Debug, Default)]
pub struct ResourceModel {
    resources: RwLock<IndexMap<ResourceId, Arc<Mutex<Resource>>>>,
    endpoints: RwLock<IndexSet<EndpointId>>,
    telemetry: Option<FabricTelemetry>,
}

impl ResourceModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers a resource; its endpoints are added to the topology.
    pub fn register(&self, spec: ResourceSpec) -> Result<(), ResourceError> {
        let resource = Resource::from_spec(spec)?;
        let id = resource.id.clone();
        let (a, b) = resource.endpoints.clone();
        let domain = resource.domain;
        {
            let mut resources = self.resources.write();
            if resources.contains_key(&id) {
                return Err(ResourceError::DuplicateResource(id));
            }
            resources.insert(id.clone(), Arc::new(Mutex::new(resource)));
        }
        {
            let mut endpoints = self.endpoints.write();
            endpoints.insert(a.clone());
            endpoints.insert(b.clone());
        }
        self.log(
            LogLevel::Info,
            "fabric.resource.registered",
            json!({ "resource": id, "domain": domain.label(), "a": a, "b": b }),
        );
        Ok(())
    }

    /// Adds an endpoint with no resources yet (an isolated node).
    pub fn add_endpoint(&self, endpoint: impl Into<EndpointId>) {
        self.endpoints.write().insert(endpoint.into());
    }

    /// Applies a reported status and usable capacity.
    ///
    /// Returns `Ok(false)` when the resource already holds exactly this state.
    pub fn update_state(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        available_capacity: f64,
    ) -> Result<bool, ResourceError> {
        check_amount(id, available_capacity)?;
        let handle = self.handle(id)?;
        let mut resource = handle.lock();
        let reported = available_capacity.min(resource.total_capacity);
        if resource.status == status && same(resource.reported_capacity, reported) {
            return Ok(false);
        }
        let previous = resource.status;
        resource.status = status;
        resource.reported_capacity = reported;
        drop(resource);
        self.log(
            LogLevel::Debug,
            "fabric.resource.state_updated",
            json!({
                "resource": id,
                "from": previous.label(),
                "to": status.label(),
                "reported_capacity": reported
            }),
        );
        Ok(true)
    }

    /// Applies a telemetry sample, trusting the newest timestamp.
    pub(crate) fn observe(&self, sample: &TelemetrySample) -> Result<IngestOutcome, ResourceError> {
        check_amount(&sample.resource_id, sample.available_capacity)?;
        let handle = self.handle(&sample.resource_id)?;
        let mut resource = handle.lock();
        if resource
            .observed_at
            .is_some_and(|seen| sample.timestamp < seen)
        {
            return Ok(IngestOutcome::Stale);
        }
        let reported = sample.available_capacity.min(resource.total_capacity);
        let latency = sample.latency_ms.unwrap_or(resource.latency_ms);
        let loss = sample.loss.unwrap_or(resource.loss);
        let unchanged = resource.status == sample.status
            && same(resource.reported_capacity, reported)
            && same(resource.latency_ms, latency)
            && same(resource.loss, loss);
        resource.observed_at = Some(sample.timestamp);
        if unchanged {
            return Ok(IngestOutcome::Unchanged);
        }
        resource.status = sample.status;
        resource.reported_capacity = reported;
        resource.latency_ms = latency;
        resource.loss = loss;
        Ok(IngestOutcome::Applied)
    }

    /// Adds `amount` to the committed capacity of one resource.
    ///
    /// Returns the new commitment.
    pub fn commit(&self, id: &ResourceId, amount: f64) -> Result<f64, ResourceError> {
        check_amount(id, amount)?;
        let handle = self.handle(id)?;
        let mut resource = handle.lock();
        if resource.committed_capacity + amount > resource.total_capacity + CAPACITY_EPSILON {
            return Err(ResourceError::CapacityExceeded {
                resource: id.clone(),
                requested: amount,
                committed: resource.committed_capacity,
                total: resource.total_capacity,
            });
        }
        resource.committed_capacity += amount;
        Ok(resource.committed_capacity)
    }

    /// Removes `amount` from the committed capacity of one resource.
    ///
    /// Returns the new commitment.
    pub fn release(&self, id: &ResourceId, amount: f64) -> Result<f64, ResourceError> {
        check_amount(id, amount)?;
        let handle = self.handle(id)?;
        let mut resource = handle.lock();
        if amount > resource.committed_capacity + CAPACITY_EPSILON {
            return Err(ResourceError::OverRelease {
                resource: id.clone(),
                requested: amount,
                committed: resource.committed_capacity,
            });
        }
        resource.committed_capacity = (resource.committed_capacity - amount).max(0.0);
        if resource.committed_capacity < CAPACITY_EPSILON {
            resource.committed_capacity = 0.0;
        }
        Ok(resource.committed_capacity)
    }

    /// Commits `amount` on every resource of a path, in order.
    ///
    /// On the first failure every earlier commit of this call is released and
    /// the failure is returned, so the path is either fully committed or untouched.
    pub fn commit_path(&self, path: &[ResourceId], amount: f64) -> Result<(), ResourceError> {
        for (idx, id) in path.iter().enumerate() {
            if let Err(err) = self.commit(id, amount) {
                for done in path[..idx].iter().rev() {
                    if let Err(rollback) = self.release(done, amount) {
                        self.log(
                            LogLevel::Error,
                            "fabric.commit.rollback_failed",
                            json!({ "resource": done, "error": rollback.to_string() }),
                        );
                    }
                }
                self.log(
                    LogLevel::Warn,
                    "fabric.commit.rejected",
                    json!({ "resource": id, "amount": amount, "error": err.to_string() }),
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// Releases `amount` on every resource of a path.
    ///
    /// Every resource is attempted; the first error is returned.
    pub fn release_path(&self, path: &[ResourceId], amount: f64) -> Result<(), ResourceError> {
        let mut first_error = None;
        for id in path {
            if let Err(err) = self.release(id, amount) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Copy of one resource.
    pub fn get(&self, id: &ResourceId) -> Result<Resource, ResourceError> {
        Ok(self.handle(id)?.lock().clone())
    }

    /// Whether a resource is registered.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.read().contains_key(id)
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    /// Whether no resources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    /// Registered resource ids in registration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources.read().keys().cloned().collect()
    }

    /// Copies of every resource in registration order.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.handles()
            .into_iter()
            .map(|handle| handle.lock().clone())
            .collect()
    }

    /// Read-only snapshot for planning, without allocation claims.
    #[must_use]
    pub fn view(&self) -> TopologyView {
        self.view_with_claims(Vec::new())
    }

    /// Read-only snapshot carrying the claims of live allocations.
    #[must_use]
    pub fn view_with_claims(&self, claims: Vec<ActiveClaim>) -> TopologyView {
        let endpoints = self.endpoints.read().iter().cloned().collect::<Vec<_>>();
        TopologyView::new(endpoints, self.resources(), claims, Utc::now())
    }

    /// Deep copy with independent locks, used by simulated substrates.
    #[must_use]
    pub fn fork(&self) -> Self {
        let resources = self
            .handles_with_ids()
            .into_iter()
            .map(|(id, handle)| (id, Arc::new(Mutex::new(handle.lock().clone()))))
            .collect();
        Self {
            resources: RwLock::new(resources),
            endpoints: RwLock::new(self.endpoints.read().clone()),
            telemetry: None,
        }
    }

    fn handle(&self, id: &ResourceId) -> Result<Arc<Mutex<Resource>>, ResourceError> {
        self.resources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownResource(id.clone()))
    }

    fn handles(&self) -> Vec<Arc<Mutex<Resource>>> {
        self.resources.read().values().cloned().collect()
    }

    fn handles_with_ids(&self) -> Vec<(ResourceId, Arc<Mutex<Resource>>)> {
        self.resources
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn check_amount(id: &ResourceId, amount: f64) -> Result<(), ResourceError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(ResourceError::InvalidAmount {
            resource: id.clone(),
            amount,
        })
    }
}

fn same(a: f64, b: f64) -> bool {
    (a - b).abs() <= CAPACITY_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Domain;
    use proptest::prelude::*;
    use std::thread;

    fn link(id: &str, capacity: f64) -> ResourceSpec {
        ResourceSpec::new(id, Domain::Electronic, "A", "B", capacity, 1.0)
    }

    #[test]
    fn register_rejects_duplicates() {
        let model = ResourceModel::new();
        model.register(link("ab", 10.0)).unwrap();
        let err = model.register(link("ab", 20.0)).unwrap_err();
        assert_eq!(err, ResourceError::DuplicateResource("ab".into()));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn update_state_unknown_and_idempotent() {
        let model = ResourceModel::new();
        let err = model
            .update_state(&"missing".into(), ResourceStatus::Up, 1.0)
            .unwrap_err();
        assert!(matches!(err, ResourceError::UnknownResource(_)));

        model.register(link("ab", 10.0)).unwrap();
        let id = ResourceId::new("ab");
        assert!(model.update_state(&id, ResourceStatus::Degraded, 6.0).unwrap());
        let after_first = model.get(&id).unwrap();
        assert!(!model.update_state(&id, ResourceStatus::Degraded, 6.0).unwrap());
        assert_eq!(model.get(&id).unwrap(), after_first);
    }

    #[test]
    fn commit_and_release_enforce_bounds() {
        let model = ResourceModel::new();
        model.register(link("ab", 10.0)).unwrap();
        let id = ResourceId::new("ab");
        assert!((model.commit(&id, 6.0).unwrap() - 6.0).abs() < CAPACITY_EPSILON);
        let err = model.commit(&id, 6.0).unwrap_err();
        assert!(err.is_contention());
        let err = model.release(&id, 7.0).unwrap_err();
        assert!(matches!(err, ResourceError::OverRelease { .. }));
        assert!(matches!(
            model.commit(&id, -1.0).unwrap_err(),
            ResourceError::InvalidAmount { .. }
        ));
        assert!(model.release(&id, 6.0).unwrap().abs() < CAPACITY_EPSILON);
    }

    #[test]
    fn commit_path_is_all_or_nothing() {
        let model = ResourceModel::new();
        model.register(link("ab", 10.0)).unwrap();
        model
            .register(ResourceSpec::new("bc", Domain::Optical, "B", "C", 4.0, 1.0))
            .unwrap();
        let path = vec![ResourceId::new("ab"), ResourceId::new("bc")];
        let err = model.commit_path(&path, 5.0).unwrap_err();
        assert_eq!(err.resource(), &ResourceId::new("bc"));
        assert!(model.get(&path[0]).unwrap().committed_capacity.abs() < CAPACITY_EPSILON);

        model.commit_path(&path, 4.0).unwrap();
        model.release_path(&path, 4.0).unwrap();
        for id in &path {
            assert!(model.get(id).unwrap().committed_capacity.abs() < CAPACITY_EPSILON);
        }
    }

    #[test]
    fn concurrent_commits_never_oversubscribe() {
        let model = Arc::new(ResourceModel::new());
        model.register(link("shared", 10.0)).unwrap();
        let id = ResourceId::new("shared");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = Arc::clone(&model);
                let id = id.clone();
                thread::spawn(move || model.commit(&id, 3.0).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 3);
        assert!((model.get(&id).unwrap().committed_capacity - 9.0).abs() < CAPACITY_EPSILON);
    }

    #[test]
    fn fork_is_independent() {
        let model = ResourceModel::new();
        model.register(link("ab", 10.0)).unwrap();
        let fork = model.fork();
        fork.commit(&"ab".into(), 4.0).unwrap();
        assert!(model.get(&"ab".into()).unwrap().committed_capacity.abs() < CAPACITY_EPSILON);
        assert_eq!(fork.view().endpoints.len(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Commit(f64),
        Release(f64),
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![
                (0.0f64..8.0).prop_map(Op::Commit),
                (0.0f64..8.0).prop_map(Op::Release),
            ],
            0..40,
        )
    }

    proptest! {
        #[test]
        fn committed_never_exceeds_total(ops in op_strategy()) {
            let model = ResourceModel::new();
            model.register(link("ab", 20.0)).unwrap();
            let id = ResourceId::new("ab");
            for op in ops {
                let _ = match op {
                    Op::Commit(amount) => model.commit(&id, amount),
                    Op::Release(amount) => model.release(&id, amount),
                };
                let resource = model.get(&id).unwrap();
                prop_assert!(resource.committed_capacity <= resource.total_capacity + CAPACITY_EPSILON);
                prop_assert!(resource.committed_capacity >= 0.0);
            }
        }

        #[test]
        fn commit_then_release_round_trips(pre in 0.0f64..10.0, amount in 0.0f64..10.0) {
            let model = ResourceModel::new();
            model.register(link("ab", 20.0)).unwrap();
            model
                .register(ResourceSpec::new("bc", Domain::Optical, "B", "C", 20.0, 1.0))
                .unwrap();
            let path = vec![ResourceId::new("ab"), ResourceId::new("bc")];
            model.commit(&path[0], pre).unwrap();
            let before: Vec<f64> = path
                .iter()
                .map(|id| model.get(id).unwrap().committed_capacity)
                .collect();
            model.commit_path(&path, amount).unwrap();
            model.release_path(&path, amount).unwrap();
            for (id, prior) in path.iter().zip(before) {
                let now = model.get(id).unwrap().committed_capacity;
                prop_assert!((now - prior).abs() < 1e-6);
            }
        }
    }
}

use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use starstream_execution::{AdapterRegistry, ExecutorAdapter, Verifier};
use starstream_fabric::{
    audit, AllocationLedger, FabricTelemetry, IngestOutcome, IngestSummary, Intent, IntentId,
    InvariantBreach, ResourceError, ResourceModel, TelemetryIngest, TelemetrySample,
};
use starstream_planning::Planner;
use starstream_policy::{Policy, PolicyEvaluator};
use tokio::runtime::Handle;
use tracing::instrument;

use crate::{
    config::ControlConfig,
    cycle::{CycleLog, CycleRecord, Stage},
    orchestrator::{ControlCore, IntentEntry, IntentReport},
    state::{ControlError, IntentState},
};

/// Answer to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Identifier to track the intent with.
    pub intent_id: IntentId,
    /// State at the time of the answer.
    pub state: IntentState,
}

/// Builder for [`ControlPlane`].
#[derive(Debug)]
pub struct ControlPlaneBuilder {
    model: Arc<ResourceModel>,
    policy: Arc<Policy>,
    adapters: AdapterRegistry,
    config: ControlConfig,
    telemetry: Option<FabricTelemetry>,
}

impl ControlPlaneBuilder {
    /// Starts a builder over a populated model.
    #[must_use]
    pub fn new(model: Arc<ResourceModel>) -> Self {
        Self {
            model,
            policy: Arc::new(Policy::default()),
            adapters: AdapterRegistry::new(),
            config: ControlConfig::default(),
            telemetry: None,
        }
    }

    /// Policy held for the lifetime of the plane.
    #[must_use]
    pub fn policy(mut self, policy: Arc<Policy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the adapter registry.
    #[must_use]
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Registers one adapter.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn ExecutorAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Control configuration.
    #[must_use]
    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    /// Telemetry shared by every component the plane builds.
    #[must_use]
    pub fn telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates the configuration and resolves the configured adapter.
    pub fn build(self) -> Result<ControlPlane, ControlError> {
        self.config
            .validate()
            .map_err(|err| ControlError::Config(format!("{err:#}")))?;
        let adapter = self
            .adapters
            .resolve(self.config.adapter)
            .map_err(|err| ControlError::Config(err.to_string()))?;

        let mut planner = Planner::new(self.config.planner.clone());
        let mut evaluator = PolicyEvaluator::new(Arc::clone(&self.policy));
        let mut verifier = Verifier::new(self.config.verifier);
        let mut ingest = TelemetryIngest::new(Arc::clone(&self.model));
        let mut log = CycleLog::new();
        if let Some(tel) = &self.telemetry {
            planner = planner.with_telemetry(tel.clone());
            evaluator = evaluator.with_telemetry(tel.clone());
            verifier = verifier.with_telemetry(tel.clone());
            ingest = ingest.with_telemetry(tel.clone());
            log = log.with_telemetry(tel.clone());
        }

        Ok(ControlPlane {
            core: Arc::new(ControlCore {
                model: self.model,
                ledger: Arc::new(AllocationLedger::new()),
                ingest,
                planner,
                policy: self.policy,
                evaluator,
                adapter,
                verifier,
                config: self.config,
                cycle_log: log,
                intents: RwLock::new(IndexMap::new()),
                telemetry: self.telemetry,
            }),
        })
    }
}

/// Entry point of the control plane.
///
/// Each submitted intent gets its own loop on the tokio runtime; the plane
/// itself only routes requests to those loops and to the shared model.
#[derive(Clone)]
pub struct ControlPlane {
    core: Arc<ControlCore>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("adapter", &self.core.adapter.name())
            .field("intents", &self.core.intents.read().len())
            .field("records", &self.core.cycle_log.len())
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Returns a builder.
    #[must_use]
    pub fn builder(model: Arc<ResourceModel>) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(model)
    }

    /// Accepts an intent and starts its loop. Must run inside a tokio runtime.
    ///
    /// Submitting an id that is already known returns its current state.
    #[instrument(skip(self, intent), fields(intent = %intent.id))]
    pub fn submit(&self, intent: Intent) -> Result<Submission, ControlError> {
        intent.validate()?;
        let handle = Handle::try_current()
            .map_err(|_| ControlError::Config("submit requires a tokio runtime".into()))?;
        let id = intent.id;
        {
            let mut intents = self.core.intents.write();
            if let Some(entry) = intents.get(&id) {
                return Ok(Submission {
                    intent_id: id,
                    state: entry.state,
                });
            }
            if let Some(previous) = intent.supersedes {
                if !intents.contains_key(&previous) {
                    return Err(ControlError::UnknownIntent(previous));
                }
            }
            let detail = json!({
                "source": intent.source,
                "destination": intent.destination,
                "min_bandwidth_gbps": intent.min_bandwidth_gbps,
                "max_latency_ms": intent.max_latency_ms,
                "priority": intent.priority.0,
                "supersedes": intent.supersedes,
            });
            intents.insert(id, IntentEntry::new(intent));
            self.core
                .cycle_log
                .append(id, 0, Stage::Submit, IntentState::Pending, "accepted", detail);
        }
        self.core.log(
            LogLevel::Info,
            "control.intent.submitted",
            json!({ "intent": id.to_string() }),
        );
        handle.spawn(Arc::clone(&self.core).drive(id));
        Ok(Submission {
            intent_id: id,
            state: IntentState::Pending,
        })
    }

    /// Waits until the intent's loop settles and returns its report.
    #[instrument(skip(self))]
    pub async fn outcome(&self, id: IntentId) -> Result<IntentReport, ControlError> {
        let mut updates = self
            .core
            .intents
            .read()
            .get(&id)
            .map(|entry| entry.report.subscribe())
            .ok_or(ControlError::UnknownIntent(id))?;
        let settled = updates
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ControlError::UnknownIntent(id))?;
        settled.clone().ok_or(ControlError::UnknownIntent(id))
    }

    /// Cancels an intent.
    ///
    /// Before execution the loop stops at its next stage boundary. Once
    /// dispatched, the loop waits for the adapter and then releases the
    /// allocation. A converged intent is torn down immediately.
    #[instrument(skip(self))]
    pub async fn withdraw(&self, id: IntentId) -> Result<IntentState, ControlError> {
        let (state, cancel) = self
            .core
            .intents
            .read()
            .get(&id)
            .map(|entry| (entry.state, Arc::clone(&entry.cancel)))
            .ok_or(ControlError::UnknownIntent(id))?;
        if state.is_terminal() {
            return Err(ControlError::AlreadyTerminal { intent: id, state });
        }
        if state == IntentState::Converged {
            self.core
                .settle_converged(id, IntentState::Withdrawn, "withdrawn")
                .await?;
            return Ok(IntentState::Withdrawn);
        }
        cancel.cancel("withdrawn");
        Ok(state)
    }

    /// Tears down the allocation of a converged intent.
    #[instrument(skip(self))]
    pub async fn release(&self, id: IntentId) -> Result<(), ControlError> {
        self.core
            .settle_converged(id, IntentState::Released, "released")
            .await
    }

    /// Releases converged intents whose validity window ended by `now` and
    /// cancels unsettled ones. Returns the intents affected.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<IntentId> {
        let expired: Vec<(IntentId, IntentState)> = self
            .core
            .intents
            .read()
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal() && entry.intent.validity.expired(now))
            .map(|(id, entry)| {
                if !entry.state.is_settled() {
                    entry.cancel.cancel("expired");
                }
                (*id, entry.state)
            })
            .collect();
        let releases = expired
            .iter()
            .filter(|(_, state)| *state == IntentState::Converged)
            .map(|(id, _)| {
                self.core
                    .settle_converged(*id, IntentState::Released, "expired")
            });
        for result in join_all(releases).await {
            if let Err(err) = result {
                self.core.log(
                    LogLevel::Warn,
                    "control.sweep.release_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Telemetry feed: applies one adapter sample to the shared model.
    pub fn ingest(&self, sample: &TelemetrySample) -> Result<IngestOutcome, ResourceError> {
        self.core.ingest.ingest(sample)
    }

    /// Telemetry feed for a batch of samples.
    pub fn ingest_batch<'a>(
        &self,
        samples: impl IntoIterator<Item = &'a TelemetrySample>,
    ) -> IngestSummary {
        self.core.ingest.ingest_batch(samples)
    }

    /// Current state of an intent.
    #[must_use]
    pub fn state(&self, id: IntentId) -> Option<IntentState> {
        self.core.state(id)
    }

    /// Current report of an intent without waiting.
    #[must_use]
    pub fn report(&self, id: IntentId) -> Option<IntentReport> {
        self.core.report(id)
    }

    /// Every known intent with its state, in submission order.
    #[must_use]
    pub fn intents(&self) -> Vec<(IntentId, IntentState)> {
        self.core
            .intents
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect()
    }

    /// Read-only copy of the cycle log.
    #[must_use]
    pub fn cycle_records(&self) -> Vec<CycleRecord> {
        self.core.cycle_log.records()
    }

    /// Writes the cycle log as JSON lines. Returns the number of records.
    pub fn export_jsonl(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        self.core.cycle_log.export_jsonl(path)
    }

    /// Shared resource model.
    #[must_use]
    pub fn model(&self) -> &Arc<ResourceModel> {
        &self.core.model
    }

    /// Allocation ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.core.ledger
    }

    /// Policy in force.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.core.policy
    }

    /// Checks capacity invariants across the model and the ledger.
    #[must_use]
    pub fn audit(&self) -> Vec<InvariantBreach> {
        audit(&self.core.model, &self.core.ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use starstream_execution::{AdapterKind, SimulationAdapter};
    use starstream_fabric::{Domain, ResourceSpec};

    use crate::retry::RetryPolicy;

    fn line() -> Arc<ResourceModel> {
        let model = ResourceModel::new();
        model
            .register(ResourceSpec::new("a-b", Domain::Electronic, "A", "B", 100.0, 1.0))
            .unwrap();
        Arc::new(model)
    }

    fn fast_config() -> ControlConfig {
        ControlConfig {
            retry: RetryPolicy {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryPolicy::default()
            },
            ..ControlConfig::default()
        }
    }

    fn plane(model: &Arc<ResourceModel>) -> (ControlPlane, Arc<SimulationAdapter>) {
        let adapter = Arc::new(SimulationAdapter::new(model, 11));
        let plane = ControlPlane::builder(Arc::clone(model))
            .adapter(adapter.clone())
            .config(fast_config())
            .build()
            .unwrap();
        (plane, adapter)
    }

    #[test]
    fn build_requires_configured_adapter() {
        let config = ControlConfig {
            adapter: AdapterKind::HardwareReserved,
            ..ControlConfig::default()
        };
        let err = ControlPlane::builder(line())
            .adapter(Arc::new(SimulationAdapter::new(&line(), 1)))
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn submit_outside_runtime_is_refused() {
        let model = line();
        let (plane, _) = plane(&model);
        let err = plane.submit(Intent::bandwidth("A", "B", 1.0)).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[tokio::test]
    async fn invalid_intents_are_refused() {
        let model = line();
        let (plane, _) = plane(&model);
        let err = plane.submit(Intent::bandwidth("A", "A", 1.0)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidIntent(_)));
        let orphan = Intent::bandwidth("A", "B", 1.0).superseding(IntentId::new());
        assert!(matches!(
            plane.submit(orphan),
            Err(ControlError::UnknownIntent(_))
        ));
    }

    #[tokio::test]
    async fn converges_and_releases() {
        let model = line();
        let (plane, adapter) = plane(&model);
        let intent = Intent::bandwidth("A", "B", 10.0);
        let submission = plane.submit(intent.clone()).unwrap();
        assert_eq!(submission.state, IntentState::Pending);
        assert_eq!(plane.submit(intent).unwrap().intent_id, submission.intent_id);

        let report = plane.outcome(submission.intent_id).await.unwrap();
        assert_eq!(report.state, IntentState::Converged);
        assert_eq!(report.retries, 0);
        let allocation = report.allocation.unwrap();
        assert!(adapter.is_applied(allocation.id));
        assert!((model.get(&"a-b".into()).unwrap().committed_capacity - 10.0).abs() < 1e-9);

        plane.release(submission.intent_id).await.unwrap();
        assert_eq!(plane.state(submission.intent_id), Some(IntentState::Released));
        assert!(model.get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
        assert!(!adapter.is_applied(allocation.id));
        assert!(matches!(
            plane.release(submission.intent_id).await,
            Err(ControlError::AlreadyTerminal { .. })
        ));
        assert!(plane.audit().is_empty());
    }

    #[tokio::test]
    async fn withdraw_before_execution() {
        let model = line();
        let (plane, adapter) = plane(&model);
        // Not yet valid, so the loop parks before planning.
        let mut intent = Intent::bandwidth("A", "B", 10.0);
        intent.validity.not_before = Utc::now() + chrono::Duration::seconds(30);
        let id = plane.submit(intent).unwrap().intent_id;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(plane.withdraw(id).await.unwrap(), IntentState::Pending);
        let report = plane.outcome(id).await.unwrap();
        assert_eq!(report.state, IntentState::Withdrawn);
        assert!(report.allocation.is_none());
        assert!(adapter.substrate().get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
        assert!(matches!(
            plane.withdraw(id).await,
            Err(ControlError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn withdraw_during_execution_is_deferred() {
        let model = line();
        let (plane, adapter) = plane(&model);
        adapter.set_delay(Some(Duration::from_millis(100)));
        let id = plane.submit(Intent::bandwidth("A", "B", 10.0)).unwrap().intent_id;
        for _ in 0..50 {
            if plane.state(id) == Some(IntentState::Executing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(plane.withdraw(id).await.unwrap(), IntentState::Executing);
        let report = plane.outcome(id).await.unwrap();
        assert_eq!(report.state, IntentState::Withdrawn);
        let allocation = report.allocation.unwrap();
        assert!(!adapter.is_applied(allocation.id));
        assert!(model.get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
    }

    #[tokio::test]
    async fn execution_timeout_rolls_back() {
        let model = line();
        let adapter = Arc::new(SimulationAdapter::new(&model, 3));
        adapter.set_delay(Some(Duration::from_millis(200)));
        let mut config = fast_config();
        config.retry.max_retries = 0;
        config.timeouts.execute_ms = 20;
        let plane = ControlPlane::builder(Arc::clone(&model))
            .adapter(adapter.clone())
            .config(config)
            .build()
            .unwrap();
        let id = plane.submit(Intent::bandwidth("A", "B", 10.0)).unwrap().intent_id;
        let report = plane.outcome(id).await.unwrap();
        assert_eq!(report.state, IntentState::Failed);
        assert!(report.last_violation.unwrap().contains("timed out"));
        assert!(model.get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
        assert!(adapter.substrate().get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
    }

    #[tokio::test]
    async fn sweep_releases_expired_allocations() {
        let model = line();
        let (plane, _) = plane(&model);
        let intent = Intent::bandwidth("A", "B", 10.0).valid_for(chrono::Duration::minutes(5));
        let id = plane.submit(intent).unwrap().intent_id;
        plane.outcome(id).await.unwrap();
        assert!(plane.sweep_expired(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(plane.sweep_expired(later).await, vec![id]);
        assert_eq!(plane.state(id), Some(IntentState::Released));
        assert!(model.get(&"a-b".into()).unwrap().committed_capacity.abs() < 1e-9);
    }

    #[tokio::test]
    async fn superseding_intent_releases_previous_after_converging() {
        let model = line();
        let (plane, _) = plane(&model);
        let first = plane.submit(Intent::bandwidth("A", "B", 10.0)).unwrap().intent_id;
        plane.outcome(first).await.unwrap();
        let second = plane
            .submit(Intent::bandwidth("A", "B", 20.0).superseding(first))
            .unwrap()
            .intent_id;
        let report = plane.outcome(second).await.unwrap();
        assert_eq!(report.state, IntentState::Converged);
        assert_eq!(plane.state(first), Some(IntentState::Released));
        assert!((model.get(&"a-b".into()).unwrap().committed_capacity - 20.0).abs() < 1e-9);
        let teardown = plane
            .cycle_records()
            .into_iter()
            .find(|record| record.intent_id == first && record.stage == Stage::Teardown)
            .unwrap();
        assert_eq!(teardown.decision, "superseded");
    }

    #[tokio::test]
    async fn telemetry_feed_updates_model() {
        let model = line();
        let (plane, _) = plane(&model);
        let sample = TelemetrySample::new("a-b", starstream_fabric::ResourceStatus::Degraded, 40.0);
        assert_eq!(plane.ingest(&sample).unwrap(), IngestOutcome::Applied);
        assert_eq!(plane.ingest(&sample).unwrap(), IngestOutcome::Unchanged);
        assert!(plane.ingest(&TelemetrySample::new("zz", starstream_fabric::ResourceStatus::Up, 1.0)).is_err());
        assert!((model.get(&"a-b".into()).unwrap().usable_capacity() - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exports_cycle_records() {
        let model = line();
        let (plane, _) = plane(&model);
        let id = plane.submit(Intent::bandwidth("A", "B", 1.0)).unwrap().intent_id;
        plane.outcome(id).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = plane.export_jsonl(dir.path().join("cycles.jsonl")).unwrap();
        assert_eq!(written, plane.cycle_records().len());
        let stages: Vec<Stage> = plane.cycle_records().iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Submit,
                Stage::Plan,
                Stage::Commit,
                Stage::Execute,
                Stage::Execute,
                Stage::Verify
            ]
        );
    }
}

use std::{
    collections::BTreeSet,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use starstream_execution::{
    ExecutionError, ExecutionFailure, ExecutionResult, ExecutorAdapter, Outcome, Verifier,
};
use starstream_fabric::{
    Allocation, AllocationId, AllocationLedger, AllocationState, FabricTelemetry, Intent,
    IntentId, ResourceError, ResourceModel, TelemetryIngest, TelemetrySample, TopologyView,
};
use starstream_planning::{Candidate, Infeasible, InfeasibleReason, Planner};
use starstream_policy::{admissible_view, reclaimable_view, Decision, Policy, PolicyEvaluator};
use tokio::sync::{watch, Notify};
use tracing::instrument;

use crate::{
    config::ControlConfig,
    cycle::{CycleLog, CycleRecord, Stage},
    state::{ControlError, IntentState},
};

/// Everything known about an intent once its loop has settled, or right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentReport {
    /// Intent.
    pub intent_id: IntentId,
    /// Orchestrator state.
    pub state: IntentState,
    /// Latest allocation made for the intent.
    pub allocation: Option<Allocation>,
    /// Latest verification outcome.
    pub outcome: Option<Outcome>,
    /// Retries consumed.
    pub retries: u32,
    /// Cycles started.
    pub cycles: u32,
    /// Last constraint or failure that sent the intent back to planning.
    pub last_violation: Option<String>,
    /// Every cycle record of the intent.
    pub records: Vec<CycleRecord>,
}

/// Cancellation flag checked at stage boundaries.
#[derive(Debug, Default)]
pub(crate) struct Cancellation {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    wake: Notify,
}

impl Cancellation {
    pub(crate) fn cancel(&self, reason: &str) {
        self.reason.lock().get_or_insert_with(|| reason.to_owned());
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "withdrawn".to_owned())
    }

    /// Sleeps for `delay` unless cancelled first. Returns whether cancelled.
    async fn sleep(&self, delay: Duration) -> bool {
        let woken = self.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => self.is_cancelled(),
            () = woken => true,
        }
    }
}

pub(crate) struct IntentEntry {
    pub(crate) intent: Intent,
    pub(crate) state: IntentState,
    pub(crate) allocation: Option<AllocationId>,
    pub(crate) retries: u32,
    pub(crate) cycles: u32,
    pub(crate) last_violation: Option<String>,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) cancel: Arc<Cancellation>,
    pub(crate) report: watch::Sender<Option<IntentReport>>,
}

impl IntentEntry {
    pub(crate) fn new(intent: Intent) -> Self {
        let (report, _) = watch::channel(None);
        Self {
            intent,
            state: IntentState::Pending,
            allocation: None,
            retries: 0,
            cycles: 0,
            last_violation: None,
            outcome: None,
            cancel: Arc::new(Cancellation::default()),
            report,
        }
    }
}

/// Why a cycle ended without converging.
struct Setback {
    stage: Stage,
    decision: String,
    violation: String,
    detail: Value,
}

impl Setback {
    fn new(stage: Stage, decision: impl Into<String>, violation: impl Into<String>) -> Self {
        Self {
            stage,
            decision: decision.into(),
            violation: violation.into(),
            detail: Value::Null,
        }
    }

    fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

enum Step {
    /// The loop stops: converged, failed, or withdrawn.
    Settled,
    /// Back off and run another cycle.
    Retry(Setback),
}

/// Shared state behind the control plane and every per-intent loop.
pub(crate) struct ControlCore {
    pub(crate) model: Arc<ResourceModel>,
    pub(crate) ledger: Arc<AllocationLedger>,
    pub(crate) ingest: TelemetryIngest,
    pub(crate) planner: Planner,
    pub(crate) policy: Arc<Policy>,
    pub(crate) evaluator: PolicyEvaluator,
    pub(crate) adapter: Arc<dyn ExecutorAdapter>,
    pub(crate) verifier: Verifier,
    pub(crate) config: ControlConfig,
    pub(crate) cycle_log: CycleLog,
    pub(crate) intents: RwLock<IndexMap<IntentId, IntentEntry>>,
    pub(crate) telemetry: Option<FabricTelemetry>,
}

impl ControlCore {
    /// Moves an intent to `next` and appends the matching cycle record.
    pub(crate) fn transition(
        &self,
        id: IntentId,
        stage: Stage,
        next: IntentState,
        decision: impl Into<String>,
        detail: Value,
    ) -> Result<CycleRecord, ControlError> {
        let record = {
            let mut intents = self.intents.write();
            let entry = intents
                .get_mut(&id)
                .ok_or(ControlError::UnknownIntent(id))?;
            if !entry.state.can_transition_to(next) {
                return Err(if entry.state.is_terminal() {
                    ControlError::AlreadyTerminal {
                        intent: id,
                        state: entry.state,
                    }
                } else {
                    ControlError::IllegalTransition {
                        intent: id,
                        from: entry.state,
                        to: next,
                    }
                });
            }
            entry.state = next;
            self.cycle_log
                .append(id, entry.cycles, stage, next, decision, detail)
        };
        self.log(
            LogLevel::Debug,
            "control.intent.transition",
            json!({
                "intent": id.to_string(),
                "stage": stage.label(),
                "state": next.label(),
                "decision": record.decision,
            }),
        );
        if next.is_settled() {
            self.publish_report(id);
        }
        Ok(record)
    }

    /// Appends a record without changing state.
    pub(crate) fn note(&self, id: IntentId, stage: Stage, decision: impl Into<String>, detail: Value) {
        let intents = self.intents.read();
        if let Some(entry) = intents.get(&id) {
            self.cycle_log
                .append(id, entry.cycles, stage, entry.state, decision, detail);
        }
    }

    pub(crate) fn state(&self, id: IntentId) -> Option<IntentState> {
        self.intents.read().get(&id).map(|entry| entry.state)
    }

    pub(crate) fn report(&self, id: IntentId) -> Option<IntentReport> {
        let intents = self.intents.read();
        let entry = intents.get(&id)?;
        Some(IntentReport {
            intent_id: id,
            state: entry.state,
            allocation: entry.allocation.and_then(|alloc| self.ledger.get(alloc)),
            outcome: entry.outcome.clone(),
            retries: entry.retries,
            cycles: entry.cycles,
            last_violation: entry.last_violation.clone(),
            records: self.cycle_log.for_intent(id),
        })
    }

    pub(crate) fn publish_report(&self, id: IntentId) {
        let Some(report) = self.report(id) else {
            return;
        };
        if let Some(entry) = self.intents.read().get(&id) {
            entry.report.send_replace(Some(report));
        }
    }

    fn update(&self, id: IntentId, apply: impl FnOnce(&mut IntentEntry)) {
        if let Some(entry) = self.intents.write().get_mut(&id) {
            apply(entry);
        }
    }

    /// Returns an allocation's capacity to the model and removes it from the
    /// substrate. Returns `false` when it was already released.
    pub(crate) async fn teardown(&self, allocation: AllocationId) -> Result<bool, ControlError> {
        let Ok(released) = self.ledger.advance(allocation, AllocationState::Released) else {
            return Ok(false);
        };
        self.model
            .release_path(&released.resource_ids(), released.bandwidth_gbps)
            .map_err(|err| integrity(&err))?;
        let limit = self.config.timeouts.execute();
        match tokio::time::timeout(limit, self.adapter.release(&released)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.log(
                LogLevel::Error,
                "control.teardown.adapter_failed",
                json!({ "allocation": allocation.to_string(), "error": err.to_string() }),
            ),
            Err(_) => self.log(
                LogLevel::Error,
                "control.teardown.adapter_timeout",
                json!({ "allocation": allocation.to_string(), "after_ms": limit.as_millis() }),
            ),
        }
        Ok(true)
    }

    /// Tears down a converged intent and moves it to `next`.
    pub(crate) async fn settle_converged(
        &self,
        id: IntentId,
        next: IntentState,
        decision: &str,
    ) -> Result<(), ControlError> {
        let allocation = self.intents.read().get(&id).and_then(|entry| entry.allocation);
        self.transition(id, Stage::Teardown, next, decision, Value::Null)?;
        if let Some(allocation) = allocation {
            self.teardown(allocation).await?;
        }
        self.publish_report(id);
        Ok(())
    }

    /// Runs cycles for one intent until it settles.
    #[instrument(skip(self), fields(intent = %id))]
    pub(crate) async fn drive(self: Arc<Self>, id: IntentId) {
        let Some((intent, cancel)) = self
            .intents
            .read()
            .get(&id)
            .map(|entry| (entry.intent.clone(), Arc::clone(&entry.cancel)))
        else {
            return;
        };
        let mut cycle = 0_u32;
        loop {
            cycle += 1;
            self.update(id, |entry| entry.cycles = cycle);
            let step = match self.cycle(&intent, &cancel).await {
                Ok(step) => step,
                Err(err) => {
                    self.abort(id, &err);
                    return;
                }
            };
            self.prune_ledger();
            match step {
                Step::Settled => return,
                Step::Retry(setback) => {
                    if !self.back_off(id, &cancel, setback).await {
                        return;
                    }
                }
            }
        }
    }

    /// Forgets released allocations no intent reports any more.
    fn prune_ledger(&self) {
        let referenced: BTreeSet<AllocationId> = self
            .intents
            .read()
            .values()
            .filter_map(|entry| entry.allocation)
            .collect();
        let pruned = self
            .ledger
            .prune_released(|allocation| referenced.contains(&allocation.id));
        if pruned > 0 {
            tracing::debug!(pruned, "released allocations pruned");
        }
    }

    fn abort(&self, id: IntentId, err: &ControlError) {
        tracing::error!(intent = %id, error = %err, "control loop aborted");
        self.log(
            LogLevel::Error,
            "control.intent.aborted",
            json!({ "intent": id.to_string(), "error": err.to_string() }),
        );
        self.update(id, |entry| entry.last_violation = Some(err.to_string()));
        let detail = json!({ "error": err });
        if self
            .transition(id, Stage::Commit, IntentState::Failed, "integrity", detail)
            .is_err()
        {
            self.publish_report(id);
        }
    }

    /// Records a setback and either schedules another cycle or fails the
    /// intent. Returns whether another cycle should run.
    async fn back_off(&self, id: IntentId, cancel: &Cancellation, setback: Setback) -> bool {
        let retry = self.config.retry;
        let retries = self.intents.read().get(&id).map_or(0, |entry| entry.retries);
        self.update(id, |entry| entry.last_violation = Some(setback.violation.clone()));
        let detail = json!({
            "violation": setback.violation,
            "detail": setback.detail,
            "retries": retries,
        });
        if !retry.should_retry(retries) {
            let _ = self.transition(
                id,
                setback.stage,
                IntentState::Failed,
                format!("{}:retries_exhausted", setback.decision),
                detail,
            );
            return false;
        }
        if self
            .transition(id, setback.stage, IntentState::Retrying, setback.decision, detail)
            .is_err()
        {
            return false;
        }
        self.update(id, |entry| entry.retries += 1);
        let delay = retry.delay(retries);
        tracing::debug!(intent = %id, delay_ms = delay.as_millis(), "backing off");
        if cancel.sleep(delay).await {
            let _ = self.transition(
                id,
                Stage::Withdraw,
                IntentState::Withdrawn,
                cancel.reason(),
                Value::Null,
            );
            return false;
        }
        self.transition(
            id,
            Stage::Retry,
            IntentState::Pending,
            "backoff_elapsed",
            json!({ "delay_ms": delay.as_millis() }),
        )
        .is_ok()
    }

    fn withdraw_now(&self, id: IntentId, cancel: &Cancellation) -> Result<Step, ControlError> {
        self.transition(
            id,
            Stage::Withdraw,
            IntentState::Withdrawn,
            cancel.reason(),
            Value::Null,
        )?;
        Ok(Step::Settled)
    }

    async fn cycle(&self, intent: &Intent, cancel: &Cancellation) -> Result<Step, ControlError> {
        let id = intent.id;
        if cancel.is_cancelled() {
            return self.withdraw_now(id, cancel);
        }
        let now = Utc::now();
        if intent.validity.expired(now) {
            self.update(id, |entry| {
                entry.last_violation = Some("validity window ended".to_owned());
            });
            self.transition(id, Stage::Plan, IntentState::Failed, "expired", Value::Null)?;
            return Ok(Step::Settled);
        }
        if let Ok(wait) = (intent.validity.not_before - now).to_std() {
            if !wait.is_zero() && cancel.sleep(wait).await {
                return self.withdraw_now(id, cancel);
            }
        }

        // Plan.
        let view = self.model.view_with_claims(self.ledger.active_claims());
        let planner = self.planner.clone();
        let policy = Arc::clone(&self.policy);
        let planned_intent = intent.clone();
        let planned = blocking_stage(self.config.timeouts.plan(), move || {
            plan_with_reclaim(&planner, &policy, &planned_intent, &view)
        })
        .await;
        let (candidate, reclaimed) = match planned {
            Err(failure) => {
                return Ok(Step::Retry(Setback::new(Stage::Plan, "timeout", failure)));
            }
            Ok(Err(infeasible)) => {
                return Ok(Step::Retry(
                    Setback::new(
                        Stage::Plan,
                        format!("infeasible:{}", infeasible.reason.label()),
                        infeasible.to_string(),
                    )
                    .with_detail(json!({ "reason": infeasible.reason, "detail": infeasible.detail })),
                ));
            }
            Ok(Ok(found)) => found,
        };
        self.transition(
            id,
            Stage::Plan,
            IntentState::Planned,
            if reclaimed { "found_with_preemption" } else { "found" },
            json!({
                "path": candidate.resource_ids(),
                "weight": candidate.weight,
                "predicted_latency_ms": candidate.predicted_latency_ms,
            }),
        )?;
        if cancel.is_cancelled() {
            return self.withdraw_now(id, cancel);
        }

        // Evaluate against a fresh view; the plan may already be stale.
        let fresh = self.model.view_with_claims(self.ledger.active_claims());
        let evaluator = self.evaluator.clone();
        let evaluated = candidate.clone();
        let decision = match blocking_stage(self.config.timeouts.evaluate(), move || {
            evaluator.evaluate(&evaluated, &fresh)
        })
        .await
        {
            Ok(decision) => decision,
            Err(failure) => {
                return Ok(Step::Retry(Setback::new(Stage::Evaluate, "timeout", failure)));
            }
        };
        match &decision {
            Decision::Approved => {}
            Decision::Rejected(reason) => {
                return Ok(Step::Retry(
                    Setback::new(
                        Stage::Evaluate,
                        format!("rejected:{}", reason.kind()),
                        reason.to_string(),
                    )
                    .with_detail(json!(reason)),
                ));
            }
            Decision::Preempt(victims) => {
                self.note(id, Stage::Evaluate, "preempt", json!({ "victims": victims }));
                if !self.preempt(intent, victims).await? {
                    return Ok(Step::Retry(Setback::new(
                        Stage::Preempt,
                        "victim_busy",
                        "an eviction victim is not settled",
                    )));
                }
            }
        }
        if cancel.is_cancelled() {
            return self.withdraw_now(id, cancel);
        }

        // Commit on the shared model.
        let mut allocation = candidate.into_allocation();
        let allocation_id = allocation.id;
        let path = allocation.resource_ids();
        self.ledger.insert(allocation.clone());
        if let Err(err) = self.model.commit_path(&path, allocation.bandwidth_gbps) {
            let _ = self.ledger.advance(allocation_id, AllocationState::Released);
            if err.is_contention() {
                return Ok(Step::Retry(
                    Setback::new(Stage::Commit, "contention", err.to_string()).with_detail(json!(err)),
                ));
            }
            return Err(integrity(&err));
        }
        allocation = self
            .ledger
            .advance(allocation_id, AllocationState::Approved)
            .map_err(|err| ControlError::Integrity(err.to_string()))?;
        self.update(id, |entry| entry.allocation = Some(allocation_id));
        self.transition(
            id,
            Stage::Commit,
            IntentState::Approved,
            decision.label(),
            json!({ "allocation": allocation_id, "bandwidth_gbps": allocation.bandwidth_gbps }),
        )?;
        if cancel.is_cancelled() {
            self.teardown(allocation_id).await?;
            return self.withdraw_now(id, cancel);
        }

        // Execute. Cancellation from here on waits for the adapter.
        self.transition(
            id,
            Stage::Execute,
            IntentState::Executing,
            "dispatched",
            json!({ "adapter": self.adapter.name() }),
        )?;
        let observed = match self.execute(&allocation).await {
            ExecutionResult::Applied(observed) => observed,
            ExecutionResult::Failed(failure) => {
                self.teardown(allocation_id).await?;
                return Ok(Step::Retry(
                    Setback::new(Stage::Execute, "failed", failure.reason.clone())
                        .with_detail(json!(failure)),
                ));
            }
        };
        allocation = self
            .ledger
            .advance(allocation_id, AllocationState::Active)
            .map_err(|err| ControlError::Integrity(err.to_string()))?;
        if cancel.is_cancelled() {
            self.teardown(allocation_id).await?;
            return self.withdraw_now(id, cancel);
        }
        self.transition(
            id,
            Stage::Execute,
            IntentState::Verifying,
            "applied",
            json!({ "samples": observed.samples.len() }),
        )?;

        // Verify against the intent using everything the substrate reported.
        let mut samples = observed.samples;
        let limit = self.config.timeouts.verify();
        match tokio::time::timeout(limit, self.adapter.observe(&allocation)).await {
            Ok(Ok(fresh)) => samples.extend(fresh),
            Ok(Err(err)) => self.note(id, Stage::Verify, "observe_failed", json!({ "error": err })),
            Err(_) => self.note(
                id,
                Stage::Verify,
                "observe_timeout",
                json!({ "after_ms": limit.as_millis() }),
            ),
        }
        self.ingest_samples(id, &samples);
        let committed: IndexMap<_, _> = allocation
            .hops
            .iter()
            .filter_map(|hop| {
                let resource = self.model.get(&hop.resource).ok()?;
                Some((hop.resource.clone(), resource.committed_capacity))
            })
            .collect();
        let outcome = self
            .verifier
            .verify_under_load(&allocation, &samples, intent, &committed);
        self.update(id, |entry| entry.outcome = Some(outcome.clone()));
        match &outcome {
            Outcome::Violated(constraint) => {
                self.ledger
                    .advance(allocation_id, AllocationState::Violated)
                    .map_err(|err| ControlError::Integrity(err.to_string()))?;
                self.teardown(allocation_id).await?;
                Ok(Step::Retry(
                    Setback::new(
                        Stage::Verify,
                        format!("violated:{}", constraint.label()),
                        constraint.to_string(),
                    )
                    .with_detail(json!(outcome)),
                ))
            }
            Outcome::Satisfied | Outcome::Degraded { .. } => {
                self.ledger
                    .advance(allocation_id, AllocationState::Verified)
                    .map_err(|err| ControlError::Integrity(err.to_string()))?;
                // Make before break: the replaced intent goes only once this
                // one is verified.
                if let Some(previous) = intent.supersedes {
                    self.retire(previous).await;
                }
                self.transition(
                    id,
                    Stage::Verify,
                    IntentState::Converged,
                    outcome.label(),
                    json!(outcome),
                )?;
                Ok(Step::Settled)
            }
        }
    }

    async fn execute(&self, allocation: &Allocation) -> ExecutionResult {
        let limit = self.config.timeouts.execute();
        if let Ok(result) = tokio::time::timeout(limit, self.adapter.execute(allocation)).await {
            return result;
        }
        // Forced rollback: whatever the adapter applied before the deadline goes.
        let rolled_back = match tokio::time::timeout(limit, self.adapter.release(allocation)).await {
            Ok(Ok(())) => allocation.hops.len(),
            _ => 0,
        };
        ExecutionResult::Failed(ExecutionFailure {
            reason: ExecutionError::Timeout {
                stage: Stage::Execute.label().to_owned(),
                after_ms: self.config.timeouts.execute_ms,
            }
            .to_string(),
            resource: None,
            rolled_back_hops: rolled_back,
        })
    }

    fn ingest_samples(&self, id: IntentId, samples: &[TelemetrySample]) {
        let summary = self.ingest.ingest_batch(samples);
        if !summary.rejected.is_empty() {
            self.log(
                LogLevel::Warn,
                "control.verify.samples_rejected",
                json!({ "intent": id.to_string(), "rejected": summary.rejected }),
            );
        }
    }

    /// Evicts the named allocations. Only converged owners are evicted;
    /// returns `false` without evicting anything otherwise.
    async fn preempt(&self, by: &Intent, victims: &[AllocationId]) -> Result<bool, ControlError> {
        let mut owners = Vec::with_capacity(victims.len());
        for victim in victims {
            let Some(allocation) = self.ledger.get(*victim) else {
                return Ok(false);
            };
            owners.push(allocation.intent_id);
        }
        {
            let intents = self.intents.read();
            let busy = owners.iter().any(|owner| {
                intents.get(owner).map(|entry| entry.state) != Some(IntentState::Converged)
            });
            if busy {
                return Ok(false);
            }
        }
        for owner in owners {
            self.update(owner, |entry| {
                entry.last_violation = Some(format!("preempted by {}", by.id));
            });
            if self
                .settle_converged(owner, IntentState::Preempted, "evicted")
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
        self.note(by.id, Stage::Preempt, "evicted", json!({ "victims": victims }));
        Ok(true)
    }

    /// Releases an intent replaced by a newer one.
    async fn retire(&self, previous: IntentId) {
        let state = self.intents.read().get(&previous).map(|entry| {
            (entry.state, Arc::clone(&entry.cancel))
        });
        match state {
            Some((IntentState::Converged, _)) => {
                let _ = self
                    .settle_converged(previous, IntentState::Released, "superseded")
                    .await;
            }
            Some((state, cancel)) if !state.is_settled() => cancel.cancel("superseded"),
            _ => {}
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn integrity(err: &ResourceError) -> ControlError {
    ControlError::Integrity(err.to_string())
}

/// Plans on the part of `view` the policy admits for this intent; when
/// bandwidth is the blocker and the policy lets this intent evict others,
/// plans again as if the evictable claims were gone.
fn plan_with_reclaim(
    planner: &Planner,
    policy: &Policy,
    intent: &Intent,
    view: &TopologyView,
) -> Result<(Candidate, bool), Infeasible> {
    let admissible = admissible_view(view, policy, intent.priority, intent.id);
    match planner.plan(intent, &admissible) {
        Ok(candidate) => Ok((candidate, false)),
        Err(infeasible) if infeasible.reason == InfeasibleReason::Bandwidth => {
            match reclaimable_view(&admissible, policy, intent.priority) {
                Some(reclaimed) => planner
                    .plan(intent, &reclaimed)
                    .map(|candidate| (candidate, true))
                    .map_err(|_| infeasible),
                None => Err(infeasible),
            }
        }
        Err(infeasible) => Err(infeasible),
    }
}

/// Runs a synchronous stage off the async workers under a time limit.
async fn blocking_stage<T, F>(limit: Duration, stage: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    run_limited(limit, tokio::task::spawn_blocking(stage)).await
}

async fn run_limited<T>(
    limit: Duration,
    task: impl Future<Output = Result<T, tokio::task::JoinError>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("stage task failed: {err}")),
        Err(_) => Err(format!("stage timed out after {} ms", limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let cancel = Arc::new(Cancellation::default());
        let sleeper = Arc::clone(&cancel);
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel("withdrawn");
        cancel.cancel("ignored");
        assert!(handle.await.unwrap());
        assert_eq!(cancel.reason(), "withdrawn");
    }

    #[tokio::test]
    async fn blocking_stage_reports_timeouts() {
        let ok = blocking_stage(Duration::from_secs(1), || 7).await;
        assert_eq!(ok, Ok(7));
        let slow = blocking_stage(Duration::from_millis(5), || {
            std::thread::sleep(Duration::from_millis(100));
        })
        .await;
        assert!(slow.unwrap_err().contains("timed out"));
    }
}

//! End-to-end runs of the control loop against the simulation adapter.

use std::{sync::Arc, time::Duration};

use starstream_execution::SimulationAdapter;
use starstream_fabric::{Domain, Intent, ResourceId, ResourceModel, ResourceSpec};
use starstream_policy::Policy;

use crate::{
    config::ControlConfig,
    cycle::Stage,
    plane::ControlPlane,
    retry::{BackoffStrategy, RetryPolicy},
    state::IntentState,
};

fn config(max_retries: u32) -> ControlConfig {
    ControlConfig {
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            strategy: BackoffStrategy::Fixed,
        },
        ..ControlConfig::default()
    }
}

fn fabric(links: &[(&str, &str, &str, f64, f64)]) -> Arc<ResourceModel> {
    let model = ResourceModel::new();
    for (id, a, b, capacity, latency) in links {
        model
            .register(ResourceSpec::new(*id, Domain::Electronic, *a, *b, *capacity, *latency))
            .unwrap();
    }
    Arc::new(model)
}

fn plane(
    model: &Arc<ResourceModel>,
    policy: Policy,
    max_retries: u32,
) -> (ControlPlane, Arc<SimulationAdapter>) {
    let adapter = Arc::new(SimulationAdapter::new(model, 7));
    let plane = ControlPlane::builder(Arc::clone(model))
        .policy(Arc::new(policy))
        .adapter(adapter.clone())
        .config(config(max_retries))
        .build()
        .unwrap();
    (plane, adapter)
}

fn committed(model: &ResourceModel, id: &str) -> f64 {
    model.get(&ResourceId::from(id)).unwrap().committed_capacity
}

#[tokio::test]
async fn second_intent_is_refused_when_capacity_runs_out() {
    let model = fabric(&[("a-b", "A", "B", 10.0, 1.0)]);
    let (plane, _) = plane(&model, Policy::permissive(), 1);

    let first = plane.submit(Intent::bandwidth("A", "B", 6.0)).unwrap().intent_id;
    assert_eq!(plane.outcome(first).await.unwrap().state, IntentState::Converged);

    let second = plane.submit(Intent::bandwidth("A", "B", 6.0)).unwrap().intent_id;
    let report = plane.outcome(second).await.unwrap();
    assert_eq!(report.state, IntentState::Failed);
    assert!(report.allocation.is_none());
    assert!(report.last_violation.unwrap().contains("Gbps"));
    assert!(report
        .records
        .iter()
        .any(|record| record.decision == "infeasible:bandwidth"));
    assert!(report
        .records
        .last()
        .unwrap()
        .decision
        .ends_with("retries_exhausted"));

    assert!((committed(&model, "a-b") - 6.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_intents_never_overcommit() {
    let model = fabric(&[("a-b", "A", "B", 10.0, 1.0)]);
    let (plane, _) = plane(&model, Policy::permissive(), 2);

    let ids: Vec<_> = (0..2)
        .map(|_| plane.submit(Intent::bandwidth("A", "B", 6.0)).unwrap().intent_id)
        .collect();
    let mut converged = 0;
    for id in &ids {
        match plane.outcome(*id).await.unwrap().state {
            IntentState::Converged => converged += 1,
            IntentState::Failed => {}
            other => panic!("unexpected state {other}"),
        }
    }
    assert_eq!(converged, 1);
    assert!((committed(&model, "a-b") - 6.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn latency_bound_rejects_slow_path() {
    let model = fabric(&[("a-b", "A", "B", 100.0, 3.0), ("b-c", "B", "C", 100.0, 4.0)]);
    let (plane, adapter) = plane(&model, Policy::default(), 0);

    let id = plane
        .submit(Intent::bandwidth("A", "C", 1.0).with_max_latency(5.0))
        .unwrap()
        .intent_id;
    let report = plane.outcome(id).await.unwrap();
    assert_eq!(report.state, IntentState::Failed);
    let plan = report
        .records
        .iter()
        .find(|record| record.stage == Stage::Plan)
        .unwrap();
    assert_eq!(plan.decision, "infeasible:latency:retries_exhausted");
    assert!(!report.records.iter().any(|record| record.stage == Stage::Execute));
    assert!(committed(&model, "a-b").abs() < 1e-9);
    assert!(committed(adapter.substrate(), "a-b").abs() < 1e-9);
}

#[tokio::test]
async fn transient_execution_failure_is_retried() {
    let model = fabric(&[("a-b", "A", "B", 100.0, 1.0)]);
    let (plane, adapter) = plane(&model, Policy::default(), 2);
    adapter.fail_next(1);

    let id = plane.submit(Intent::bandwidth("A", "B", 10.0)).unwrap().intent_id;
    let report = plane.outcome(id).await.unwrap();
    assert_eq!(report.state, IntentState::Converged);
    assert_eq!(report.retries, 1);
    assert_eq!(report.cycles, 2);
    let retry = report
        .records
        .iter()
        .find(|record| record.stage == Stage::Retry)
        .unwrap();
    assert_eq!(retry.state, IntentState::Pending);
    assert_eq!(retry.decision, "backoff_elapsed");
    assert!(report
        .records
        .iter()
        .any(|record| record.stage == Stage::Execute
            && record.state == IntentState::Retrying
            && record.decision == "failed"));

    // Only the second allocation holds capacity; the first is forgotten.
    assert!((committed(&model, "a-b") - 10.0).abs() < 1e-9);
    assert!((committed(adapter.substrate(), "a-b") - 10.0).abs() < 1e-9);
    assert_eq!(plane.ledger().holding().len(), 1);
    assert_eq!(plane.ledger().len(), 1);
    assert_eq!(report.allocation.map(|a| a.id), plane.ledger().holding().first().map(|a| a.id));
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn degraded_link_triggers_replan() {
    let model = fabric(&[
        ("a-b", "A", "B", 100.0, 1.0),
        ("b-c", "B", "C", 100.0, 1.0),
        ("a-d", "A", "D", 100.0, 2.0),
        ("d-c", "D", "C", 100.0, 2.0),
    ]);
    let (plane, adapter) = plane(&model, Policy::default(), 2);
    adapter.degrade_after_apply("a-b", 4.0);

    let id = plane.submit(Intent::bandwidth("A", "C", 10.0)).unwrap().intent_id;
    let report = plane.outcome(id).await.unwrap();
    assert_eq!(report.state, IntentState::Converged);
    assert_eq!(report.retries, 1);
    assert!(report
        .records
        .iter()
        .any(|record| record.decision == "violated:bandwidth"));

    let allocation = report.allocation.unwrap();
    let path: Vec<&str> = allocation.hops.iter().map(|hop| hop.resource.as_str()).collect();
    assert_eq!(path, vec!["a-d", "d-c"]);

    // The degraded sample reached the shared model and the first path was released.
    assert!((model.get(&ResourceId::from("a-b")).unwrap().usable_capacity() - 4.0).abs() < 1e-9);
    assert!(committed(&model, "a-b").abs() < 1e-9);
    assert!(committed(&model, "b-c").abs() < 1e-9);
    assert!((committed(&model, "a-d") - 10.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn higher_priority_evicts_lowest_priority_first() {
    let model = fabric(&[("a-b", "A", "B", 10.0, 1.0)]);
    let (plane, _) = plane(&model, Policy::default(), 1);

    let older = plane
        .submit(Intent::bandwidth("A", "B", 4.0).with_priority(2))
        .unwrap()
        .intent_id;
    assert_eq!(plane.outcome(older).await.unwrap().state, IntentState::Converged);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = plane
        .submit(Intent::bandwidth("A", "B", 4.0).with_priority(1))
        .unwrap()
        .intent_id;
    assert_eq!(plane.outcome(newer).await.unwrap().state, IntentState::Converged);

    let urgent = plane
        .submit(Intent::bandwidth("A", "B", 4.0).with_priority(5))
        .unwrap()
        .intent_id;
    let report = plane.outcome(urgent).await.unwrap();
    assert_eq!(report.state, IntentState::Converged);
    assert!(report
        .records
        .iter()
        .any(|record| record.stage == Stage::Plan && record.decision == "found_with_preemption"));
    assert!(report
        .records
        .iter()
        .any(|record| record.stage == Stage::Preempt && record.decision == "evicted"));

    assert_eq!(plane.state(newer), Some(IntentState::Preempted));
    assert_eq!(plane.state(older), Some(IntentState::Converged));
    let evicted = plane.report(newer).unwrap();
    assert!(evicted.last_violation.unwrap().contains("preempted by"));
    assert!((committed(&model, "a-b") - 8.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn ceiling_steers_planning_onto_detour() {
    let model = fabric(&[
        ("short", "A", "B", 10.0, 1.0),
        ("a-c", "A", "C", 100.0, 2.0),
        ("c-b", "C", "B", 100.0, 2.0),
    ]);
    let (plane, _) = plane(&model, Policy::default(), 3);

    let id = plane.submit(Intent::bandwidth("A", "B", 9.0)).unwrap().intent_id;
    let report = plane.outcome(id).await.unwrap();
    assert_eq!(report.state, IntentState::Converged);
    assert_eq!(report.retries, 0);
    assert!(!report
        .records
        .iter()
        .any(|record| record.decision.starts_with("rejected")));

    let allocation = report.allocation.unwrap();
    let path: Vec<&str> = allocation.hops.iter().map(|hop| hop.resource.as_str()).collect();
    assert_eq!(path, vec!["a-c", "c-b"]);
    assert!(committed(&model, "short").abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn tenant_on_degraded_shared_link_is_not_satisfied() {
    let model = fabric(&[("a-b", "A", "B", 10.0, 1.0)]);
    let (plane, adapter) = plane(&model, Policy::permissive(), 1);

    let first = plane.submit(Intent::bandwidth("A", "B", 6.0)).unwrap().intent_id;
    assert_eq!(plane.outcome(first).await.unwrap().state, IntentState::Converged);

    // The link drops to 7 while it carries 6 + 3.
    adapter.degrade_after_apply("a-b", 7.0);
    let second = plane.submit(Intent::bandwidth("A", "B", 3.0)).unwrap().intent_id;
    let report = plane.outcome(second).await.unwrap();
    assert_eq!(report.state, IntentState::Failed);
    assert!(report
        .records
        .iter()
        .any(|record| record.stage == Stage::Verify && record.decision == "violated:bandwidth"));
    assert!(report
        .records
        .last()
        .unwrap()
        .decision
        .starts_with("infeasible:bandwidth"));

    assert!((committed(&model, "a-b") - 6.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn stale_admission_loses_and_replans() {
    let model = fabric(&[("a-b", "A", "B", 10.0, 1.0)]);
    let (plane, _) = plane(&model, Policy::permissive(), 1);

    // Both loops take their planning snapshot before either commits.
    let ids: Vec<_> = (0..2)
        .map(|_| plane.submit(Intent::bandwidth("A", "B", 6.0)).unwrap().intent_id)
        .collect();
    let mut reports = Vec::new();
    for id in &ids {
        reports.push(plane.outcome(*id).await.unwrap());
    }
    let (winners, losers): (Vec<_>, Vec<_>) = reports
        .into_iter()
        .partition(|report| report.state == IntentState::Converged);
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);

    let loser = &losers[0];
    assert_eq!(loser.state, IntentState::Failed);
    let lost = loser
        .records
        .iter()
        .position(|record| {
            record.decision == "contention" || record.decision == "rejected:capacity_exceeded"
        })
        .unwrap();
    assert!(matches!(loser.records[lost].stage, Stage::Evaluate | Stage::Commit));
    assert_eq!(loser.records[lost].state, IntentState::Retrying);
    assert!(loser.records[lost + 1..]
        .iter()
        .any(|record| record.stage == Stage::Plan));
    assert_eq!(loser.retries, 1);

    assert!((committed(&model, "a-b") - 6.0).abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

#[tokio::test]
async fn slow_execution_times_out_and_rolls_back() {
    let model = fabric(&[("a-b", "A", "B", 100.0, 1.0)]);
    let adapter = Arc::new(SimulationAdapter::new(&model, 7));
    adapter.set_delay(Some(Duration::from_millis(500)));
    let mut config = config(0);
    config.timeouts.execute_ms = 20;
    let plane = ControlPlane::builder(Arc::clone(&model))
        .adapter(adapter.clone())
        .config(config)
        .build()
        .unwrap();

    let id = plane.submit(Intent::bandwidth("A", "B", 10.0)).unwrap().intent_id;
    let report = plane.outcome(id).await.unwrap();
    assert_eq!(report.state, IntentState::Failed);
    assert_eq!(
        report.last_violation.as_deref(),
        Some("execute timed out after 20 ms")
    );
    assert_eq!(
        report.records.last().unwrap().decision,
        "failed:retries_exhausted"
    );
    assert!(committed(&model, "a-b").abs() < 1e-9);
    assert!(committed(adapter.substrate(), "a-b").abs() < 1e-9);
    assert!(plane.audit().is_empty());
}

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use starstream_fabric::{
    Allocation, Domain, EndpointId, FabricTelemetry, Hop, Intent, IntentId, Priority, Resource,
    ResourceId, ResourceStatus, TopologyView, CAPACITY_EPSILON,
};
use thiserror::Error;

use crate::transitions::{TransitionCost, TransitionCosts};

const WEIGHT_SCALE: f64 = 1e6;

/// Planner tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Weight per millisecond of latency.
    pub latency_weight: f64,
    /// Numerator of the inverse-available-bandwidth term.
    pub capacity_weight: f64,
    /// Domain-boundary overheads.
    pub transitions: TransitionCosts,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            latency_weight: 1.0,
            capacity_weight: 10.0,
            transitions: TransitionCosts::default(),
        }
    }
}

/// A feasible path proposed for an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Intent served.
    pub intent_id: IntentId,
    /// Priority of the intent.
    pub priority: Priority,
    /// Hops from source to destination.
    pub hops: Vec<Hop>,
    /// Bandwidth to reserve on every hop.
    pub bandwidth_gbps: f64,
    /// Predicted end-to-end latency, transitions included.
    pub predicted_latency_ms: f64,
    /// Share of the latency spent on domain transitions.
    pub transition_latency_ms: f64,
    /// Path weight.
    pub weight: f64,
    /// Smallest available capacity along the path at planning time.
    pub bottleneck_gbps: f64,
}

impl Candidate {
    /// Resources in path order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.hops.iter().map(|hop| hop.resource.clone()).collect()
    }

    /// Endpoints in path order, source first.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut endpoints: Vec<EndpointId> =
            self.hops.first().map(|hop| hop.from.clone()).into_iter().collect();
        endpoints.extend(self.hops.iter().map(|hop| hop.to.clone()));
        endpoints
    }

    /// Proposed allocation for this candidate.
    #[must_use]
    pub fn into_allocation(self) -> Allocation {
        Allocation::propose(
            self.intent_id,
            self.priority,
            self.hops,
            self.bandwidth_gbps,
            self.predicted_latency_ms,
            self.transition_latency_ms,
        )
    }
}

/// First constraint no path could satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfeasibleReason {
    /// Paths exist but none has enough available capacity.
    Bandwidth,
    /// Paths with capacity exist but all exceed the latency bound.
    Latency,
    /// Source or destination is not in the topology.
    UnknownEndpoint,
    /// Source and destination are disconnected.
    Unreachable,
}

impl InfeasibleReason {
    /// Label used in records and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Bandwidth => "bandwidth",
            Self::Latency => "latency",
            Self::UnknownEndpoint => "unknown_endpoint",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for InfeasibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// No path satisfies the intent.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{intent_id} infeasible ({reason}): {detail}")]
pub struct Infeasible {
    /// Intent that could not be planned.
    pub intent_id: IntentId,
    /// First violated constraint.
    pub reason: InfeasibleReason,
    /// Human readable detail.
    pub detail: String,
}

/// Constrained shortest-path planner.
///
/// Search state is `(endpoint, domain of the last hop)`; each state keeps the
/// Pareto front of `(weight, latency)` labels so a heavier but faster prefix
/// survives when the intent carries a latency bound. Labels are expanded in
/// `(weight, endpoint path, resource path)` order, which makes the first label
/// reaching the destination both minimal and the lexicographically smallest
/// among equal-weight paths.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
    telemetry: Option<FabricTelemetry>,
}

impl Planner {
    /// Planner with the given tuning.
    #[must_use]
    pub const fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Active tuning.
    #[must_use]
    pub const fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plans a path for `intent` over `view`.
    pub fn plan(&self, intent: &Intent, view: &TopologyView) -> Result<Candidate, Infeasible> {
        let result = self
            .search(intent, view)
            .ok_or_else(|| diagnose(intent, view, &self.config.transitions));
        match &result {
            Ok(candidate) => self.log(
                LogLevel::Debug,
                "planning.plan.found",
                json!({
                    "intent": intent.id.to_string(),
                    "path": candidate.resource_ids(),
                    "weight": candidate.weight,
                    "latency_ms": candidate.predicted_latency_ms
                }),
            ),
            Err(infeasible) => self.log(
                LogLevel::Info,
                "planning.plan.infeasible",
                json!({
                    "intent": intent.id.to_string(),
                    "reason": infeasible.reason.label(),
                    "detail": infeasible.detail
                }),
            ),
        }
        result
    }

    fn search(&self, intent: &Intent, view: &TopologyView) -> Option<Candidate> {
        if !view.has_endpoint(&intent.source) || !view.has_endpoint(&intent.destination) {
            return None;
        }
        let bandwidth = intent.min_bandwidth_gbps;
        let mut frontier = BinaryHeap::new();
        let mut settled: BTreeMap<(EndpointId, Option<Domain>), Vec<(i64, f64)>> = BTreeMap::new();
        frontier.push(Reverse(Label::origin(intent.source.clone())));

        while let Some(Reverse(label)) = frontier.pop() {
            let front = settled.entry((label.node.clone(), label.domain)).or_default();
            if front
                .iter()
                .any(|(w, lat)| *w <= label.weight_q && *lat <= label.latency + CAPACITY_EPSILON)
            {
                continue;
            }
            front.push((label.weight_q, label.latency));

            if label.node == intent.destination {
                return Some(label.into_candidate(intent));
            }

            for resource in view.incident(&label.node) {
                if !carries(resource, bandwidth) {
                    continue;
                }
                let Some(next) = resource.far_end(&label.node) else {
                    continue;
                };
                if label.nodes.contains(next) {
                    continue;
                }
                let transition = label.domain.map_or(TransitionCost::FREE, |from| {
                    self.config.transitions.between(from, resource.domain)
                });
                let latency = label.latency + resource.latency_ms + transition.latency_ms;
                if intent
                    .max_latency_ms
                    .is_some_and(|max| latency > max + CAPACITY_EPSILON)
                {
                    continue;
                }
                frontier.push(Reverse(label.extend(resource, next, transition, &self.config)));
            }
        }
        None
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[derive(Debug, Clone)]
struct Label {
    weight_q: i64,
    weight: f64,
    latency: f64,
    transition_latency: f64,
    bottleneck: f64,
    node: EndpointId,
    domain: Option<Domain>,
    nodes: Vec<EndpointId>,
    hops: Vec<Hop>,
}

impl Label {
    fn origin(source: EndpointId) -> Self {
        Self {
            weight_q: 0,
            weight: 0.0,
            latency: 0.0,
            transition_latency: 0.0,
            bottleneck: f64::INFINITY,
            node: source.clone(),
            domain: None,
            nodes: vec![source],
            hops: Vec::new(),
        }
    }

    fn extend(
        &self,
        resource: &Resource,
        next: &EndpointId,
        transition: TransitionCost,
        config: &PlannerConfig,
    ) -> Self {
        let available = resource.available().max(CAPACITY_EPSILON);
        let weight = self.weight
            + config.latency_weight * resource.latency_ms
            + config.capacity_weight / available
            + transition.weight;
        let mut nodes = self.nodes.clone();
        nodes.push(next.clone());
        let mut hops = self.hops.clone();
        hops.push(Hop {
            resource: resource.id.clone(),
            from: self.node.clone(),
            to: next.clone(),
            domain: resource.domain,
            latency_ms: resource.latency_ms,
        });
        Self {
            weight_q: quantize(weight),
            weight,
            latency: self.latency + resource.latency_ms + transition.latency_ms,
            transition_latency: self.transition_latency + transition.latency_ms,
            bottleneck: self.bottleneck.min(resource.available()),
            node: next.clone(),
            domain: Some(resource.domain),
            nodes,
            hops,
        }
    }

    fn into_candidate(self, intent: &Intent) -> Candidate {
        Candidate {
            intent_id: intent.id,
            priority: intent.priority,
            hops: self.hops,
            bandwidth_gbps: intent.min_bandwidth_gbps,
            predicted_latency_ms: self.latency,
            transition_latency_ms: self.transition_latency,
            weight: self.weight,
            bottleneck_gbps: self.bottleneck,
        }
    }

    fn resource_path(&self) -> impl Iterator<Item = &ResourceId> {
        self.hops.iter().map(|hop| &hop.resource)
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Label {}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight_q
            .cmp(&other.weight_q)
            .then_with(|| self.nodes.cmp(&other.nodes))
            .then_with(|| self.resource_path().cmp(other.resource_path()))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(weight: f64) -> i64 {
    (weight * WEIGHT_SCALE).round() as i64
}

fn carries(resource: &Resource, bandwidth: f64) -> bool {
    resource.status != ResourceStatus::Down && resource.available() + CAPACITY_EPSILON >= bandwidth
}

fn usable(resource: &Resource) -> bool {
    resource.status != ResourceStatus::Down
}

fn diagnose(intent: &Intent, view: &TopologyView, transitions: &TransitionCosts) -> Infeasible {
    let infeasible = |reason, detail: String| Infeasible {
        intent_id: intent.id,
        reason,
        detail,
    };
    for endpoint in [&intent.source, &intent.destination] {
        if !view.has_endpoint(endpoint) {
            return infeasible(
                InfeasibleReason::UnknownEndpoint,
                format!("endpoint `{endpoint}` is not in the topology"),
            );
        }
    }
    let bandwidth = intent.min_bandwidth_gbps;
    if !connected(view, intent, |r| carries(r, bandwidth)) {
        return if connected(view, intent, usable) {
            infeasible(
                InfeasibleReason::Bandwidth,
                format!("no path with {bandwidth} Gbps available on every hop"),
            )
        } else {
            infeasible(
                InfeasibleReason::Unreachable,
                format!("`{}` cannot reach `{}`", intent.source, intent.destination),
            )
        };
    }
    let bound = intent.max_latency_ms.unwrap_or(f64::INFINITY);
    let best = lowest_latency(view, intent, bandwidth, transitions).unwrap_or(f64::INFINITY);
    infeasible(
        InfeasibleReason::Latency,
        format!("lowest achievable latency {best:.3} ms exceeds bound {bound} ms"),
    )
}

fn connected(view: &TopologyView, intent: &Intent, keep: impl Fn(&Resource) -> bool) -> bool {
    let mut seen = BTreeSet::from([intent.source.clone()]);
    let mut queue = VecDeque::from([intent.source.clone()]);
    while let Some(node) = queue.pop_front() {
        if node == intent.destination {
            return true;
        }
        for resource in view.incident(&node) {
            if !keep(resource) {
                continue;
            }
            if let Some(next) = resource.far_end(&node) {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
    }
    false
}

/// Smallest end-to-end latency over hops that carry `bandwidth`, transition
/// overheads included. Search state is `(endpoint, domain of the last hop)`.
#[allow(clippy::cast_precision_loss)]
fn lowest_latency(
    view: &TopologyView,
    intent: &Intent,
    bandwidth: f64,
    transitions: &TransitionCosts,
) -> Option<f64> {
    let mut best: BTreeMap<(EndpointId, Option<Domain>), i64> = BTreeMap::new();
    let mut queue = BinaryHeap::from([Reverse((0_i64, intent.source.clone(), None))]);
    while let Some(Reverse((dist, node, domain))) = queue.pop() {
        let state = (node.clone(), domain);
        if best.get(&state).is_some_and(|seen| *seen <= dist) {
            continue;
        }
        best.insert(state, dist);
        if node == intent.destination {
            return Some(dist as f64 / WEIGHT_SCALE);
        }
        for resource in view.incident(&node).filter(|r| carries(r, bandwidth)) {
            if let Some(next) = resource.far_end(&node) {
                let transition = domain.map_or(TransitionCost::FREE, |from| {
                    transitions.between(from, resource.domain)
                });
                let step = quantize(resource.latency_ms + transition.latency_ms);
                queue.push(Reverse((dist + step, next.clone(), Some(resource.domain))));
            }
        }
    }
    None
}

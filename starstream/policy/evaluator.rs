use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use starstream_fabric::{
    ActiveClaim, AllocationId, FabricTelemetry, IntentId, Priority, Resource, ResourceId,
    ResourceStatus, TopologyView, CAPACITY_EPSILON,
};
use starstream_planning::Candidate;
use thiserror::Error;

use crate::constraint::{Constraint, EvictionOrder, Policy, PreemptionRule};

/// Why a candidate was refused.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// The path references a resource missing from the snapshot.
    #[error("resource `{resource}` is not in the topology")]
    UnknownResource {
        /// Resource involved.
        resource: ResourceId,
    },
    /// A resource on the path is down.
    #[error("resource `{resource}` is down")]
    ResourceDown {
        /// Resource involved.
        resource: ResourceId,
    },
    /// A resource reports loss above the ceiling.
    #[error("resource `{resource}` loss {loss} exceeds {max_loss}")]
    LossExceeded {
        /// Resource involved.
        resource: ResourceId,
        /// Reported loss.
        loss: f64,
        /// Ceiling.
        max_loss: f64,
    },
    /// Admitting the candidate would push a resource past its ceiling even
    /// after every eligible eviction.
    #[error("capacity exceeded on `{resource}`: {requested} Gbps requested, {committed} committed, limit {limit}")]
    CapacityExceeded {
        /// Resource involved.
        resource: ResourceId,
        /// Bandwidth requested.
        requested: f64,
        /// Capacity already committed.
        committed: f64,
        /// Ceiling in Gbps.
        limit: f64,
    },
    /// An isolation rule excludes the candidate's priority class.
    #[error("resource `{resource}` is isolated by {tag}={value}")]
    Isolation {
        /// Resource involved.
        resource: ResourceId,
        /// Tag key.
        tag: String,
        /// Tag value.
        value: String,
    },
    /// A dedicated resource is already held.
    #[error("resource `{resource}` is dedicated ({tag}) and already held")]
    Dedicated {
        /// Resource involved.
        resource: ResourceId,
        /// Tag key.
        tag: String,
    },
}

impl RejectReason {
    /// Resource the rejection refers to.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        match self {
            Self::UnknownResource { resource }
            | Self::ResourceDown { resource }
            | Self::LossExceeded { resource, .. }
            | Self::CapacityExceeded { resource, .. }
            | Self::Isolation { resource, .. }
            | Self::Dedicated { resource, .. } => resource,
        }
    }

    /// Label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownResource { .. } => "unknown_resource",
            Self::ResourceDown { .. } => "resource_down",
            Self::LossExceeded { .. } => "loss_exceeded",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Isolation { .. } => "isolation",
            Self::Dedicated { .. } => "dedicated",
        }
    }
}

/// Policy verdict on a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    /// Admit as is.
    Approved,
    /// Refuse.
    Rejected(RejectReason),
    /// Admit after evicting these allocations, in eviction order.
    Preempt(Vec<AllocationId>),
}

impl Decision {
    /// Label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected(_) => "rejected",
            Self::Preempt(_) => "preempt",
        }
    }
}

/// Evaluates `candidate` against `view` and `policy`.
///
/// Stages run in a fixed order: capacity (status, loss, ceilings), then
/// isolation and dedication, then priority. The function reads its inputs
/// only.
#[must_use]
pub fn evaluate(candidate: &Candidate, view: &TopologyView, policy: &Policy) -> Decision {
    let path = candidate.resource_ids();
    let mut resources = Vec::with_capacity(path.len());
    for id in &path {
        match view.resource(id) {
            Some(resource) => resources.push(resource),
            None => {
                return Decision::Rejected(RejectReason::UnknownResource {
                    resource: id.clone(),
                })
            }
        }
    }
    let preemption = policy.preemption();
    let victims = eligible_victims(candidate.priority, view, preemption);

    if let Err(reason) = check_capacity(candidate, &resources, policy, &victims) {
        return Decision::Rejected(reason);
    }
    if let Err(reason) = check_isolation(candidate, &resources, view, policy) {
        return Decision::Rejected(reason);
    }
    match preemption {
        Some(rule) => select_victims(candidate, &resources, policy, victims, rule),
        None => Decision::Approved,
    }
}

/// `view` as an intent of `priority` would see it once every claim it may
/// evict is gone. Claims are kept so a later [`evaluate`] still names them.
///
/// `None` when preemption is disabled or nothing is evictable.
#[must_use]
pub fn reclaimable_view(
    view: &TopologyView,
    policy: &Policy,
    priority: Priority,
) -> Option<TopologyView> {
    let victims = eligible_victims(priority, view, policy.preemption());
    if victims.is_empty() {
        return None;
    }
    let mut reclaimed = view.clone();
    for claim in victims {
        for id in &claim.path {
            if let Some(resource) = reclaimed.resources.get_mut(id) {
                resource.committed_capacity = (resource.committed_capacity - claim.bandwidth).max(0.0);
            }
        }
    }
    Some(reclaimed)
}

/// `view` with every resource the policy keeps from this intent marked down
/// and the rest capped at their ceiling, so a planner searching it only finds
/// paths [`evaluate`] can approve on the same snapshot.
///
/// Committed capacity and claims are left alone.
#[must_use]
pub fn admissible_view(
    view: &TopologyView,
    policy: &Policy,
    priority: Priority,
    intent: IntentId,
) -> TopologyView {
    let max_loss = policy.max_loss();
    let mut admissible = view.clone();
    for resource in admissible.resources.values_mut() {
        let lossy = max_loss.is_some_and(|max| resource.loss > max);
        let fenced = policy.constraints.iter().any(|constraint| {
            isolation_breach(constraint, resource, view, priority, intent).is_some()
        });
        if lossy || fenced {
            resource.status = ResourceStatus::Down;
        } else {
            resource.reported_capacity = policy.capacity_limit(resource);
        }
    }
    admissible
}

fn eligible_victims(
    priority: Priority,
    view: &TopologyView,
    preemption: Option<PreemptionRule>,
) -> Vec<&ActiveClaim> {
    let Some(rule) = preemption else {
        return Vec::new();
    };
    view.claims
        .iter()
        .filter(|claim| claim.preemptible && rule.allows(priority, claim.priority))
        .collect()
}

fn check_capacity(
    candidate: &Candidate,
    resources: &[&Resource],
    policy: &Policy,
    victims: &[&ActiveClaim],
) -> Result<(), RejectReason> {
    let max_loss = policy.max_loss();
    for resource in resources {
        if resource.status == ResourceStatus::Down {
            return Err(RejectReason::ResourceDown {
                resource: resource.id.clone(),
            });
        }
        if let Some(max_loss) = max_loss {
            if resource.loss > max_loss {
                return Err(RejectReason::LossExceeded {
                    resource: resource.id.clone(),
                    loss: resource.loss,
                    max_loss,
                });
            }
        }
        let limit = policy.capacity_limit(resource);
        let freeable: f64 = victims
            .iter()
            .filter(|claim| claim.path.contains(&resource.id))
            .map(|claim| claim.bandwidth)
            .sum();
        let hard = (resource.committed_capacity - freeable).max(0.0);
        if candidate.bandwidth_gbps + hard > limit + CAPACITY_EPSILON {
            return Err(RejectReason::CapacityExceeded {
                resource: resource.id.clone(),
                requested: candidate.bandwidth_gbps,
                committed: resource.committed_capacity,
                limit,
            });
        }
    }
    Ok(())
}

fn check_isolation(
    candidate: &Candidate,
    resources: &[&Resource],
    view: &TopologyView,
    policy: &Policy,
) -> Result<(), RejectReason> {
    for constraint in &policy.constraints {
        for resource in resources {
            if let Some(reason) =
                isolation_breach(constraint, resource, view, candidate.priority, candidate.intent_id)
            {
                return Err(reason);
            }
        }
    }
    Ok(())
}

fn isolation_breach(
    constraint: &Constraint,
    resource: &Resource,
    view: &TopologyView,
    priority: Priority,
    intent: IntentId,
) -> Option<RejectReason> {
    match constraint {
        Constraint::Isolation {
            tag,
            value,
            min_priority,
            max_priority,
        } if resource.tag(tag) == Some(value.as_str()) => {
            let below = min_priority.is_some_and(|min| priority.0 < min);
            let above = max_priority.is_some_and(|max| priority.0 > max);
            (below || above).then(|| RejectReason::Isolation {
                resource: resource.id.clone(),
                tag: tag.clone(),
                value: value.clone(),
            })
        }
        Constraint::Dedicated { tag } if resource.tag(tag).is_some() => view
            .claims_on(&resource.id)
            .any(|claim| claim.intent_id != intent)
            .then(|| RejectReason::Dedicated {
                resource: resource.id.clone(),
                tag: tag.clone(),
            }),
        _ => None,
    }
}

fn select_victims(
    candidate: &Candidate,
    resources: &[&Resource],
    policy: &Policy,
    mut victims: Vec<&ActiveClaim>,
    rule: PreemptionRule,
) -> Decision {
    let mut shortfall: BTreeMap<&ResourceId, f64> = BTreeMap::new();
    for resource in resources {
        let need = candidate.bandwidth_gbps + resource.committed_capacity
            - policy.capacity_limit(resource);
        if need > CAPACITY_EPSILON {
            shortfall.insert(&resource.id, need);
        }
    }
    if shortfall.is_empty() {
        return Decision::Approved;
    }

    victims.sort_by(|a, b| {
        let by_age = match rule.order {
            EvictionOrder::OldestFirst => a.activated_at.cmp(&b.activated_at),
            EvictionOrder::NewestFirst => b.activated_at.cmp(&a.activated_at),
        };
        a.priority
            .cmp(&b.priority)
            .then(by_age)
            .then_with(|| a.allocation_id.cmp(&b.allocation_id))
    });

    let mut chosen: Vec<AllocationId> = Vec::new();
    let mut taken = BTreeSet::new();
    let pending: Vec<&ResourceId> = shortfall.keys().copied().collect();
    for id in pending {
        for claim in victims.iter().filter(|claim| claim.path.contains(id)) {
            let satisfied = shortfall
                .get(id)
                .copied()
                .unwrap_or_default()
                <= CAPACITY_EPSILON;
            if satisfied {
                break;
            }
            if !taken.insert(claim.allocation_id) {
                continue;
            }
            chosen.push(claim.allocation_id);
            for freed in &claim.path {
                if let Some(need) = shortfall.get_mut(freed) {
                    *need -= claim.bandwidth;
                }
            }
        }
    }
    Decision::Preempt(chosen)
}

/// Evaluator bound to a loaded policy, logging every decision.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    policy: Arc<Policy>,
    telemetry: Option<FabricTelemetry>,
}

impl PolicyEvaluator {
    /// Evaluator for `policy`.
    #[must_use]
    pub const fn new(policy: Arc<Policy>) -> Self {
        Self {
            policy,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Loaded policy.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Evaluates a candidate and logs the decision.
    #[must_use]
    pub fn evaluate(&self, candidate: &Candidate, view: &TopologyView) -> Decision {
        let decision = evaluate(candidate, view, &self.policy);
        if let Some(tel) = &self.telemetry {
            let level = match decision {
                Decision::Rejected(_) => LogLevel::Warn,
                _ => LogLevel::Debug,
            };
            let _ = tel.log(
                level,
                "policy.decision",
                json!({
                    "intent": candidate.intent_id.to_string(),
                    "decision": decision.label(),
                    "detail": decision,
                }),
            );
        }
        decision
    }
}

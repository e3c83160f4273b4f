use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    intent::{IntentId, Priority},
    resource::{Domain, EndpointId, ResourceId},
    topology::ActiveClaim,
};

/// Unique allocation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(Uuid);

impl AllocationId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// One traversal of a resource along a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// Resource traversed.
    pub resource: ResourceId,
    /// Entry endpoint.
    pub from: EndpointId,
    /// Exit endpoint.
    pub to: EndpointId,
    /// Domain of the resource.
    pub domain: Domain,
    /// Resource latency at planning time.
    pub latency_ms: f64,
}

/// Allocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    /// Produced by the planner, nothing committed.
    Proposed,
    /// Policy approved and capacity committed.
    Approved,
    /// Applied to the substrate.
    Active,
    /// Observed to meet the intent.
    Verified,
    /// Observed to miss the intent.
    Violated,
    /// Capacity returned. Terminal.
    Released,
}

impl AllocationState {
    /// Whether `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use AllocationState::{Active, Approved, Proposed, Released, Verified, Violated};
        matches!(
            (self, next),
            (Proposed, Approved | Released)
                | (Approved, Active | Released)
                | (Active, Verified | Violated | Released)
                | (Verified, Violated | Released)
                | (Violated, Released)
        )
    }

    /// Whether the allocation holds committed capacity in this state.
    #[must_use]
    pub const fn holds_capacity(self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Active | Self::Verified | Self::Violated
        )
    }

    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Verified => "verified",
            Self::Violated => "violated",
            Self::Released => "released",
        }
    }
}

/// Concrete assignment of resources to an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Identifier.
    pub id: AllocationId,
    /// Intent served.
    pub intent_id: IntentId,
    /// Priority copied from the intent.
    pub priority: Priority,
    /// Ordered hops from source to destination.
    pub hops: Vec<Hop>,
    /// Bandwidth reserved on every hop.
    pub bandwidth_gbps: f64,
    /// Latency predicted at planning time, transitions included.
    pub predicted_latency_ms: f64,
    /// Latency contributed by domain transitions.
    pub transition_latency_ms: f64,
    /// Lifecycle state.
    pub state: AllocationState,
    /// Creation time.
    pub proposed_at: DateTime<Utc>,
    /// When the allocation became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// When the allocation was released.
    pub released_at: Option<DateTime<Utc>>,
}

impl Allocation {
    /// New allocation in [`AllocationState::Proposed`].
    #[must_use]
    pub fn propose(
        intent_id: IntentId,
        priority: Priority,
        hops: Vec<Hop>,
        bandwidth_gbps: f64,
        predicted_latency_ms: f64,
        transition_latency_ms: f64,
    ) -> Self {
        Self {
            id: AllocationId::new(),
            intent_id,
            priority,
            hops,
            bandwidth_gbps,
            predicted_latency_ms,
            transition_latency_ms,
            state: AllocationState::Proposed,
            proposed_at: Utc::now(),
            activated_at: None,
            released_at: None,
        }
    }

    /// Resources in path order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.hops.iter().map(|hop| hop.resource.clone()).collect()
    }

    /// Moves to `next`, stamping activation and release times.
    pub fn advance(&mut self, next: AllocationState) -> Result<(), AllocationError> {
        if !self.state.can_transition_to(next) {
            return Err(AllocationError::IllegalTransition {
                allocation: self.id,
                from: self.state,
                to: next,
            });
        }
        match next {
            AllocationState::Active => self.activated_at = Some(Utc::now()),
            AllocationState::Released => self.released_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Claim as seen by policy. Only applied allocations are preemptible.
    #[must_use]
    pub fn claim(&self) -> ActiveClaim {
        ActiveClaim {
            allocation_id: self.id,
            intent_id: self.intent_id,
            priority: self.priority,
            bandwidth: self.bandwidth_gbps,
            activated_at: self.activated_at,
            preemptible: matches!(
                self.state,
                AllocationState::Active | AllocationState::Verified
            ),
            path: self.resource_ids(),
        }
    }
}

/// Allocation bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationError {
    /// No allocation with this id.
    #[error("unknown allocation {0}")]
    UnknownAllocation(AllocationId),
    /// Transition not allowed by the lifecycle.
    #[error("allocation {allocation} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        /// Allocation involved.
        allocation: AllocationId,
        /// Current state.
        from: AllocationState,
        /// Requested state.
        to: AllocationState,
    },
}

/// Registry of every allocation the control plane has created.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    entries: RwLock<IndexMap<AllocationId, Allocation>>,
}

impl AllocationLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an allocation.
    pub fn insert(&self, allocation: Allocation) {
        self.entries.write().insert(allocation.id, allocation);
    }

    /// Advances an allocation and returns the updated copy.
    pub fn advance(
        &self,
        id: AllocationId,
        next: AllocationState,
    ) -> Result<Allocation, AllocationError> {
        let mut entries = self.entries.write();
        let allocation = entries
            .get_mut(&id)
            .ok_or(AllocationError::UnknownAllocation(id))?;
        allocation.advance(next)?;
        Ok(allocation.clone())
    }

    /// Copy of one allocation.
    #[must_use]
    pub fn get(&self, id: AllocationId) -> Option<Allocation> {
        self.entries.read().get(&id).cloned()
    }

    /// Every allocation created for an intent, oldest first.
    #[must_use]
    pub fn by_intent(&self, intent: IntentId) -> Vec<Allocation> {
        self.entries
            .read()
            .values()
            .filter(|a| a.intent_id == intent)
            .cloned()
            .collect()
    }

    /// Allocations currently holding capacity.
    #[must_use]
    pub fn holding(&self) -> Vec<Allocation> {
        self.entries
            .read()
            .values()
            .filter(|a| a.state.holds_capacity())
            .cloned()
            .collect()
    }

    /// Claims of allocations currently holding capacity.
    #[must_use]
    pub fn active_claims(&self) -> Vec<ActiveClaim> {
        self.entries
            .read()
            .values()
            .filter(|a| a.state.holds_capacity())
            .map(Allocation::claim)
            .collect()
    }

    /// Drops released allocations for which `keep` is false and returns how
    /// many went. Allocations still holding capacity are never dropped.
    pub fn prune_released(&self, keep: impl Fn(&Allocation) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, allocation| {
            allocation.state != AllocationState::Released || keep(allocation)
        });
        before - entries.len()
    }

    /// Number of recorded allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(id: &str) -> Hop {
        Hop {
            resource: id.into(),
            from: "A".into(),
            to: "B".into(),
            domain: Domain::Electronic,
            latency_ms: 1.0,
        }
    }

    #[test]
    fn lifecycle_rejects_illegal_moves() {
        let mut allocation =
            Allocation::propose(IntentId::new(), Priority::default(), vec![hop("ab")], 5.0, 1.0, 0.0);
        assert!(allocation.advance(AllocationState::Active).is_err());
        allocation.advance(AllocationState::Approved).unwrap();
        allocation.advance(AllocationState::Active).unwrap();
        assert!(allocation.activated_at.is_some());
        allocation.advance(AllocationState::Released).unwrap();
        assert!(allocation.advance(AllocationState::Verified).is_err());
    }

    #[test]
    fn ledger_reports_holding_claims() {
        let ledger = AllocationLedger::new();
        let allocation =
            Allocation::propose(IntentId::new(), Priority(5), vec![hop("ab")], 5.0, 1.0, 0.0);
        let id = allocation.id;
        ledger.insert(allocation);
        assert!(ledger.active_claims().is_empty());
        ledger.advance(id, AllocationState::Approved).unwrap();
        let claims = ledger.active_claims();
        assert_eq!(claims.len(), 1);
        assert!(!claims[0].preemptible);
        ledger.advance(id, AllocationState::Active).unwrap();
        assert!(ledger.active_claims()[0].preemptible);
        assert!(matches!(
            ledger.advance(AllocationId::new(), AllocationState::Released),
            Err(AllocationError::UnknownAllocation(_))
        ));
    }

    #[test]
    fn pruning_keeps_held_and_referenced_allocations() {
        let ledger = AllocationLedger::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let allocation =
                Allocation::propose(IntentId::new(), Priority(1), vec![hop("ab")], 1.0, 1.0, 0.0);
            ids.push(allocation.id);
            ledger.insert(allocation);
        }
        ledger.advance(ids[0], AllocationState::Approved).unwrap();
        ledger.advance(ids[1], AllocationState::Released).unwrap();
        ledger.advance(ids[2], AllocationState::Released).unwrap();

        let referenced = ids[2];
        assert_eq!(ledger.prune_released(|a| a.id == referenced), 1);
        assert!(ledger.get(ids[0]).is_some());
        assert!(ledger.get(ids[1]).is_none());
        assert!(ledger.get(ids[2]).is_some());
        assert_eq!(ledger.prune_released(|_| false), 1);
        assert_eq!(ledger.len(), 1);
    }
}

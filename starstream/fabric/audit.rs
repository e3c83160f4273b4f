use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    allocation::{AllocationId, AllocationLedger},
    model::ResourceModel,
    resource::{ResourceId, CAPACITY_EPSILON},
};

/// A violated capacity invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvariantBreach {
    /// Committed capacity above total capacity.
    Overcommitted {
        /// Resource involved.
        resource: ResourceId,
        /// Commitment.
        committed: f64,
        /// Total capacity.
        total: f64,
    },
    /// Holding allocations claim more than the model has committed.
    UncoveredClaim {
        /// Resource involved.
        resource: ResourceId,
        /// Sum of claims.
        claimed: f64,
        /// Commitment recorded by the model.
        committed: f64,
    },
    /// An allocation spans a resource the model does not know.
    UnknownPathResource {
        /// Allocation involved.
        allocation: AllocationId,
        /// Missing resource.
        resource: ResourceId,
    },
}

/// Checks the model against the ledger.
///
/// Committed capacity may exceed the sum of claims transiently (a commit lands
/// before the ledger marks the allocation approved), never the other way round.
#[must_use]
pub fn audit(model: &ResourceModel, ledger: &AllocationLedger) -> Vec<InvariantBreach> {
    let mut breaches = Vec::new();
    let resources: BTreeMap<_, _> = model
        .resources()
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    for resource in resources.values() {
        if resource.committed_capacity > resource.total_capacity + CAPACITY_EPSILON {
            breaches.push(InvariantBreach::Overcommitted {
                resource: resource.id.clone(),
                committed: resource.committed_capacity,
                total: resource.total_capacity,
            });
        }
    }

    let mut claimed: BTreeMap<ResourceId, f64> = BTreeMap::new();
    for allocation in ledger.holding() {
        for id in allocation.resource_ids() {
            if resources.contains_key(&id) {
                *claimed.entry(id).or_default() += allocation.bandwidth_gbps;
            } else {
                breaches.push(InvariantBreach::UnknownPathResource {
                    allocation: allocation.id,
                    resource: id,
                });
            }
        }
    }
    for (id, sum) in claimed {
        let committed = resources[&id].committed_capacity;
        if sum > committed + 1e-6 {
            breaches.push(InvariantBreach::UncoveredClaim {
                resource: id,
                claimed: sum,
                committed,
            });
        }
    }
    breaches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocation::{Allocation, AllocationState, Hop},
        intent::{IntentId, Priority},
        resource::{Domain, ResourceSpec},
    };

    fn allocation(bw: f64) -> Allocation {
        Allocation::propose(
            IntentId::new(),
            Priority::default(),
            vec![Hop {
                resource: "ab".into(),
                from: "A".into(),
                to: "B".into(),
                domain: Domain::Compute,
                latency_ms: 0.1,
            }],
            bw,
            0.1,
            0.0,
        )
    }

    #[test]
    fn clean_state_has_no_breaches() {
        let model = ResourceModel::new();
        model
            .register(ResourceSpec::new("ab", Domain::Compute, "A", "B", 10.0, 0.1))
            .unwrap();
        let ledger = AllocationLedger::new();
        let alloc = allocation(4.0);
        let id = alloc.id;
        ledger.insert(alloc);
        model.commit(&"ab".into(), 4.0).unwrap();
        ledger.advance(id, AllocationState::Approved).unwrap();
        assert!(audit(&model, &ledger).is_empty());
    }

    #[test]
    fn detects_uncovered_claim() {
        let model = ResourceModel::new();
        model
            .register(ResourceSpec::new("ab", Domain::Compute, "A", "B", 10.0, 0.1))
            .unwrap();
        let ledger = AllocationLedger::new();
        let alloc = allocation(4.0);
        let id = alloc.id;
        ledger.insert(alloc);
        ledger.advance(id, AllocationState::Approved).unwrap();
        let breaches = audit(&model, &ledger);
        assert!(matches!(breaches[0], InvariantBreach::UncoveredClaim { .. }));
    }
}

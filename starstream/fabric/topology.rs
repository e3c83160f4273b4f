use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    allocation::AllocationId,
    intent::{IntentId, Priority},
    resource::{EndpointId, Resource, ResourceId},
};

/// Capacity held by a live allocation, as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveClaim {
    /// Allocation holding the capacity.
    pub allocation_id: AllocationId,
    /// Intent the allocation serves.
    pub intent_id: IntentId,
    /// Priority of that intent.
    pub priority: Priority,
    /// Bandwidth held on every resource of the path.
    pub bandwidth: f64,
    /// When the allocation became active, if it has.
    pub activated_at: Option<DateTime<Utc>>,
    /// Whether the allocation may be evicted.
    pub preemptible: bool,
    /// Resources the allocation spans.
    pub path: Vec<ResourceId>,
}

/// Immutable snapshot of the fabric used by planning and policy.
///
/// Collections are ordered so iteration is reproducible for equal snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyView {
    /// Every known endpoint.
    pub endpoints: BTreeSet<EndpointId>,
    /// Resource copies keyed by id.
    pub resources: BTreeMap<ResourceId, Resource>,
    /// Resources incident to each endpoint, sorted by id.
    pub adjacency: BTreeMap<EndpointId, Vec<ResourceId>>,
    /// Claims of live allocations.
    pub claims: Vec<ActiveClaim>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl TopologyView {
    /// Builds a view from resource copies.
    #[must_use]
    pub fn new(
        endpoints: impl IntoIterator<Item = EndpointId>,
        resources: impl IntoIterator<Item = Resource>,
        claims: Vec<ActiveClaim>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        let mut endpoint_set: BTreeSet<EndpointId> = endpoints.into_iter().collect();
        let mut by_id = BTreeMap::new();
        let mut adjacency: BTreeMap<EndpointId, Vec<ResourceId>> = BTreeMap::new();
        for resource in resources {
            let (a, b) = resource.endpoints.clone();
            endpoint_set.insert(a.clone());
            endpoint_set.insert(b.clone());
            adjacency.entry(a).or_default().push(resource.id.clone());
            adjacency.entry(b).or_default().push(resource.id.clone());
            by_id.insert(resource.id.clone(), resource);
        }
        for ids in adjacency.values_mut() {
            ids.sort();
        }
        Self {
            endpoints: endpoint_set,
            resources: by_id,
            adjacency,
            claims,
            taken_at,
        }
    }

    /// Resource by id.
    #[must_use]
    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Whether an endpoint exists.
    #[must_use]
    pub fn has_endpoint(&self, endpoint: &EndpointId) -> bool {
        self.endpoints.contains(endpoint)
    }

    /// Resources touching `endpoint`, in id order.
    pub fn incident<'a>(&'a self, endpoint: &EndpointId) -> impl Iterator<Item = &'a Resource> + 'a {
        self.adjacency
            .get(endpoint)
            .into_iter()
            .flatten()
            .filter_map(|id| self.resources.get(id))
    }

    /// Claims spanning a resource.
    pub fn claims_on<'a>(&'a self, id: &'a ResourceId) -> impl Iterator<Item = &'a ActiveClaim> + 'a {
        self.claims.iter().filter(move |claim| claim.path.contains(id))
    }

    /// Same view with the given claims attached.
    #[must_use]
    pub fn with_claims(mut self, claims: Vec<ActiveClaim>) -> Self {
        self.claims = claims;
        self
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used for every capacity comparison.
pub const CAPACITY_EPSILON: f64 = 1e-9;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrowed identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Identifier of a capacity-bearing resource (topology edge).
    ResourceId
);
string_id!(
    /// Identifier of an endpoint (topology node).
    EndpointId
);

/// Substrate a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Optical channel / wavelength.
    Optical,
    /// Electronic packet link or switch port.
    Electronic,
    /// GPU-fabric interconnect port.
    Compute,
}

impl Domain {
    /// Label for logs and config.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Optical => "optical",
            Self::Electronic => "electronic",
            Self::Compute => "compute",
        }
    }
}

/// Operational status as last reported by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Fully operational.
    Up,
    /// Carrying traffic with reduced quality or capacity.
    Degraded,
    /// Not carrying traffic.
    Down,
}

impl ResourceStatus {
    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

/// Registration request for a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Unique identifier.
    pub id: ResourceId,
    /// Substrate domain.
    pub domain: Domain,
    /// First endpoint.
    pub a: EndpointId,
    /// Second endpoint.
    pub b: EndpointId,
    /// Total capacity in Gbps.
    pub capacity_gbps: f64,
    /// Nominal one-way latency in milliseconds.
    pub latency_ms: f64,
    /// Free-form tags used by isolation and dedication rules.
    #[serde(default)]
    pub tags: IndexMap<String, String>,
}

impl ResourceSpec {
    /// Creates a spec without tags.
    #[must_use]
    pub fn new(
        id: impl Into<ResourceId>,
        domain: Domain,
        a: impl Into<EndpointId>,
        b: impl Into<EndpointId>,
        capacity_gbps: f64,
        latency_ms: f64,
    ) -> Self {
        Self {
            id: id.into(),
            domain,
            a: a.into(),
            b: b.into(),
            capacity_gbps,
            latency_ms,
            tags: IndexMap::new(),
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A typed unit of capacity: an edge of the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Identifier.
    pub id: ResourceId,
    /// Substrate domain.
    pub domain: Domain,
    /// Endpoints joined by this resource (undirected).
    pub endpoints: (EndpointId, EndpointId),
    /// Installed capacity in Gbps.
    pub total_capacity: f64,
    /// Capacity currently claimed by allocations.
    pub committed_capacity: f64,
    /// Usable capacity as last reported by telemetry (never above total).
    pub reported_capacity: f64,
    /// Latency in milliseconds (nominal until telemetry reports otherwise).
    pub latency_ms: f64,
    /// Packet loss ratio as last reported (0..1).
    pub loss: f64,
    /// Operational status.
    pub status: ResourceStatus,
    /// Timestamp of the most recent telemetry applied.
    pub observed_at: Option<DateTime<Utc>>,
    /// Tags copied from the spec.
    pub tags: IndexMap<String, String>,
}

impl Resource {
    /// Validates a spec and builds a fresh, uncommitted resource.
    pub fn from_spec(spec: ResourceSpec) -> Result<Self, ResourceError> {
        let invalid = |reason: &str| ResourceError::InvalidResource {
            resource: spec.id.clone(),
            reason: reason.into(),
        };
        if !spec.capacity_gbps.is_finite() || spec.capacity_gbps <= 0.0 {
            return Err(invalid("capacity must be positive"));
        }
        if !spec.latency_ms.is_finite() || spec.latency_ms < 0.0 {
            return Err(invalid("latency must be non-negative"));
        }
        if spec.a == spec.b {
            return Err(invalid("endpoints must differ"));
        }
        Ok(Self {
            id: spec.id,
            domain: spec.domain,
            endpoints: (spec.a, spec.b),
            total_capacity: spec.capacity_gbps,
            committed_capacity: 0.0,
            reported_capacity: spec.capacity_gbps,
            latency_ms: spec.latency_ms,
            loss: 0.0,
            status: ResourceStatus::Up,
            observed_at: None,
            tags: spec.tags,
        })
    }

    /// Capacity the resource can carry right now.
    #[must_use]
    pub fn usable_capacity(&self) -> f64 {
        if self.status == ResourceStatus::Down {
            0.0
        } else {
            self.reported_capacity.min(self.total_capacity)
        }
    }

    /// Uncommitted usable capacity.
    #[must_use]
    pub fn available(&self) -> f64 {
        (self.usable_capacity() - self.committed_capacity).max(0.0)
    }

    /// Committed share of total capacity.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.committed_capacity / self.total_capacity
    }

    /// Whether the resource terminates at `endpoint`.
    #[must_use]
    pub fn touches(&self, endpoint: &EndpointId) -> bool {
        &self.endpoints.0 == endpoint || &self.endpoints.1 == endpoint
    }

    /// The endpoint opposite `endpoint`, if the resource touches it.
    #[must_use]
    pub fn far_end(&self, endpoint: &EndpointId) -> Option<&EndpointId> {
        if &self.endpoints.0 == endpoint {
            Some(&self.endpoints.1)
        } else if &self.endpoints.1 == endpoint {
            Some(&self.endpoints.0)
        } else {
            None
        }
    }

    /// Tag lookup.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Resource-model integrity errors. Never clamped, always surfaced.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ResourceError {
    /// No resource with this id.
    #[error("unknown resource `{0}`")]
    UnknownResource(ResourceId),
    /// A resource with this id is already registered.
    #[error("resource `{0}` is already registered")]
    DuplicateResource(ResourceId),
    /// Commit would push committed capacity above total capacity.
    #[error("commit of {requested} Gbps on `{resource}` exceeds capacity ({committed} of {total} committed)")]
    CapacityExceeded {
        /// Resource involved.
        resource: ResourceId,
        /// Amount requested.
        requested: f64,
        /// Commitment before the request.
        committed: f64,
        /// Total capacity.
        total: f64,
    },
    /// Release larger than the current commitment.
    #[error("release of {requested} Gbps on `{resource}` exceeds commitment of {committed}")]
    OverRelease {
        /// Resource involved.
        resource: ResourceId,
        /// Amount requested.
        requested: f64,
        /// Commitment before the request.
        committed: f64,
    },
    /// Negative, NaN, or infinite amount.
    #[error("invalid amount {amount} for `{resource}`")]
    InvalidAmount {
        /// Resource involved.
        resource: ResourceId,
        /// Offending amount.
        amount: f64,
    },
    /// Spec failed validation.
    #[error("invalid resource `{resource}`: {reason}")]
    InvalidResource {
        /// Resource involved.
        resource: ResourceId,
        /// Reason.
        reason: String,
    },
}

impl ResourceError {
    /// Whether the error is ordinary contention with a concurrent committer.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Resource the error refers to.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        match self {
            Self::UnknownResource(id) | Self::DuplicateResource(id) => id,
            Self::CapacityExceeded { resource, .. }
            | Self::OverRelease { resource, .. }
            | Self::InvalidAmount { resource, .. }
            | Self::InvalidResource { resource, .. } => resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation_rejects_bad_input() {
        let err = Resource::from_spec(ResourceSpec::new("x", Domain::Optical, "A", "A", 10.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidResource { .. }));
        assert!(
            Resource::from_spec(ResourceSpec::new("y", Domain::Optical, "A", "B", 0.0, 1.0))
                .is_err()
        );
    }

    #[test]
    fn down_resource_has_no_available_capacity() {
        let mut resource =
            Resource::from_spec(ResourceSpec::new("ab", Domain::Electronic, "A", "B", 10.0, 2.0))
                .unwrap();
        assert!((resource.available() - 10.0).abs() < CAPACITY_EPSILON);
        resource.status = ResourceStatus::Down;
        assert!(resource.available().abs() < CAPACITY_EPSILON);
        assert_eq!(resource.far_end(&"A".into()), Some(&EndpointId::new("B")));
    }
}

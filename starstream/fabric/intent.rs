use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::resource::EndpointId;

/// Unique intent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(Uuid);

impl IntentId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent-{}", self.0)
    }
}

/// Intent priority. Higher values are more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Default for Priority {
    fn default() -> Self {
        Self(3)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Interval during which an intent must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// Start of the window.
    pub not_before: DateTime<Utc>,
    /// End of the window; `None` means open-ended.
    pub not_after: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    /// Open-ended window starting now.
    #[must_use]
    pub fn always() -> Self {
        Self {
            not_before: Utc::now(),
            not_after: None,
        }
    }

    /// Window starting now and lasting `duration`.
    #[must_use]
    pub fn for_duration(duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            not_before: now,
            not_after: Some(now + duration),
        }
    }

    /// Whether `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.not_before && !self.expired(at)
    }

    /// Whether the window closed before `at`.
    #[must_use]
    pub fn expired(&self, at: DateTime<Utc>) -> bool {
        self.not_after.is_some_and(|end| at >= end)
    }
}

/// Declarative connectivity request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Identifier.
    pub id: IntentId,
    /// Source endpoint.
    pub source: EndpointId,
    /// Destination endpoint.
    pub destination: EndpointId,
    /// Minimum bandwidth in Gbps.
    pub min_bandwidth_gbps: f64,
    /// Maximum end-to-end latency in milliseconds.
    pub max_latency_ms: Option<f64>,
    /// Priority class.
    pub priority: Priority,
    /// Validity window.
    pub validity: ValidityWindow,
    /// Intent replaced by this one once it converges.
    pub supersedes: Option<IntentId>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl Intent {
    /// Bandwidth intent with default priority and an open-ended window.
    #[must_use]
    pub fn bandwidth(
        source: impl Into<EndpointId>,
        destination: impl Into<EndpointId>,
        min_bandwidth_gbps: f64,
    ) -> Self {
        Self {
            id: IntentId::new(),
            source: source.into(),
            destination: destination.into(),
            min_bandwidth_gbps,
            max_latency_ms: None,
            priority: Priority::default(),
            validity: ValidityWindow::always(),
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    /// Sets a latency bound.
    #[must_use]
    pub const fn with_max_latency(mut self, max_latency_ms: f64) -> Self {
        self.max_latency_ms = Some(max_latency_ms);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Priority(priority);
        self
    }

    /// Limits the intent to `duration` from now.
    #[must_use]
    pub fn valid_for(mut self, duration: Duration) -> Self {
        self.validity = ValidityWindow::for_duration(duration);
        self
    }

    /// Sets an explicit validity window.
    #[must_use]
    pub const fn with_validity(mut self, validity: ValidityWindow) -> Self {
        self.validity = validity;
        self
    }

    /// Marks this intent as the replacement of `previous`.
    #[must_use]
    pub const fn superseding(mut self, previous: IntentId) -> Self {
        self.supersedes = Some(previous);
        self
    }

    /// Checks structural validity.
    pub fn validate(&self) -> Result<(), IntentError> {
        if !self.min_bandwidth_gbps.is_finite() || self.min_bandwidth_gbps <= 0.0 {
            return Err(IntentError::InvalidBandwidth(self.min_bandwidth_gbps));
        }
        if let Some(latency) = self.max_latency_ms {
            if !latency.is_finite() || latency <= 0.0 {
                return Err(IntentError::InvalidLatency(latency));
            }
        }
        if self.source == self.destination {
            return Err(IntentError::SameEndpoints(self.source.clone()));
        }
        if let Some(end) = self.validity.not_after {
            if end <= self.validity.not_before {
                return Err(IntentError::EmptyValidity);
            }
        }
        Ok(())
    }
}

/// Structural intent errors.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum IntentError {
    /// Bandwidth must be positive.
    #[error("minimum bandwidth must be positive, got {0}")]
    InvalidBandwidth(f64),
    /// Latency bound must be positive.
    #[error("latency bound must be positive, got {0}")]
    InvalidLatency(f64),
    /// Source equals destination.
    #[error("source and destination are both `{0}`")]
    SameEndpoints(EndpointId),
    /// Window closes before it opens.
    #[error("validity window is empty")]
    EmptyValidity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_catches_bad_intents() {
        assert!(Intent::bandwidth("A", "B", 10.0).validate().is_ok());
        assert_eq!(
            Intent::bandwidth("A", "B", 0.0).validate(),
            Err(IntentError::InvalidBandwidth(0.0))
        );
        assert!(matches!(
            Intent::bandwidth("A", "A", 1.0).validate(),
            Err(IntentError::SameEndpoints(_))
        ));
        assert!(Intent::bandwidth("A", "B", 1.0)
            .with_max_latency(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn validity_window_bounds() {
        let window = ValidityWindow::for_duration(Duration::seconds(5));
        assert!(window.contains(window.not_before));
        assert!(!window.expired(window.not_before));
        assert!(window.expired(window.not_before + Duration::seconds(5)));
        assert!(!ValidityWindow::always().expired(Utc::now() + Duration::days(365)));
    }
}

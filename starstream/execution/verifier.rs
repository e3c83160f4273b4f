use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use starstream_fabric::{
    Allocation, FabricTelemetry, Intent, ResourceId, ResourceStatus, TelemetrySample,
};

/// Verification thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Relative band around an intent threshold reported as `Degraded`
    /// rather than `Violated`.
    pub tolerance: f64,
    /// Per-hop loss ceiling; unchecked when absent.
    pub max_loss: Option<f64>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.05,
            max_loss: None,
        }
    }
}

/// Intent threshold an observation broke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "constraint", rename_all = "snake_case")]
pub enum ViolatedConstraint {
    /// Achieved bandwidth below the tolerance band.
    Bandwidth {
        /// Bottleneck bandwidth observed.
        achieved: f64,
        /// Intent minimum.
        required: f64,
    },
    /// Observed latency above the tolerance band.
    Latency {
        /// End-to-end latency observed, transitions included.
        observed: f64,
        /// Intent maximum.
        max: f64,
    },
    /// A hop reports more loss than allowed.
    Loss {
        /// Offending resource.
        resource: ResourceId,
        /// Reported loss ratio.
        loss: f64,
        /// Ceiling.
        max: f64,
    },
    /// A hop reported nothing.
    MissingTelemetry {
        /// Silent resource.
        resource: ResourceId,
    },
}

impl ViolatedConstraint {
    /// Label for logs and cycle records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Bandwidth { .. } => "bandwidth",
            Self::Latency { .. } => "latency",
            Self::Loss { .. } => "loss",
            Self::MissingTelemetry { .. } => "missing_telemetry",
        }
    }
}

impl fmt::Display for ViolatedConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bandwidth { achieved, required } => {
                write!(f, "bandwidth {achieved:.3} Gbps below required {required:.3}")
            }
            Self::Latency { observed, max } => {
                write!(f, "latency {observed:.3} ms above max {max:.3}")
            }
            Self::Loss {
                resource,
                loss,
                max,
            } => write!(f, "loss {loss:.4} on `{resource}` above {max:.4}"),
            Self::MissingTelemetry { resource } => write!(f, "no telemetry for `{resource}`"),
        }
    }
}

/// Verification verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Every threshold met.
    Satisfied,
    /// Within the tolerance band but short of a threshold.
    Degraded {
        /// Largest relative shortfall across checked thresholds.
        margin: f64,
    },
    /// A threshold broken beyond tolerance.
    Violated(ViolatedConstraint),
}

impl Outcome {
    /// Whether the intent counts as converged.
    #[must_use]
    pub const fn is_acceptable(&self) -> bool {
        !matches!(self, Self::Violated(_))
    }

    /// Label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::Degraded { .. } => "degraded",
            Self::Violated(_) => "violated",
        }
    }
}

/// Compares observed telemetry against the intent an allocation serves.
///
/// Thresholds come from the intent, not the plan's prediction, so a correctly
/// executed plan over a stale model still fails verification.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    config: VerifierConfig,
    telemetry: Option<FabricTelemetry>,
}

impl Verifier {
    /// Verifier with explicit thresholds.
    #[must_use]
    pub const fn new(config: VerifierConfig) -> Self {
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

    /// Active thresholds.
    #[must_use]
    pub const fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Classifies the observed state of `allocation` as if it were the only
    /// tenant of its hops.
    #[must_use]
    pub fn verify(
        &self,
        allocation: &Allocation,
        samples: &[TelemetrySample],
        intent: &Intent,
    ) -> Outcome {
        self.verify_under_load(allocation, samples, intent, &IndexMap::new())
    }

    /// Classifies the observed state of `allocation` given the total
    /// bandwidth committed on each hop by every tenant.
    ///
    /// The latest sample per hop is used. Checks run in order: telemetry
    /// coverage, loss ceiling, bandwidth, latency. When a hop carries more
    /// commitment than it reports, each tenant gets a proportional share of
    /// what is left; a down hop carries nothing. Hops absent from `committed`
    /// count only this allocation.
    #[must_use]
    pub fn verify_under_load(
        &self,
        allocation: &Allocation,
        samples: &[TelemetrySample],
        intent: &Intent,
        committed: &IndexMap<ResourceId, f64>,
    ) -> Outcome {
        let outcome = self.classify(allocation, samples, intent, committed);
        if let Some(tel) = &self.telemetry {
            let level = match outcome {
                Outcome::Violated(_) => LogLevel::Warn,
                _ => LogLevel::Debug,
            };
            let _ = tel.log(
                level,
                "execution.verify.outcome",
                json!({
                    "allocation": allocation.id.to_string(),
                    "intent": intent.id.to_string(),
                    "outcome": outcome,
                }),
            );
        }
        outcome
    }

    fn classify(
        &self,
        allocation: &Allocation,
        samples: &[TelemetrySample],
        intent: &Intent,
        committed: &IndexMap<ResourceId, f64>,
    ) -> Outcome {
        let mut latest: IndexMap<&ResourceId, &TelemetrySample> = IndexMap::new();
        for sample in samples {
            match latest.get(&sample.resource_id) {
                Some(seen) if seen.timestamp > sample.timestamp => {}
                _ => {
                    latest.insert(&sample.resource_id, sample);
                }
            }
        }

        let mut achieved = allocation.bandwidth_gbps;
        let mut observed_latency = allocation.transition_latency_ms;
        for hop in &allocation.hops {
            let Some(sample) = latest.get(&hop.resource) else {
                return Outcome::Violated(ViolatedConstraint::MissingTelemetry {
                    resource: hop.resource.clone(),
                });
            };
            if let (Some(max), Some(loss)) = (self.config.max_loss, sample.loss) {
                if loss > max {
                    return Outcome::Violated(ViolatedConstraint::Loss {
                        resource: hop.resource.clone(),
                        loss,
                        max,
                    });
                }
            }
            let own = allocation.bandwidth_gbps;
            let load = committed.get(&hop.resource).copied().unwrap_or(own).max(own);
            let usable = sample.available_capacity.max(0.0);
            let carried = if sample.status == ResourceStatus::Down {
                0.0
            } else if load > usable {
                own * usable / load
            } else {
                own
            };
            achieved = achieved.min(carried);
            observed_latency += sample.latency_ms.unwrap_or(hop.latency_ms);
        }

        let tolerance = self.config.tolerance.max(0.0);
        let mut margin: f64 = 0.0;

        let required = intent.min_bandwidth_gbps;
        if achieved < required {
            let shortfall = (required - achieved) / required;
            if shortfall > tolerance {
                return Outcome::Violated(ViolatedConstraint::Bandwidth { achieved, required });
            }
            margin = margin.max(shortfall);
        }

        if let Some(max) = intent.max_latency_ms {
            if observed_latency > max {
                let excess = if max > 0.0 {
                    (observed_latency - max) / max
                } else {
                    f64::INFINITY
                };
                if excess > tolerance {
                    return Outcome::Violated(ViolatedConstraint::Latency {
                        observed: observed_latency,
                        max,
                    });
                }
                margin = margin.max(excess);
            }
        }

        if margin > 0.0 {
            Outcome::Degraded { margin }
        } else {
            Outcome::Satisfied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use starstream_fabric::{Domain, Hop, IntentId, Priority};

    fn allocation(bandwidth: f64) -> Allocation {
        let hop = |id: &str, from: &str, to: &str| Hop {
            resource: id.into(),
            from: from.into(),
            to: to.into(),
            domain: Domain::Optical,
            latency_ms: 2.0,
        };
        Allocation::propose(
            IntentId::new(),
            Priority::default(),
            vec![hop("a-b", "A", "B"), hop("b-c", "B", "C")],
            bandwidth,
            4.0,
            0.0,
        )
    }

    fn healthy(id: &str) -> TelemetrySample {
        TelemetrySample::new(id, ResourceStatus::Up, 100.0).with_latency(2.0)
    }

    #[test]
    fn satisfied_when_thresholds_met() {
        let intent = Intent::bandwidth("A", "C", 10.0).with_max_latency(5.0);
        let outcome = Verifier::default().verify(
            &allocation(10.0),
            &[healthy("a-b"), healthy("b-c")],
            &intent,
        );
        assert_eq!(outcome, Outcome::Satisfied);
    }

    #[test]
    fn degraded_hop_below_need_is_violated() {
        let intent = Intent::bandwidth("A", "C", 10.0);
        let samples = [
            TelemetrySample::new("a-b", ResourceStatus::Degraded, 4.0),
            healthy("b-c"),
        ];
        let outcome = Verifier::default().verify(&allocation(10.0), &samples, &intent);
        assert_eq!(
            outcome,
            Outcome::Violated(ViolatedConstraint::Bandwidth {
                achieved: 4.0,
                required: 10.0
            })
        );
    }

    #[test]
    fn small_shortfall_is_degraded() {
        let intent = Intent::bandwidth("A", "C", 10.0);
        let samples = [
            TelemetrySample::new("a-b", ResourceStatus::Degraded, 9.8),
            healthy("b-c"),
        ];
        let Outcome::Degraded { margin } =
            Verifier::default().verify(&allocation(10.0), &samples, &intent)
        else {
            panic!("expected degraded");
        };
        assert!((margin - 0.02).abs() < 1e-9);
    }

    #[test]
    fn latency_checked_against_intent_not_plan() {
        let intent = Intent::bandwidth("A", "C", 1.0).with_max_latency(5.0);
        let samples = [healthy("a-b"), healthy("b-c").with_latency(4.0)];
        let outcome = Verifier::default().verify(&allocation(1.0), &samples, &intent);
        assert_eq!(outcome.label(), "violated");
        assert!(matches!(
            outcome,
            Outcome::Violated(ViolatedConstraint::Latency { observed, .. }) if (observed - 6.0).abs() < 1e-9
        ));
    }

    #[test]
    fn missing_hop_and_down_hop() {
        let intent = Intent::bandwidth("A", "C", 1.0);
        let verifier = Verifier::default();
        assert!(matches!(
            verifier.verify(&allocation(1.0), &[healthy("a-b")], &intent),
            Outcome::Violated(ViolatedConstraint::MissingTelemetry { .. })
        ));
        let down = [healthy("a-b"), TelemetrySample::new("b-c", ResourceStatus::Down, 0.0)];
        assert!(!verifier.verify(&allocation(1.0), &down, &intent).is_acceptable());
    }

    #[test]
    fn latest_sample_per_hop_wins() {
        let intent = Intent::bandwidth("A", "C", 10.0);
        let now = Utc::now();
        let samples = [
            TelemetrySample::new("a-b", ResourceStatus::Down, 0.0).at(now - Duration::seconds(5)),
            healthy("a-b").at(now),
            healthy("b-c"),
        ];
        assert_eq!(
            Verifier::default().verify(&allocation(10.0), &samples, &intent),
            Outcome::Satisfied
        );
    }

    #[test]
    fn shared_hop_splits_what_is_left() {
        let intent = Intent::bandwidth("A", "C", 3.0);
        let samples = [
            TelemetrySample::new("a-b", ResourceStatus::Degraded, 7.0),
            healthy("b-c"),
        ];
        let verifier = Verifier::default();
        assert_eq!(verifier.verify(&allocation(3.0), &samples, &intent), Outcome::Satisfied);

        // Another tenant holds 6 of the 9 committed on the degraded hop.
        let committed = IndexMap::from([(ResourceId::from("a-b"), 9.0)]);
        let outcome = verifier.verify_under_load(&allocation(3.0), &samples, &intent, &committed);
        let Outcome::Violated(ViolatedConstraint::Bandwidth { achieved, required }) = outcome else {
            panic!("expected a bandwidth violation, got {outcome:?}");
        };
        assert!((achieved - 3.0 * 7.0 / 9.0).abs() < 1e-9);
        assert!((required - 3.0).abs() < 1e-9);

        // Commitment the hop can still carry leaves the share intact.
        let light = IndexMap::from([(ResourceId::from("a-b"), 6.0)]);
        assert_eq!(
            verifier.verify_under_load(&allocation(3.0), &samples, &intent, &light),
            Outcome::Satisfied
        );
    }

    #[test]
    fn loss_ceiling_is_optional() {
        let intent = Intent::bandwidth("A", "C", 1.0);
        let samples = [healthy("a-b").with_loss(0.05), healthy("b-c")];
        assert_eq!(
            Verifier::default().verify(&allocation(1.0), &samples, &intent),
            Outcome::Satisfied
        );
        let strict = Verifier::new(VerifierConfig {
            max_loss: Some(0.02),
            ..VerifierConfig::default()
        });
        assert!(matches!(
            strict.verify(&allocation(1.0), &samples, &intent),
            Outcome::Violated(ViolatedConstraint::Loss { .. })
        ));
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    model::ResourceModel,
    resource::{ResourceError, ResourceId, ResourceStatus},
    telemetry::FabricTelemetry,
};

/// One observation of a resource reported by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Resource observed.
    pub resource_id: ResourceId,
    /// Reported status.
    pub status: ResourceStatus,
    /// Usable capacity in Gbps.
    pub available_capacity: f64,
    /// Measured latency, if reported.
    pub latency_ms: Option<f64>,
    /// Measured loss ratio, if reported.
    pub loss: Option<f64>,
    /// Observation time at the source.
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Sample stamped now.
    #[must_use]
    pub fn new(
        resource_id: impl Into<ResourceId>,
        status: ResourceStatus,
        available_capacity: f64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            status,
            available_capacity,
            latency_ms: None,
            loss: None,
            timestamp: Utc::now(),
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a latency measurement.
    #[must_use]
    pub const fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Adds a loss measurement.
    #[must_use]
    pub const fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }
}

/// Result of applying one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The model changed.
    Applied,
    /// The model already held these values.
    Unchanged,
    /// Older than the last applied sample; discarded.
    Stale,
}

/// Tally of a batch ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// Samples that changed the model.
    pub applied: usize,
    /// Samples that matched the model.
    pub unchanged: usize,
    /// Samples discarded as out of order.
    pub stale: usize,
    /// Samples rejected with the reason.
    pub rejected: Vec<(ResourceId, ResourceError)>,
}

impl IngestSummary {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Applied => self.applied += 1,
            IngestOutcome::Unchanged => self.unchanged += 1,
            IngestOutcome::Stale => self.stale += 1,
        }
    }
}

/// Sole writer of operational state into the resource model.
///
/// Committed capacity is never touched here; only status, usable capacity,
/// latency, and loss.
#[derive(Debug, Clone)]
pub struct TelemetryIngest {
    model: Arc<ResourceModel>,
    telemetry: Option<FabricTelemetry>,
}

impl TelemetryIngest {
    /// Ingest bound to a model.
    #[must_use]
    pub const fn new(model: Arc<ResourceModel>) -> Self {
        Self {
            model,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Applies one sample. Unknown resources and invalid values are rejected.
    pub fn ingest(&self, sample: &TelemetrySample) -> Result<IngestOutcome, ResourceError> {
        match self.model.observe(sample) {
            Ok(outcome) => {
                if outcome == IngestOutcome::Applied {
                    self.log(
                        LogLevel::Debug,
                        "fabric.ingest.applied",
                        json!({
                            "resource": sample.resource_id,
                            "status": sample.status.label(),
                            "available": sample.available_capacity
                        }),
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "fabric.ingest.rejected",
                    json!({ "resource": sample.resource_id, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Applies a batch, continuing past rejected samples.
    pub fn ingest_batch<'a>(
        &self,
        samples: impl IntoIterator<Item = &'a TelemetrySample>,
    ) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for sample in samples {
            match self.ingest(sample) {
                Ok(outcome) => summary.record(outcome),
                Err(err) => summary.rejected.push((sample.resource_id.clone(), err)),
            }
        }
        summary
    }

    /// Model this ingest writes to.
    #[must_use]
    pub fn model(&self) -> &Arc<ResourceModel> {
        &self.model
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Domain, ResourceSpec, CAPACITY_EPSILON};
    use chrono::Duration;

    fn setup() -> TelemetryIngest {
        let model = Arc::new(ResourceModel::new());
        model
            .register(ResourceSpec::new("ab", Domain::Optical, "A", "B", 100.0, 2.0))
            .unwrap();
        TelemetryIngest::new(model)
    }

    #[test]
    fn stale_samples_are_discarded() {
        let ingest = setup();
        let now = Utc::now();
        let fresh = TelemetrySample::new("ab", ResourceStatus::Degraded, 40.0).at(now);
        let old = TelemetrySample::new("ab", ResourceStatus::Up, 100.0).at(now - Duration::seconds(1));
        assert_eq!(ingest.ingest(&fresh).unwrap(), IngestOutcome::Applied);
        assert_eq!(ingest.ingest(&old).unwrap(), IngestOutcome::Stale);
        let resource = ingest.model().get(&"ab".into()).unwrap();
        assert_eq!(resource.status, ResourceStatus::Degraded);
        assert!((resource.reported_capacity - 40.0).abs() < CAPACITY_EPSILON);
    }

    #[test]
    fn repeated_sample_is_unchanged() {
        let ingest = setup();
        let sample = TelemetrySample::new("ab", ResourceStatus::Up, 80.0).with_loss(0.01);
        assert_eq!(ingest.ingest(&sample).unwrap(), IngestOutcome::Applied);
        assert_eq!(ingest.ingest(&sample).unwrap(), IngestOutcome::Unchanged);
    }

    #[test]
    fn ingest_never_touches_commitments() {
        let ingest = setup();
        ingest.model().commit(&"ab".into(), 30.0).unwrap();
        ingest
            .ingest(&TelemetrySample::new("ab", ResourceStatus::Down, 0.0))
            .unwrap();
        let resource = ingest.model().get(&"ab".into()).unwrap();
        assert!((resource.committed_capacity - 30.0).abs() < CAPACITY_EPSILON);
        assert!(resource.available().abs() < CAPACITY_EPSILON);
    }

    #[test]
    fn batch_collects_rejections() {
        let ingest = setup();
        let samples = vec![
            TelemetrySample::new("ab", ResourceStatus::Up, 90.0),
            TelemetrySample::new("zz", ResourceStatus::Up, 10.0),
            TelemetrySample::new("ab", ResourceStatus::Up, -5.0),
        ];
        let summary = ingest.ingest_batch(&samples);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.rejected.len(), 2);
        assert!(matches!(summary.rejected[0].1, ResourceError::UnknownResource(_)));
    }
}

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use starstream_fabric::{FabricTelemetry, IntentId};

use crate::state::IntentState;

/// Step of the control loop a record was written at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Intent accepted.
    Submit,
    /// Planner call.
    Plan,
    /// Policy evaluation.
    Evaluate,
    /// Eviction of lower-priority allocations.
    Preempt,
    /// Capacity commitment on the shared model.
    Commit,
    /// Executor dispatch.
    Execute,
    /// Telemetry ingest and verification.
    Verify,
    /// Backoff before another cycle.
    Retry,
    /// Allocation torn down.
    Teardown,
    /// Cancellation.
    Withdraw,
}

impl Stage {
    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Plan => "plan",
            Self::Evaluate => "evaluate",
            Self::Preempt => "preempt",
            Self::Commit => "commit",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Retry => "retry",
            Self::Teardown => "teardown",
            Self::Withdraw => "withdraw",
        }
    }
}

/// One entry of the cycle log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Position in the log, starting at zero.
    pub sequence: u64,
    /// Intent the record belongs to.
    pub intent_id: IntentId,
    /// Cycle number within the intent, starting at one. Zero for records
    /// written outside a cycle.
    pub cycle: u32,
    /// Stage.
    pub stage: Stage,
    /// Intent state after the stage.
    pub state: IntentState,
    /// Short decision label (`approved`, `infeasible:latency`, ...).
    pub decision: String,
    /// Structured diagnostics.
    #[serde(default)]
    pub detail: Value,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of control-loop iterations.
///
/// Only the orchestrator appends; everyone else gets copies.
#[derive(Debug, Default)]
pub struct CycleLog {
    records: RwLock<Vec<CycleRecord>>,
    telemetry: Option<FabricTelemetry>,
}

impl CycleLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a `control.cycle.transition` event per record.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: FabricTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub(crate) fn append(
        &self,
        intent_id: IntentId,
        cycle: u32,
        stage: Stage,
        state: IntentState,
        decision: impl Into<String>,
        detail: Value,
    ) -> CycleRecord {
        let record = {
            let mut records = self.records.write();
            let record = CycleRecord {
                sequence: records.len() as u64,
                intent_id,
                cycle,
                stage,
                state,
                decision: decision.into(),
                detail,
                timestamp: Utc::now(),
            };
            records.push(record.clone());
            record
        };
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                "control.cycle.transition",
                json!({
                    "intent": record.intent_id.to_string(),
                    "cycle": record.cycle,
                    "stage": record.stage.label(),
                    "state": record.state.label(),
                    "decision": record.decision,
                }),
            );
        }
        record
    }

    /// Copy of every record in append order.
    #[must_use]
    pub fn records(&self) -> Vec<CycleRecord> {
        self.records.read().clone()
    }

    /// Records of one intent in append order.
    #[must_use]
    pub fn for_intent(&self, intent: IntentId) -> Vec<CycleRecord> {
        self.records
            .read()
            .iter()
            .filter(|record| record.intent_id == intent)
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing was logged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Writes every record as one JSON object per line, replacing `path`.
    pub fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening cycle export {}", path.display()))?;
        let records = self.records();
        for record in &records {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn sequences_are_dense_and_ordered() {
        let log = CycleLog::new();
        let a = IntentId::new();
        let b = IntentId::new();
        log.append(a, 1, Stage::Plan, IntentState::Planned, "found", Value::Null);
        log.append(b, 1, Stage::Plan, IntentState::Retrying, "infeasible:latency", Value::Null);
        log.append(a, 1, Stage::Evaluate, IntentState::Approved, "approved", Value::Null);
        let sequences: Vec<u64> = log.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(log.for_intent(a).len(), 2);
        assert_eq!(log.for_intent(b)[0].decision, "infeasible:latency");
    }

    #[test]
    fn exports_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles/export.jsonl");
        let log = CycleLog::new();
        let intent = IntentId::new();
        log.append(
            intent,
            1,
            Stage::Submit,
            IntentState::Pending,
            "accepted",
            json!({ "bandwidth_gbps": 5.0 }),
        );
        log.append(intent, 1, Stage::Plan, IntentState::Planned, "found", Value::Null);
        assert_eq!(log.export_jsonl(&path).unwrap(), 2);
        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<CycleRecord> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, log.records());
    }

    #[tokio::test]
    async fn publishes_transitions() {
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = FabricTelemetry::builder("control")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let log = CycleLog::new().with_telemetry(telemetry);
        log.append(IntentId::new(), 1, Stage::Plan, IntentState::Planned, "found", Value::Null);
        for _ in 0..20 {
            if !bus.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(bus.events_of("control.cycle.transition").len(), 1);
    }
}

use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use starstream_execution::{AdapterKind, VerifierConfig};
use starstream_planning::PlannerConfig;

use crate::retry::RetryPolicy;

/// Per-stage time limits in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    /// Planner call.
    pub plan_ms: u64,
    /// Policy evaluation.
    pub evaluate_ms: u64,
    /// Executor dispatch, including the adapter's own rollback.
    pub execute_ms: u64,
    /// Fresh telemetry collection before verification.
    pub verify_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            plan_ms: 1_000,
            evaluate_ms: 1_000,
            execute_ms: 5_000,
            verify_ms: 2_000,
        }
    }
}

impl StageTimeouts {
    /// Planning limit.
    #[must_use]
    pub const fn plan(&self) -> Duration {
        Duration::from_millis(self.plan_ms)
    }

    /// Evaluation limit.
    #[must_use]
    pub const fn evaluate(&self) -> Duration {
        Duration::from_millis(self.evaluate_ms)
    }

    /// Execution limit.
    #[must_use]
    pub const fn execute(&self) -> Duration {
        Duration::from_millis(self.execute_ms)
    }

    /// Verification limit.
    #[must_use]
    pub const fn verify(&self) -> Duration {
        Duration::from_millis(self.verify_ms)
    }
}

/// Control-loop configuration.
///
/// ```toml
/// adapter = "simulation"
///
/// [retry]
/// max_retries = 3
/// base_delay_ms = 100
/// max_delay_ms = 5000
/// strategy = "exponential"
///
/// [timeouts]
/// execute_ms = 5000
///
/// [verifier]
/// tolerance = 0.05
/// max_loss = 0.02
///
/// [planner]
/// latency_weight = 1.0
/// capacity_weight = 10.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Adapter the orchestrator dispatches to.
    pub adapter: AdapterKind,
    /// Retry budget and backoff.
    pub retry: RetryPolicy,
    /// Stage time limits.
    pub timeouts: StageTimeouts,
    /// Verification thresholds.
    pub verifier: VerifierConfig,
    /// Planner tuning.
    pub planner: PlannerConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Simulation,
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            verifier: VerifierConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading control config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            bail!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms,
                self.retry.base_delay_ms
            );
        }
        let timeouts = [
            ("plan_ms", self.timeouts.plan_ms),
            ("evaluate_ms", self.timeouts.evaluate_ms),
            ("execute_ms", self.timeouts.execute_ms),
            ("verify_ms", self.timeouts.verify_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            bail!("timeouts.{name} must be positive");
        }
        if !(0.0..1.0).contains(&self.verifier.tolerance) {
            bail!(
                "verifier.tolerance must be in [0, 1), got {}",
                self.verifier.tolerance
            );
        }
        if let Some(max_loss) = self.verifier.max_loss {
            if !(0.0..=1.0).contains(&max_loss) {
                bail!("verifier.max_loss must be in [0, 1], got {max_loss}");
            }
        }
        if self.planner.latency_weight < 0.0 || self.planner.capacity_weight < 0.0 {
            bail!("planner weights must be non-negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;

    #[test]
    fn empty_document_uses_defaults() {
        assert_eq!(ControlConfig::from_toml_str("").unwrap(), ControlConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = ControlConfig::from_toml_str(
            r#"
[retry]
max_retries = 5
strategy = "linear"

[timeouts]
execute_ms = 250

[verifier]
max_loss = 0.02

[planner]
capacity_weight = 0.0
"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.timeouts.execute(), Duration::from_millis(250));
        assert_eq!(config.timeouts.plan_ms, 1_000);
        assert_eq!(config.verifier.max_loss, Some(0.02));
        assert!((config.verifier.tolerance - 0.05).abs() < 1e-12);
        assert!(config.planner.capacity_weight.abs() < 1e-12);
        assert_eq!(config.adapter, AdapterKind::Simulation);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for raw in [
            "[retry]\nbase_delay_ms = 900\nmax_delay_ms = 100\n",
            "[timeouts]\nverify_ms = 0\n",
            "[verifier]\ntolerance = 1.5\n",
            "adapter = \"carrier-pigeon\"\n",
        ] {
            assert!(ControlConfig::from_toml_str(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.toml");
        fs::write(&path, "adapter = \"hardware-reserved\"\n").unwrap();
        let config = ControlConfig::load(&path).unwrap();
        assert_eq!(config.adapter, AdapterKind::HardwareReserved);
        assert!(ControlConfig::load(dir.path().join("absent.toml")).is_err());
    }
}

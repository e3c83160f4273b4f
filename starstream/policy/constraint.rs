use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use starstream_fabric::{Domain, Priority, Resource};

/// Order in which equal-priority victims are evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Earliest activation first.
    #[default]
    OldestFirst,
    /// Latest activation first.
    NewestFirst,
}

/// One policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Committed share of a resource may not exceed `max_utilization`.
    CapacityCeiling {
        /// Ceiling as a fraction of total capacity.
        #[serde(default = "default_max_utilization")]
        max_utilization: f64,
        /// Restricts the ceiling to one domain.
        #[serde(default)]
        domain: Option<Domain>,
    },
    /// Resources reporting more loss than `max_loss` are unsafe.
    LossCeiling {
        /// Loss ratio ceiling.
        #[serde(default = "default_max_loss")]
        max_loss: f64,
    },
    /// Resources tagged `tag = value` only carry intents whose priority lies
    /// within `[min_priority, max_priority]`.
    Isolation {
        /// Tag key.
        tag: String,
        /// Tag value.
        value: String,
        /// Lowest admitted priority.
        #[serde(default)]
        min_priority: Option<u8>,
        /// Highest admitted priority.
        #[serde(default)]
        max_priority: Option<u8>,
    },
    /// Resources carrying `tag` hold at most one allocation.
    Dedicated {
        /// Tag key.
        tag: String,
    },
    /// Higher-priority intents may evict lower-priority active allocations.
    Preemption {
        /// Whether eviction is allowed at all.
        #[serde(default = "default_true")]
        enabled: bool,
        /// Minimum priority difference between candidate and victim.
        #[serde(default = "default_priority_gap")]
        min_priority_gap: u8,
        /// Tie-break among equal-priority victims.
        #[serde(default)]
        order: EvictionOrder,
    },
}

impl Constraint {
    /// Label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CapacityCeiling { .. } => "capacity_ceiling",
            Self::LossCeiling { .. } => "loss_ceiling",
            Self::Isolation { .. } => "isolation",
            Self::Dedicated { .. } => "dedicated",
            Self::Preemption { .. } => "preemption",
        }
    }
}

/// Resolved eviction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptionRule {
    /// Minimum priority difference.
    pub min_priority_gap: u8,
    /// Tie-break order.
    pub order: EvictionOrder,
}

impl PreemptionRule {
    /// Whether `victim` may be evicted for `candidate`.
    #[must_use]
    pub fn allows(&self, candidate: Priority, victim: Priority) -> bool {
        victim < candidate && candidate.0 - victim.0 >= self.min_priority_gap
    }
}

/// Ordered constraint set, immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Constraints in evaluation order.
    pub constraints: Vec<Constraint>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            constraints: vec![
                Constraint::CapacityCeiling {
                    max_utilization: default_max_utilization(),
                    domain: None,
                },
                Constraint::Preemption {
                    enabled: true,
                    min_priority_gap: default_priority_gap(),
                    order: EvictionOrder::OldestFirst,
                },
            ],
        }
    }
}

impl Policy {
    /// Policy from an explicit constraint list.
    #[must_use]
    pub const fn new(constraints: Vec<Constraint>) -> Self {
        Self { constraints }
    }

    /// Policy without any constraint.
    #[must_use]
    pub const fn permissive() -> Self {
        Self::new(Vec::new())
    }

    /// Highest capacity this resource may have committed.
    ///
    /// Every matching ceiling applies; the tightest wins. The result never
    /// exceeds what the resource can currently carry.
    #[must_use]
    pub fn capacity_limit(&self, resource: &Resource) -> f64 {
        self.constraints
            .iter()
            .filter_map(|constraint| match constraint {
                Constraint::CapacityCeiling {
                    max_utilization,
                    domain,
                } if domain.is_none() || *domain == Some(resource.domain) => {
                    Some(resource.total_capacity * max_utilization)
                }
                _ => None,
            })
            .fold(resource.usable_capacity(), f64::min)
    }

    /// Tightest loss ceiling, if any.
    #[must_use]
    pub fn max_loss(&self) -> Option<f64> {
        self.constraints
            .iter()
            .filter_map(|constraint| match constraint {
                Constraint::LossCeiling { max_loss } => Some(*max_loss),
                _ => None,
            })
            .reduce(f64::min)
    }

    /// Eviction settings; the last preemption constraint wins. `None` when
    /// preemption is absent or disabled.
    #[must_use]
    pub fn preemption(&self) -> Option<PreemptionRule> {
        self.constraints
            .iter()
            .rev()
            .find_map(|constraint| match constraint {
                Constraint::Preemption {
                    enabled,
                    min_priority_gap,
                    order,
                } => Some(enabled.then_some(PreemptionRule {
                    min_priority_gap: *min_priority_gap,
                    order: *order,
                })),
                _ => None,
            })
            .flatten()
    }
}

/// Policy file.
///
/// ```toml
/// [[constraints]]
/// kind = "capacity_ceiling"
/// max_utilization = 0.85
///
/// [[constraints]]
/// kind = "preemption"
/// order = "oldest_first"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDocument {
    /// Constraints; the default policy applies when the key is absent.
    #[serde(default)]
    pub constraints: Option<Vec<Constraint>>,
}

impl PolicyDocument {
    /// Loads and validates a policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Policy> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading policy {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates a policy document.
    pub fn from_toml_str(raw: &str) -> Result<Policy> {
        let document: Self = toml::from_str(raw)?;
        let policy = document.constraints.map_or_else(Policy::default, Policy::new);
        validate(&policy)?;
        Ok(policy)
    }
}

fn validate(policy: &Policy) -> Result<()> {
    for (idx, constraint) in policy.constraints.iter().enumerate() {
        match constraint {
            Constraint::CapacityCeiling {
                max_utilization, ..
            } if !(*max_utilization > 0.0 && *max_utilization <= 1.0) => {
                bail!("constraint {idx}: max_utilization must be in (0, 1], got {max_utilization}");
            }
            Constraint::LossCeiling { max_loss } if !(0.0..=1.0).contains(max_loss) => {
                bail!("constraint {idx}: max_loss must be in [0, 1], got {max_loss}");
            }
            Constraint::Isolation {
                min_priority: Some(min),
                max_priority: Some(max),
                ..
            } if min > max => {
                bail!("constraint {idx}: isolation min_priority {min} above max_priority {max}");
            }
            _ => {}
        }
    }
    Ok(())
}

const fn default_max_utilization() -> f64 {
    0.85
}

const fn default_max_loss() -> f64 {
    0.02
}

const fn default_priority_gap() -> u8 {
    1
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use starstream_fabric::ResourceSpec;

    #[test]
    fn defaults_fill_missing_fields() {
        let policy = PolicyDocument::from_toml_str(
            r#"
[[constraints]]
kind = "capacity_ceiling"

[[constraints]]
kind = "loss_ceiling"

[[constraints]]
kind = "preemption"
order = "newest_first"
"#,
        )
        .unwrap();
        assert_eq!(policy.max_loss(), Some(0.02));
        let rule = policy.preemption().unwrap();
        assert_eq!(rule.order, EvictionOrder::NewestFirst);
        assert_eq!(rule.min_priority_gap, 1);
        let resource =
            Resource::from_spec(ResourceSpec::new("ab", Domain::Optical, "A", "B", 10.0, 1.0))
                .unwrap();
        assert!((policy.capacity_limit(&resource) - 8.5).abs() < 1e-9);
    }

    #[test]
    fn absent_constraints_use_default_policy() {
        assert_eq!(PolicyDocument::from_toml_str("").unwrap(), Policy::default());
        assert!(PolicyDocument::from_toml_str("constraints = []")
            .unwrap()
            .preemption()
            .is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let err = PolicyDocument::from_toml_str(
            "[[constraints]]\nkind = \"capacity_ceiling\"\nmax_utilization = 1.5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_utilization"));
        assert!(PolicyDocument::from_toml_str(
            "[[constraints]]\nkind = \"isolation\"\ntag = \"t\"\nvalue = \"v\"\nmin_priority = 5\nmax_priority = 2\n"
        )
        .is_err());
    }

    #[test]
    fn domain_ceiling_only_applies_to_its_domain() {
        let policy = Policy::new(vec![Constraint::CapacityCeiling {
            max_utilization: 0.5,
            domain: Some(Domain::Compute),
        }]);
        let optical =
            Resource::from_spec(ResourceSpec::new("o", Domain::Optical, "A", "B", 10.0, 1.0))
                .unwrap();
        assert!((policy.capacity_limit(&optical) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn loads_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        fs::write(
            &path,
            "[[constraints]]\nkind = \"dedicated\"\ntag = \"exclusive\"\n",
        )
        .unwrap();
        let policy = PolicyDocument::load(&path).unwrap();
        assert_eq!(policy.constraints[0].kind(), "dedicated");
        assert!(PolicyDocument::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn gap_controls_eligibility() {
        let rule = PreemptionRule {
            min_priority_gap: 2,
            order: EvictionOrder::OldestFirst,
        };
        assert!(rule.allows(Priority(5), Priority(3)));
        assert!(!rule.allows(Priority(5), Priority(4)));
        assert!(!rule.allows(Priority(3), Priority(5)));
    }
}

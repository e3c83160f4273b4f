use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use starstream_fabric::Domain;

/// Overhead of crossing from one domain into another.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionCost {
    /// Added to the path weight.
    pub weight: f64,
    /// Added to the path latency (conversion delay).
    pub latency_ms: f64,
}

impl TransitionCost {
    /// No overhead.
    pub const FREE: Self = Self {
        weight: 0.0,
        latency_ms: 0.0,
    };
}

/// One configured domain pair, applied in both directions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransitionRule {
    /// One side of the boundary.
    pub from: Domain,
    /// Other side of the boundary.
    pub to: Domain,
    /// Added weight.
    pub weight: f64,
    /// Added latency.
    #[serde(default)]
    pub latency_ms: f64,
}

/// Symmetric lookup of domain-boundary costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<TransitionRule>", into = "Vec<TransitionRule>")]
pub struct TransitionCosts {
    table: BTreeMap<(Domain, Domain), TransitionCost>,
}

impl TransitionCosts {
    /// Table without any boundary overhead.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Sets the cost for a pair of domains.
    #[must_use]
    pub fn with(mut self, a: Domain, b: Domain, cost: TransitionCost) -> Self {
        self.table.insert(key(a, b), cost);
        self
    }

    /// Cost of moving between `from` and `to`. Same-domain moves are free.
    #[must_use]
    pub fn between(&self, from: Domain, to: Domain) -> TransitionCost {
        if from == to {
            return TransitionCost::FREE;
        }
        self.table
            .get(&key(from, to))
            .copied()
            .unwrap_or(TransitionCost::FREE)
    }
}

impl Default for TransitionCosts {
    fn default() -> Self {
        Self::none()
            .with(
                Domain::Optical,
                Domain::Electronic,
                TransitionCost {
                    weight: 0.5,
                    latency_ms: 0.01,
                },
            )
            .with(
                Domain::Electronic,
                Domain::Compute,
                TransitionCost {
                    weight: 0.2,
                    latency_ms: 0.005,
                },
            )
            .with(
                Domain::Optical,
                Domain::Compute,
                TransitionCost {
                    weight: 0.7,
                    latency_ms: 0.015,
                },
            )
    }
}

impl From<Vec<TransitionRule>> for TransitionCosts {
    fn from(rules: Vec<TransitionRule>) -> Self {
        rules.into_iter().fold(Self::none(), |costs, rule| {
            costs.with(
                rule.from,
                rule.to,
                TransitionCost {
                    weight: rule.weight,
                    latency_ms: rule.latency_ms,
                },
            )
        })
    }
}

impl From<TransitionCosts> for Vec<TransitionRule> {
    fn from(costs: TransitionCosts) -> Self {
        costs
            .table
            .into_iter()
            .map(|((from, to), cost)| TransitionRule {
                from,
                to,
                weight: cost.weight,
                latency_ms: cost.latency_ms,
            })
            .collect()
    }
}

fn key(a: Domain, b: Domain) -> (Domain, Domain) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_symmetric() {
        let costs = TransitionCosts::default();
        assert_eq!(
            costs.between(Domain::Optical, Domain::Electronic),
            costs.between(Domain::Electronic, Domain::Optical)
        );
        assert_eq!(costs.between(Domain::Compute, Domain::Compute), TransitionCost::FREE);
    }

    #[test]
    fn rules_replace_defaults() {
        let costs = TransitionCosts::from(vec![TransitionRule {
            from: Domain::Compute,
            to: Domain::Optical,
            weight: 3.0,
            latency_ms: 1.0,
        }]);
        assert!((costs.between(Domain::Optical, Domain::Compute).weight - 3.0).abs() < 1e-12);
        assert_eq!(costs.between(Domain::Optical, Domain::Electronic), TransitionCost::FREE);
    }
}

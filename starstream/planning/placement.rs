use indexmap::IndexMap;
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Compute substrate class a workload can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Substrate {
    /// Photonic accelerator.
    Photonic,
    /// GPU.
    Gpu,
    /// General-purpose CPU.
    Cpu,
}

impl Substrate {
    /// Every substrate in evaluation order.
    pub const ALL: [Self; 3] = [Self::Photonic, Self::Gpu, Self::Cpu];

    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Photonic => "photonic",
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
        }
    }
}

/// Service-level objective for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slo {
    /// p95 latency target.
    pub latency_p95_ms: f64,
    /// Cost budget per thousand requests.
    pub cost_per_1k: f64,
    /// Energy cap in joules.
    pub energy_j_max: f64,
}

/// Shape of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    /// Tokens per request.
    pub tokens: f64,
    /// Batch size.
    pub batch_size: f64,
    /// Concurrent requests.
    pub concurrency: f64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            tokens: 512.0,
            batch_size: 1.0,
            concurrency: 1.0,
        }
    }
}

impl Workload {
    /// Dimensionless load factor; 1.0 for the default workload.
    #[must_use]
    pub fn load(&self) -> f64 {
        (self.tokens / 512.0) * self.batch_size.sqrt() * self.concurrency.powf(0.6)
    }
}

/// Expected latency, cost, and energy of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Cost per thousand requests.
    pub cost: f64,
    /// Energy in joules.
    pub energy: f64,
}

impl Estimate {
    /// Whether the estimate stays within the SLO's safety margins.
    #[must_use]
    pub fn is_safe(&self, slo: &Slo) -> bool {
        self.latency_ms <= slo.latency_p95_ms * 1.05 && self.energy <= slo.energy_j_max * 1.1
    }
}

/// Load-scaled estimator over per-substrate baselines.
#[derive(Debug, Clone)]
pub struct Estimator {
    means: IndexMap<Substrate, Estimate>,
}

impl Default for Estimator {
    fn default() -> Self {
        let mut means = IndexMap::new();
        means.insert(
            Substrate::Photonic,
            Estimate {
                latency_ms: 0.4,
                cost: 0.0002,
                energy: 1.0,
            },
        );
        means.insert(
            Substrate::Gpu,
            Estimate {
                latency_ms: 1.2,
                cost: 0.0005,
                energy: 5.0,
            },
        );
        means.insert(
            Substrate::Cpu,
            Estimate {
                latency_ms: 4.0,
                cost: 0.0001,
                energy: 2.0,
            },
        );
        Self { means }
    }
}

impl Estimator {
    /// Overrides the baseline for one substrate.
    #[must_use]
    pub fn with_mean(mut self, substrate: Substrate, mean: Estimate) -> Self {
        self.means.insert(substrate, mean);
        self
    }

    /// Estimate for `substrate` under `workload`.
    #[must_use]
    pub fn estimate(&self, substrate: Substrate, workload: &Workload) -> Estimate {
        let base = self.means.get(&substrate).copied().unwrap_or(Estimate {
            latency_ms: f64::INFINITY,
            cost: f64::INFINITY,
            energy: f64::INFINITY,
        });
        let load = workload.load();
        Estimate {
            latency_ms: base.latency_ms * 0.25f64.mul_add(load, 1.0),
            cost: base.cost * 0.20f64.mul_add(load, 1.0),
            energy: base.energy * 0.35f64.mul_add(load, 1.0),
        }
    }

    fn candidates(&self, slo: &Slo, workload: &Workload) -> Vec<(Substrate, Estimate)> {
        let all: Vec<_> = Substrate::ALL
            .iter()
            .map(|s| (*s, self.estimate(*s, workload)))
            .collect();
        let safe: Vec<_> = all.iter().copied().filter(|(_, e)| e.is_safe(slo)).collect();
        if safe.is_empty() {
            all
        } else {
            safe
        }
    }
}

/// Higher is better: weighted penalties against the SLO, inverted.
#[must_use]
pub fn score(estimate: &Estimate, slo: &Slo) -> f64 {
    let latency = estimate.latency_ms / slo.latency_p95_ms.max(1e-6);
    let cost = estimate.cost / slo.cost_per_1k.max(1e-9);
    let energy = estimate.energy / slo.energy_j_max.max(1e-9);
    1.0 / (0.55 * latency + 0.30 * cost + 0.15 * energy)
}

/// How a placement was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    /// Best score among safe targets.
    Best,
    /// Random safe target.
    Explore,
    /// Score plus learned reward.
    Exploit,
}

/// A placement decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Chosen substrate.
    pub target: Substrate,
    /// Expected outcome.
    pub expected: Estimate,
    /// Score of the expected outcome.
    pub score: f64,
    /// Decision mode.
    pub mode: PlacementMode,
    /// Share of traffic sent to the target first.
    pub canary_fraction: f64,
}

/// Strategy choosing a substrate for a workload.
pub trait PlacementPolicy {
    /// Chooses a substrate.
    fn decide(&mut self, slo: &Slo, workload: &Workload) -> Placement;
}

/// Best score among targets within the SLO safety margins.
///
/// Falls back to every target when none is safe.
#[derive(Debug, Clone, Default)]
pub struct ConstrainedBestScore {
    estimator: Estimator,
}

impl ConstrainedBestScore {
    /// Uses a custom estimator.
    #[must_use]
    pub const fn new(estimator: Estimator) -> Self {
        Self { estimator }
    }
}

impl PlacementPolicy for ConstrainedBestScore {
    fn decide(&mut self, slo: &Slo, workload: &Workload) -> Placement {
        let mut best: Option<Placement> = None;
        for (target, expected) in self.estimator.candidates(slo, workload) {
            let score = score(&expected, slo);
            let better = match &best {
                Some(current) => score > current.score,
                None => true,
            };
            if better {
                best = Some(Placement {
                    target,
                    expected,
                    score,
                    mode: PlacementMode::Best,
                    canary_fraction: 0.0,
                });
            }
        }
        best.unwrap_or_else(|| fallback(slo))
    }
}

/// Seeded explore/exploit over safe targets with observed-reward feedback.
#[derive(Debug, Clone)]
pub struct ConstrainedEpsilonGreedy {
    estimator: Estimator,
    epsilon: f64,
    canary: f64,
    rng: SmallRng,
    rewards: IndexMap<Substrate, (f64, u32)>,
}

impl ConstrainedEpsilonGreedy {
    /// Policy exploring with probability `epsilon`.
    #[must_use]
    pub fn new(epsilon: f64, canary: f64, seed: u64) -> Self {
        Self {
            estimator: Estimator::default(),
            epsilon,
            canary,
            rng: SmallRng::seed_from_u64(seed),
            rewards: Substrate::ALL.iter().map(|s| (*s, (0.0, 1))).collect(),
        }
    }

    /// Records the measured outcome of a placement.
    pub fn observe(&mut self, target: Substrate, latency_ms: f64, cost: f64) {
        let reward = 1.0 / cost.max(1e-4) - 0.5 * latency_ms.max(0.0);
        let entry = self.rewards.entry(target).or_insert((0.0, 1));
        entry.0 += reward;
        entry.1 += 1;
    }

    /// Mean observed reward for a target.
    #[must_use]
    pub fn mean_reward(&self, target: Substrate) -> f64 {
        self.rewards
            .get(&target)
            .map_or(0.0, |(sum, n)| sum / f64::from(*n))
    }
}

impl Default for ConstrainedEpsilonGreedy {
    fn default() -> Self {
        Self::new(0.1, 0.05, 0)
    }
}

impl PlacementPolicy for ConstrainedEpsilonGreedy {
    fn decide(&mut self, slo: &Slo, workload: &Workload) -> Placement {
        let safe = self.estimator.candidates(slo, workload);
        let explore = self.rng.gen::<f64>() < self.epsilon;
        let chosen = if explore {
            safe.choose(&mut self.rng).copied()
        } else {
            safe.iter()
                .copied()
                .map(|(target, expected)| {
                    (target, expected, score(&expected, slo) + self.mean_reward(target))
                })
                .fold(None, |best: Option<(Substrate, Estimate, f64)>, item| match best {
                    Some(b) if b.2 >= item.2 => Some(b),
                    _ => Some(item),
                })
                .map(|(target, expected, _)| (target, expected))
        };
        chosen.map_or_else(
            || fallback(slo),
            |(target, expected)| Placement {
                target,
                expected,
                score: score(&expected, slo),
                mode: if explore {
                    PlacementMode::Explore
                } else {
                    PlacementMode::Exploit
                },
                canary_fraction: self.canary,
            },
        )
    }
}

fn fallback(slo: &Slo) -> Placement {
    let expected = Estimator::default().estimate(Substrate::Cpu, &Workload::default());
    Placement {
        target: Substrate::Cpu,
        expected,
        score: score(&expected, slo),
        mode: PlacementMode::Best,
        canary_fraction: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slo() -> Slo {
        Slo {
            latency_p95_ms: 2.0,
            cost_per_1k: 0.0005,
            energy_j_max: 6.0,
        }
    }

    #[test]
    fn load_scales_estimates() {
        let estimator = Estimator::default();
        let light = estimator.estimate(Substrate::Gpu, &Workload::default());
        assert!((light.latency_ms - 1.5).abs() < 1e-9);
        let heavy = estimator.estimate(
            Substrate::Gpu,
            &Workload {
                tokens: 1024.0,
                batch_size: 4.0,
                concurrency: 1.0,
            },
        );
        assert!(heavy.latency_ms > light.latency_ms);
        assert!(heavy.energy > light.energy);
    }

    #[test]
    fn best_score_prefers_photonic_under_tight_latency() {
        let placement = ConstrainedBestScore::default().decide(&slo(), &Workload::default());
        assert_eq!(placement.target, Substrate::Photonic);
        assert_eq!(placement.mode, PlacementMode::Best);
    }

    #[test]
    fn best_score_falls_back_when_nothing_is_safe() {
        let impossible = Slo {
            latency_p95_ms: 0.01,
            cost_per_1k: 0.0005,
            energy_j_max: 0.1,
        };
        let placement = ConstrainedBestScore::default().decide(&impossible, &Workload::default());
        assert!(placement.score > 0.0);
    }

    #[test]
    fn epsilon_greedy_is_deterministic_per_seed() {
        let run = |seed| {
            let mut policy = ConstrainedEpsilonGreedy::new(0.5, 0.05, seed);
            (0..20)
                .map(|_| policy.decide(&slo(), &Workload::default()).target)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn observation_shifts_exploitation() {
        let mut policy = ConstrainedEpsilonGreedy::new(0.0, 0.05, 1);
        let relaxed = Slo {
            latency_p95_ms: 10.0,
            cost_per_1k: 0.0005,
            energy_j_max: 10.0,
        };
        let first = policy.decide(&relaxed, &Workload::default());
        assert_eq!(first.mode, PlacementMode::Exploit);
        for _ in 0..5 {
            policy.observe(Substrate::Cpu, 0.1, 0.0001);
        }
        let next = policy.decide(&relaxed, &Workload::default());
        assert_eq!(next.target, Substrate::Cpu);
        assert!(policy.mean_reward(Substrate::Cpu) > policy.mean_reward(Substrate::Gpu));
    }
}

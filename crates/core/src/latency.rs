//! Network latency models.
//!
//! A model is a pure function `(from, to, rnd) -> ms` with `rnd ∈ [0, 99]`.
//! All variance flows through `rnd` (produced by [`pseudo_random`]), so a
//! single send to many destinations yields the same per-destination
//! latencies regardless of iteration order, and an in-flight envelope can
//! recompute its arrival times at any moment.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::node::{Node, NodeId, MAX_X, MAX_Y};

/// Deterministic mix of a node id and a per-send seed, uniform over
/// `[0, 99]`. Xorshift over the id, XOR with the seed, modulo 100.
pub fn pseudo_random(node_id: NodeId, seed: i32) -> u32 {
    let mut a = node_id as i32;
    a ^= a.wrapping_shl(13);
    a ^= ((a as u32) >> 17) as i32;
    a ^= a.wrapping_shl(5);
    ((a ^ seed) % 100).unsigned_abs()
}

/// The latency assigned to a message between two nodes.
///
/// Models never return less than 1 ms: a send at time `t` is observable at
/// `t + 1` at the earliest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkLatency {
    /// Constant latency, clamped to >= 1 ms.
    Fixed(u64),

    /// Euclidean distance over node positions mapped onto `[min_ms, max_ms]`
    /// with a bounded multiplicative spread driven by `rnd`.
    Distance { min_ms: u64, max_ms: u64 },

    /// Empirical distribution: `props[i]` messages out of `sum(props)`
    /// experience `vals[i]` ms. The proportions need not sum to 100.
    Measured { props: Vec<u32>, vals: Vec<u64> },
}

impl NetworkLatency {
    /// "No latency": everything arrives on the next millisecond.
    pub fn none() -> Self {
        NetworkLatency::Fixed(1)
    }

    /// Distance-based WAN defaults.
    pub fn by_distance() -> Self {
        NetworkLatency::Distance {
            min_ms: 10,
            max_ms: 200,
        }
    }

    /// Measured wide-area distribution (15 buckets, long 1.2 s tail) used by
    /// the aggregation studies.
    pub fn ic3() -> Self {
        NetworkLatency::Measured {
            props: vec![1, 33, 17, 12, 8, 5, 4, 3, 3, 1, 1, 2, 1, 1, 8],
            vals: vec![
                12, 15, 19, 32, 35, 37, 40, 42, 45, 87, 155, 160, 185, 297, 1200,
            ],
        }
    }

    /// Build a measured distribution, validating the tables.
    pub fn measured(props: Vec<u32>, vals: Vec<u64>) -> Result<Self, ConfigError> {
        if props.is_empty() || props.len() != vals.len() {
            return Err(ConfigError::BadDistribution {
                props: props.len(),
                vals: vals.len(),
            });
        }
        Ok(NetworkLatency::Measured { props, vals })
    }

    /// Latency in ms for a message from `from` to `to`, with `rnd ∈ [0, 99]`
    /// as the only source of variance.
    pub fn latency(&self, from: &Node, to: &Node, rnd: u32) -> u64 {
        debug_assert!(rnd < 100);
        match self {
            NetworkLatency::Fixed(ms) => (*ms).max(1),
            NetworkLatency::Distance { min_ms, max_ms } => {
                let max_dist = (f64::from(MAX_X).powi(2) + f64::from(MAX_Y).powi(2)).sqrt();
                let ratio = from.distance(to) / max_dist;
                let base = *min_ms as f64 + (max_ms.saturating_sub(*min_ms)) as f64 * ratio;
                // rnd spreads the curve over [95%, 104%].
                let spread = (95 + rnd / 10) as f64 / 100.0;
                ((base * spread) as u64).max(1)
            }
            NetworkLatency::Measured { props, vals } => {
                let total: u64 = props.iter().map(|&p| u64::from(p)).sum();
                let target = u64::from(rnd) * total / 100;
                let mut cum = 0u64;
                for (p, v) in props.iter().zip(vals) {
                    cum += u64::from(*p);
                    if cum > target {
                        return (*v).max(1);
                    }
                }
                vals.last().copied().unwrap_or(1).max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBuilder;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn two_nodes() -> (Node, Node) {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut nb = NodeBuilder::with_random_position();
        (nb.build(&mut rng), nb.build(&mut rng))
    }

    #[test]
    fn pseudo_random_is_stable_and_bounded() {
        for id in 0..2048 {
            for seed in [-1, 0, 1, i32::MIN, i32::MAX, 123_456_789] {
                let r = pseudo_random(id, seed);
                assert!(r < 100);
                assert_eq!(r, pseudo_random(id, seed));
            }
        }
    }

    #[test]
    fn fixed_latency_never_below_one() {
        let (a, b) = two_nodes();
        assert_eq!(NetworkLatency::Fixed(0).latency(&a, &b, 50), 1);
        assert_eq!(NetworkLatency::none().latency(&a, &b, 0), 1);
        assert_eq!(NetworkLatency::Fixed(42).latency(&a, &b, 99), 42);
    }

    #[test]
    fn distance_latency_is_pure_and_in_range() {
        let (a, b) = two_nodes();
        let model = NetworkLatency::by_distance();
        for rnd in 0..100 {
            let l = model.latency(&a, &b, rnd);
            assert_eq!(l, model.latency(&a, &b, rnd), "model must be pure");
            assert!((1..=210).contains(&l), "latency {l} out of range");
        }
    }

    #[test]
    fn measured_latency_walks_the_distribution() {
        let (a, b) = two_nodes();
        let model = NetworkLatency::measured(vec![50, 50], vec![10, 100]).unwrap();
        assert_eq!(model.latency(&a, &b, 0), 10);
        assert_eq!(model.latency(&a, &b, 49), 10);
        assert_eq!(model.latency(&a, &b, 50), 100);
        assert_eq!(model.latency(&a, &b, 99), 100);
    }

    #[test]
    fn measured_rejects_mismatched_tables() {
        assert_eq!(
            NetworkLatency::measured(vec![1, 2], vec![3]),
            Err(ConfigError::BadDistribution { props: 2, vals: 1 })
        );
        assert!(NetworkLatency::measured(vec![], vec![]).is_err());
    }

    #[test]
    fn ic3_covers_all_buckets() {
        let (a, b) = two_nodes();
        let model = NetworkLatency::ic3();
        let mut seen = std::collections::BTreeSet::new();
        for rnd in 0..100 {
            seen.insert(model.latency(&a, &b, rnd));
        }
        assert!(seen.contains(&12));
        assert!(seen.contains(&1200));
    }
}

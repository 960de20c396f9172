//! Stats getters.

use std::collections::BTreeMap;

use aggsim_core::{Network, SimNode};

/// Min/max/avg over one sample of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl SimpleStats {
    /// Fold an iterator of values. Empty input yields all-zero stats.
    pub fn over<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        if count == 0 {
            return Self {
                min: 0.0,
                max: 0.0,
                avg: 0.0,
            };
        }
        Self {
            min,
            max,
            avg: sum / count as f64,
        }
    }
}

/// Min/max/avg of a per-node projection over every registered node.
pub fn stats_on<N: SimNode, F: Fn(&N) -> f64>(net: &Network<N>, f: F) -> SimpleStats {
    SimpleStats::over(net.nodes().map(f))
}

/// Periodic stat sampler consumed by the scenario runner.
pub trait StatsGetter<N: SimNode> {
    /// Names of the emitted fields, stable across calls.
    fn fields(&self) -> &'static [&'static str];

    /// One sample over the current network state.
    fn collect(&self, net: &Network<N>) -> BTreeMap<&'static str, f64>;
}

/// The common case: min/max/avg of one per-node value.
pub struct NodeStatsGetter<N: SimNode> {
    project: Box<dyn Fn(&N) -> f64>,
}

impl<N: SimNode> NodeStatsGetter<N> {
    pub fn new<F: Fn(&N) -> f64 + 'static>(project: F) -> Self {
        Self {
            project: Box::new(project),
        }
    }
}

impl<N: SimNode> StatsGetter<N> for NodeStatsGetter<N> {
    fn fields(&self) -> &'static [&'static str] {
        &["min", "max", "avg"]
    }

    fn collect(&self, net: &Network<N>) -> BTreeMap<&'static str, f64> {
        let s = stats_on(net, &self.project);
        BTreeMap::from([("min", s.min), ("max", s.max), ("avg", s.avg)])
    }
}

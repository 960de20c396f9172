//! The scenario runner.

use std::collections::BTreeMap;

use tracing::info;

use aggsim_core::{ConfigError, Protocol, SimNode};

use crate::series::{stat_series, Series, StatSeries};
use crate::stats::{stats_on, StatsGetter};

/// Runs a protocol template for several rounds and samples stats over
/// virtual time.
///
/// Each round duplicates the template, reseeds the kernel RNG with
/// `seed_base + round`, initializes the protocol, and advances virtual
/// time in `stat_each_ms` steps until the continuation predicate says
/// stop, sampling the stats getter after every step.
pub struct ProgressPerTime<P: Protocol, S: StatsGetter<P::N>> {
    template: P,
    stats: S,
    round_count: u32,
    stat_each_ms: u64,
    seed_base: u64,
}

/// Per-field min/max/avg envelopes over all rounds.
pub struct ScenarioResult {
    pub series: BTreeMap<&'static str, StatSeries>,
}

impl<P: Protocol, S: StatsGetter<P::N>> ProgressPerTime<P, S> {
    pub fn new(
        template: &P,
        stats: S,
        round_count: u32,
        stat_each_ms: u64,
    ) -> Result<Self, ConfigError> {
        if round_count == 0 {
            return Err(ConfigError::ZeroRounds);
        }
        if stat_each_ms == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "stat_each_ms",
                reason: "sampling period must be at least 1 ms".into(),
            });
        }
        Ok(Self {
            template: template.duplicate(),
            stats,
            round_count,
            stat_each_ms,
            seed_base: 0,
        })
    }

    /// Offset the per-round seeds (round `r` runs with `seed_base + r`).
    pub fn with_seed_base(mut self, seed_base: u64) -> Self {
        self.seed_base = seed_base;
        self
    }

    /// Run every round. `continue_if` is evaluated after each sampling
    /// step; `on_round_end` sees the finished protocol of each round.
    pub fn run(
        &self,
        continue_if: impl Fn(&P) -> bool,
        mut on_round_end: impl FnMut(u32, &P),
    ) -> ScenarioResult {
        let fields = self.stats.fields();
        let mut rounds: BTreeMap<&'static str, Vec<Series>> =
            fields.iter().map(|&f| (f, Vec::new())).collect();

        for round in 0..self.round_count {
            let mut p = self.template.duplicate();
            p.network_mut().reseed(self.seed_base + u64::from(round));
            p.init();
            info!(round, seed = self.seed_base + u64::from(round), "round start");

            let mut round_series: BTreeMap<&'static str, Series> =
                fields.iter().map(|&f| (f, Series::new(f))).collect();

            loop {
                p.network_mut().run_ms(self.stat_each_ms);
                let sample = self.stats.collect(p.network());
                let now = p.network().time();
                for (&field, series) in round_series.iter_mut() {
                    if let Some(&v) = sample.get(field) {
                        series.add(now, v);
                    }
                }
                if !continue_if(&p) {
                    break;
                }
            }

            let net = p.network();
            let done_at = stats_on(net, |n| n.base().done_at as f64);
            info!(
                round,
                time = net.time(),
                msg_sent_avg = stats_on(net, |n| n.base().msg_sent as f64).avg,
                msg_received_avg = stats_on(net, |n| n.base().msg_received as f64).avg,
                bytes_sent_avg = stats_on(net, |n| n.base().bytes_sent as f64).avg,
                done_at_min = done_at.min,
                done_at_max = done_at.max,
                down = net.nodes().filter(|n| n.base().down).count(),
                "round end"
            );
            on_round_end(round, &p);

            for (field, series) in round_series {
                rounds.get_mut(field).expect("known field").push(series);
            }
        }

        let series = rounds
            .into_iter()
            .map(|(field, per_round)| (field, stat_series(field, &per_round)))
            .collect();
        ScenarioResult { series }
    }
}

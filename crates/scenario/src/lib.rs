//! Scenario running and stats collection.
//!
//! A scenario takes a protocol template and runs it for a number of
//! rounds, each on a fresh duplicate with a fresh seed, sampling a stats
//! getter at a fixed virtual-time period. The per-round samples are folded
//! into min/max/avg series per stat field — the same shape the original
//! aggregation studies plotted.

mod runner;
mod series;
mod stats;

pub use runner::{ProgressPerTime, ScenarioResult};
pub use series::{stat_series, Series, StatSeries};
pub use stats::{stats_on, NodeStatsGetter, SimpleStats, StatsGetter};

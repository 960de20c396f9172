//! aggsim CLI
//!
//! Runs a protocol scenario under virtual time and prints per-round
//! summaries plus the final min/max/avg envelope of the sampled stat.
//!
//! # Example
//!
//! ```bash
//! # 1024-node San Fermín aggregation over the measured WAN latency
//! aggsim --protocol san-fermin --nodes 1024 --latency ic3 --seconds 30
//!
//! # Handel with 4 rounds and a fixed per-link latency
//! aggsim --protocol handel --nodes 512 --rounds 4 --latency fixed --fixed-ms 50
//! ```

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aggsim_core::{NetworkLatency, Protocol, SimNode};
use aggsim_protocols::{
    Flood, FloodParams, Handel, HandelParams, SanFermin, SanFerminParams,
};
use aggsim_scenario::{NodeStatsGetter, ProgressPerTime, ScenarioResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProtocolKind {
    SanFermin,
    Handel,
    Flood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LatencyKind {
    /// Everything arrives on the next millisecond.
    None,
    /// Constant per-link latency (see --fixed-ms).
    Fixed,
    /// Distance-based over the node map.
    Distance,
    /// Measured wide-area distribution.
    Ic3,
}

/// aggsim — deterministic virtual-time protocol simulation.
///
/// Single-threaded and reproducible: the same seed produces the same run.
#[derive(Parser, Debug)]
#[command(name = "aggsim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Protocol to simulate.
    #[arg(short = 'p', long, value_enum, default_value = "san-fermin")]
    protocol: ProtocolKind,

    /// Number of nodes (power of two for the aggregation protocols).
    #[arg(short = 'n', long, default_value = "256")]
    nodes: usize,

    /// Virtual run time per round, in seconds.
    #[arg(short = 's', long, default_value = "30")]
    seconds: u64,

    /// Number of rounds; round r runs with seed (seed + r).
    #[arg(short = 'r', long, default_value = "1")]
    rounds: u32,

    /// Base RNG seed.
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Stat sampling period in virtual ms.
    #[arg(long, default_value = "10")]
    stat_period: u64,

    /// Latency model.
    #[arg(short = 'l', long, value_enum, default_value = "ic3")]
    latency: LatencyKind,

    /// Per-link latency in ms for --latency fixed.
    #[arg(long, default_value = "100")]
    fixed_ms: u64,

    /// Aggregation threshold; defaults to 3/4 of the nodes.
    #[arg(short = 't', long)]
    threshold: Option<u64>,
}

fn latency_model(args: &Args) -> NetworkLatency {
    match args.latency {
        LatencyKind::None => NetworkLatency::none(),
        LatencyKind::Fixed => NetworkLatency::Fixed(args.fixed_ms),
        LatencyKind::Distance => NetworkLatency::by_distance(),
        LatencyKind::Ic3 => NetworkLatency::ic3(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let threshold = args.threshold.unwrap_or(args.nodes as u64 * 3 / 4);

    info!(
        protocol = ?args.protocol,
        nodes = args.nodes,
        rounds = args.rounds,
        seed = args.seed,
        seconds = args.seconds,
        latency = ?args.latency,
        "starting scenario"
    );

    let result = match args.protocol {
        ProtocolKind::SanFermin => {
            let params = SanFerminParams {
                node_count: args.nodes,
                threshold,
                ..SanFerminParams::default()
            };
            let template = match SanFermin::new(params) {
                Ok(p) => p,
                Err(e) => die(e),
            };
            run_scenario(template, &args, |n| n.agg_value as f64)
        }
        ProtocolKind::Handel => {
            let params = HandelParams {
                node_count: args.nodes,
                threshold: threshold as usize,
                ..HandelParams::default()
            };
            let template = match Handel::new(params) {
                Ok(p) => p,
                Err(e) => die(e),
            };
            run_scenario(template, &args, |n| n.total_cardinality() as f64)
        }
        ProtocolKind::Flood => {
            let params = FloodParams {
                node_count: args.nodes,
                ..FloodParams::default()
            };
            let template = match Flood::new(params) {
                Ok(p) => p,
                Err(e) => die(e),
            };
            run_scenario(template, &args, |n| n.received_count() as f64)
        }
    };

    print_envelope(&result);
}

fn die(e: aggsim_core::ConfigError) -> ! {
    eprintln!("configuration error: {e}");
    std::process::exit(1);
}

/// Run the rounds, sampling one per-node projection, stopping each round
/// at the virtual deadline or once every node is done.
fn run_scenario<P, F>(mut template: P, args: &Args, project: F) -> ScenarioResult
where
    P: Protocol,
    F: Fn(&P::N) -> f64 + 'static,
{
    template.network_mut().set_latency(latency_model(args));
    let getter = NodeStatsGetter::new(project);
    let runner = match ProgressPerTime::new(&template, getter, args.rounds, args.stat_period) {
        Ok(r) => r.with_seed_base(args.seed),
        Err(e) => die(e),
    };

    let deadline = args.seconds * 1000;
    runner.run(
        |p| {
            p.network().time() < deadline
                && p.network().nodes().any(|n| n.base().done_at == 0)
        },
        |round, p| {
            let net = p.network();
            let done = net.nodes().filter(|n| n.base().done_at > 0).count();
            info!(
                round,
                time = net.time(),
                done,
                total = net.node_count(),
                "round finished"
            );
        },
    )
}

fn print_envelope(result: &ScenarioResult) {
    for (field, series) in &result.series {
        let last = |s: &aggsim_scenario::Series| {
            s.points.last().map(|&(t, v)| (t, v)).unwrap_or((0, 0.0))
        };
        let (t, min) = last(&series.min);
        let (_, max) = last(&series.max);
        let (_, avg) = last(&series.avg);
        println!("{field:>4} @ {t} ms: min={min:.1} max={max:.1} avg={avg:.1}");
    }
}

//! Configuration errors.
//!
//! Configuration problems are fatal at init and surface as [`ConfigError`];
//! kernel invariant violations mid-run are panics (the same seed always
//! reproduces them, so there is nothing to recover). Expected runtime
//! outcomes — timeouts, refusals, exhausted candidate pools — are not
//! errors at all and are absorbed by the protocol state machines.

use thiserror::Error;

/// Fatal configuration problems detected before a scenario starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Protocols that impose a binomial structure need `2^L` nodes.
    #[error("node count must be a power of two >= 2, got {0}")]
    NodeCountNotPowerOfTwo(usize),

    /// The scenario runner needs at least one round.
    #[error("round count must be greater than zero")]
    ZeroRounds,

    /// Empirical latency distributions need matching, non-empty tables.
    #[error("latency distribution tables must be non-empty and of equal length ({props} proportions vs {vals} values)")]
    BadDistribution { props: usize, vals: usize },

    /// A protocol parameter is out of its accepted range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },
}

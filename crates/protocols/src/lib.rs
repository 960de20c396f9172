//! Protocols exercising the aggsim kernel.
//!
//! - [`sanfermin`] — binomial-swap signature aggregation: every node swaps
//!   aggregates with one candidate per tree level, halving the remaining
//!   work each time.
//! - [`handel`] — multi-level aggregation with per-level contribution
//!   windows, scored verification and overlap-aware bitset merging.
//! - [`flood`] — plain gossip flooding, mostly useful as a kernel workout
//!   and a baseline for message-count comparisons.
//!
//! Each protocol exposes one parameter record as its construction surface
//! and implements the [`aggsim_core::Protocol`] façade.

pub mod flood;
pub mod handel;
pub mod sanfermin;

pub use flood::{Flood, FloodParams};
pub use handel::{Handel, HandelParams};
pub use sanfermin::{SanFermin, SanFerminParams};

//! Deterministic virtual-time simulation kernel.
//!
//! This crate provides the event kernel used to study distributed protocols
//! over thousands of logical nodes: a time-bucketed message store, a
//! latency-aware send path with geographic partitioning, periodic and
//! conditional tasks, and a single-threaded step loop driven by virtual
//! milliseconds. No wall-clock sleeps anywhere; given the same seed, a
//! scenario produces byte-identical results every run.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Network<N>                          │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  MessageStore: 60s slots → per-ms envelope chains  │  │
//! │  └────────────────────────┬───────────────────────────┘  │
//! │                           │ poll(time)                   │
//! │                           ▼                              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  deliver: partition check, counters, payload action│  │
//! │  └────────────────────────┬───────────────────────────┘  │
//! │                           │ send / register_task         │
//! │                           ▼                              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  latency model + pseudo_random → arrival times     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers run to completion; a handler "suspends" by scheduling a task at
//! a future virtual time and returning. Everything stochastic flows through
//! one seeded [`rand_chacha::ChaCha8Rng`].

mod bitset;
mod error;
mod latency;
mod message;
mod network;
mod node;
mod protocol;
mod store;

pub use bitset::BitSet;
pub use error::ConfigError;
pub use latency::{pseudo_random, NetworkLatency};
pub use message::{Envelope, MessageArrival, Payload};
pub use network::Network;
pub use node::{Node, NodeBuilder, NodeId, SimNode, MAX_X, MAX_Y};
pub use protocol::Protocol;
pub use store::SLOT_DURATION;

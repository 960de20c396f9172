//! The protocol façade.
//!
//! Everything around the kernel — scenario runners, stat collectors, server
//! wrappers — depends only on this contract: populate the network, clone
//! yourself for another round, hand out the kernel.

use crate::network::Network;
use crate::node::SimNode;

/// Minimal contract every simulated protocol satisfies.
pub trait Protocol {
    /// Concrete node type carried by this protocol's kernel.
    type N: SimNode;

    /// Populate the nodes and schedule the initial wave of events.
    fn init(&mut self);

    /// An independent instance with identical parameters and a fresh
    /// kernel. Two duplicates initialized separately follow identical
    /// trajectories.
    fn duplicate(&self) -> Self
    where
        Self: Sized;

    fn network(&self) -> &Network<Self::N>;

    fn network_mut(&mut self) -> &mut Network<Self::N>;
}

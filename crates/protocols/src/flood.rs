//! Flood gossip.
//!
//! The simplest protocol on the kernel: when a node first receives a
//! message it re-sends it to all its peers after a fixed delay. Useful as
//! a kernel workout (multi-destination sends, staggered delivery, down
//! nodes) and as a message-count baseline for the aggregation protocols.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use aggsim_core::{
    ConfigError, Network, Node, NodeBuilder, NodeId, Payload, Protocol, SimNode,
};

/// Fixed wire size of one flood message.
const FLOOD_MSG_BYTES: usize = 200;

/// Tunables of a flood run. The one public construction surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodParams {
    /// Total number of nodes.
    pub node_count: usize,
    /// Leading nodes marked down: counted in peer lists, never delivering.
    pub dead_node_count: usize,
    /// Minimum peers per node; the symmetric wiring usually adds a few.
    pub peers_count: usize,
    /// Number of distinct messages injected, each from a different sender.
    pub msg_count: usize,
    /// Pause before a node re-sends a fresh message to its peers.
    pub delay_before_resend: u64,
    /// Stagger between two consecutive peers of one re-send.
    pub delay_between_sends: u64,
}

impl Default for FloodParams {
    fn default() -> Self {
        Self {
            node_count: 100,
            dead_node_count: 10,
            peers_count: 15,
            msg_count: 1,
            delay_before_resend: 10,
            delay_between_sends: 0,
        }
    }
}

struct FloodMessage {
    msg_id: u64,
}

impl Payload<FloodNode> for FloodMessage {
    fn size(&self) -> usize {
        FLOOD_MSG_BYTES
    }

    fn action(self: Arc<Self>, net: &mut Network<FloodNode>, from: NodeId, to: NodeId) {
        on_flood(net, from, to, self);
    }
}

/// Per-node flood state: the peer list and the set of message ids seen.
pub struct FloodNode {
    base: Node,
    params: Arc<FloodParams>,
    pub peers: Vec<NodeId>,
    received: BTreeSet<u64>,
}

impl SimNode for FloodNode {
    fn base(&self) -> &Node {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Node {
        &mut self.base
    }
}

impl FloodNode {
    pub fn received_count(&self) -> usize {
        self.received.len()
    }
}

/// Flood gossip over a random symmetric peer graph.
pub struct Flood {
    params: Arc<FloodParams>,
    network: Network<FloodNode>,
}

impl Flood {
    pub fn new(params: FloodParams) -> Result<Self, ConfigError> {
        if params.node_count < 2 {
            return Err(ConfigError::InvalidParameter {
                name: "node_count",
                reason: "need at least two nodes".into(),
            });
        }
        if params.dead_node_count + params.msg_count > params.node_count {
            return Err(ConfigError::InvalidParameter {
                name: "msg_count",
                reason: "not enough live nodes to pick the senders from".into(),
            });
        }
        if params.peers_count == 0 || params.peers_count >= params.node_count {
            return Err(ConfigError::InvalidParameter {
                name: "peers_count",
                reason: format!(
                    "must be within 1..{}, got {}",
                    params.node_count, params.peers_count
                ),
            });
        }
        Ok(Self {
            params: Arc::new(params),
            network: Network::new(),
        })
    }

    pub fn params(&self) -> &FloodParams {
        &self.params
    }
}

impl Protocol for Flood {
    type N = FloodNode;

    fn init(&mut self) {
        let p = self.params.clone();
        let mut nb = NodeBuilder::with_random_position();
        for id in 0..p.node_count {
            let mut base = nb.build(self.network.rng_mut());
            base.down = id < p.dead_node_count;
            self.network.add_node(FloodNode {
                base,
                params: p.clone(),
                peers: Vec::new(),
                received: BTreeSet::new(),
            });
        }

        // Random symmetric wiring: draw until everyone has at least
        // `peers_count` distinct peers.
        for id in 0..p.node_count {
            while self.network.node(id).peers.len() < p.peers_count {
                let other = self.network.rng_mut().gen_range(0..p.node_count);
                if other == id || self.network.node(id).peers.contains(&other) {
                    continue;
                }
                self.network.node_mut(id).peers.push(other);
                self.network.node_mut(other).peers.push(id);
            }
        }

        // Pick the senders among live nodes; each injects one message.
        let mut senders = BTreeSet::new();
        while senders.len() < p.msg_count {
            let id = self.network.rng_mut().gen_range(0..p.node_count);
            if self.network.node(id).base.down || !senders.insert(id) {
                continue;
            }
            let msg_id = senders.len() as u64 - 1;
            debug!(node = id, msg_id, "flood sender");
            let node = self.network.node_mut(id);
            node.received.insert(msg_id);
            if node.received.len() == p.msg_count {
                node.base.done_at = 1;
            }
            let peers = node.peers.clone();
            let payload: Arc<dyn Payload<FloodNode>> = Arc::new(FloodMessage { msg_id });
            let at = self.network.time() + 1;
            self.network
                .send_many(payload, at, id, &peers, p.delay_between_sends);
        }
    }

    fn duplicate(&self) -> Self {
        let mut network = Network::new();
        network.set_latency(self.network.latency().clone());
        Self {
            params: self.params.clone(),
            network,
        }
    }

    fn network(&self) -> &Network<FloodNode> {
        &self.network
    }

    fn network_mut(&mut self) -> &mut Network<FloodNode> {
        &mut self.network
    }
}

fn on_flood(net: &mut Network<FloodNode>, from: NodeId, to: NodeId, msg: Arc<FloodMessage>) {
    let now = net.time();
    let forward = {
        let node = net.node_mut(to);
        if !node.received.insert(msg.msg_id) {
            None // duplicate
        } else {
            if node.received.len() == node.params.msg_count {
                node.base.done_at = now;
            }
            let peers: Vec<NodeId> = node.peers.iter().copied().filter(|&p| p != from).collect();
            Some((peers, node.params.delay_before_resend, node.params.delay_between_sends))
        }
    };
    if let Some((peers, delay_before, delay_between)) = forward {
        let at = now + delay_before.max(1);
        net.send_many(msg, at, to, &peers, delay_between);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggsim_core::NetworkLatency;

    #[test]
    fn wiring_is_symmetric_and_sufficient() {
        let mut p = Flood::new(FloodParams {
            node_count: 30,
            dead_node_count: 3,
            peers_count: 4,
            ..FloodParams::default()
        })
        .unwrap();
        p.init();
        let net = p.network();
        for node in net.nodes() {
            assert!(node.peers.len() >= 4);
            for &peer in &node.peers {
                assert!(net.node(peer).peers.contains(&node.base.id));
            }
        }
    }

    #[test]
    fn every_live_node_hears_every_message() {
        let mut p = Flood::new(FloodParams {
            node_count: 40,
            dead_node_count: 3,
            peers_count: 8,
            msg_count: 2,
            delay_before_resend: 5,
            delay_between_sends: 0,
        })
        .unwrap();
        p.network_mut().set_latency(NetworkLatency::Fixed(10));
        p.init();
        p.network_mut().run(10);

        for node in p.network().live_nodes() {
            assert_eq!(node.received_count(), 2, "node {}", node.base.id);
            assert!(node.base.done_at > 0);
        }
        for node in p.network().nodes().filter(|n| n.base.down) {
            assert_eq!(node.received_count(), 0);
            assert_eq!(node.base.msg_received, 0);
        }
    }

    #[test]
    fn staggered_resend_behaves_like_single_dest_for_one_peer() {
        // Two live nodes wired to each other: the re-send has exactly one
        // destination even with a positive stagger.
        let mut p = Flood::new(FloodParams {
            node_count: 2,
            dead_node_count: 0,
            peers_count: 1,
            msg_count: 1,
            delay_before_resend: 1,
            delay_between_sends: 7,
        })
        .unwrap();
        p.network_mut().set_latency(NetworkLatency::none());
        p.init();
        p.network_mut().run(1);

        for node in p.network().nodes() {
            assert_eq!(node.received_count(), 1);
        }
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(Flood::new(FloodParams {
            node_count: 1,
            ..FloodParams::default()
        })
        .is_err());
        assert!(Flood::new(FloodParams {
            node_count: 10,
            dead_node_count: 8,
            msg_count: 3,
            ..FloodParams::default()
        })
        .is_err());
        assert!(Flood::new(FloodParams {
            node_count: 10,
            dead_node_count: 0,
            peers_count: 10,
            msg_count: 1,
            ..FloodParams::default()
        })
        .is_err());
    }
}

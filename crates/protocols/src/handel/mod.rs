//! Handel multi-level aggregation.
//!
//! Nodes are organized into a binary hierarchy of levels: level 0 is the
//! node itself, level `l >= 1` covers the `2^(l-1)` ids obtained by
//! flipping bit `l-1` of the node's id. Each level keeps the best
//! aggregate received so far and periodically offers the union of its
//! lower levels to one peer per dissemination cycle, in a deterministic
//! emission order. Incoming aggregates queue up for verification; one is
//! verified and merged per verification period, preferring the candidate
//! whose merge grows the aggregate the most.
//!
//! Signatures are modeled as always valid; verification cost is modeled by
//! the verification period itself.

mod level;

pub use level::{AggToVerify, Attestation};

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use aggsim_core::{
    BitSet, ConfigError, Network, Node, NodeBuilder, NodeId, Payload, Protocol, SimNode,
};

use level::HLevel;

/// Wire overhead of one aggregation message, plus one attestation entry
/// (hash + contributor bitset + 48-byte aggregate signature).
const AGG_BASE_BYTES: usize = 16;
const AGG_PER_ATTESTATION_BYTES: usize = 56;

/// Tunables of a Handel run. The one public construction surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandelParams {
    /// Number of nodes; must be a power of two >= 2.
    pub node_count: usize,
    /// Total contributor count at which a node records `threshold_at`.
    pub threshold: usize,
    /// Period of the per-node dissemination cycle in ms.
    pub dissemination_period: u64,
    /// Period of the verification cycle in ms; one aggregate is verified
    /// and merged per period.
    pub pairing_time: u64,
    /// Extra wait before level `l` opens: `(l-1) * level_wait_time` ms.
    pub level_wait_time: u64,
    /// Size of the rank window used by the verification selector.
    pub window_size: usize,
    /// Number of nodes attesting a divergent hash (exercises multi-hash
    /// merging); the highest ids diverge.
    pub alt_hash_count: usize,
}

impl Default for HandelParams {
    fn default() -> Self {
        Self {
            node_count: 256,
            threshold: 192,
            dissemination_period: 20,
            pairing_time: 3,
            level_wait_time: 50,
            window_size: 16,
            alt_hash_count: 0,
        }
    }
}

/// The aggregate a node attests by default.
const DEFAULT_HASH: u64 = 0;
/// The divergent hash attested by the `alt_hash_count` highest ids.
const ALT_HASH: u64 = 1;

struct SendAggregation {
    level: u32,
    own_hash: u64,
    incoming_complete: bool,
    attestations: Vec<Attestation>,
    bytes: usize,
}

impl Payload<HNode> for SendAggregation {
    fn size(&self) -> usize {
        self.bytes
    }

    fn action(self: Arc<Self>, net: &mut Network<HNode>, from: NodeId, to: NodeId) {
        on_send_aggregation(net, from, to, &self);
    }
}

/// One outbound aggregation picked by a dissemination cycle.
struct OutboundAgg {
    level: u32,
    dest: NodeId,
    incoming_complete: bool,
    attestations: Vec<Attestation>,
}

/// Per-node Handel state: one [`HLevel`] per level plus the peer-wide
/// bookkeeping shared by all levels.
pub struct HNode {
    base: Node,
    params: Arc<HandelParams>,
    /// The hash this node attests.
    pub own_hash: u64,
    levels: Vec<HLevel>,
    /// Peers that reported their matching level complete; never contacted
    /// again.
    finished_peers: BitSet,
    /// Peers whose contributions are ignored. Stays empty here — signatures
    /// are always valid — but drives the selector and rotation filters.
    blacklist: BitSet,
    /// Round-robin cursor of the verification cycle over levels.
    verify_cursor: usize,
    /// When the aggregate first covered `threshold` contributors; 0 until
    /// then.
    pub threshold_at: u64,
    threshold_done: bool,
    /// Whether this node aggregated the whole network (`done_at` on the
    /// base record carries the time).
    pub done: bool,
}

impl SimNode for HNode {
    fn base(&self) -> &Node {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Node {
        &mut self.base
    }
}

impl HNode {
    fn new(base: Node, params: Arc<HandelParams>, own_hash: u64, rng: &mut ChaCha8Rng) -> Self {
        let id = base.id;
        let level_count = params.node_count.trailing_zeros();
        let mut levels = Vec::with_capacity(level_count as usize + 1);
        levels.push(HLevel::level0(id, own_hash));
        for level in 1..=level_count {
            // The level's id block: flip bit (level-1), keep the bits above.
            let shift = level - 1;
            let start = ((id >> shift) ^ 1) << shift;
            let mut peers: Vec<NodeId> = (start..start + (1 << shift)).collect();
            // Emission order stands in for the VRF ordering, which is an
            // input to this core.
            peers.shuffle(rng);
            levels.push(HLevel::new(level, peers));
        }

        let mut node = Self {
            base,
            params,
            own_hash,
            levels,
            finished_peers: BitSet::new(),
            blacklist: BitSet::new(),
            verify_cursor: 0,
            threshold_at: 0,
            threshold_done: false,
            done: false,
        };
        // Every level initially offers the node's own attestation.
        node.refresh_outgoing(0);
        node
    }

    /// Total number of contributors aggregated so far. Level blocks are
    /// disjoint, so the per-level cardinalities just add up.
    pub fn total_cardinality(&self) -> usize {
        self.levels.iter().map(|l| l.incoming_cardinality).sum()
    }

    /// Per-level `(incoming, outgoing)` cardinalities, for stats.
    pub fn level_cardinalities(&self) -> Vec<(usize, usize)> {
        self.levels
            .iter()
            .map(|l| (l.incoming_cardinality, l.outgoing_cardinality))
            .collect()
    }

    /// True once every level has run out of peers to contact.
    pub fn all_outgoing_finished(&self) -> bool {
        self.levels.iter().all(|l| l.outgoing_finished)
    }

    /// Recompute the outgoing aggregate of every level above `from_level`:
    /// outgoing of level `l` is the union of the incoming sets of all
    /// levels below `l`.
    fn refresh_outgoing(&mut self, from_level: u32) {
        for l2 in (from_level as usize + 1)..self.levels.len() {
            let (lower, upper) = self.levels.split_at_mut(l2);
            let mut combined: BTreeMap<u64, Attestation> = BTreeMap::new();
            for level in lower.iter() {
                for (hash, att) in &level.incoming {
                    combined
                        .entry(*hash)
                        .and_modify(|acc| acc.who.union_with(&att.who))
                        .or_insert_with(|| att.clone());
                }
            }
            upper[0].set_outgoing(combined);
        }
    }

    /// One dissemination cycle: for every open level, the next peer in
    /// rotation and the level's current offer.
    fn dissemination_batch(&mut self, now: u64) -> Vec<OutboundAgg> {
        let Self {
            levels,
            finished_peers,
            blacklist,
            params,
            ..
        } = self;
        let mut batch = Vec::new();
        for level in levels.iter_mut().skip(1) {
            if !level.is_open(now, params.level_wait_time) {
                continue;
            }
            let dests = level.get_remaining_peers(finished_peers, blacklist, 1);
            if let Some(&dest) = dests.first() {
                batch.push(OutboundAgg {
                    level: level.level,
                    dest,
                    incoming_complete: level.is_incoming_complete(),
                    attestations: level.outgoing.values().cloned().collect(),
                });
            }
        }
        batch
    }

    /// Pick at most one queued aggregate across levels, round-robin.
    fn select_verification(&mut self) -> Option<(usize, AggToVerify)> {
        let upper_levels = self.levels.len() - 1;
        if upper_levels == 0 {
            return None;
        }
        for offset in 0..upper_levels {
            let idx = 1 + (self.verify_cursor + offset) % upper_levels;
            let chosen = {
                let Self {
                    levels,
                    blacklist,
                    params,
                    ..
                } = self;
                levels[idx].best_to_verify(params.window_size, blacklist)
            };
            if let Some(agg) = chosen {
                self.verify_cursor = idx % upper_levels;
                return Some((idx, agg));
            }
        }
        None
    }
}

/// Multi-level aggregation over a fresh kernel.
pub struct Handel {
    params: Arc<HandelParams>,
    network: Network<HNode>,
}

impl Handel {
    pub fn new(params: HandelParams) -> Result<Self, ConfigError> {
        if params.node_count < 2 || !params.node_count.is_power_of_two() {
            return Err(ConfigError::NodeCountNotPowerOfTwo(params.node_count));
        }
        if params.threshold == 0 || params.threshold > params.node_count {
            return Err(ConfigError::InvalidParameter {
                name: "threshold",
                reason: format!(
                    "must be within 1..={}, got {}",
                    params.node_count, params.threshold
                ),
            });
        }
        if params.window_size == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "window_size",
                reason: "must be at least 1".into(),
            });
        }
        if params.alt_hash_count >= params.node_count {
            return Err(ConfigError::InvalidParameter {
                name: "alt_hash_count",
                reason: "at least one node must attest the default hash".into(),
            });
        }
        Ok(Self {
            params: Arc::new(params),
            network: Network::new(),
        })
    }

    pub fn params(&self) -> &HandelParams {
        &self.params
    }
}

impl Protocol for Handel {
    type N = HNode;

    fn init(&mut self) {
        let node_count = self.params.node_count;
        let alt_from = node_count - self.params.alt_hash_count;
        let mut nb = NodeBuilder::with_random_position();
        for id in 0..node_count {
            let own_hash = if id >= alt_from { ALT_HASH } else { DEFAULT_HASH };
            let (base, node) = {
                let rng = self.network.rng_mut();
                let base = nb.build(rng);
                let node = HNode::new(base.clone(), self.params.clone(), own_hash, rng);
                (base, node)
            };
            debug_assert_eq!(base.id, id);
            self.network.add_node(node);
        }

        let dissemination_period = self.params.dissemination_period;
        let pairing_time = self.params.pairing_time;
        for id in 0..node_count {
            self.network.register_periodic_task_with_condition(
                move |net| dissemination_cycle(net, id),
                1,
                dissemination_period,
                id,
                move |net| !net.node(id).all_outgoing_finished(),
            );
            self.network.register_periodic_task_with_condition(
                move |net| verification_cycle(net, id),
                1,
                pairing_time,
                id,
                move |net| !net.node(id).done,
            );
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

    fn network(&self) -> &Network<HNode> {
        &self.network
    }

    fn network_mut(&mut self) -> &mut Network<HNode> {
        &mut self.network
    }
}

fn dissemination_cycle(net: &mut Network<HNode>, id: NodeId) {
    let now = net.time();
    let (own_hash, batch) = {
        let node = net.node_mut(id);
        (node.own_hash, node.dissemination_batch(now))
    };
    for out in batch {
        let bytes = AGG_BASE_BYTES + out.attestations.len() * AGG_PER_ATTESTATION_BYTES;
        let payload: Arc<dyn Payload<HNode>> = Arc::new(SendAggregation {
            level: out.level,
            own_hash,
            incoming_complete: out.incoming_complete,
            attestations: out.attestations,
            bytes,
        });
        net.send(payload, id, out.dest);
    }
}

fn verification_cycle(net: &mut Network<HNode>, id: NodeId) {
    let now = net.time();
    let node = net.node_mut(id);
    if let Some((idx, agg)) = node.select_verification() {
        node.levels[idx].merge_incoming(&agg);
        node.refresh_outgoing(idx as u32);
    }

    let total = node.total_cardinality();
    if total >= node.params.threshold && !node.threshold_done {
        node.threshold_done = true;
        node.threshold_at = now;
        debug!(time = now, node = id, total, "threshold reached");
    }
    if total == node.params.node_count && !node.done {
        node.done = true;
        node.base.done_at = now;
        debug!(time = now, node = id, "aggregation complete");
    }
}

fn on_send_aggregation(net: &mut Network<HNode>, from: NodeId, to: NodeId, msg: &SendAggregation) {
    let node = net.node_mut(to);
    if msg.incoming_complete {
        // The sender has everything it needs at the level we share; no
        // point contacting it again.
        node.finished_peers.set(from);
    }
    let idx = msg.level as usize;
    assert!(idx >= 1 && idx < node.levels.len(), "bad level {idx}");
    if node.levels[idx].is_incoming_complete() {
        // Nothing left to learn at this level.
        return;
    }
    let rank = node.levels[idx].rank_of(from);
    node.levels[idx].queue_incoming(AggToVerify {
        from,
        own_hash: msg.own_hash,
        rank,
        attestations: msg.attestations.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn mk_node(id: NodeId, node_count: usize) -> HNode {
        let params = Arc::new(HandelParams {
            node_count,
            threshold: node_count,
            ..HandelParams::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let base = Node {
            id,
            x: 0,
            y: 0,
            down: false,
            byzantine: false,
            msg_sent: 0,
            msg_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            done_at: 0,
        };
        HNode::new(base, params, DEFAULT_HASH, &mut rng)
    }

    #[test]
    fn level_blocks_are_disjoint_and_cover_the_network() {
        let node = mk_node(5, 16);
        let mut all: Vec<NodeId> = node
            .levels
            .iter()
            .flat_map(|l| l.peers.iter().copied())
            .collect();
        all.push(5);
        all.sort_unstable();
        assert_eq!(all, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn level_sizes_double() {
        let node = mk_node(0, 16);
        let sizes: Vec<usize> = node.levels.iter().map(|l| l.peers_count).collect();
        assert_eq!(sizes, vec![1, 1, 2, 4, 8]);
    }

    #[test]
    fn outgoing_starts_with_the_own_attestation() {
        let node = mk_node(0, 8);
        for level in node.levels.iter().skip(1) {
            assert_eq!(level.outgoing_cardinality, 1);
        }
        assert_eq!(node.total_cardinality(), 1);
    }

    #[test]
    fn refresh_outgoing_unions_the_lower_levels() {
        let mut node = mk_node(0, 8);
        // Level 1 learns about node 1.
        node.levels[1].merge_incoming(&AggToVerify {
            from: 1,
            own_hash: DEFAULT_HASH,
            rank: 0,
            attestations: vec![Attestation::individual(DEFAULT_HASH, 1)],
        });
        node.refresh_outgoing(1);
        assert_eq!(node.levels[2].outgoing_cardinality, 2);
        assert_eq!(node.levels[3].outgoing_cardinality, 2);
        // Level 1's own offer is untouched.
        assert_eq!(node.levels[1].outgoing_cardinality, 1);
    }

    #[test]
    fn peer_relation_is_symmetric() {
        let count = 16;
        for a in 0..count {
            for b in 0..count {
                if a == b {
                    continue;
                }
                let na = mk_node(a, count);
                let nb = mk_node(b, count);
                let la = na.levels.iter().find(|l| l.peers.contains(&b)).unwrap();
                let lb = nb.levels.iter().find(|l| l.peers.contains(&a)).unwrap();
                assert_eq!(la.level, lb.level, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn rejects_bad_configs() {
        let bad = |p: HandelParams| Handel::new(p).is_err();
        assert!(bad(HandelParams {
            node_count: 12,
            ..HandelParams::default()
        }));
        assert!(bad(HandelParams {
            threshold: 0,
            ..HandelParams::default()
        }));
        assert!(bad(HandelParams {
            threshold: 1000,
            node_count: 256,
            ..HandelParams::default()
        }));
        assert!(bad(HandelParams {
            window_size: 0,
            ..HandelParams::default()
        }));
        assert!(bad(HandelParams {
            alt_hash_count: 256,
            node_count: 256,
            ..HandelParams::default()
        }));
    }
}

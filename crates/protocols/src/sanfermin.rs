//! San Fermín binomial-swap aggregation.
//!
//! Every node carries a binary id of width `L = log2(node_count)`. Two nodes
//! are candidates at level `l` when their ids share a prefix of length `l`
//! and differ at bit `l`. Starting from the deepest level, each node swaps
//! its running aggregate with one candidate per level, doubling the
//! aggregate and halving the remaining tree each time, so the full
//! aggregation needs only `O(log n)` exchanges per node.
//!
//! Aggregated signatures are modeled as integer sums: every node starts
//! with the value 1 and aggregation is addition. Verification is modeled as
//! a fixed `pairing_time` delay; signatures are always valid.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use aggsim_core::{
    ConfigError, Network, Node, NodeBuilder, NodeId, Payload, Protocol, SimNode,
};

/// Tunables of a San Fermín run. The one public construction surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanFerminParams {
    /// Number of nodes; must be a power of two >= 2.
    pub node_count: usize,
    /// Aggregate value at which a node records `threshold_at`.
    pub threshold: u64,
    /// Modeled signature-verification (pairing) time in ms.
    pub pairing_time: u64,
    /// Size of one (possibly aggregated) signature in bytes.
    pub signature_size: usize,
    /// How long to wait for a `SwapReply` before contacting new candidates.
    pub reply_timeout: u64,
    /// How many candidates to contact at once per level.
    pub candidate_count: usize,
    /// Shuffle each level's candidate list instead of walking it in id
    /// order.
    pub shuffled_lists: bool,
}

impl Default for SanFerminParams {
    fn default() -> Self {
        Self {
            node_count: 256,
            threshold: 192,
            pairing_time: 2,
            signature_size: 48,
            reply_timeout: 300,
            candidate_count: 1,
            shuffled_lists: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapStatus {
    Ok,
    No,
}

struct SwapRequest {
    level: u32,
    agg_value: u64,
    bytes: usize,
}

impl Payload<SanFerminNode> for SwapRequest {
    fn size(&self) -> usize {
        self.bytes
    }

    fn action(self: Arc<Self>, net: &mut Network<SanFerminNode>, from: NodeId, to: NodeId) {
        on_swap_request(net, from, to, &self);
    }
}

struct SwapReply {
    status: SwapStatus,
    level: u32,
    agg_value: u64,
    bytes: usize,
}

impl Payload<SanFerminNode> for SwapReply {
    fn size(&self) -> usize {
        self.bytes
    }

    fn action(self: Arc<Self>, net: &mut Network<SanFerminNode>, from: NodeId, to: NodeId) {
        on_swap_reply(net, from, to, &self);
    }
}

/// Per-node aggregation state.
pub struct SanFerminNode {
    base: Node,
    params: Arc<SanFerminParams>,
    /// Tree depth, `log2(node_count)`.
    levels: u32,
    /// The node id rendered as a fixed-width binary string; only for logs.
    pub binary_id: String,
    /// Remaining common-prefix length. Starts at `levels`, decremented on
    /// each level entry, 0 once the whole network is covered.
    pub current_prefix_length: u32,
    /// Running aggregate; each node contributes 1.
    pub agg_value: u64,
    /// Per-level lock held between accepting a swap and committing it after
    /// the pairing delay. At most one successful aggregation per level.
    is_swapping: bool,
    /// Own aggregate snapshotted at each level entry, plus values learned
    /// from already-passed levels; serves cached optimistic replies.
    signature_cache: BTreeMap<u32, u64>,
    /// Values received for levels not yet reached; consumed on level entry.
    future_sigs: BTreeMap<u32, u64>,
    /// Outstanding swap requests at the current level.
    pending_nodes: BTreeSet<NodeId>,
    /// Candidates already contacted, per level.
    used_candidates: BTreeMap<u32, aggsim_core::BitSet>,
    /// Per-level emission order, materialized lazily.
    candidate_lists: BTreeMap<u32, Vec<NodeId>>,
    /// When the aggregate first reached the threshold; 0 until then.
    pub threshold_at: u64,
    threshold_done: bool,
    /// Whether this node finished the whole protocol (`done_at` on the base
    /// record carries the time).
    pub done: bool,
    /// Swap requests this node initiated (as opposed to optimistic replies).
    pub sent_requests: u64,
    /// Swap requests received.
    pub received_requests: u64,
}

impl SimNode for SanFerminNode {
    fn base(&self) -> &Node {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Node {
        &mut self.base
    }
}

impl SanFerminNode {
    fn new(base: Node, params: Arc<SanFerminParams>) -> Self {
        let levels = params.node_count.trailing_zeros();
        let binary_id = format!("{:0width$b}", base.id, width = levels as usize);
        Self {
            base,
            params,
            levels,
            binary_id,
            current_prefix_length: levels,
            agg_value: 1,
            is_swapping: false,
            signature_cache: BTreeMap::new(),
            future_sigs: BTreeMap::new(),
            pending_nodes: BTreeSet::new(),
            used_candidates: BTreeMap::new(),
            candidate_lists: BTreeMap::new(),
            threshold_at: 0,
            threshold_done: false,
            done: false,
            sent_requests: 0,
            received_requests: 0,
        }
    }

    /// Ids sharing a prefix of length `level` with this node and differing
    /// at bit `level` — a contiguous id block of size `2^(levels-level-1)`.
    fn candidate_range(&self, level: u32) -> Range<NodeId> {
        debug_assert!(level < self.levels);
        let shift = self.levels - level - 1;
        let base = ((self.base.id >> shift) ^ 1) << shift;
        base..base + (1 << shift)
    }

    fn is_candidate_at(&self, level: u32, peer: NodeId) -> bool {
        level < self.levels && self.candidate_range(level).contains(&peer)
    }

    /// Next batch of unused candidates at `level`, in emission order,
    /// recorded in `used_candidates`. Empty once the pool is exhausted.
    fn pick_next_candidates(&mut self, level: u32, rng: &mut ChaCha8Rng) -> Vec<NodeId> {
        if level >= self.levels {
            return Vec::new();
        }
        if !self.candidate_lists.contains_key(&level) {
            let mut list: Vec<NodeId> = self.candidate_range(level).collect();
            if self.params.shuffled_lists {
                list.shuffle(rng);
            }
            self.candidate_lists.insert(level, list);
        }
        let used = self.used_candidates.entry(level).or_default();
        let picks: Vec<NodeId> = self.candidate_lists[&level]
            .iter()
            .copied()
            .filter(|&p| !used.get(p))
            .take(self.params.candidate_count)
            .collect();
        for &p in &picks {
            used.set(p);
        }
        picks
    }
}

/// Binomial-swap aggregation over a fresh kernel.
pub struct SanFermin {
    params: Arc<SanFerminParams>,
    network: Network<SanFerminNode>,
}

impl SanFermin {
    pub fn new(params: SanFerminParams) -> Result<Self, ConfigError> {
        if params.node_count < 2 || !params.node_count.is_power_of_two() {
            return Err(ConfigError::NodeCountNotPowerOfTwo(params.node_count));
        }
        if params.candidate_count == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "candidate_count",
                reason: "must contact at least one candidate per level".into(),
            });
        }
        Ok(Self {
            params: Arc::new(params),
            network: Network::new(),
        })
    }

    pub fn params(&self) -> &SanFerminParams {
        &self.params
    }

    /// Nodes that completed the full aggregation, in id order.
    pub fn finished_nodes(&self) -> impl Iterator<Item = &SanFerminNode> {
        self.network.nodes().filter(|n| n.done)
    }
}

impl Protocol for SanFermin {
    type N = SanFerminNode;

    fn init(&mut self) {
        let mut nb = NodeBuilder::with_random_position();
        for _ in 0..self.params.node_count {
            let base = nb.build(self.network.rng_mut());
            let node = SanFerminNode::new(base, self.params.clone());
            self.network.add_node(node);
        }
        for id in 0..self.params.node_count {
            self.network
                .register_task(move |net| go_next_level(net, id), 1, id);
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

    fn network(&self) -> &Network<SanFerminNode> {
        &self.network
    }

    fn network_mut(&mut self) -> &mut Network<SanFerminNode> {
        &mut self.network
    }
}

enum LevelStep {
    Finished,
    Reenter,
    Contact(Vec<NodeId>),
}

/// Enter the next level: snapshot the aggregate, release the swap lock and
/// either consume a value received ahead of time (tail-recursing into the
/// level below) or contact the first candidate batch.
fn go_next_level(net: &mut Network<SanFerminNode>, id: NodeId) {
    let now = net.time();
    let step = {
        let (node, rng) = net.node_mut_and_rng(id);
        if node.done {
            return;
        }
        let enough_sigs = node.agg_value >= node.params.threshold;
        if enough_sigs && !node.threshold_done {
            node.threshold_done = true;
            node.threshold_at = now + 2 * node.params.pairing_time;
            debug!(time = now, node = id, agg = node.agg_value, "threshold reached");
        }
        if node.current_prefix_length == 0 {
            node.base.done_at = now + 2 * node.params.pairing_time;
            node.done = true;
            debug!(time = now, node = id, agg = node.agg_value, "finished");
            LevelStep::Finished
        } else {
            node.current_prefix_length -= 1;
            let level = node.current_prefix_length;
            node.signature_cache.insert(level, node.agg_value);
            node.is_swapping = false;
            node.pending_nodes.clear();
            if let Some(&v) = node.future_sigs.get(&level) {
                node.agg_value += v;
                trace!(time = now, node = id, level, value = v, "consumed future value");
                LevelStep::Reenter
            } else {
                LevelStep::Contact(node.pick_next_candidates(level, rng))
            }
        }
    };
    match step {
        LevelStep::Finished => {}
        LevelStep::Reenter => go_next_level(net, id),
        LevelStep::Contact(candidates) => send_swap_requests(net, id, candidates),
    }
}

/// Send a `SwapRequest` to each candidate and arm the retry timeout. An
/// empty batch means the pool is exhausted: the node stays at this level
/// silently, which is legal — its aggregate just misses this level.
fn send_swap_requests(net: &mut Network<SanFerminNode>, id: NodeId, candidates: Vec<NodeId>) {
    if candidates.is_empty() {
        trace!(node = id, "no more candidates to pick");
        return;
    }
    let now = net.time();
    let (level, agg_value, signature_size, reply_timeout) = {
        let node = net.node_mut(id);
        node.pending_nodes.extend(candidates.iter().copied());
        node.sent_requests += candidates.len() as u64;
        (
            node.current_prefix_length,
            node.agg_value,
            node.params.signature_size,
            node.params.reply_timeout,
        )
    };
    let request: Arc<dyn Payload<SanFerminNode>> = Arc::new(SwapRequest {
        level,
        agg_value,
        bytes: 4 + signature_size,
    });
    net.send_many(request, now + 1, id, &candidates, 0);

    // Still waiting on an answer for this level at the deadline? Try the
    // next batch.
    net.register_task(
        move |net| {
            let retry = {
                let (node, rng) = net.node_mut_and_rng(id);
                if node.done || node.current_prefix_length != level {
                    None
                } else {
                    trace!(node = id, level, "swap request timeout");
                    Some(node.pick_next_candidates(level, rng))
                }
            };
            if let Some(batch) = retry {
                send_swap_requests(net, id, batch);
            }
        },
        now + reply_timeout,
        id,
    );
}

enum RequestOutcome {
    ReplyCached { level: u32, value: u64 },
    ReplyNo { level: u32 },
    ReplyBusy { level: u32, value: u64 },
    Accept(u64),
    Ignore,
}

/// The optimistic-reply path: a request for a level we already passed gets
/// the cached value; a request while the lock is held gets our current
/// aggregate without committing anything locally; a valid request at our
/// level commits a swap.
fn on_swap_request(net: &mut Network<SanFerminNode>, from: NodeId, to: NodeId, req: &SwapRequest) {
    let outcome = {
        let node = net.node_mut(to);
        node.received_requests += 1;
        if node.done || req.level != node.current_prefix_length {
            if let Some(&value) = node.signature_cache.get(&req.level) {
                RequestOutcome::ReplyCached {
                    level: req.level,
                    value,
                }
            } else {
                // A value we may want to keep: the signature is "valid" by
                // construction, so only candidacy matters.
                if node.is_candidate_at(req.level, from) {
                    if req.level < node.current_prefix_length {
                        node.future_sigs.insert(req.level, req.agg_value);
                    } else {
                        node.signature_cache.insert(req.level, req.agg_value);
                    }
                }
                RequestOutcome::ReplyNo {
                    level: node.current_prefix_length,
                }
            }
        } else if node.is_swapping {
            RequestOutcome::ReplyBusy {
                level: req.level,
                value: node.agg_value,
            }
        } else if node.is_candidate_at(node.current_prefix_length, from) {
            RequestOutcome::Accept(req.agg_value)
        } else {
            trace!(node = to, peer = from, level = req.level, "invalid swap request");
            RequestOutcome::Ignore
        }
    };
    match outcome {
        RequestOutcome::ReplyCached { level, value } | RequestOutcome::ReplyBusy { level, value } => {
            send_swap_reply(net, to, from, SwapStatus::Ok, level, value);
        }
        RequestOutcome::ReplyNo { level } => {
            send_swap_reply(net, to, from, SwapStatus::No, level, 0);
        }
        RequestOutcome::Accept(value) => transition(net, to, value),
        RequestOutcome::Ignore => {}
    }
}

enum ReplyOutcome {
    Accept(u64),
    PickNext,
    Ignore,
}

fn on_swap_reply(net: &mut Network<SanFerminNode>, from: NodeId, to: NodeId, rep: &SwapReply) {
    let outcome = {
        let node = net.node_mut(to);
        if rep.level != node.current_prefix_length || node.done || node.is_swapping {
            ReplyOutcome::Ignore
        } else {
            match rep.status {
                SwapStatus::Ok => {
                    if node.pending_nodes.contains(&from)
                        || node.is_candidate_at(node.current_prefix_length, from)
                    {
                        ReplyOutcome::Accept(rep.agg_value)
                    } else {
                        trace!(node = to, peer = from, "unexpected swap reply");
                        ReplyOutcome::Ignore
                    }
                }
                SwapStatus::No => {
                    if node.pending_nodes.contains(&from) {
                        ReplyOutcome::PickNext
                    } else {
                        trace!(node = to, peer = from, "unexpected NO reply");
                        ReplyOutcome::Ignore
                    }
                }
            }
        }
    };
    match outcome {
        ReplyOutcome::Accept(value) => transition(net, to, value),
        ReplyOutcome::PickNext => {
            let batch = {
                let (node, rng) = net.node_mut_and_rng(to);
                let level = node.current_prefix_length;
                node.pick_next_candidates(level, rng)
            };
            send_swap_requests(net, to, batch);
        }
        ReplyOutcome::Ignore => {}
    }
}

fn send_swap_reply(
    net: &mut Network<SanFerminNode>,
    from: NodeId,
    to: NodeId,
    status: SwapStatus,
    level: u32,
    value: u64,
) {
    let signature_size = net.node(from).params.signature_size;
    let reply: Arc<dyn Payload<SanFerminNode>> = Arc::new(SwapReply {
        status,
        level,
        agg_value: value,
        bytes: 4 + signature_size,
    });
    net.send(reply, from, to);
}

/// Commit a swap: hold the per-level lock over the verification delay, then
/// fold the incoming value in and enter the next level.
fn transition(net: &mut Network<SanFerminNode>, id: NodeId, incoming: u64) {
    let now = net.time();
    let pairing_time = {
        let node = net.node_mut(id);
        node.is_swapping = true;
        node.params.pairing_time
    };
    net.register_task(
        move |net| {
            {
                let commit_time = net.time();
                let node = net.node_mut(id);
                node.agg_value += incoming;
                debug!(
                    time = commit_time,
                    node = id,
                    level = node.current_prefix_length,
                    agg = node.agg_value,
                    "swap committed"
                );
            }
            go_next_level(net, id);
        },
        now + pairing_time,
        id,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(id: NodeId, node_count: usize) -> SanFerminNode {
        let params = Arc::new(SanFerminParams {
            node_count,
            ..SanFerminParams::default()
        });
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
        SanFerminNode::new(base, params)
    }

    #[test]
    fn binary_id_is_fixed_width() {
        assert_eq!(node_with(0, 8).binary_id, "000");
        assert_eq!(node_with(5, 8).binary_id, "101");
        assert_eq!(node_with(3, 16).binary_id, "0011");
    }

    #[test]
    fn candidate_ranges_partition_the_tree() {
        let n = node_with(0, 8);
        assert_eq!(n.candidate_range(2), 1..2);
        assert_eq!(n.candidate_range(1), 2..4);
        assert_eq!(n.candidate_range(0), 4..8);

        let n = node_with(5, 8);
        assert_eq!(n.candidate_range(2), 4..5);
        assert_eq!(n.candidate_range(1), 6..8);
        assert_eq!(n.candidate_range(0), 0..4);
    }

    #[test]
    fn candidacy_is_symmetric() {
        for count in [4usize, 8, 16] {
            let levels = count.trailing_zeros();
            for a in 0..count {
                for b in 0..count {
                    for level in 0..levels {
                        let na = node_with(a, count);
                        let nb = node_with(b, count);
                        assert_eq!(
                            na.is_candidate_at(level, b),
                            nb.is_candidate_at(level, a),
                            "a={a} b={b} level={level}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn picking_exhausts_the_pool() {
        use rand::SeedableRng;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut n = node_with(0, 8);
        // Level 0 has four candidates; candidate_count is 1.
        let mut seen = Vec::new();
        for _ in 0..4 {
            let batch = n.pick_next_candidates(0, &mut rng);
            assert_eq!(batch.len(), 1);
            seen.extend(batch);
        }
        assert!(n.pick_next_candidates(0, &mut rng).is_empty());
        seen.sort_unstable();
        assert_eq!(seen, vec![4, 5, 6, 7]);
    }

    #[test]
    fn future_value_reenters_the_level_without_any_messages() {
        let params = Arc::new(SanFerminParams {
            node_count: 2,
            threshold: 2,
            ..SanFerminParams::default()
        });
        let mut net: Network<SanFerminNode> = Network::new();
        net.set_latency(aggsim_core::NetworkLatency::none());
        let mut nb = NodeBuilder::new();
        for _ in 0..2 {
            let base = nb.build(net.rng_mut());
            net.add_node(SanFerminNode::new(base, params.clone()));
        }
        // Node 0 already learned level 0's value ahead of time.
        net.node_mut(0).future_sigs.insert(0, 1);
        net.register_task(|net| go_next_level(net, 0), 1, 0);
        net.run(1);

        let node = net.node(0);
        assert!(node.done);
        assert_eq!(node.agg_value, 2);
        assert!(node.threshold_at > 0);
        assert_eq!(node.base().msg_sent, 0, "no swap needed");
    }

    #[test]
    fn rejects_bad_configs() {
        let params = SanFerminParams {
            node_count: 6,
            ..SanFerminParams::default()
        };
        assert!(matches!(
            SanFermin::new(params),
            Err(ConfigError::NodeCountNotPowerOfTwo(6))
        ));

        let params = SanFerminParams {
            candidate_count: 0,
            ..SanFerminParams::default()
        };
        assert!(SanFermin::new(params).is_err());
    }
}

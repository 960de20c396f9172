//! Per-level aggregation state.
//!
//! A level owns the best aggregate received so far (`incoming`), the
//! individual contributions seen (`ind_incoming`, used to disambiguate
//! overlapping aggregates), the aggregate it offers peers (`outgoing`), a
//! queue of unverified incoming aggregates, and the round-robin peer
//! cursor. Cardinalities are capped by the level's peer count; exceeding
//! the cap is a fatal bug, not a recoverable condition.

use aggsim_core::{BitSet, NodeId};
use tracing::trace;

/// `(hash, contributors)` — the value being signed and who signed it.
/// Aggregates combine by bitset union; signatures are modeled as always
/// valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub hash: u64,
    pub who: BitSet,
}

impl Attestation {
    pub fn new(hash: u64, who: BitSet) -> Self {
        Self { hash, who }
    }

    pub fn individual(hash: u64, signer: NodeId) -> Self {
        Self {
            hash,
            who: BitSet::single(signer),
        }
    }

    pub fn cardinality(&self) -> usize {
        self.who.cardinality()
    }
}

/// An incoming aggregate waiting for verification.
#[derive(Debug, Clone)]
pub struct AggToVerify {
    /// Sender.
    pub from: NodeId,
    /// The hash the sender itself attests; its individual contribution.
    pub own_hash: u64,
    /// Sender's position in this level's emission order.
    pub rank: usize,
    /// The sender's outgoing aggregate, one attestation per hash.
    pub attestations: Vec<Attestation>,
}

/// One level of a node's aggregation tree.
pub(crate) struct HLevel {
    pub(crate) level: u32,
    /// `2^(level-1)` for level >= 1, 1 for level 0.
    pub(crate) peers_count: usize,
    /// Peers in emission order; empty at level 0.
    pub(crate) peers: Vec<NodeId>,
    pub(crate) incoming: std::collections::BTreeMap<u64, Attestation>,
    ind_incoming: std::collections::BTreeMap<u64, BitSet>,
    pub(crate) outgoing: std::collections::BTreeMap<u64, Attestation>,
    pub(crate) incoming_cardinality: usize,
    pub(crate) outgoing_cardinality: usize,
    to_verify_agg: Vec<AggToVerify>,
    /// No peer left to contact; the level is closed.
    pub(crate) outgoing_finished: bool,
    pos_in_level: usize,
    last_message_cardinality: usize,
    last_node: Option<NodeId>,
}

impl HLevel {
    /// Level 0 holds (and needs) only the node's own attestation; it is
    /// complete from the start and never sends.
    pub(crate) fn level0(node_id: NodeId, own_hash: u64) -> Self {
        let own = Attestation::individual(own_hash, node_id);
        let mut ind_incoming = std::collections::BTreeMap::new();
        ind_incoming.insert(own_hash, BitSet::single(node_id));
        let mut incoming = std::collections::BTreeMap::new();
        incoming.insert(own_hash, own);
        Self {
            level: 0,
            peers_count: 1,
            peers: Vec::new(),
            incoming,
            ind_incoming,
            outgoing: std::collections::BTreeMap::new(),
            incoming_cardinality: 1,
            outgoing_cardinality: 0,
            to_verify_agg: Vec::new(),
            outgoing_finished: true,
            pos_in_level: 0,
            last_message_cardinality: 0,
            last_node: None,
        }
    }

    /// A level on top of the previous ones, with its peers in emission
    /// order.
    ///
    /// # Panics
    ///
    /// Panics unless `peers.len() == 2^(level-1)`.
    pub(crate) fn new(level: u32, peers: Vec<NodeId>) -> Self {
        assert!(level >= 1);
        let peers_count = 1usize << (level - 1);
        assert!(
            peers.len() == peers_count,
            "level {level} needs {peers_count} peers, got {}",
            peers.len()
        );
        Self {
            level,
            peers_count,
            peers,
            incoming: std::collections::BTreeMap::new(),
            ind_incoming: std::collections::BTreeMap::new(),
            outgoing: std::collections::BTreeMap::new(),
            incoming_cardinality: 0,
            outgoing_cardinality: 0,
            to_verify_agg: Vec::new(),
            outgoing_finished: false,
            pos_in_level: 0,
            last_message_cardinality: 0,
            last_node: None,
        }
    }

    /// A level runs once its wait time has elapsed or its outgoing
    /// contribution is already complete; it stops for good once no peer
    /// remains to contact.
    pub(crate) fn is_open(&self, now: u64, level_wait_time: u64) -> bool {
        if self.outgoing_finished {
            return false;
        }
        now >= u64::from(self.level - 1) * level_wait_time || self.is_outgoing_complete()
    }

    pub(crate) fn is_incoming_complete(&self) -> bool {
        self.incoming_cardinality == self.peers_count
    }

    pub(crate) fn is_outgoing_complete(&self) -> bool {
        self.outgoing_cardinality == self.peers_count
    }

    /// Sender's position in the emission order.
    pub(crate) fn rank_of(&self, peer: NodeId) -> usize {
        self.peers
            .iter()
            .position(|&p| p == peer)
            .unwrap_or(self.peers.len())
    }

    pub(crate) fn queue_incoming(&mut self, agg: AggToVerify) {
        self.to_verify_agg.push(agg);
    }

    #[cfg(test)]
    pub(crate) fn pending_verifications(&self) -> usize {
        self.to_verify_agg.len()
    }

    /// Next `peers_ct` peers in rotation, skipping peers that reported
    /// completion and blacklisted peers. A full fruitless revolution closes
    /// the level. Reaching the recipient of the previous send while the
    /// outgoing cardinality has not grown stops the scan: no point sending
    /// the same payload to the same peer twice. The skip and the closure
    /// checks are independent: every slot is tested for closure first, and
    /// a suppression stop that completes an empty revolution closes the
    /// level too, so a level can never sit open with nothing left to send.
    pub(crate) fn get_remaining_peers(
        &mut self,
        finished: &BitSet,
        blacklist: &BitSet,
        mut peers_ct: usize,
    ) -> Vec<NodeId> {
        let mut res = Vec::with_capacity(peers_ct);
        let start = self.pos_in_level;
        while peers_ct > 0 && !self.outgoing_finished {
            let p = self.peers[self.pos_in_level];
            self.pos_in_level += 1;
            if self.pos_in_level >= self.peers.len() {
                self.pos_in_level = 0;
            }

            if finished.get(p) || blacklist.get(p) {
                if self.pos_in_level == start {
                    self.outgoing_finished = true;
                }
                continue;
            }

            // The peer would be contacted; hold the send if it already saw
            // this exact payload.
            if Some(p) == self.last_node && self.last_message_cardinality == self.outgoing_cardinality
            {
                if self.pos_in_level == start && res.is_empty() {
                    self.outgoing_finished = true;
                }
                break;
            }

            res.push(p);
            peers_ct -= 1;
        }

        if let Some(&first) = res.first() {
            if self.outgoing_cardinality > self.last_message_cardinality {
                self.last_message_cardinality = self.outgoing_cardinality;
                self.last_node = Some(first);
            }
        }
        res
    }

    /// Projected incoming cardinality if `sig` were merged in, attestation
    /// by attestation: disjoint sets add up, overlapping ones fall back to
    /// re-aggregating the individual contributions we kept.
    ///
    /// # Panics
    ///
    /// Panics if the projection exceeds the level's peer count — that can
    /// only happen if a contributor leaked across levels.
    pub(crate) fn size_if_merged(&self, sig: &AggToVerify) -> usize {
        let mut remaining: std::collections::BTreeMap<u64, &Attestation> =
            self.incoming.iter().map(|(h, a)| (*h, a)).collect();

        let mut size = 0;
        for av in &sig.attestations {
            match remaining.remove(&av.hash) {
                None => size += av.cardinality(),
                Some(our) if !our.who.intersects(&av.who) => {
                    size += our.cardinality() + av.cardinality();
                }
                Some(our) => {
                    let merged_cardinality = match self.ind_incoming.get(&our.hash) {
                        Some(indivs) => {
                            let mut merged = indivs.clone();
                            merged.union_with(&av.who);
                            merged.cardinality()
                        }
                        None => av.cardinality(),
                    };
                    size += merged_cardinality.max(our.cardinality());
                }
            }
        }
        for our in remaining.values() {
            size += our.cardinality();
        }

        assert!(
            size <= self.peers_count,
            "projected cardinality {size} exceeds level capacity {} at level {}",
            self.peers_count,
            self.level
        );
        size
    }

    /// Merge a verified aggregate into `incoming`, keeping the sender's
    /// individual contribution for later overlap disambiguation.
    ///
    /// # Panics
    ///
    /// Panics if the resulting cardinality exceeds the level's peer count.
    pub(crate) fn merge_incoming(&mut self, aggv: &AggToVerify) {
        self.ind_incoming
            .entry(aggv.own_hash)
            .or_default()
            .set(aggv.from);

        for av in &aggv.attestations {
            let existing = self.incoming.get(&av.hash).cloned();
            match existing {
                None => {
                    self.incoming.insert(av.hash, av.clone());
                    self.incoming_cardinality += av.cardinality();
                }
                Some(our) if !our.who.intersects(&av.who) => {
                    let mut both = our.clone();
                    both.who.union_with(&av.who);
                    self.incoming_cardinality += av.cardinality();
                    self.incoming.insert(both.hash, both);
                }
                Some(our) => {
                    let merged = match self.ind_incoming.get(&our.hash) {
                        Some(indivs) => {
                            let mut merged = indivs.clone();
                            merged.union_with(&av.who);
                            merged
                        }
                        None => av.who.clone(),
                    };
                    if merged.cardinality() > our.cardinality() {
                        self.incoming_cardinality -= our.cardinality();
                        self.incoming_cardinality += merged.cardinality();
                        self.incoming
                            .insert(our.hash, Attestation::new(our.hash, merged));
                    }
                }
            }
        }

        assert!(
            self.incoming_cardinality <= self.peers_count,
            "incoming cardinality {} exceeds level capacity {} at level {}",
            self.incoming_cardinality,
            self.peers_count,
            self.level
        );
    }

    /// Replace the outgoing aggregate (recomputed from the lower levels).
    pub(crate) fn set_outgoing(&mut self, outgoing: std::collections::BTreeMap<u64, Attestation>) {
        self.outgoing_cardinality = outgoing.values().map(Attestation::cardinality).sum();
        assert!(
            self.outgoing_cardinality <= self.peers_count,
            "outgoing cardinality {} exceeds level capacity {} at level {}",
            self.outgoing_cardinality,
            self.peers_count,
            self.level
        );
        self.outgoing = outgoing;
    }

    /// Pick the queued aggregate to verify next: prune everything that can
    /// no longer improve the incoming set, then take the best projected
    /// merge. Once incoming is complete the queue is cleared for good.
    pub(crate) fn best_to_verify(
        &mut self,
        window_size: usize,
        blacklist: &BitSet,
    ) -> Option<AggToVerify> {
        assert!(window_size >= 1, "verification window must be at least 1");
        if self.to_verify_agg.is_empty() {
            return None;
        }
        if self.is_incoming_complete() {
            self.to_verify_agg.clear();
            return None;
        }

        let items = std::mem::take(&mut self.to_verify_agg);
        let mut window_index = usize::MAX;
        let mut kept: Vec<(usize, AggToVerify)> = Vec::with_capacity(items.len());
        for atv in items {
            if blacklist.get(atv.from) {
                continue;
            }
            let projected = self.size_if_merged(&atv);
            if projected <= self.incoming_cardinality {
                // Cannot improve; drop it for good.
                continue;
            }
            window_index = window_index.min(atv.rank);
            kept.push((projected, atv));
        }

        let mut best: Option<usize> = None;
        let mut best_score = 0;
        for (i, (projected, _)) in kept.iter().enumerate() {
            if *projected > best_score {
                best_score = *projected;
                best = Some(i);
            }
        }

        let chosen = best.map(|i| kept.remove(i).1);
        self.to_verify_agg = kept.into_iter().map(|(_, atv)| atv).collect();
        if let Some(atv) = &chosen {
            trace!(
                level = self.level,
                from = atv.from,
                rank = atv.rank,
                window_index,
                projected = best_score,
                "selected aggregate to verify"
            );
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(ids: &[usize]) -> BitSet {
        ids.iter().copied().collect()
    }

    fn agg(from: NodeId, attestations: Vec<Attestation>) -> AggToVerify {
        AggToVerify {
            from,
            own_hash: 0,
            rank: 0,
            attestations,
        }
    }

    /// A level-3 object (4 peers: 4..8) seen from node 0's side.
    fn level3() -> HLevel {
        HLevel::new(3, vec![4, 5, 6, 7])
    }

    #[test]
    fn level0_is_complete_and_closed() {
        let l = HLevel::level0(3, 0);
        assert!(l.is_incoming_complete());
        assert!(!l.is_open(1_000_000, 1));
        assert_eq!(l.incoming_cardinality, 1);
    }

    #[test]
    fn merge_disjoint_adds_up() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5]))]));
        assert_eq!(l.incoming_cardinality, 2);
        l.merge_incoming(&agg(6, vec![Attestation::new(0, bits(&[6, 7]))]));
        assert_eq!(l.incoming_cardinality, 4);
        assert!(l.is_incoming_complete());
    }

    #[test]
    fn merge_overlap_uses_kept_individuals() {
        let mut l = level3();
        // Individual contributions from 4 and 5 arrive first.
        l.merge_incoming(&AggToVerify {
            from: 4,
            own_hash: 0,
            rank: 0,
            attestations: vec![Attestation::individual(0, 4)],
        });
        l.merge_incoming(&AggToVerify {
            from: 5,
            own_hash: 0,
            rank: 1,
            attestations: vec![Attestation::new(0, bits(&[4, 5]))],
        });
        assert_eq!(l.incoming_cardinality, 2);
        // {5,6,7} overlaps {4,5}; re-aggregating the individuals 4,5 with
        // the new set yields {4,5,6,7}.
        l.merge_incoming(&agg(6, vec![Attestation::new(0, bits(&[5, 6, 7]))]));
        assert_eq!(l.incoming_cardinality, 4);
    }

    #[test]
    fn merge_overlap_keeps_the_better_existing() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5, 6]))]));
        // {6} is a strict subset; re-aggregating the kept individuals
        // {4,6} with it is still worse than {4,5,6}. Nothing changes.
        l.merge_incoming(&agg(6, vec![Attestation::new(0, bits(&[6]))]));
        assert_eq!(l.incoming_cardinality, 3);
    }

    #[test]
    fn merge_multi_hash_counts_each_contributor_once() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5]))]));
        l.merge_incoming(&agg(6, vec![Attestation::new(1, bits(&[6, 7]))]));
        assert_eq!(l.incoming.len(), 2);
        assert_eq!(l.incoming_cardinality, 4);
        assert!(l.is_incoming_complete());
    }

    #[test]
    fn size_if_merged_projects_without_mutating() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5]))]));
        let projected = l.size_if_merged(&agg(6, vec![Attestation::new(0, bits(&[6, 7]))]));
        assert_eq!(projected, 4);
        assert_eq!(l.incoming_cardinality, 2, "projection must not mutate");
    }

    #[test]
    #[should_panic(expected = "exceeds level capacity")]
    fn cardinality_over_capacity_is_fatal() {
        let mut l = level3();
        // A contributor from outside the level's block sneaks in.
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5, 6, 7, 9]))]));
    }

    #[test]
    fn best_to_verify_prefers_the_biggest_merge() {
        let mut l = level3();
        let none = BitSet::new();
        l.queue_incoming(AggToVerify {
            from: 4,
            own_hash: 0,
            rank: 0,
            attestations: vec![Attestation::new(0, bits(&[4]))],
        });
        l.queue_incoming(AggToVerify {
            from: 5,
            own_hash: 0,
            rank: 1,
            attestations: vec![Attestation::new(0, bits(&[4, 5, 6]))],
        });
        let chosen = l.best_to_verify(4, &none).expect("one must be chosen");
        assert_eq!(chosen.from, 5);
        // The smaller one stays queued.
        assert_eq!(l.pending_verifications(), 1);
    }

    #[test]
    fn best_to_verify_prunes_blacklisted_and_useless() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5]))]));

        let mut blacklist = BitSet::new();
        blacklist.set(6);
        // Blacklisted sender.
        l.queue_incoming(AggToVerify {
            from: 6,
            own_hash: 0,
            rank: 2,
            attestations: vec![Attestation::new(0, bits(&[6, 7]))],
        });
        // Subset of what we already have: can't improve.
        l.queue_incoming(AggToVerify {
            from: 5,
            own_hash: 0,
            rank: 1,
            attestations: vec![Attestation::new(0, bits(&[4]))],
        });
        assert!(l.best_to_verify(4, &blacklist).is_none());
        assert_eq!(l.pending_verifications(), 0);
    }

    #[test]
    fn complete_incoming_clears_the_queue() {
        let mut l = level3();
        l.merge_incoming(&agg(4, vec![Attestation::new(0, bits(&[4, 5, 6, 7]))]));
        l.queue_incoming(AggToVerify {
            from: 5,
            own_hash: 0,
            rank: 1,
            attestations: vec![Attestation::new(0, bits(&[5]))],
        });
        assert!(l.best_to_verify(4, &BitSet::new()).is_none());
        assert_eq!(l.pending_verifications(), 0);
    }

    #[test]
    fn rotation_skips_finished_and_closes_on_exhaustion() {
        let mut l = level3();
        let mut finished = BitSet::new();
        finished.set(4);
        finished.set(6);
        let none = BitSet::new();

        assert_eq!(l.get_remaining_peers(&finished, &none, 1), vec![5]);
        assert_eq!(l.get_remaining_peers(&finished, &none, 1), vec![7]);

        finished.set(5);
        finished.set(7);
        assert!(l.get_remaining_peers(&finished, &none, 1).is_empty());
        assert!(l.outgoing_finished);
        assert!(!l.is_open(1_000_000, 1));
    }

    #[test]
    fn unchanged_payload_to_same_peer_is_suppressed() {
        let mut l = HLevel::new(1, vec![4]);
        let mut outgoing = std::collections::BTreeMap::new();
        outgoing.insert(0, Attestation::individual(0, 0));
        l.set_outgoing(outgoing);
        let none = BitSet::new();

        // First cycle reaches the peer.
        assert_eq!(l.get_remaining_peers(&none, &none, 1), vec![4]);
        // Cardinality unchanged, cursor back at the same peer: no send, and
        // the suppressed slot completed an empty revolution, so the level
        // closes instead of idling forever.
        assert!(l.get_remaining_peers(&none, &none, 1).is_empty());
        assert!(l.outgoing_finished);
    }

    #[test]
    fn suppressed_last_candidate_still_closes_the_level() {
        let mut l = level3();
        let mut outgoing = std::collections::BTreeMap::new();
        outgoing.insert(0, Attestation::individual(0, 0));
        l.set_outgoing(outgoing);
        let none = BitSet::new();
        let mut finished = BitSet::new();

        // First cycle sends to the head of the rotation.
        assert_eq!(l.get_remaining_peers(&finished, &none, 1), vec![4]);

        // Everyone else reports completion; the only candidate left is the
        // previous recipient, with nothing new to offer it.
        finished.set(5);
        finished.set(6);
        finished.set(7);
        assert!(l.get_remaining_peers(&finished, &none, 1).is_empty());
        assert!(
            l.outgoing_finished,
            "a revolution of finished peers ending on the suppressed one must close the level"
        );
        assert!(!l.is_open(1_000_000, 1));
    }

    #[test]
    fn grown_payload_resumes_the_rotation() {
        let mut l = HLevel::new(2, vec![4, 5]);
        let mut outgoing = std::collections::BTreeMap::new();
        outgoing.insert(0, Attestation::individual(0, 0));
        l.set_outgoing(outgoing);
        let none = BitSet::new();

        assert_eq!(l.get_remaining_peers(&none, &none, 1), vec![4]);
        assert_eq!(l.get_remaining_peers(&none, &none, 1), vec![5]);
        // Back at the previous recipient with nothing new to offer.
        assert!(l.get_remaining_peers(&none, &none, 1).is_empty());

        let mut grown = std::collections::BTreeMap::new();
        grown.insert(0, Attestation::new(0, bits(&[0, 1])));
        l.set_outgoing(grown);
        assert_eq!(l.get_remaining_peers(&none, &none, 1), vec![5]);
    }
}

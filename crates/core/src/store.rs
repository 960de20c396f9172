//! Time-bucketed message store.
//!
//! Optimized for "many events in the same millisecond, bounded horizon": a
//! vector of fixed-duration slots, each holding one array indexed by
//! `arrival % SLOT_DURATION` whose entries are singly-linked chains of
//! envelopes arriving that millisecond. New envelopes are prepended, so
//! within one millisecond the order is LIFO — not observable across
//! components, but reproducible, which is what determinism needs.

use crate::message::Envelope;
use crate::node::SimNode;

/// Width of one slot in virtual milliseconds.
pub const SLOT_DURATION: u64 = 60_000;

/// One fixed window of the store, aligned to a `SLOT_DURATION` boundary.
struct MsgsSlot<N: SimNode> {
    start_time: u64,
    end_time: u64,
    by_ms: Vec<Option<Box<Envelope<N>>>>,
}

impl<N: SimNode> MsgsSlot<N> {
    fn new(start_time: u64) -> Self {
        let start_time = start_time - start_time % SLOT_DURATION;
        Self {
            start_time,
            end_time: start_time + SLOT_DURATION,
            by_ms: std::iter::repeat_with(|| None)
                .take(SLOT_DURATION as usize)
                .collect(),
        }
    }

    fn pos(&self, time: u64) -> usize {
        assert!(
            time >= self.start_time && time < self.end_time,
            "time {time} outside slot [{}, {})",
            self.start_time,
            self.end_time
        );
        (time % SLOT_DURATION) as usize
    }

    fn add(&mut self, mut env: Box<Envelope<N>>, arrival: u64) {
        let pos = self.pos(arrival);
        env.next_same_time = self.by_ms[pos].take();
        self.by_ms[pos] = Some(env);
    }

    fn peek(&self, time: u64) -> Option<&Envelope<N>> {
        self.by_ms[self.pos(time)].as_deref()
    }

    fn poll(&mut self, time: u64) -> Option<Box<Envelope<N>>> {
        let pos = self.pos(time);
        let mut head = self.by_ms[pos].take()?;
        self.by_ms[pos] = head.next_same_time.take();
        Some(head)
    }

    fn size(&self) -> usize {
        self.by_ms
            .iter()
            .map(|head| {
                let mut count = 0;
                let mut cur = head.as_deref();
                while let Some(env) = cur {
                    count += 1;
                    cur = env.next_same_time.as_deref();
                }
                count
            })
            .sum()
    }

    #[cfg(test)]
    fn peek_first(&self) -> Option<&Envelope<N>> {
        self.by_ms.iter().find_map(|head| head.as_deref())
    }
}

/// The kernel's message queue.
pub(crate) struct MessageStore<N: SimNode> {
    slots: Vec<MsgsSlot<N>>,
}

impl<N: SimNode> MessageStore<N> {
    pub(crate) fn new(now: u64) -> Self {
        Self {
            slots: vec![MsgsSlot::new(now)],
        }
    }

    /// Enqueue an envelope at its precomputed arrival time.
    ///
    /// # Panics
    ///
    /// Panics if `arrival < now` — nothing may be scheduled into the past.
    pub(crate) fn add(&mut self, env: Box<Envelope<N>>, arrival: u64, now: u64) {
        assert!(
            arrival >= now,
            "can't add a message arriving in the past: arrival={arrival}, time={now}"
        );
        self.find_slot(arrival, now).add(env, arrival);
    }

    /// Drop leading slots entirely in the past, then append slots until one
    /// covers `time`, and return it.
    fn find_slot(&mut self, time: u64, now: u64) -> &mut MsgsSlot<N> {
        self.cleanup(now);
        self.ensure_size(time);
        let idx = ((time - self.slots[0].start_time) / SLOT_DURATION) as usize;
        &mut self.slots[idx]
    }

    fn cleanup(&mut self, now: u64) {
        while !self.slots.is_empty() && now >= self.slots[0].end_time {
            self.slots.remove(0);
        }
        if self.slots.is_empty() {
            self.slots.push(MsgsSlot::new(now));
        }
    }

    fn ensure_size(&mut self, time: u64) {
        while self.slots.last().expect("at least one slot").end_time <= time {
            let next_start = self.slots.last().expect("at least one slot").end_time;
            self.slots.push(MsgsSlot::new(next_start));
        }
    }

    #[cfg(test)]
    pub(crate) fn peek(&mut self, time: u64, now: u64) -> Option<&Envelope<N>> {
        self.find_slot(time, now).peek(time)
    }

    pub(crate) fn poll(&mut self, time: u64, now: u64) -> Option<Box<Envelope<N>>> {
        self.find_slot(time, now).poll(time)
    }

    /// Total number of queued envelopes. Walks every chain; meant for tests
    /// and assertions, not the hot path.
    pub(crate) fn size(&self) -> usize {
        self.slots.iter().map(MsgsSlot::size).sum()
    }

    /// Envelopes queued at exactly `time`.
    pub(crate) fn size_at(&mut self, time: u64, now: u64) -> usize {
        let mut count = 0;
        let mut cur = self.find_slot(time, now).peek(time);
        while let Some(env) = cur {
            count += 1;
            cur = env.next_same_time.as_deref();
        }
        count
    }

    /// The earliest queued envelope, if any.
    #[cfg(test)]
    pub(crate) fn peek_first(&self) -> Option<&Envelope<N>> {
        self.slots.iter().find_map(MsgsSlot::peek_first)
    }

    /// Drop everything and re-seed with a single slot at the current time.
    pub(crate) fn clear(&mut self, now: u64) {
        self.slots.clear();
        self.cleanup(now);
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::network::Network;
    use crate::node::{Node, NodeId};
    use std::sync::Arc;

    /// Test payload whose size tags the envelope so ordering is observable.
    struct Dummy(usize);

    impl Payload<Node> for Dummy {
        fn size(&self) -> usize {
            self.0
        }

        fn action(self: Arc<Self>, _net: &mut Network<Node>, _from: NodeId, _to: NodeId) {}
    }

    fn env(arrival: u64) -> Box<Envelope<Node>> {
        tagged_env(arrival, 10)
    }

    fn tagged_env(arrival: u64, tag: usize) -> Box<Envelope<Node>> {
        Envelope::single(Arc::new(Dummy(tag)), 0, 1, arrival)
    }

    #[test]
    fn lifo_within_one_millisecond() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        store.add(tagged_env(1, 1), 1, 0);
        store.add(tagged_env(1, 2), 1, 0);

        assert!(store.peek(2, 0).is_none());
        assert_eq!(store.size_at(1, 0), 2);
        // Most recently inserted comes out first.
        assert_eq!(store.peek(1, 0).unwrap().payload().size(), 2);
        assert_eq!(store.poll(1, 0).unwrap().payload().size(), 2);
        assert_eq!(store.poll(1, 0).unwrap().payload().size(), 1);
        assert!(store.peek(1, 0).is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn slot_growth_and_reclaim() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        store.add(env(1), 1, 0);
        assert_eq!(store.slot_count(), 1);

        // An arrival past the first window appends a second slot.
        store.add(env(SLOT_DURATION + 1), SLOT_DURATION + 1, 0);
        assert_eq!(store.slot_count(), 2);

        // Once time has moved past the first window, adding reclaims it.
        let now = SLOT_DURATION + 1;
        store.add(env(SLOT_DURATION + 2), SLOT_DURATION + 2, now);
        assert_eq!(store.slot_count(), 1);
    }

    #[test]
    fn boundary_arrival_lands_in_second_slot() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        assert!(store.peek(SLOT_DURATION, 0).is_none());
        store.add(env(SLOT_DURATION), SLOT_DURATION, 0);
        assert!(store.peek(SLOT_DURATION, 0).is_some());
        assert_eq!(store.slot_count(), 2);
    }

    #[test]
    fn far_future_arrival() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        let t = 10 * 60 * 1000 + 1;
        assert!(store.peek(t, 0).is_none());
        assert!(store.peek_first().is_none());
        store.add(env(t), t, 0);
        assert!(store.peek(t, 0).is_some());
        assert!(store.peek_first().is_some());
    }

    #[test]
    #[should_panic(expected = "arriving in the past")]
    fn adding_into_the_past_is_fatal() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        store.add(env(5), 5, 10);
    }

    #[test]
    fn clear_reseeds_one_slot() {
        let mut store: MessageStore<Node> = MessageStore::new(0);
        store.add(env(SLOT_DURATION + 1), SLOT_DURATION + 1, 0);
        store.clear(0);
        assert_eq!(store.size(), 0);
        assert_eq!(store.slot_count(), 1);
    }
}

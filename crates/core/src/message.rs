//! Message payloads, tasks and envelopes.
//!
//! A payload is anything that can arrive at a node: a protocol message with
//! a byte size, or a task — a size-0 payload whose action runs a captured
//! closure at its owner. Envelopes are the store's unit of work: one payload
//! plus a delivery plan of one or more `(dest, arrival)` pairs sorted by
//! arrival, consumed through a cursor.

use std::sync::Arc;

use crate::latency::{pseudo_random, NetworkLatency};
use crate::network::Network;
use crate::node::{NodeId, Registry, SimNode};

/// Behavior invoked when a payload arrives at a node.
///
/// `action` receives the kernel so it can inspect and mutate node state and
/// schedule further events; handlers run to completion without preemption.
pub trait Payload<N: SimNode>: 'static {
    /// Payload size in bytes, used only for traffic accounting. Must be
    /// non-zero for anything that is not a task.
    fn size(&self) -> usize;

    /// Deliver the payload to `to`.
    fn action(self: Arc<Self>, net: &mut Network<N>, from: NodeId, to: NodeId);

    /// Tasks bypass receive accounting.
    fn is_task(&self) -> bool {
        false
    }
}

/// One-shot closure task.
pub(crate) struct Task<N: SimNode> {
    pub(crate) run: Box<dyn Fn(&mut Network<N>)>,
}

impl<N: SimNode> Payload<N> for Task<N> {
    fn size(&self) -> usize {
        0
    }

    fn action(self: Arc<Self>, net: &mut Network<N>, _from: NodeId, _to: NodeId) {
        (self.run)(net);
    }

    fn is_task(&self) -> bool {
        true
    }
}

/// Self-rescheduling task. If a continuation condition is present and
/// fails, the task stops for good; otherwise it runs and re-enqueues itself
/// `period` ms later.
pub(crate) struct PeriodicTask<N: SimNode> {
    pub(crate) run: Box<dyn Fn(&mut Network<N>)>,
    pub(crate) owner: NodeId,
    pub(crate) period: u64,
    pub(crate) cond: Option<Box<dyn Fn(&Network<N>) -> bool>>,
}

impl<N: SimNode> Payload<N> for PeriodicTask<N> {
    fn size(&self) -> usize {
        0
    }

    fn action(self: Arc<Self>, net: &mut Network<N>, _from: NodeId, _to: NodeId) {
        if let Some(cond) = &self.cond {
            if !cond(net) {
                return;
            }
        }
        (self.run)(net);
        let at = net.time() + self.period;
        let owner = self.owner;
        net.enqueue_single(self, owner, owner, at);
    }

    fn is_task(&self) -> bool {
        true
    }
}

/// A `(destination, arrival time)` pair inside a multi-destination plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageArrival {
    pub dest: NodeId,
    pub arrival: u64,
}

/// Delivery plan of an envelope, from narrowest to widest.
enum Plan {
    /// One destination with a precomputed arrival.
    Single { dest: NodeId, arrival: u64, read: bool },
    /// Many destinations sharing one send time. Stores only the destination
    /// ids (sorted by arrival) plus the send time and per-send random seed;
    /// arrivals are recomputed from the latency model on demand. This is
    /// why the latency model cannot change while messages are in flight.
    MultiSameSend {
        dests: Vec<NodeId>,
        send_time: u64,
        random_seed: i32,
        next_reader: usize,
    },
    /// Many destinations with explicit arrivals (staggered sends).
    MultiWithDelay {
        arrivals: Vec<MessageArrival>,
        next_reader: usize,
    },
}

/// The store's unit of work: payload, origin, delivery plan, and the
/// intrusive pointer chaining envelopes that arrive in the same millisecond.
pub struct Envelope<N: SimNode> {
    pub(crate) payload: Arc<dyn Payload<N>>,
    pub(crate) from: NodeId,
    plan: Plan,
    pub(crate) next_same_time: Option<Box<Envelope<N>>>,
}

impl<N: SimNode> Envelope<N> {
    pub(crate) fn single(
        payload: Arc<dyn Payload<N>>,
        from: NodeId,
        dest: NodeId,
        arrival: u64,
    ) -> Box<Self> {
        Box::new(Self {
            payload,
            from,
            plan: Plan::Single {
                dest,
                arrival,
                read: false,
            },
            next_same_time: None,
        })
    }

    /// `dests` must already be sorted by their recomputed arrival times.
    pub(crate) fn multi_same_send(
        payload: Arc<dyn Payload<N>>,
        from: NodeId,
        dests: Vec<NodeId>,
        send_time: u64,
        random_seed: i32,
    ) -> Box<Self> {
        Box::new(Self {
            payload,
            from,
            plan: Plan::MultiSameSend {
                dests,
                send_time,
                random_seed,
                next_reader: 0,
            },
            next_same_time: None,
        })
    }

    /// `arrivals` must already be sorted by arrival time.
    pub(crate) fn multi_with_delay(
        payload: Arc<dyn Payload<N>>,
        from: NodeId,
        arrivals: Vec<MessageArrival>,
    ) -> Box<Self> {
        Box::new(Self {
            payload,
            from,
            plan: Plan::MultiWithDelay {
                arrivals,
                next_reader: 0,
            },
            next_same_time: None,
        })
    }

    /// Arrival time of the next unread destination.
    ///
    /// # Panics
    ///
    /// Panics if every destination has been read.
    pub(crate) fn next_arrival_time(&self, nodes: &Registry<N>, latency: &NetworkLatency) -> u64 {
        match &self.plan {
            Plan::Single { arrival, read, .. } => {
                assert!(!*read, "envelope already fully read");
                *arrival
            }
            Plan::MultiSameSend {
                dests,
                send_time,
                random_seed,
                next_reader,
            } => {
                let dest = dests[*next_reader];
                let from = nodes.get(self.from).base();
                let to = nodes.get(dest).base();
                send_time + latency.latency(from, to, pseudo_random(dest, *random_seed))
            }
            Plan::MultiWithDelay {
                arrivals,
                next_reader,
            } => arrivals[*next_reader].arrival,
        }
    }

    /// Destination of the next unread delivery.
    pub(crate) fn next_dest(&self) -> NodeId {
        match &self.plan {
            Plan::Single { dest, .. } => *dest,
            Plan::MultiSameSend {
                dests, next_reader, ..
            } => dests[*next_reader],
            Plan::MultiWithDelay {
                arrivals,
                next_reader,
            } => arrivals[*next_reader].dest,
        }
    }

    /// Advance the cursor past the destination just delivered.
    pub(crate) fn mark_read(&mut self) {
        match &mut self.plan {
            Plan::Single { read, .. } => *read = true,
            Plan::MultiSameSend { next_reader, .. } | Plan::MultiWithDelay { next_reader, .. } => {
                *next_reader += 1
            }
        }
    }

    /// True while at least one destination remains unread.
    pub(crate) fn has_next_reader(&self) -> bool {
        match &self.plan {
            Plan::Single { read, .. } => !*read,
            Plan::MultiSameSend {
                dests, next_reader, ..
            } => *next_reader < dests.len(),
            Plan::MultiWithDelay {
                arrivals,
                next_reader,
            } => *next_reader < arrivals.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn payload(&self) -> &Arc<dyn Payload<N>> {
        &self.payload
    }
}

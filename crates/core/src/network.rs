//! The event kernel: registry, virtual time, send paths and the step loop.

use std::sync::Arc;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::latency::{pseudo_random, NetworkLatency};
use crate::message::{Envelope, MessageArrival, Payload, PeriodicTask, Task};
use crate::node::{Node, NodeId, Registry, SimNode, MAX_X};
use crate::store::MessageStore;

/// Condition task entry. Lives outside the message queue: conditions are
/// re-evaluated whenever the step loop crosses into a new delivery time.
struct ConditionalTask<N: SimNode> {
    run: Box<dyn Fn(&mut Network<N>)>,
    start_if: Box<dyn Fn(&Network<N>) -> bool>,
    repeat_if: Box<dyn Fn(&Network<N>) -> bool>,
    min_start_time: u64,
    duration: u64,
    #[allow(dead_code)]
    owner: NodeId,
}

/// A single-threaded virtual-time network of nodes.
///
/// Owns the node registry, the message store, the conditional-task list,
/// the partition cuts and the RNG. Handlers run to completion inside the
/// step loop; the only way to wait is to schedule a task at a future time.
///
/// Determinism: one `ChaCha8Rng`, seeded at construction, drives every
/// stochastic choice. Two runs with the same parameters and seed produce
/// byte-identical counters and arrival orderings.
pub struct Network<N: SimNode> {
    time: u64,
    nodes: Registry<N>,
    pub(crate) msgs: MessageStore<N>,
    conditional_tasks: Vec<ConditionalTask<N>>,
    partitions_x: Vec<u32>,
    msg_discard_time: u64,
    latency: NetworkLatency,
    rng: ChaCha8Rng,
}

impl<N: SimNode> Default for Network<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: SimNode> Network<N> {
    /// A network with the default WAN latency model and seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            time: 0,
            nodes: Registry::new(),
            msgs: MessageStore::new(0),
            conditional_tasks: Vec::new(),
            partitions_x: Vec::new(),
            msg_discard_time: u64::MAX,
            latency: NetworkLatency::ic3(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    // ─── Accessors ───

    /// Current virtual time in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn node(&self, id: NodeId) -> &N {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut N {
        self.nodes.get_mut(id)
    }

    /// Mutable access to a node together with the kernel RNG, for handlers
    /// that shuffle or draw while holding node state.
    pub fn node_mut_and_rng(&mut self, id: NodeId) -> (&mut N, &mut ChaCha8Rng) {
        (self.nodes.get_mut(id), &mut self.rng)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }

    /// Nodes that are not down.
    pub fn live_nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter().filter(|n| !n.base().down)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Re-seed the kernel RNG (scenario runners do this per round).
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Number of envelopes currently in flight.
    pub fn message_count(&self) -> usize {
        self.msgs.size()
    }

    /// Number of envelopes scheduled to arrive at exactly `time`.
    pub fn queued_at(&mut self, time: u64) -> usize {
        let now = self.time;
        self.msgs.size_at(time, now)
    }

    pub fn has_messages(&self) -> bool {
        self.msgs.size() != 0
    }

    pub fn latency(&self) -> &NetworkLatency {
        &self.latency
    }

    // ─── Configuration ───

    /// Register a node at its id.
    ///
    /// # Panics
    ///
    /// Panics if the id is already occupied.
    pub fn add_node(&mut self, node: N) {
        self.nodes.add(node);
    }

    /// Swap the latency model.
    ///
    /// # Panics
    ///
    /// Panics if any message is in flight: in-flight envelopes recompute
    /// their arrival times from the model, so swapping it mid-flight would
    /// rewrite history.
    pub fn set_latency(&mut self, latency: NetworkLatency) {
        assert!(
            !self.has_messages(),
            "can't change the latency model while messages are in flight"
        );
        self.latency = latency;
    }

    /// Drop, at send time, any delivery whose latency would be `>= limit`.
    pub fn set_msg_discard_time(&mut self, limit: u64) {
        self.msg_discard_time = limit;
    }

    // ─── Partitions ───

    /// Cut the network along `fraction * MAX_X`. Nodes on different sides of
    /// a cut stop delivering to each other, checked at delivery time.
    ///
    /// # Panics
    ///
    /// Panics if the fraction is outside `(0, 1)` or the cut already exists.
    pub fn partition(&mut self, fraction: f64) {
        assert!(
            fraction > 0.0 && fraction < 1.0,
            "partition fraction must be strictly between 0 and 1, got {fraction}"
        );
        let x_cut = (f64::from(MAX_X) * fraction) as u32;
        assert!(
            !self.partitions_x.contains(&x_cut),
            "partition at x={x_cut} already exists"
        );
        self.partitions_x.push(x_cut);
        self.partitions_x.sort_unstable();
    }

    /// Remove every partition cut.
    pub fn end_partition(&mut self) {
        self.partitions_x.clear();
    }

    /// Partition id of a node: the number of cuts at or left of its x
    /// coordinate.
    pub fn partition_id(&self, node: &Node) -> usize {
        self.partitions_x.iter().take_while(|&&c| c <= node.x).count()
    }

    // ─── Sending ───

    /// Send to one destination, considered sent on the next millisecond.
    pub fn send(&mut self, payload: Arc<dyn Payload<N>>, from: NodeId, to: NodeId) {
        self.send_at(payload, self.time + 1, from, to);
    }

    /// Send to one destination at an explicit send time.
    pub fn send_at(
        &mut self,
        payload: Arc<dyn Payload<N>>,
        send_time: u64,
        from: NodeId,
        to: NodeId,
    ) {
        let seed: i32 = self.rng.gen();
        if let Some(arrival) = self.create_arrival(&payload, send_time, from, to, seed) {
            let env = Envelope::single(payload, from, to, arrival);
            self.msgs.add(env, arrival, self.time);
        }
    }

    /// Send to many destinations, bundling the accepted deliveries into the
    /// narrowest envelope kind. With `delay_between > 0`, each subsequent
    /// destination's send time is pushed back by `delay_between + 1` ms.
    pub fn send_many(
        &mut self,
        payload: Arc<dyn Payload<N>>,
        send_time: u64,
        from: NodeId,
        dests: &[NodeId],
        delay_between: u64,
    ) {
        let seed: i32 = self.rng.gen();
        let mut per_dest_send = send_time;
        let mut arrivals = Vec::with_capacity(dests.len());
        for &dest in dests {
            if let Some(arrival) = self.create_arrival(&payload, per_dest_send, from, dest, seed) {
                arrivals.push(MessageArrival { dest, arrival });
            }
            if delay_between > 0 {
                per_dest_send += delay_between + 1;
            }
        }
        if arrivals.is_empty() {
            return;
        }
        arrivals.sort_by_key(|ma| ma.arrival);

        let first_arrival = arrivals[0].arrival;
        let env = if arrivals.len() == 1 {
            Envelope::single(payload, from, arrivals[0].dest, first_arrival)
        } else if delay_between == 0 {
            let dests = arrivals.iter().map(|ma| ma.dest).collect();
            Envelope::multi_same_send(payload, from, dests, send_time, seed)
        } else {
            Envelope::multi_with_delay(payload, from, arrivals)
        };
        self.msgs.add(env, first_arrival, self.time);
    }

    /// Send to every registered node (the sender included).
    pub fn send_all(&mut self, payload: Arc<dyn Payload<N>>, from: NodeId) {
        let dests: Vec<NodeId> = self.nodes.iter().map(|n| n.base().id).collect();
        self.send_many(payload, self.time + 1, from, &dests, 0);
    }

    /// Schedule a delivery at an explicit arrival time, bypassing the
    /// latency model and sender accounting.
    ///
    /// # Panics
    ///
    /// Panics if `arrive_at <= time`.
    pub fn send_arrive_at(
        &mut self,
        payload: Arc<dyn Payload<N>>,
        arrive_at: u64,
        from: NodeId,
        to: NodeId,
    ) {
        assert!(
            arrive_at > self.time,
            "wrong arrival time: arrive_at={arrive_at}, time={}",
            self.time
        );
        let env = Envelope::single(payload, from, to, arrive_at);
        self.msgs.add(env, arrive_at, self.time);
    }

    /// Compute the arrival time of one delivery, or `None` when it is
    /// suppressed (cross-partition, down endpoint, or over the discard
    /// limit). Sender counters tick once per accepted destination.
    fn create_arrival(
        &mut self,
        payload: &Arc<dyn Payload<N>>,
        send_time: u64,
        from: NodeId,
        to: NodeId,
        seed: i32,
    ) -> Option<u64> {
        assert!(
            send_time > self.time,
            "send time {send_time} must be after current time {}",
            self.time
        );
        assert!(
            !payload.is_task(),
            "tasks go through register_task, not the send path"
        );
        let (deliverable, latency) = {
            let f = self.nodes.get(from).base();
            let t = self.nodes.get(to).base();
            let same_partition = self.partition_id(f) == self.partition_id(t);
            let lat = self.latency.latency(f, t, pseudo_random(to, seed));
            (same_partition && !f.down && !t.down, lat)
        };
        if !deliverable || latency >= self.msg_discard_time {
            return None;
        }
        let f = self.nodes.get_mut(from).base_mut();
        f.msg_sent += 1;
        f.bytes_sent += payload.size() as u64;
        Some(send_time + latency)
    }

    // ─── Tasks ───

    /// Run a closure at `start_at` on behalf of `owner`.
    pub fn register_task<F>(&mut self, f: F, start_at: u64, owner: NodeId)
    where
        F: Fn(&mut Network<N>) + 'static,
    {
        let task: Arc<dyn Payload<N>> = Arc::new(Task { run: Box::new(f) });
        self.enqueue_single(task, owner, owner, start_at);
    }

    /// Run a closure at `start_at` and then every `period` ms forever.
    pub fn register_periodic_task<F>(&mut self, f: F, start_at: u64, period: u64, owner: NodeId)
    where
        F: Fn(&mut Network<N>) + 'static,
    {
        let task: Arc<dyn Payload<N>> = Arc::new(PeriodicTask {
            run: Box::new(f),
            owner,
            period,
            cond: None,
        });
        self.enqueue_single(task, owner, owner, start_at);
    }

    /// Periodic task that stops for good once the condition fails.
    pub fn register_periodic_task_with_condition<F, C>(
        &mut self,
        f: F,
        start_at: u64,
        period: u64,
        owner: NodeId,
        cond: C,
    ) where
        F: Fn(&mut Network<N>) + 'static,
        C: Fn(&Network<N>) -> bool + 'static,
    {
        let task: Arc<dyn Payload<N>> = Arc::new(PeriodicTask {
            run: Box::new(f),
            owner,
            period,
            cond: Some(Box::new(cond)),
        });
        self.enqueue_single(task, owner, owner, start_at);
    }

    /// A task that lives outside the queue: dropped once `repeat_if` fails,
    /// and otherwise run whenever the loop crosses into a new delivery time
    /// with `time >= min_start_time` and `start_if` holding; each run pushes
    /// `min_start_time` to `time + duration`.
    pub fn register_conditional_task<F, S, R>(
        &mut self,
        f: F,
        start_at: u64,
        duration: u64,
        owner: NodeId,
        start_if: S,
        repeat_if: R,
    ) where
        F: Fn(&mut Network<N>) + 'static,
        S: Fn(&Network<N>) -> bool + 'static,
        R: Fn(&Network<N>) -> bool + 'static,
    {
        self.conditional_tasks.push(ConditionalTask {
            run: Box::new(f),
            start_if: Box::new(start_if),
            repeat_if: Box::new(repeat_if),
            min_start_time: start_at,
            duration,
            owner,
        });
    }

    /// Enqueue a payload as a single-destination envelope without touching
    /// counters (task scheduling and periodic reschedules).
    pub(crate) fn enqueue_single(
        &mut self,
        payload: Arc<dyn Payload<N>>,
        from: NodeId,
        dest: NodeId,
        arrival: u64,
    ) {
        let env = Envelope::single(payload, from, dest, arrival);
        self.msgs.add(env, arrival, self.time);
    }

    // ─── Step loop ───

    /// Advance virtual time by `seconds`, delivering everything due.
    pub fn run(&mut self, seconds: u64) {
        self.run_ms(seconds * 1000);
    }

    /// Advance virtual time by `ms`, delivering everything due. On exit
    /// `time` equals exactly the requested end time.
    pub fn run_ms(&mut self, ms: u64) {
        let end_at = self.time + ms;
        self.receive_until(end_at);
        self.time = end_at;
    }

    fn next_envelope(&mut self, until: u64) -> Option<Box<Envelope<N>>> {
        while self.time <= until {
            if let Some(env) = self.msgs.poll(self.time, self.time) {
                return Some(env);
            }
            self.time += 1;
        }
        None
    }

    fn receive_until(&mut self, until: u64) {
        let mut previous_time = self.time;
        while let Some(mut env) = self.next_envelope(until) {
            let arrival = env.next_arrival_time(&self.nodes, &self.latency);
            if arrival != previous_time {
                assert!(
                    self.time <= arrival,
                    "time {} has passed arrival {arrival}",
                    self.time
                );
                self.sweep_conditional_tasks();
            }

            let from_id = env.from;
            let dest = env.next_dest();
            let same_partition = {
                let from = self.nodes.get(from_id).base();
                let to = self.nodes.get(dest).base();
                self.partition_id(from) == self.partition_id(to)
            };
            if same_partition {
                let payload = env.payload.clone();
                if !payload.is_task() {
                    let size = payload.size();
                    assert!(size > 0, "message size must be greater than zero");
                    let to = self.nodes.get_mut(dest).base_mut();
                    to.msg_received += 1;
                    to.bytes_received += size as u64;
                }
                trace!(time = self.time, from = from_id, to = dest, "deliver");
                payload.action(self, from_id, dest);
            }

            env.mark_read();
            if env.has_next_reader() {
                let next = env.next_arrival_time(&self.nodes, &self.latency);
                self.msgs.add(env, next, self.time);
            }
            previous_time = self.time;
        }
    }

    fn sweep_conditional_tasks(&mut self) {
        if self.conditional_tasks.is_empty() {
            return;
        }
        let mut tasks = std::mem::take(&mut self.conditional_tasks);
        tasks.retain_mut(|ct| {
            if !(ct.repeat_if)(self) {
                return false;
            }
            if self.time >= ct.min_start_time && (ct.start_if)(self) {
                (ct.run)(self);
                ct.min_start_time = self.time + ct.duration;
            }
            true
        });
        // Tasks registered during the sweep land behind the survivors.
        tasks.append(&mut self.conditional_tasks);
        self.conditional_tasks = tasks;
    }
}

//! Node records and the dense registry.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Dense small-integer node identifier. Ids are assigned in creation order
/// and index directly into the kernel registry.
pub type NodeId = usize;

/// Width of the rectangular map nodes are placed on. Positions only feed the
/// latency models and X-axis partitioning.
pub const MAX_X: u32 = 1000;
/// Height of the rectangular map.
pub const MAX_Y: u32 = 1000;

/// Base record every simulated node carries: identity, position and the
/// traffic counters maintained by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique id; `registry[id].id == id` always holds.
    pub id: NodeId,
    /// X coordinate in `[0, MAX_X)`.
    pub x: u32,
    /// Y coordinate in `[0, MAX_Y)`.
    pub y: u32,
    /// A down node neither sends nor receives; it still occupies its slot in
    /// peer lists, which makes it a byzantine-by-absence participant.
    pub down: bool,
    /// Actively misbehaving (protocol-defined semantics).
    pub byzantine: bool,
    /// Messages sent (one per accepted destination).
    pub msg_sent: u64,
    /// Messages received.
    pub msg_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Virtual time at which this node finished its protocol; 0 = not done.
    pub done_at: u64,
}

impl Node {
    /// Euclidean distance between two node positions.
    pub fn distance(&self, other: &Node) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Access to the base [`Node`] record embedded in a protocol node type.
///
/// The kernel only ever talks to nodes through this trait; protocol-specific
/// state lives in the concrete type.
pub trait SimNode: 'static {
    fn base(&self) -> &Node;
    fn base_mut(&mut self) -> &mut Node;
}

impl SimNode for Node {
    fn base(&self) -> &Node {
        self
    }

    fn base_mut(&mut self) -> &mut Node {
        self
    }
}

/// Builds nodes with sequential ids, optionally drawing uniform positions
/// from the kernel RNG.
#[derive(Debug, Clone, Default)]
pub struct NodeBuilder {
    next_id: NodeId,
    random_position: bool,
}

impl NodeBuilder {
    /// All nodes at the origin. Good enough when latency ignores positions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniform random positions over the map.
    pub fn with_random_position() -> Self {
        Self {
            next_id: 0,
            random_position: true,
        }
    }

    /// Build the next node. Position randomness comes from the caller's RNG
    /// so that node layout is part of the seeded run.
    pub fn build(&mut self, rng: &mut ChaCha8Rng) -> Node {
        let id = self.next_id;
        self.next_id += 1;
        let (x, y) = if self.random_position {
            (rng.gen_range(0..MAX_X), rng.gen_range(0..MAX_Y))
        } else {
            (0, 0)
        };
        Node {
            id,
            x,
            y,
            down: false,
            byzantine: false,
            msg_sent: 0,
            msg_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            done_at: 0,
        }
    }
}

/// Dense vector of nodes indexed by id.
#[derive(Debug, Default)]
pub(crate) struct Registry<N> {
    slots: Vec<Option<N>>,
}

impl<N: SimNode> Registry<N> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register a node at its id, growing the vector as needed.
    ///
    /// # Panics
    ///
    /// Panics if the id is already occupied.
    pub(crate) fn add(&mut self, node: N) {
        let id = node.base().id;
        if self.slots.len() <= id {
            self.slots.resize_with(id + 1, || None);
        }
        if self.slots[id].is_some() {
            panic!("there is already a node with id {id}");
        }
        self.slots[id] = Some(node);
    }

    pub(crate) fn get(&self, id: NodeId) -> &N {
        self.slots
            .get(id)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("no node registered with id {id}"))
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut N {
        self.slots
            .get_mut(id)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("no node registered with id {id}"))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &N> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn sequential_ids_and_positions() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut nb = NodeBuilder::with_random_position();
        let a = nb.build(&mut rng);
        let b = nb.build(&mut rng);
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert!(a.x < MAX_X && a.y < MAX_Y);
    }

    #[test]
    fn registry_round_trip() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut nb = NodeBuilder::new();
        let mut reg: Registry<Node> = Registry::new();
        reg.add(nb.build(&mut rng));
        reg.add(nb.build(&mut rng));
        assert_eq!(reg.get(1).id, 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    #[should_panic(expected = "already a node")]
    fn duplicate_id_is_fatal() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut nb = NodeBuilder::new();
        let mut reg: Registry<Node> = Registry::new();
        let n = nb.build(&mut rng);
        reg.add(n.clone());
        reg.add(n);
    }
}

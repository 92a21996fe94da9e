use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arcstr::ArcStr;
use log::{debug, trace};
use rand::{rng, seq::IndexedRandom};

use crate::cluster_handling::routing::{Route, SlotAddr};
use crate::connection::split_node_address;
use crate::{ErrorKind, RedisError, RedisResult};

/// Number of hash slots in a cluster.
pub const SLOT_SIZE: u16 = 16384;

/// The role a node plays for the slots it serves.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns slots and accepts writes.
    Master,
    /// Replicates a master.
    Slave,
}

/// A cluster node, identified by its `host:port` name.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Node {
    id: ArcStr,
    host: ArcStr,
    port: u16,
    role: NodeRole,
    name: ArcStr,
}

impl Node {
    pub(crate) fn new(host: &str, port: u16, role: NodeRole) -> Self {
        Node {
            id: ArcStr::new(),
            host: host.into(),
            port,
            role,
            name: arcstr::format!("{host}:{port}"),
        }
    }

    pub(crate) fn with_id(mut self, id: &str) -> Self {
        self.id = id.into();
        self
    }

    /// Parses a `host:port` (or `redis://host:port`) address into a master node without an id.
    pub(crate) fn from_addr(addr: &str) -> RedisResult<Self> {
        let (host, port) = split_node_address(addr)?;
        Ok(Node::new(host, port, NodeRole::Master))
    }

    /// The node id reported by the cluster. Empty for nodes only known from a redirect.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current role.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// `host:port`, unique within a registry.
    pub fn name(&self) -> &ArcStr {
        &self.name
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The nodes serving one slot.
#[derive(Debug, PartialEq)]
pub(crate) struct SlotAddrs {
    pub(crate) primary: Node,
    pub(crate) replicas: Vec<Node>,
}

impl SlotAddrs {
    pub(crate) fn new(primary: Node, replicas: Vec<Node>) -> Self {
        Self { primary, replicas }
    }

    fn replica_or_primary(&self) -> &Node {
        self.replicas.choose(&mut rng()).unwrap_or(&self.primary)
    }
}

impl<'a> IntoIterator for &'a SlotAddrs {
    type Item = &'a Node;
    type IntoIter = std::iter::Chain<std::iter::Once<&'a Node>, std::slice::Iter<'a, Node>>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

/// A contiguous slot range as reported by `CLUSTER SLOTS`.
#[derive(Debug, PartialEq)]
pub(crate) struct Slot {
    pub(crate) start: u16,
    pub(crate) end: u16,
    pub(crate) primary: Node,
    pub(crate) replicas: Vec<Node>,
}

impl Slot {
    pub fn new(start: u16, end: u16, primary: Node, replicas: Vec<Node>) -> RedisResult<Self> {
        if start > end || end >= SLOT_SIZE {
            return Err(RedisError::from((
                ErrorKind::ParseError,
                "Invalid slot range",
                format!("{start}-{end}"),
            )));
        }

        Ok(Self {
            start,
            end,
            primary,
            replicas,
        })
    }
}

/// A full slot table. Index `n` holds the owners of slot `n`.
pub(crate) struct SlotTable {
    entries: Vec<Option<Arc<SlotAddrs>>>,
    assigned: usize,
}

impl SlotTable {
    pub(crate) fn empty() -> Self {
        SlotTable {
            entries: vec![None; SLOT_SIZE as usize],
            assigned: 0,
        }
    }

    pub(crate) fn get(&self, slot: u16) -> Option<&Arc<SlotAddrs>> {
        self.entries.get(slot as usize).and_then(Option::as_ref)
    }

    pub(crate) fn set(&mut self, slot: u16, addrs: Arc<SlotAddrs>) {
        if let Some(entry) = self.entries.get_mut(slot as usize) {
            if entry.is_none() {
                self.assigned += 1;
            }
            *entry = Some(addrs);
        }
    }

    pub(crate) fn covered(&self) -> usize {
        self.assigned
    }

    pub(crate) fn is_fully_covered(&self) -> bool {
        self.assigned == SLOT_SIZE as usize
    }

    fn primaries(&self) -> Vec<Node> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .flatten()
            .filter(|addrs| seen.insert(addrs.primary.name.clone()))
            .map(|addrs| addrs.primary.clone())
            .collect()
    }
}

/// Node and slot tables of one cluster, shared by every connection of a client.
///
/// The tables are replaced wholesale by discovery and patched one slot at a time on `MOVED`.
/// Locks are never held across an `.await`.
pub struct NodeRegistry {
    slots: RwLock<SlotTable>,
    nodes: RwLock<HashMap<ArcStr, Node>>,
    startup_nodes: RwLock<Vec<Node>>,
    reinitialize_counter: AtomicUsize,
    reinitialize_steps: usize,
    refresh_pending: AtomicBool,
    full_coverage_required: AtomicBool,
    read_from_replicas: bool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl NodeRegistry {
    pub(crate) fn new(
        startup_nodes: Vec<Node>,
        reinitialize_steps: usize,
        read_from_replicas: bool,
    ) -> Self {
        let mut unique = Vec::<Node>::with_capacity(startup_nodes.len());
        for node in startup_nodes {
            if !unique.iter().any(|n| n.name == node.name) {
                unique.push(node);
            }
        }
        NodeRegistry {
            slots: RwLock::new(SlotTable::empty()),
            nodes: RwLock::new(HashMap::new()),
            startup_nodes: RwLock::new(unique),
            reinitialize_counter: AtomicUsize::new(0),
            reinitialize_steps,
            refresh_pending: AtomicBool::new(false),
            full_coverage_required: AtomicBool::new(true),
            read_from_replicas,
        }
    }

    /// Returns the master serving `slot`.
    ///
    /// An unassigned slot is an error when the cluster requires full coverage; otherwise any
    /// known node is returned and the server answers with a redirect if needed.
    pub fn get_node_for_slot(&self, slot: u16) -> RedisResult<Node> {
        if let Some(addrs) = read(&self.slots).get(slot) {
            return Ok(addrs.primary.clone());
        }
        self.uncovered_slot(slot)
    }

    /// Returns a random replica serving `slot`, or its master when it has none.
    pub fn get_replica_for_slot(&self, slot: u16) -> RedisResult<Node> {
        if let Some(addrs) = read(&self.slots).get(slot) {
            return Ok(addrs.replica_or_primary().clone());
        }
        self.uncovered_slot(slot)
    }

    fn uncovered_slot(&self, slot: u16) -> RedisResult<Node> {
        if self.full_coverage_required.load(Ordering::Acquire) {
            return Err(RedisError::from((
                ErrorKind::NoNodeForSlot,
                "No node serves slot",
                slot.to_string(),
            )));
        }
        self.random_node()
    }

    /// Resolves a route, reading from a replica only when the registry was built for it.
    pub(crate) fn node_for_route(&self, route: &Route) -> RedisResult<Node> {
        match route.slot_addr() {
            SlotAddr::ReplicaOptional if self.read_from_replicas => {
                self.get_replica_for_slot(route.slot())
            }
            _ => self.get_node_for_slot(route.slot()),
        }
    }

    /// Inserts or updates the node named `host:port`. A known node keeps its id.
    pub fn set_node(&self, host: &str, port: u16, role: NodeRole) -> Node {
        let mut nodes = write(&self.nodes);
        let node = Node::new(host, port, role);
        match nodes.get_mut(&node.name) {
            Some(existing) => {
                existing.role = role;
                existing.clone()
            }
            None => {
                nodes.insert(node.name.clone(), node.clone());
                node
            }
        }
    }

    /// Makes `node` the master of `slot`. Known replicas stay unless one of them is the new
    /// master.
    pub fn patch_slot_owner(&self, slot: u16, node: Node) {
        let mut slots = write(&self.slots);
        let replicas = slots
            .get(slot)
            .map(|addrs| {
                addrs
                    .replicas
                    .iter()
                    .filter(|replica| replica.name != node.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        trace!("slot {slot} now served by {node}");
        slots.set(slot, Arc::new(SlotAddrs::new(node, replicas)));
    }

    /// Every distinct master of the slot table, or the known masters before the first discovery.
    pub fn all_masters(&self) -> Vec<Node> {
        let masters = read(&self.slots).primaries();
        if !masters.is_empty() {
            return masters;
        }
        let mut masters: Vec<Node> = read(&self.nodes)
            .values()
            .filter(|node| node.role == NodeRole::Master)
            .cloned()
            .collect();
        masters.sort_by(|a, b| a.name.cmp(&b.name));
        masters
    }

    /// Every known node, sorted by name.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = read(&self.nodes).values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Looks a node up by name.
    pub fn node(&self, name: &str) -> Option<Node> {
        read(&self.nodes).get(name).cloned()
    }

    /// A random known node, falling back to the startup nodes when nothing was discovered yet.
    pub fn random_node(&self) -> RedisResult<Node> {
        if let Some(node) = read(&self.nodes)
            .values()
            .collect::<Vec<_>>()
            .choose(&mut rng())
        {
            return Ok((*node).clone());
        }
        read(&self.startup_nodes)
            .choose(&mut rng())
            .cloned()
            .ok_or_else(|| {
                RedisError::from((ErrorKind::ClusterUnreachable, "No known cluster nodes"))
            })
    }

    /// Adds `step` to the redirect counter. Returns true when the counter crossed a multiple of
    /// the configured step count, meaning a full refresh is due.
    pub fn increment_reinitialize_counter(&self, step: usize) -> bool {
        if self.reinitialize_steps == 0 || step == 0 {
            return false;
        }
        let previous = self.reinitialize_counter.fetch_add(step, Ordering::AcqRel);
        let current = previous.wrapping_add(step);
        previous / self.reinitialize_steps != current / self.reinitialize_steps
    }

    pub(crate) fn reinitialize_counter(&self) -> usize {
        self.reinitialize_counter.load(Ordering::Acquire)
    }

    pub(crate) fn reset_reinitialize_counter(&self) {
        self.reinitialize_counter.store(0, Ordering::Release);
    }

    /// Requests a full refresh before the next command.
    pub fn flag_refresh(&self) {
        self.refresh_pending.store(true, Ordering::Release);
    }

    /// Clears the pending refresh flag. Only one of several concurrent callers gets `true`.
    pub fn take_refresh_pending(&self) -> bool {
        self.refresh_pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a full refresh was requested and not yet taken.
    pub fn is_refresh_pending(&self) -> bool {
        self.refresh_pending.load(Ordering::Acquire)
    }

    pub(crate) fn clear_refresh_pending(&self) {
        self.refresh_pending.store(false, Ordering::Release);
    }

    /// Replaces both tables. Concurrent refreshes are resolved by the last writer.
    pub(crate) fn replace(&self, slots: SlotTable, nodes: HashMap<ArcStr, Node>) {
        debug!(
            "installing topology: {} nodes, {} of {SLOT_SIZE} slots covered",
            nodes.len(),
            slots.covered()
        );
        *write(&self.slots) = slots;
        *write(&self.nodes) = nodes;
    }

    pub(crate) fn set_full_coverage_required(&self, required: bool) {
        self.full_coverage_required
            .store(required, Ordering::Release);
    }

    /// Forgets every slot and node, keeping the startup nodes, and requests a refresh.
    pub fn reset(&self) {
        *write(&self.slots) = SlotTable::empty();
        write(&self.nodes).clear();
        self.flag_refresh();
    }

    /// Whether at least one slot is assigned.
    pub fn is_initialized(&self) -> bool {
        read(&self.slots).covered() > 0
    }

    /// Number of assigned slots.
    pub fn covered_slots(&self) -> usize {
        read(&self.slots).covered()
    }

    /// Appends every known node that is not a startup node yet, so later refreshes survive the
    /// loss of the seeds.
    pub fn populate_startup_nodes(&self) {
        let mut known = self.all_nodes();
        let mut startup_nodes = write(&self.startup_nodes);
        known.retain(|node| !startup_nodes.iter().any(|s| s.name == node.name));
        startup_nodes.extend(known);
    }

    /// The seed nodes, in order.
    pub fn startup_nodes(&self) -> Vec<Node> {
        read(&self.startup_nodes).clone()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &read(&self.nodes).len())
            .field("covered_slots", &self.covered_slots())
            .field("refresh_pending", &self.is_refresh_pending())
            .finish()
    }
}

//! Node registry: the registration node list and the committed population.
//!
//! Two collections back the MAC coordinator. The RNL holds newly registered
//! nodes in arrival order until they are admitted by a downlink announcement
//! or at a frame boundary. NODES is the committed population, keyed by
//! address, carrying the relay topology (a one-hop parent relays up to
//! [`MAX_CHILDREN`] two-hop children) and the per-node uplink statistics.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Maximum relay fan-out per one-hop parent.
pub const MAX_CHILDREN: usize = 2;

/// Consecutive-miss ceiling; the counter saturates here.
const MAX_MISS_COUNT: u16 = u16::MAX;

/// Reachability of a node from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Directly reachable.
    OneHop,
    /// Reachable through a relay parent.
    TwoHop,
}

/// Child slot inside a relay parent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub addr: u16,
    pub class: u8,
    pub slot_demand: u16,
}

/// A single end-node record.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: u16,
    pub class: u8,
    /// Uplink slots needed per frame. For a relay parent this includes both
    /// legs of every attached child: `2^class + 2 * sum(child demands)`.
    pub slot_demand: u16,
    pub node_type: NodeType,
    /// Relay parent address; 0 for one-hop nodes.
    pub parent_addr: u16,
    pub children: [Option<Child>; MAX_CHILDREN],
    /// True once the node has been scheduled and is considered reachable.
    pub connected: bool,
    /// True iff the node currently holds a slot allocation.
    pub schedule_flag: bool,

    pub latest_seq: u16,
    pub prev_seq: u16,
    pub data_count: u16,
    pub data_count_main_link: u16,
    pub data_count_direct_link: u16,
    pub miss_count: u16,
}

impl Node {
    pub fn new(addr: u16, class: u8, node_type: NodeType, parent_addr: u16) -> Self {
        Self {
            addr,
            class,
            slot_demand: 1u16 << class,
            node_type,
            parent_addr,
            children: [None; MAX_CHILDREN],
            connected: false,
            schedule_flag: false,
            latest_seq: 0,
            prev_seq: 0,
            data_count: 0,
            data_count_main_link: 0,
            data_count_direct_link: 0,
            miss_count: 0,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().flatten().count()
    }

    pub fn children_addrs(&self) -> Vec<u16> {
        self.children.iter().flatten().map(|c| c.addr).collect()
    }

    /// Attach a child, replacing an existing entry with the same address or
    /// taking the first free slot. Returns false when all slots are taken by
    /// other children; the caller discards the child in that case.
    ///
    /// The parent demand is recomputed from scratch afterwards, so replacing
    /// a child never double-counts its old contribution.
    pub fn attach_child(&mut self, child: Child) -> bool {
        let slot = self
            .children
            .iter()
            .position(|c| c.is_some_and(|c| c.addr == child.addr))
            .or_else(|| self.children.iter().position(Option::is_none));
        let Some(slot) = slot else {
            return false;
        };
        self.children[slot] = Some(child);
        self.recompute_demand();
        true
    }

    /// Drop every child and fall back to the node's own class demand.
    pub fn detach_children(&mut self) {
        self.children = [None; MAX_CHILDREN];
        self.recompute_demand();
    }

    fn recompute_demand(&mut self) {
        let relayed: u16 = self.children.iter().flatten().map(|c| c.slot_demand).sum();
        self.slot_demand = (1u16 << self.class) + 2 * relayed;
    }

    /// Fold one received DATA sequence number into the statistics.
    ///
    /// A repeated sequence number is a duplicate and changes nothing. A lower
    /// one means the node rebooted: the window restarts with this frame as
    /// the first delivery. Otherwise the counters advance, split between the
    /// main link (the scheduled path) and the direct link depending on how
    /// the frame travelled.
    pub fn update_seq(&mut self, seq: u16, via_relay: bool) {
        if seq == self.latest_seq {
            return;
        }
        if seq < self.latest_seq {
            self.data_count = 1;
            self.data_count_main_link = 0;
            self.data_count_direct_link = 0;
            self.latest_seq = seq;
            self.prev_seq = seq.wrapping_sub(1);
            self.miss_count = 0;
        } else {
            self.data_count = self.data_count.saturating_add(1);
            self.latest_seq = seq;
            self.miss_count = 0;
        }

        match (self.node_type, via_relay) {
            // A one-hop node's scheduled path is the direct link.
            (NodeType::OneHop, false) => {
                self.data_count_main_link += 1;
                self.data_count_direct_link += 1;
            }
            (NodeType::OneHop, true) => {}
            // A two-hop node's scheduled path runs through its parent.
            (NodeType::TwoHop, true) => self.data_count_main_link += 1,
            (NodeType::TwoHop, false) => self.data_count_direct_link += 1,
        }
    }
}

/// Insertion-ordered holding list for nodes awaiting admission (the RNL).
#[derive(Debug, Default)]
pub struct NodeList {
    nodes: Vec<Node>,
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly registered node. A re-registration of a pending
    /// address updates the entry in place and keeps its queue position.
    pub fn enroll(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.addr == node.addr) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Pop the oldest pending node.
    pub fn pop_front(&mut self) -> Option<Node> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Outcome of committing an RNL entry into the population.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// The node is now part of NODES (inserted or updated in place).
    pub admitted: bool,
    /// Address whose stale slot allocation must be removed from every group
    /// (a two-hop commit may shadow a previous one-hop allocation).
    pub drop_schedule: Option<u16>,
}

/// The committed node population, keyed by address.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: BTreeMap<u16, Node>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, addr: u16) -> Option<&Node> {
        self.nodes.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u16) -> Option<&mut Node> {
        self.nodes.get_mut(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Commit a node drained from the RNL.
    ///
    /// One-hop: a re-commit resets the node's topology (old children are
    /// marked disconnected and detached) while keeping its statistics.
    /// Two-hop: the child is attached to its parent, the parent's aggregate
    /// demand changes so its schedule flag is cleared, and any allocation the
    /// child address held as a former one-hop node must be dropped. A child
    /// whose parent is unknown or full is discarded.
    pub fn commit(&mut self, node: Node) -> CommitOutcome {
        match node.node_type {
            NodeType::OneHop => {
                if self.nodes.contains_key(&node.addr) {
                    self.set_children_connected(node.addr, false);
                    if let Some(existing) = self.nodes.get_mut(&node.addr) {
                        existing.detach_children();
                    }
                }
                self.insert_keeping_stats(node);
                CommitOutcome {
                    admitted: true,
                    drop_schedule: None,
                }
            }
            NodeType::TwoHop => {
                let child = Child {
                    addr: node.addr,
                    class: node.class,
                    slot_demand: 1u16 << node.class,
                };
                let Some(parent) = self.nodes.get_mut(&node.parent_addr) else {
                    log::warn!("NODE {:#06x}: parent {:#06x} not found, child discarded", node.addr, node.parent_addr);
                    return CommitOutcome {
                        admitted: false,
                        drop_schedule: Some(node.addr),
                    };
                };
                if !parent.attach_child(child) {
                    log::warn!(
                        "NODE {:#06x}: parent {:#06x} is full of children, child discarded",
                        node.addr,
                        node.parent_addr
                    );
                    return CommitOutcome {
                        admitted: false,
                        drop_schedule: Some(node.addr),
                    };
                }
                parent.schedule_flag = false;
                let drop_schedule = Some(node.addr);
                self.insert_keeping_stats(node);
                CommitOutcome {
                    admitted: true,
                    drop_schedule,
                }
            }
        }
    }

    /// Insert or update by address; an existing record keeps its uplink
    /// statistics and only takes the incoming topology fields.
    fn insert_keeping_stats(&mut self, node: Node) {
        match self.nodes.get_mut(&node.addr) {
            Some(existing) => {
                existing.class = node.class;
                existing.slot_demand = node.slot_demand;
                existing.node_type = node.node_type;
                existing.parent_addr = node.parent_addr;
                existing.children = node.children;
                existing.connected = node.connected;
                existing.schedule_flag = node.schedule_flag;
            }
            None => {
                self.nodes.insert(node.addr, node);
            }
        }
    }

    pub fn mark_disconnected(&mut self, addr: u16) {
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.connected = false;
        }
    }

    /// Propagate reachability from a relay parent to its children's records.
    pub fn set_children_connected(&mut self, parent_addr: u16, status: bool) {
        let child_addrs: Vec<u16> = match self.nodes.get(&parent_addr) {
            Some(parent) => parent.children.iter().flatten().map(|c| c.addr).collect(),
            None => return,
        };
        for addr in child_addrs {
            if let Some(child) = self.nodes.get_mut(&addr) {
                child.connected = status;
            }
        }
    }

    pub fn update_seq(&mut self, addr: u16, seq: u16, via_relay: bool) {
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.update_seq(seq, via_relay);
        }
    }

    /// Per-frame miss sweep: a connected node whose sequence number did not
    /// move since the last frame missed a delivery. Snapshots `prev_seq`.
    pub fn sweep_missed(&mut self) {
        for node in self.nodes.values_mut() {
            if node.connected {
                if node.prev_seq == node.latest_seq {
                    if node.miss_count < MAX_MISS_COUNT {
                        node.miss_count += 1;
                    }
                } else {
                    node.miss_count = 0;
                }
                node.prev_seq = node.latest_seq;
            }
        }
    }

    pub fn clear_schedule_flags(&mut self) {
        for node in self.nodes.values_mut() {
            node.schedule_flag = false;
        }
    }

    pub fn children_of(&self, addr: u16) -> Vec<Child> {
        self.nodes
            .get(&addr)
            .map(|n| n.children.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// One-hop nodes without a current allocation, in the order the allocator
    /// consumes them: slot demand ascending, address as tie-break.
    pub fn unscheduled_one_hop(&self) -> Vec<(u16, u8, u16)> {
        let mut candidates: Vec<(u16, u8, u16)> = self
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::OneHop && !n.schedule_flag)
            .map(|n| (n.addr, n.class, n.slot_demand))
            .collect();
        candidates.sort_by_key(|&(addr, _, demand)| (demand, addr));
        candidates
    }

    /// Operator dump: one-hop and two-hop sections with delivery statistics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- NODE INFORMATION ({} NODES) ---", self.nodes.len());
        let _ = writeln!(
            out,
            "{:<10}{:<8}{:<8}{:<8}{:<20}{:<8}{:<22}{:<6}",
            "NodeID", "Sch?", "Demand", "Class", "Data (dir) (main)", "Seq", "PDR% (dir) (main)", "Miss"
        );
        for node_type in [NodeType::OneHop, NodeType::TwoHop] {
            let _ = writeln!(
                out,
                "{}",
                match node_type {
                    NodeType::OneHop => "ONE-HOP NODES",
                    NodeType::TwoHop => "TWO-HOP NODES",
                }
            );
            for node in self.nodes.values().filter(|n| n.node_type == node_type) {
                let id = match node.node_type {
                    NodeType::OneHop if node.is_relay() => format!("{:#06x} (R)", node.addr),
                    NodeType::OneHop => format!("{:#06x}", node.addr),
                    NodeType::TwoHop => format!("{:#06x} ({:#06x})", node.addr, node.parent_addr),
                };
                let pdr = |count: u16| {
                    if node.latest_seq == 0 {
                        0.0
                    } else {
                        f64::from(count) / f64::from(node.latest_seq) * 100.0
                    }
                };
                let _ = writeln!(
                    out,
                    "{:<10}{:<8}{:<8}{:<8}{:<20}{:<8}{:<22}{}{}",
                    id,
                    node.schedule_flag,
                    node.slot_demand,
                    node.class,
                    format!(
                        "{} ({}) ({})",
                        node.data_count, node.data_count_direct_link, node.data_count_main_link
                    ),
                    node.latest_seq,
                    format!(
                        "{:.1} ({:.1}) ({:.1})",
                        pdr(node.data_count),
                        pdr(node.data_count_direct_link),
                        pdr(node.data_count_main_link)
                    ),
                    node.miss_count,
                    if node.connected { "" } else { " (DISC)" },
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(addr: u16, class: u8) -> Child {
        Child {
            addr,
            class,
            slot_demand: 1u16 << class,
        }
    }

    #[test]
    fn test_relay_demand_counts_both_legs() {
        // Relay registration: parent class 0 picks up a class-1 child.
        let mut parent = Node::new(0x0101, 0, NodeType::OneHop, 0);
        assert!(parent.attach_child(child(0x0202, 1)));
        assert_eq!(parent.slot_demand, 1 + 2 * 2);
        assert!(parent.is_relay());
    }

    #[test]
    fn test_child_replacement_subtracts_old_contribution() {
        let mut parent = Node::new(0x0101, 2, NodeType::OneHop, 0);
        assert!(parent.attach_child(child(0x0202, 3)));
        assert_eq!(parent.slot_demand, 4 + 2 * 8);
        // Same address comes back with a smaller class: old demand must not linger.
        assert!(parent.attach_child(child(0x0202, 0)));
        assert_eq!(parent.slot_demand, 4 + 2 * 1);
        assert_eq!(parent.child_count(), 1);
    }

    #[test]
    fn test_child_capacity_rejects_over_fanout() {
        let mut parent = Node::new(0x0101, 0, NodeType::OneHop, 0);
        assert!(parent.attach_child(child(0x0202, 0)));
        assert!(parent.attach_child(child(0x0303, 0)));
        assert!(!parent.attach_child(child(0x0404, 0)));
        assert_eq!(parent.child_count(), MAX_CHILDREN);
        assert_eq!(parent.slot_demand, 1 + 2 * 2);
    }

    #[test]
    fn test_commit_two_hop_updates_parent() {
        let mut table = NodeTable::new();
        table.commit(Node::new(0x0101, 0, NodeType::OneHop, 0));

        let outcome = table.commit(Node::new(0x0202, 1, NodeType::TwoHop, 0x0101));
        assert!(outcome.admitted);
        assert_eq!(outcome.drop_schedule, Some(0x0202));

        let parent = table.get(0x0101).unwrap();
        assert_eq!(parent.slot_demand, 5);
        assert!(!parent.schedule_flag);
        assert_eq!(parent.children_addrs(), vec![0x0202]);

        let child = table.get(0x0202).unwrap();
        assert_eq!(child.node_type, NodeType::TwoHop);
        assert_eq!(child.parent_addr, 0x0101);
        assert_eq!(child.slot_demand, 2);
    }

    #[test]
    fn test_commit_two_hop_without_parent_is_discarded() {
        let mut table = NodeTable::new();
        let outcome = table.commit(Node::new(0x0202, 1, NodeType::TwoHop, 0x0101));
        assert!(!outcome.admitted);
        assert!(table.get(0x0202).is_none());
    }

    #[test]
    fn test_recommit_one_hop_keeps_statistics() {
        let mut table = NodeTable::new();
        table.commit(Node::new(0x0101, 2, NodeType::OneHop, 0));
        table.update_seq(0x0101, 7, false);
        assert_eq!(table.get(0x0101).unwrap().data_count, 1);

        // Node re-registers with a different class.
        table.commit(Node::new(0x0101, 3, NodeType::OneHop, 0));
        let node = table.get(0x0101).unwrap();
        assert_eq!(node.class, 3);
        assert_eq!(node.slot_demand, 8);
        assert_eq!(node.data_count, 1);
        assert_eq!(node.latest_seq, 7);
    }

    #[test]
    fn test_update_seq_advance_duplicate_reset() {
        let mut node = Node::new(0x0303, 0, NodeType::OneHop, 0);
        for seq in 1..=10 {
            node.update_seq(seq, false);
        }
        assert_eq!(node.latest_seq, 10);
        assert_eq!(node.data_count, 10);

        // Duplicate advances nothing.
        node.update_seq(10, false);
        assert_eq!(node.latest_seq, 10);
        assert_eq!(node.data_count, 10);

        // Next frame advances both by exactly one.
        node.update_seq(11, false);
        assert_eq!(node.latest_seq, 11);
        assert_eq!(node.data_count, 11);

        // A lower sequence means a reboot: window restarts at one delivery.
        node.update_seq(3, false);
        assert_eq!(node.latest_seq, 3);
        assert_eq!(node.data_count, 1);
        assert_eq!(node.prev_seq, 2);
    }

    #[test]
    fn test_update_seq_link_accounting() {
        let mut two_hop = Node::new(0x0404, 0, NodeType::TwoHop, 0x0101);
        two_hop.update_seq(1, true);
        two_hop.update_seq(2, false);
        assert_eq!(two_hop.data_count_main_link, 1);
        assert_eq!(two_hop.data_count_direct_link, 1);
        assert_eq!(two_hop.data_count, 2);
    }

    #[test]
    fn test_mark_disconnected() {
        let mut table = NodeTable::new();
        table.commit(Node::new(0x0101, 0, NodeType::OneHop, 0));
        table.get_mut(0x0101).unwrap().connected = true;
        table.mark_disconnected(0x0101);
        assert!(!table.get(0x0101).unwrap().connected);
        // A disconnected node is exempt from the miss sweep.
        table.sweep_missed();
        assert_eq!(table.get(0x0101).unwrap().miss_count, 0);
    }

    #[test]
    fn test_sweep_missed_counts_stalls() {
        let mut table = NodeTable::new();
        table.commit(Node::new(0x0101, 0, NodeType::OneHop, 0));
        table.get_mut(0x0101).unwrap().connected = true;

        table.update_seq(0x0101, 1, false);
        table.sweep_missed();
        assert_eq!(table.get(0x0101).unwrap().miss_count, 0);

        // No new data since the snapshot: two stalled frames in a row.
        table.sweep_missed();
        table.sweep_missed();
        assert_eq!(table.get(0x0101).unwrap().miss_count, 2);

        table.update_seq(0x0101, 2, false);
        table.sweep_missed();
        assert_eq!(table.get(0x0101).unwrap().miss_count, 0);
    }

    #[test]
    fn test_rnl_enroll_updates_in_place() {
        let mut rnl = NodeList::new();
        rnl.enroll(Node::new(0x0101, 1, NodeType::OneHop, 0));
        rnl.enroll(Node::new(0x0202, 2, NodeType::OneHop, 0));
        rnl.enroll(Node::new(0x0101, 3, NodeType::OneHop, 0));
        assert_eq!(rnl.len(), 2);
        let first = rnl.pop_front().unwrap();
        assert_eq!(first.addr, 0x0101);
        assert_eq!(first.class, 3);
    }

    #[test]
    fn test_unscheduled_candidates_sorted_by_demand() {
        let mut table = NodeTable::new();
        table.commit(Node::new(0x0303, 2, NodeType::OneHop, 0));
        table.commit(Node::new(0x0101, 0, NodeType::OneHop, 0));
        table.commit(Node::new(0x0202, 0, NodeType::OneHop, 0));
        table.commit(Node::new(0x0404, 1, NodeType::TwoHop, 0x0101));

        let candidates = table.unscheduled_one_hop();
        let addrs: Vec<u16> = candidates.iter().map(|c| c.0).collect();
        // Two-hop nodes are never allocated directly; 0x0101 carries its
        // child's demand now (1 + 2*2 = 5) and sorts last.
        assert_eq!(addrs, vec![0x0202, 0x0303, 0x0101]);
    }
}

//! Multi-group TDMA slot allocator.
//!
//! Each scheduling group (one per radio channel) owns an ordered map of
//! schedule entries over the logical slot indices `1..=2^N`. Allocation is
//! first-fit over the gaps of the chosen group; the group itself is picked by
//! lowest load. Every entry tracks how many more times its assignment must be
//! announced downlink before the relays can rely on it.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

/// Announcements owed by an entry allocated during Schedule-Distribution
/// (SCH1 repeats the whole schedule anyway).
pub const DIST_COUNT_SCHEDULE_PHASE: u8 = 1;
/// Announcements owed by an entry allocated mid-operation, during
/// Data-Collection (carried by CM updated-schedule sections).
pub const DIST_COUNT_DATA_PHASE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// No gap in any eligible group fits the demand; the node stays
    /// unscheduled and is retried next frame.
    #[error("no free run of {demand} slots")]
    NoCapacity { demand: u16 },
}

/// One scheduled node inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub addr: u16,
    pub class: u8,
    /// First logical slot index of the assignment, in `1..=2^N`.
    pub start_lsi: u16,
    pub slot_demand: u16,
    /// Remaining downlink announcements before the entry is settled.
    pub dist_remaining: u8,
}

impl ScheduleEntry {
    /// Last logical slot index covered by this assignment.
    pub fn last_lsi(&self) -> u16 {
        self.start_lsi + self.slot_demand - 1
    }
}

/// Ordered schedule of a single group, keyed by start LSI.
#[derive(Debug)]
pub struct GroupSchedule {
    entries: BTreeMap<u16, ScheduleEntry>,
    total_slots: u16,
    assigned_slots: u16,
    remaining_slots: u16,
    /// Number of entries with `dist_remaining > 0`.
    dist_pending: u16,
}

impl GroupSchedule {
    pub fn new(total_slots: u16) -> Self {
        Self {
            entries: BTreeMap::new(),
            total_slots,
            assigned_slots: 0,
            remaining_slots: total_slots,
            dist_pending: 0,
        }
    }

    pub fn assigned_slots(&self) -> u16 {
        self.assigned_slots
    }

    pub fn remaining_slots(&self) -> u16 {
        self.remaining_slots
    }

    pub fn dist_pending(&self) -> u16 {
        self.dist_pending
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending start-LSI order.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values()
    }

    pub fn get(&self, addr: u16) -> Option<&ScheduleEntry> {
        self.entries.values().find(|e| e.addr == addr)
    }

    /// First-fit gap scan. Walks the assignments in LSI order and takes the
    /// first gap wide enough for the demand: before the head (from LSI 1),
    /// between consecutive entries, or after the tail (up to `2^N`).
    fn find_gap(&self, demand: u16) -> Option<u16> {
        let mut prev_last = 0u16;
        for entry in self.entries.values() {
            if entry.start_lsi - prev_last - 1 >= demand {
                return Some(prev_last + 1);
            }
            prev_last = entry.last_lsi();
        }
        if self.total_slots - prev_last >= demand {
            return Some(prev_last + 1);
        }
        None
    }

    /// Allocate a run of `slot_demand` slots for a node. Returns the start
    /// LSI on success.
    pub fn insert(
        &mut self,
        addr: u16,
        class: u8,
        slot_demand: u16,
        dist_count: u8,
    ) -> Result<u16, ScheduleError> {
        let start_lsi = self
            .find_gap(slot_demand)
            .ok_or(ScheduleError::NoCapacity {
                demand: slot_demand,
            })?;
        self.entries.insert(
            start_lsi,
            ScheduleEntry {
                addr,
                class,
                start_lsi,
                slot_demand,
                dist_remaining: dist_count,
            },
        );
        self.assigned_slots += slot_demand;
        self.remaining_slots -= slot_demand;
        if dist_count > 0 {
            self.dist_pending += 1;
        }
        Ok(start_lsi)
    }

    /// Remove an address from the group, rebalancing the counters. Returns
    /// true if an entry was removed.
    pub fn remove(&mut self, addr: u16) -> bool {
        let Some(start_lsi) = self
            .entries
            .values()
            .find(|e| e.addr == addr)
            .map(|e| e.start_lsi)
        else {
            return false;
        };
        let Some(entry) = self.entries.remove(&start_lsi) else {
            return false;
        };
        self.assigned_slots -= entry.slot_demand;
        self.remaining_slots += entry.slot_demand;
        if entry.dist_remaining > 0 {
            self.dist_pending -= 1;
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.assigned_slots = 0;
        self.remaining_slots = self.total_slots;
        self.dist_pending = 0;
    }

    /// Update an entry's remaining announcement count, keeping the pending
    /// counter consistent across the zero boundary in both directions.
    pub fn set_dist_remaining(&mut self, addr: u16, dist_remaining: u8) {
        for entry in self.entries.values_mut() {
            if entry.addr == addr {
                if entry.dist_remaining > 0 && dist_remaining == 0 {
                    self.dist_pending -= 1;
                }
                if entry.dist_remaining == 0 && dist_remaining > 0 {
                    self.dist_pending += 1;
                }
                entry.dist_remaining = dist_remaining;
                return;
            }
        }
    }

    /// Last LSI assigned in this group, or 0 when empty.
    pub fn last_assigned_lsi(&self) -> u16 {
        self.entries
            .values()
            .next_back()
            .map(ScheduleEntry::last_lsi)
            .unwrap_or(0)
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "{:<10}{:<10}{:<10}{}", "Node", "AsgLsi", "Demand", "DistLeft");
        for entry in self.entries.values() {
            let _ = writeln!(
                out,
                "{:<#10x}{:<10}{:<10}{}",
                entry.addr, entry.start_lsi, entry.slot_demand, entry.dist_remaining
            );
        }
    }
}

/// All scheduling groups of the network. Group count equals the radio
/// channel count; every group spans the same `1..=2^N` LSI range.
#[derive(Debug)]
pub struct SlotAllocator {
    groups: Vec<GroupSchedule>,
}

impl SlotAllocator {
    pub fn new(group_count: usize, total_slots: u16) -> Self {
        Self {
            groups: (0..group_count).map(|_| GroupSchedule::new(total_slots)).collect(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, index: usize) -> &GroupSchedule {
        &self.groups[index]
    }

    pub fn group_mut(&mut self, index: usize) -> &mut GroupSchedule {
        &mut self.groups[index]
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSchedule> {
        self.groups.iter()
    }

    /// Index of the group with the smallest assigned load; lowest index wins
    /// ties so placement is deterministic.
    fn least_loaded_group(&self) -> usize {
        let mut index = 0;
        let mut min_load = self.groups[0].assigned_slots();
        for (i, group) in self.groups.iter().enumerate() {
            if group.assigned_slots() < min_load {
                min_load = group.assigned_slots();
                index = i;
            }
        }
        index
    }

    /// Allocate a node into the least-loaded group. Returns `(group index,
    /// start LSI)`.
    pub fn allocate(
        &mut self,
        addr: u16,
        class: u8,
        slot_demand: u16,
        dist_count: u8,
    ) -> Result<(usize, u16), ScheduleError> {
        let group = self.least_loaded_group();
        let start_lsi = self.groups[group].insert(addr, class, slot_demand, dist_count)?;
        Ok((group, start_lsi))
    }

    /// Drop any allocation this address holds, in every group.
    pub fn remove_everywhere(&mut self, addr: u16) {
        for group in &mut self.groups {
            group.remove(addr);
        }
    }

    pub fn clear_all(&mut self) {
        for group in &mut self.groups {
            group.clear();
        }
    }

    /// True if any group still owes schedule announcements.
    pub fn any_dist_pending(&self) -> bool {
        self.groups.iter().any(|g| g.dist_pending() > 0)
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            let _ = writeln!(
                out,
                "SCHEDULE GROUP {} ({} nodes, {}/{} slots, {} pending)",
                i,
                group.len(),
                group.assigned_slots(),
                group.total_slots,
                group.dist_pending()
            );
            group.dump(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cross-checks the group against the §8 schedule invariants.
    fn assert_group_invariants(group: &GroupSchedule) {
        let mut prev_end = 0u16;
        for entry in group.iter() {
            assert!(entry.start_lsi >= 1);
            assert!(entry.last_lsi() <= group.total_slots);
            assert!(entry.start_lsi > prev_end, "overlapping entries");
            prev_end = entry.last_lsi();
        }
        let assigned: u16 = group.iter().map(|e| e.slot_demand).sum();
        assert_eq!(group.assigned_slots(), assigned);
        assert_eq!(group.remaining_slots(), group.total_slots - assigned);
        let pending = group.iter().filter(|e| e.dist_remaining > 0).count() as u16;
        assert_eq!(group.dist_pending(), pending);
    }

    #[test]
    fn test_single_node_takes_head_gap() {
        // Class-2 node on an N=6 frame.
        let mut alloc = SlotAllocator::new(1, 64);
        let (group, lsi) = alloc.allocate(0x0101, 2, 4, DIST_COUNT_SCHEDULE_PHASE).unwrap();
        assert_eq!((group, lsi), (0, 1));
        let g = alloc.group(0);
        assert_eq!(g.last_assigned_lsi(), 4);
        assert_eq!(g.get(0x0101).unwrap().dist_remaining, 1);
        assert_eq!(g.dist_pending(), 1);
        assert_group_invariants(g);
    }

    #[test]
    fn test_first_fit_reuses_freed_gap() {
        let mut alloc = SlotAllocator::new(1, 16);
        alloc.allocate(1, 1, 2, 1).unwrap(); // 1..2
        alloc.allocate(2, 1, 2, 1).unwrap(); // 3..4
        alloc.allocate(3, 2, 4, 1).unwrap(); // 5..8
        alloc.remove_everywhere(2);
        assert_group_invariants(alloc.group(0));

        // A demand of 2 fits the freed 3..4 gap exactly.
        let (_, lsi) = alloc.allocate(4, 1, 2, 1).unwrap();
        assert_eq!(lsi, 3);
        // A demand of 3 must go after the tail instead.
        alloc.remove_everywhere(4);
        let (_, lsi) = alloc.allocate(5, 0, 3, 1).unwrap();
        assert_eq!(lsi, 9);
        assert_group_invariants(alloc.group(0));
    }

    #[test]
    fn test_exhausting_group_returns_no_capacity() {
        // Fill all 2^N slots with class-0 nodes, then one more must fail.
        let total = 8u16;
        let mut alloc = SlotAllocator::new(1, total);
        for addr in 1..=total {
            alloc.allocate(addr, 0, 1, 1).unwrap();
        }
        assert_eq!(alloc.group(0).remaining_slots(), 0);
        assert_eq!(
            alloc.allocate(100, 0, 1, 1),
            Err(ScheduleError::NoCapacity { demand: 1 })
        );
        assert_group_invariants(alloc.group(0));
    }

    #[test]
    fn test_whole_frame_demand_spills_to_next_group() {
        // A class-N node consumes an entire group; the next one must land in
        // the other group.
        let mut alloc = SlotAllocator::new(2, 8);
        let (g1, lsi1) = alloc.allocate(1, 3, 8, 1).unwrap();
        assert_eq!((g1, lsi1), (0, 1));
        let (g2, lsi2) = alloc.allocate(2, 3, 8, 1).unwrap();
        assert_eq!((g2, lsi2), (1, 1));
        assert_eq!(alloc.allocate(3, 0, 1, 1), Err(ScheduleError::NoCapacity { demand: 1 }));
    }

    #[test]
    fn test_multi_group_balancing() {
        // Three class-2 nodes over two N=3 groups: two land in one group
        // (starts 1 and 5), the third picks the less-loaded group.
        let mut alloc = SlotAllocator::new(2, 8);
        let a = alloc.allocate(1, 2, 4, 1).unwrap();
        let b = alloc.allocate(2, 2, 4, 1).unwrap();
        let c = alloc.allocate(3, 2, 4, 1).unwrap();
        assert_eq!(a, (0, 1));
        assert_eq!(b, (1, 1));
        assert_eq!(c, (0, 5));
        assert_group_invariants(alloc.group(0));
        assert_group_invariants(alloc.group(1));
    }

    #[test]
    fn test_dist_counters_track_zero_crossings() {
        let mut alloc = SlotAllocator::new(1, 16);
        alloc.allocate(1, 0, 1, DIST_COUNT_DATA_PHASE).unwrap();
        alloc.allocate(2, 0, 1, DIST_COUNT_DATA_PHASE).unwrap();
        let group = alloc.group_mut(0);
        assert_eq!(group.dist_pending(), 2);

        group.set_dist_remaining(1, 2);
        assert_eq!(group.dist_pending(), 2);
        group.set_dist_remaining(1, 0);
        assert_eq!(group.dist_pending(), 1);
        // Re-arming a settled entry counts it again.
        group.set_dist_remaining(1, 1);
        assert_eq!(group.dist_pending(), 2);
        assert_group_invariants(group);
    }

    #[test]
    fn test_remove_entry_owing_distributions() {
        let mut alloc = SlotAllocator::new(1, 16);
        alloc.allocate(1, 1, 2, 3).unwrap();
        alloc.allocate(2, 1, 2, 3).unwrap();
        alloc.group_mut(0).set_dist_remaining(2, 0);

        alloc.remove_everywhere(1); // still owed announcements
        alloc.remove_everywhere(2); // already settled
        let group = alloc.group(0);
        assert_eq!(group.dist_pending(), 0);
        assert_eq!(group.assigned_slots(), 0);
        assert_eq!(group.remaining_slots(), 16);
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut alloc = SlotAllocator::new(2, 8);
        alloc.allocate(1, 2, 4, 1).unwrap();
        alloc.allocate(2, 2, 4, 1).unwrap();
        alloc.clear_all();
        for group in alloc.groups() {
            assert!(group.is_empty());
            assert_eq!(group.assigned_slots(), 0);
            assert_eq!(group.remaining_slots(), 8);
            assert_eq!(group.dist_pending(), 0);
            assert_eq!(group.last_assigned_lsi(), 0);
        }
    }
}

//! Phase state machine driving the MAC timeline.
//!
//! The network rotates `Network-Init → Schedule-Distribution →
//! Data-Collection → Schedule-Distribution → …`. Every periodic phase paces
//! itself with absolute deadlines taken at the start of each slot
//! (`Timer::at(slot_start + period)`), so processing time inside a slot never
//! drifts the frame.
//!
//! An operator transition request is flushed gracefully: the current phase
//! runs up to [`PHASE_FLUSH_PERIODS`] more periods (Network-Init announces
//! `net_ready` during them) before the state machine advances and clears the
//! request.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::{Duration as StdDuration, SystemTime};

use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

use crate::mac::frame::{self, AddrClass, SmNode, SmSection, UsiEntry, MAX_RNL_NODES, MAX_SM_NODES, MAX_USI_RELAYS};
use crate::mac::schedule::{ScheduleEntry, DIST_COUNT_DATA_PHASE, DIST_COUNT_SCHEDULE_PHASE};
use crate::mac::types::{OutboundSender, ServerState, TxMessage};

/// RNL announcement interval during Network-Init.
pub const RNL_INTERVAL_MS: u64 = 5000;
/// SCH1 slot size; one SM per slot.
pub const SCH1_SLOT_MS: u64 = 200;
/// Number of SM transmissions per Schedule-Distribution phase.
pub const SCH1_SLOT_COUNT: u8 = 15;
/// SCH2 padding slot size; airtime left for relays to forward schedules.
pub const SCH2_SLOT_MS: u64 = 100;
/// Periods a phase keeps running after a transition request, to flush
/// protocol distributions.
pub const PHASE_FLUSH_PERIODS: u8 = 6;
/// Head start given to the transport: downlinks are stamped this far after
/// the slot start.
pub const TX_SHIFT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NetworkInit,
    ScheduleDist,
    DataCollection,
}

/// Outcome of one flush-countdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTick {
    /// Run this period; `announce` is set while the countdown is draining.
    Run { announce: bool },
    /// The countdown completed last period; leave the phase now.
    Exit,
}

/// Graceful-exit countdown of a periodic phase.
///
/// Idle while no transition is requested. Once the request flag is observed
/// the countdown consumes one period per tick; after the last flush period
/// the next tick reports `Exit`.
#[derive(Debug)]
struct PhaseFlush {
    periods_left: u8,
}

impl PhaseFlush {
    fn new() -> Self {
        Self {
            periods_left: PHASE_FLUSH_PERIODS,
        }
    }

    fn tick(&mut self, requested: bool) -> FlushTick {
        if self.periods_left == 0 {
            return FlushTick::Exit;
        }
        if requested {
            self.periods_left -= 1;
            FlushTick::Run { announce: true }
        } else {
            FlushTick::Run { announce: false }
        }
    }
}

/// Main phase loop. Runs until the quit flag is raised.
#[embassy_executor::task]
pub async fn phase_task(state: &'static ServerState, outbound: OutboundSender) {
    info!("[MAC] two-hop RT-LoRa MAC start");
    let mut phase = Phase::NetworkInit;
    while !state.quit.load(Ordering::SeqCst) {
        phase = match phase {
            Phase::NetworkInit => {
                network_init_phase(state, &outbound).await;
                Phase::ScheduleDist
            }
            Phase::ScheduleDist => {
                schedule_distribution_phase(state, &outbound).await;
                Phase::DataCollection
            }
            Phase::DataCollection => {
                data_collection_phase(state, &outbound).await;
                Phase::ScheduleDist
            }
        };
    }
    info!("[MAC] phase task stopped");
}

async fn network_init_phase(state: &ServerState, outbound: &OutboundSender) {
    info!("[MAC] network init phase start");
    let mut flush = PhaseFlush::new();
    let mut seq: u16 = 0;
    let period = Duration::from_millis(RNL_INTERVAL_MS);

    while !state.quit.load(Ordering::SeqCst) {
        let slot_start = Instant::now();
        let wall_start = SystemTime::now();

        let requested = state.phase_transition_request.load(Ordering::SeqCst);
        let net_ready = match flush.tick(requested) {
            FlushTick::Exit => {
                state.phase_transition_request.store(false, Ordering::SeqCst);
                break;
            }
            FlushTick::Run { announce } => announce,
        };
        seq = seq.wrapping_add(1);

        let admitted = admit_pending_rnl(state, MAX_RNL_NODES);
        let payload = frame::encode_rnl(&state.config, seq, net_ready, &admitted);
        enqueue_downlink(outbound, payload, wall_start);
        info!("[MAC] net_ready={} transmit RNL {seq}", u8::from(net_ready));

        if seq % 3 == 0 {
            debug!("{}", state.nodes.lock().unwrap().dump());
        }

        Timer::at(slot_start + period).await;
    }
    info!("[MAC] network init phase done");
}

async fn schedule_distribution_phase(state: &ServerState, outbound: &OutboundSender) {
    info!("[MAC] schedule distribution phase start");

    // A fresh schedule every pass: old allocations carry over only through
    // the reallocation below.
    state.nodes.lock().unwrap().clear_schedule_flags();
    state.schedules.lock().unwrap().clear_all();
    let scheduled = allocate_unscheduled(state, DIST_COUNT_SCHEDULE_PHASE);
    info!("[MAC] generated schedule for {scheduled} nodes");
    debug!("{}", state.schedules.lock().unwrap().dump());

    info!("[MAC] start SCH1 ({SCH1_SLOT_COUNT} slots of {SCH1_SLOT_MS} ms)");
    let mut sch2_start_slot: u8 = 1;
    for sm_count in 1..=SCH1_SLOT_COUNT {
        if state.quit.load(Ordering::SeqCst) {
            return;
        }
        let slot_start = Instant::now();
        let wall_start = SystemTime::now();

        if let Some(payload) = build_sm(state, sm_count, &mut sch2_start_slot) {
            enqueue_downlink(outbound, payload, wall_start);
            info!("[MAC] transmit SM_{sm_count}");
        }

        Timer::at(slot_start + Duration::from_millis(SCH1_SLOT_MS)).await;
    }

    let sch2_slots = u64::from(sch2_start_slot - 1);
    info!("[MAC] start SCH2 ({sch2_slots} slots of {SCH2_SLOT_MS} ms)");
    Timer::after(Duration::from_millis(SCH2_SLOT_MS * sch2_slots)).await;
    info!("[MAC] schedule distribution phase done");
}

async fn data_collection_phase(state: &ServerState, outbound: &OutboundSender) {
    let period = Duration::from_millis(state.config.frame_period_ms());
    info!(
        "[MAC] data collection phase start, frame period {} ms",
        state.config.frame_period_ms()
    );
    let mut flush = PhaseFlush::new();
    let mut seq: u16 = 0;

    while !state.quit.load(Ordering::SeqCst) {
        let slot_start = Instant::now();
        let wall_start = SystemTime::now();

        let requested = state.phase_transition_request.load(Ordering::SeqCst);
        match flush.tick(requested) {
            FlushTick::Exit => {
                state.phase_transition_request.store(false, Ordering::SeqCst);
                break;
            }
            FlushTick::Run { .. } => {}
        }
        seq = seq.wrapping_add(1);
        debug!("[MAC] ----- frame period {seq} -----");

        state.nodes.lock().unwrap().sweep_missed();

        // Late registrations join at frame boundaries.
        admit_pending_rnl(state, usize::MAX);
        let newly_scheduled = allocate_unscheduled(state, DIST_COUNT_DATA_PHASE);
        if newly_scheduled > 0 {
            debug!("{}", state.schedules.lock().unwrap().dump());
        }

        let payload = build_cm(state, seq);
        enqueue_downlink(outbound, payload, wall_start);

        let records = state.app.lock().unwrap().parse_tick();
        if records > 0 {
            debug!("[APP] wrote {records} records");
        }

        if seq % 5 == 0 {
            debug!("{}", state.nodes.lock().unwrap().dump());
        }

        Timer::at(slot_start + period).await;
    }
    info!("[MAC] data collection phase end");
}

/// Drain up to `limit` pending registrations from the RNL into NODES,
/// returning the address words announced downlink. The RNL lock is released
/// before the NODES lock is taken; both lists are only ever written from the
/// phase task, so the brief gap is harmless.
fn admit_pending_rnl(state: &ServerState, limit: usize) -> Vec<AddrClass> {
    let mut admitted = Vec::new();
    let mut stale_schedules = Vec::new();
    while admitted.len() < limit {
        let node = state.rnl.lock().unwrap().pop_front();
        let Some(node) = node else { break };
        admitted.push(AddrClass {
            addr: node.addr,
            class: node.class,
        });
        let addr = node.addr;
        let outcome = state.nodes.lock().unwrap().commit(node);
        if outcome.admitted {
            info!("[MAC] NODE {addr:#06x}: admitted to population");
        }
        if let Some(addr) = outcome.drop_schedule {
            stale_schedules.push(addr);
        }
    }
    if !stale_schedules.is_empty() {
        let mut schedules = state.schedules.lock().unwrap();
        for addr in stale_schedules {
            schedules.remove_everywhere(addr);
        }
    }
    admitted
}

/// Allocate every unscheduled one-hop node, smallest demand first. Nodes the
/// allocator cannot place stay unscheduled and are retried next frame.
/// Returns the number of nodes scheduled.
fn allocate_unscheduled(state: &ServerState, dist_count: u8) -> usize {
    let candidates = state.nodes.lock().unwrap().unscheduled_one_hop();
    if candidates.is_empty() {
        return 0;
    }

    let mut placed = Vec::new();
    {
        let mut schedules = state.schedules.lock().unwrap();
        for (addr, class, demand) in candidates {
            // The address may still hold a stale allocation from before its
            // demand changed.
            schedules.remove_everywhere(addr);
            match schedules.allocate(addr, class, demand, dist_count) {
                Ok((group, start_lsi)) => {
                    info!("[MAC] NODE {addr:#06x}: scheduled to group {group} LSI {start_lsi}");
                    placed.push(addr);
                }
                Err(err) => warn!("[MAC] NODE {addr:#06x}: {err}"),
            }
        }
    }

    let mut nodes = state.nodes.lock().unwrap();
    for &addr in &placed {
        if let Some(node) = nodes.get_mut(addr) {
            node.schedule_flag = true;
            node.connected = true;
        }
        nodes.set_children_connected(addr, true);
    }
    placed.len()
}

/// Assemble one Scheduling Message: the first group still owing
/// announcements contributes a consecutive run of entries starting at its
/// first pending one. Every announced entry consumes one distribution;
/// announced relays extend the SCH2 window by one slot each (the bump
/// applies from the next SM on, matching what receivers see). Returns `None`
/// when no group has anything left to announce.
fn build_sm(state: &ServerState, sm_count: u8, sch2_start_slot: &mut u8) -> Option<Vec<u8>> {
    let relay_addrs: HashSet<u16> = {
        let nodes = state.nodes.lock().unwrap();
        nodes.iter().filter(|n| n.is_relay()).map(|n| n.addr).collect()
    };
    let relay_count = relay_addrs.len() as u8;

    let sch2_in_frame = *sch2_start_slot;
    let mut schedules = state.schedules.lock().unwrap();
    let group_id = (0..schedules.group_count()).find(|&i| schedules.group(i).dist_pending() > 0)?;

    let group = schedules.group_mut(group_id);
    let announce_count = (group.dist_pending() as usize).min(MAX_SM_NODES);
    let entries: Vec<ScheduleEntry> = group
        .iter()
        .skip_while(|e| e.dist_remaining == 0)
        .take(announce_count)
        .copied()
        .collect();
    debug_assert!(!entries.is_empty());

    for entry in &entries {
        if entry.dist_remaining > 0 {
            group.set_dist_remaining(entry.addr, entry.dist_remaining - 1);
        }
        if relay_addrs.contains(&entry.addr) {
            *sch2_start_slot += 1;
        }
    }

    let section = SmSection {
        group_id: group_id as u8,
        start_lsi: entries[0].start_lsi,
        nodes: entries
            .iter()
            .map(|e| SmNode {
                addr: e.addr,
                class: e.class,
                slot_demand: e.slot_demand,
            })
            .collect(),
    };
    Some(frame::encode_sm(
        &state.config,
        sm_count,
        SCH1_SLOT_COUNT,
        sch2_in_frame,
        relay_count,
        &section,
    ))
}

/// Assemble one Command Message: per-group last assigned LSI, plus updated
/// schedule info for up to [`MAX_USI_RELAYS`] entries still owing
/// announcements (same distribution decrement as SM).
fn build_cm(state: &ServerState, seq: u16) -> Vec<u8> {
    let (last_lsi, pending) = {
        let mut schedules = state.schedules.lock().unwrap();
        let last_lsi: Vec<u16> = schedules.groups().map(|g| g.last_assigned_lsi()).collect();
        let mut pending: Vec<(u8, ScheduleEntry)> = Vec::new();
        'groups: for group_id in 0..schedules.group_count() {
            let entries: Vec<ScheduleEntry> = schedules
                .group(group_id)
                .iter()
                .filter(|e| e.dist_remaining > 0)
                .copied()
                .collect();
            for entry in entries {
                if pending.len() >= MAX_USI_RELAYS {
                    break 'groups;
                }
                schedules
                    .group_mut(group_id)
                    .set_dist_remaining(entry.addr, entry.dist_remaining - 1);
                pending.push((group_id as u8, entry));
            }
        }
        (last_lsi, pending)
    };

    let usi: Vec<UsiEntry> = {
        let nodes = state.nodes.lock().unwrap();
        pending
            .into_iter()
            .map(|(group_id, entry)| UsiEntry {
                group_id,
                start_lsi: entry.start_lsi,
                parent: AddrClass {
                    addr: entry.addr,
                    class: entry.class,
                },
                children: nodes
                    .children_of(entry.addr)
                    .into_iter()
                    .map(|c| AddrClass {
                        addr: c.addr,
                        class: c.class,
                    })
                    .collect(),
            })
            .collect()
    };

    frame::encode_cm(&state.config, seq, &last_lsi, &usi)
}

/// Stamp the transmit time and push to the outbound queue. A full queue
/// drops this emission; the next period retries.
fn enqueue_downlink(outbound: &OutboundSender, payload: Vec<u8>, slot_start: SystemTime) {
    let tx_time = slot_start + StdDuration::from_millis(TX_SHIFT_MS);
    if outbound.try_send(TxMessage::broadcast(payload, tx_time)).is_err() {
        warn!("[MAC] outbound queue full, downlink dropped");
    }
}

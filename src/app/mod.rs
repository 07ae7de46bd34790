//! Application-domain boundary.
//!
//! The MAC core hands every collected payload to this handler and triggers a
//! parse pass once per frame. The handler buffers records per origin node and
//! drains them into the rotating CSV sink; interpreting the sensor payloads
//! themselves belongs to a downstream consumer of those files.

pub mod record_log;

pub use record_log::RecordLog;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Cap on buffered records per node between parse passes. A stalled parse
/// pass drops the oldest records rather than growing without bound.
const PENDING_RECORDS_PER_NODE: usize = 64;

struct PendingRecord {
    received_at: DateTime<Utc>,
    payload: Vec<u8>,
}

/// Sink for collected uplink payloads.
pub struct AppHandler {
    pending: HashMap<u16, Vec<PendingRecord>>,
    record_log: RecordLog,
}

impl AppHandler {
    pub fn new(record_log: RecordLog) -> Self {
        Self {
            pending: HashMap::new(),
            record_log,
        }
    }

    /// Accept one payload from the uplink dispatcher.
    pub fn handle_uplink(&mut self, origin: u16, payload: &[u8]) {
        let queue = self.pending.entry(origin).or_default();
        if queue.len() >= PENDING_RECORDS_PER_NODE {
            log::warn!("NODE {origin:#06x}: record buffer full, dropping oldest");
            queue.remove(0);
        }
        queue.push(PendingRecord {
            received_at: Utc::now(),
            payload: payload.to_vec(),
        });
    }

    /// Per-frame parse pass: drain buffered records into the record log and
    /// rotate the log when due. Returns the number of records written.
    pub fn parse_tick(&mut self) -> usize {
        self.record_log.rotate_if_due();
        let mut written = 0;
        for (&node, queue) in &mut self.pending {
            for record in queue.drain(..) {
                self.record_log.append(record.received_at, node, &record.payload);
                written += 1;
            }
        }
        self.pending.retain(|_, queue| !queue.is_empty());
        written
    }
}

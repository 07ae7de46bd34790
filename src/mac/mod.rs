//! Two-hop RT-LoRa MAC core.
//!
//! The coordinator discovers end-nodes through a registration protocol,
//! computes a conflict-free TDMA schedule across the configured frequency
//! groups, and drives the periodic frame of control and data slots.
//!
//! ## Module Organization
//!
//! - `types`: message envelopes, queue aliases, shared server state
//! - `registry`: registration node list and the committed population
//! - `schedule`: per-group slot allocation
//! - `frame`: byte-exact downlink/uplink codec
//! - `phase`: the phase state machine task
//! - `uplink`: the inbound dispatcher task

pub mod frame;
pub mod phase;
pub mod registry;
pub mod schedule;
pub mod types;
pub mod uplink;

pub use phase::phase_task;
pub use types::ServerState;
pub use uplink::uplink_task;

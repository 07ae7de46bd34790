//! Gateway transport: the TCP bridge between the MAC core and the radio
//! gateways.
//!
//! Gateways are transparent packet forwarders; every connected one receives
//! the same downlink fan-out and any of them may deliver uplinks. The module
//! splits into:
//!
//! - `wire`: the JSON-over-TCP datagram format (txpk/rxpk, timesync)
//! - `transport`: the accept loop, per-gateway reader threads, the gateway
//!   table and the async downlink writer

pub mod transport;
pub mod wire;

pub use transport::{GatewayTable, downlink_task, listener_loop};

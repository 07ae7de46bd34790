//! Gateway socket handling.
//!
//! Blocking side: an accept loop plus one reader thread per connected
//! gateway, feeding parsed uplinks into the inbound queue. Async side: the
//! downlink writer task drains the outbound queue and fans every datagram
//! out to all connected gateways. A gateway that fails a read or a write is
//! dropped without affecting the others.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use embassy_futures::select::{Either, select};
use log::{debug, info, warn};

use crate::gateway::wire::{self, GatewayDatagram};
use crate::mac::types::{InboundSender, OutboundReceiver, RxMessage, ServerState};

/// Largest datagram accepted from a gateway in one read.
const RX_BUFFER_SIZE: usize = 8192;

/// How often a blocked reader re-checks the quit flag.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// One connected gateway socket.
pub struct GatewayEntry {
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub connected_at: DateTime<Utc>,
}

/// All currently connected gateways, keyed by a monotonically increasing
/// socket identity.
#[derive(Default)]
pub struct GatewayTable {
    next_id: u64,
    gateways: HashMap<u64, GatewayEntry>,
}

impl GatewayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.gateways.insert(
            id,
            GatewayEntry {
                peer,
                stream,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.gateways.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &GatewayEntry)> {
        self.gateways.iter().map(|(&id, entry)| (id, entry))
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- GATEWAYS ({}) ---", self.gateways.len());
        let mut ids: Vec<u64> = self.gateways.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let entry = &self.gateways[&id];
            let _ = writeln!(
                out,
                "{:<6}{:<24}connected {}",
                id,
                entry.peer,
                entry.connected_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        out
    }
}

/// Accept loop for the gateway welcome socket. Each connection gets its own
/// reader thread; the writer half is registered in the gateway table.
pub fn listener_loop(state: &'static ServerState, listener: TcpListener, inbound: InboundSender) {
    for connection in listener.incoming() {
        if state.quit.load(Ordering::SeqCst) {
            break;
        }
        let stream = match connection {
            Ok(stream) => stream,
            Err(err) => {
                warn!("[GW] accept failed: {err}");
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                warn!("[GW] peer address unavailable: {err}");
                continue;
            }
        };
        let writer_half = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!("[GW] failed to clone gateway socket: {err}");
                continue;
            }
        };
        let id = state.gateways.lock().unwrap().insert(writer_half, peer);
        info!("[GW] connecting new gateway {id} ({peer})");

        let result = thread::Builder::new()
            .name(format!("gw-reader-{id}"))
            .spawn(move || reader_loop(state, stream, id, inbound));
        if let Err(err) = result {
            warn!("[GW] failed to spawn reader for gateway {id}: {err}");
            state.gateways.lock().unwrap().remove(id);
        }
    }
    info!("[GW] listener stopped");
}

/// Per-gateway read loop: one `read` yields one datagram.
fn reader_loop(state: &ServerState, mut stream: TcpStream, id: u64, inbound: InboundSender) {
    if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("[GW] gateway {id}: cannot set read timeout: {err}");
    }
    let mut buf = vec![0u8; RX_BUFFER_SIZE];
    loop {
        if state.quit.load(Ordering::SeqCst) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("[GW] gateway {id} closed its socket");
                break;
            }
            Ok(n) => handle_datagram(&stream, id, &buf[..n], &inbound),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => {
                warn!("[GW] gateway {id} read failed: {err}");
                break;
            }
        }
    }
    state.gateways.lock().unwrap().remove(id);
    info!("[GW] gateway {id} removed");
}

fn handle_datagram(stream: &TcpStream, id: u64, buf: &[u8], inbound: &InboundSender) {
    match wire::parse_gateway_datagram(buf) {
        Ok(GatewayDatagram::TimesyncReq { token_h, token_l }) => {
            debug!("[GW] received TIMESYNC_REQ from gateway {id}");
            let response = wire::encode_timesync_response(
                token_h,
                token_l,
                SystemTime::now(),
                SystemTime::now(),
            );
            if let Err(err) = (&mut &*stream).write_all(&response) {
                warn!("[GW] gateway {id}: timesync response failed: {err}");
            }
        }
        Ok(GatewayDatagram::UplinkData(packets)) => {
            for packet in packets {
                let msg = RxMessage {
                    gateway_id: id,
                    rssi: packet.rssi,
                    snr: packet.snr,
                    payload: packet.payload,
                };
                if inbound.try_send(msg).is_err() {
                    warn!("[GW] inbound queue full, uplink from gateway {id} dropped");
                }
            }
        }
        Err(err) => {
            warn!("[GW] ignoring invalid datagram from gateway {id}: {err}");
        }
    }
}

/// Downlink writer: drains the outbound queue and writes each datagram to
/// every connected gateway.
#[embassy_executor::task]
pub async fn downlink_task(state: &'static ServerState, outbound: OutboundReceiver) {
    loop {
        let msg = match select(outbound.receive(), state.downlink_shutdown.wait()).await {
            Either::First(msg) => msg,
            Either::Second(()) => break,
        };
        let datagram = match wire::encode_downlink_datagram(&msg) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!("[GW] downlink encoding failed: {err}");
                continue;
            }
        };

        let mut dead = Vec::new();
        {
            let gateways = state.gateways.lock().unwrap();
            for (id, entry) in gateways.iter() {
                if let Err(err) = (&mut &entry.stream).write_all(&datagram) {
                    warn!("[GW] write to gateway {id} failed: {err}");
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut gateways = state.gateways.lock().unwrap();
            for id in dead {
                gateways.remove(id);
                info!("[GW] gateway {id} dropped");
            }
        }
    }
    info!("[GW] downlink writer stopped");
}

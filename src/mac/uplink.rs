//! Uplink dispatcher: consumes the inbound queue and routes each frame.
//!
//! Registration requests become RNL entries; data frames update the origin's
//! statistics and feed the application handler. Anything malformed is
//! dropped with a log line and never disturbs the task.

use embassy_futures::select::{Either, select};
use log::{debug, info, warn};

use crate::mac::frame::{
    self, DataFrame, RegistrationRequest, UplinkBody, UplinkHeader,
};
use crate::mac::registry::{Node, NodeType};
use crate::mac::types::{InboundReceiver, RxMessage, ServerState};

/// Dispatcher loop. Wakes on inbound traffic, drains the queue, re-waits.
#[embassy_executor::task]
pub async fn uplink_task(state: &'static ServerState, inbound: InboundReceiver) {
    loop {
        let msg = match select(inbound.receive(), state.uplink_shutdown.wait()).await {
            Either::First(msg) => msg,
            Either::Second(()) => break,
        };
        handle_message(state, &msg);
        // Drain the batch that accumulated while processing.
        while let Ok(msg) = inbound.try_receive() {
            handle_message(state, &msg);
        }
    }
    info!("[MAC] uplink dispatcher stopped");
}

fn handle_message(state: &ServerState, msg: &RxMessage) {
    let parsed = match frame::parse_uplink(&msg.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("[MAC] dropping uplink from gateway {}: {err}", msg.gateway_id);
            return;
        }
    };
    match parsed.body {
        UplinkBody::Registration(request) => {
            handle_registration(state, &parsed.header, request, msg);
        }
        UplinkBody::Data(data) => handle_data(state, parsed.header.src, &data),
    }
}

fn handle_registration(
    state: &ServerState,
    header: &UplinkHeader,
    request: RegistrationRequest,
    msg: &RxMessage,
) {
    if header.dst != frame::SERVER_ADDR {
        debug!(
            "[MAC] RR from {:#06x} addressed to {:#06x}, ignored",
            header.src, header.dst
        );
        return;
    }
    match request {
        RegistrationRequest::SelfRegistration(word) => {
            info!(
                "[MAC] NODE {:#06x}: receive RR ({:.2}, {:.2})",
                word.addr, msg.rssi, msg.snr
            );
            state
                .rnl
                .lock()
                .unwrap()
                .enroll(Node::new(word.addr, word.class, NodeType::OneHop, 0));
        }
        RegistrationRequest::Relay(words) => {
            let mut rnl = state.rnl.lock().unwrap();
            for word in words {
                let node = if word.addr == header.src {
                    Node::new(word.addr, word.class, NodeType::OneHop, 0)
                } else {
                    info!(
                        "[MAC] NODE {:#06x}: receive RR via NODE {:#06x}",
                        word.addr, header.src
                    );
                    Node::new(word.addr, word.class, NodeType::TwoHop, header.src)
                };
                rnl.enroll(node);
            }
        }
    }
}

fn handle_data(state: &ServerState, frame_src: u16, data: &DataFrame<'_>) {
    let origin = data.origin(frame_src);
    if data.relayed {
        info!(
            "[MAC] NODE {origin:#06x}: receive DATA {} (via NODE {frame_src:#06x})",
            data.seq
        );
    } else {
        info!("[MAC] NODE {origin:#06x}: receive DATA {}", data.seq);
    }
    state.app.lock().unwrap().handle_uplink(origin, data.payload);
    state
        .nodes
        .lock()
        .unwrap()
        .update_seq(origin, data.seq, data.relayed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppHandler, RecordLog};
    use crate::config::MacConfig;

    fn test_state() -> ServerState {
        let dir = std::env::temp_dir().join(format!(
            "rtlora-uplink-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let config = MacConfig {
            frame_factor: 6,
            ul_slot_ms: 100,
            dl_slot_ms: 200,
            channel_count: 1,
        };
        ServerState::new(config, AppHandler::new(RecordLog::open(&dir, 3600).unwrap()))
    }

    fn rx(payload: Vec<u8>) -> RxMessage {
        RxMessage {
            gateway_id: 1,
            rssi: -90.0,
            snr: 7.5,
            payload,
        }
    }

    fn data_frame(src: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![4u8 << 4];
        buf.extend_from_slice(&src.to_le_bytes());
        buf.extend_from_slice(&frame::SERVER_ADDR.to_le_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.push(0); // direct, no j-slot, no signal meta
        buf.push(payload.len() as u8);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_self_registration_lands_in_rnl() {
        let state = test_state();
        let mut buf = vec![3u8 << 4];
        buf.extend_from_slice(&0x0101u16.to_le_bytes());
        buf.extend_from_slice(&frame::SERVER_ADDR.to_le_bytes());
        buf.push(0b0000_0100); // self registration, one word
        buf.extend_from_slice(&(0x0101u16 | 2 << 13).to_le_bytes());

        handle_message(&state, &rx(buf));
        let mut rnl = state.rnl.lock().unwrap();
        let node = rnl.pop_front().unwrap();
        assert_eq!(node.addr, 0x0101);
        assert_eq!(node.class, 2);
        assert_eq!(node.slot_demand, 4);
        assert_eq!(node.node_type, NodeType::OneHop);
    }

    #[test]
    fn test_registration_for_other_destination_is_ignored() {
        let state = test_state();
        let mut buf = vec![3u8 << 4];
        buf.extend_from_slice(&0x0101u16.to_le_bytes());
        buf.extend_from_slice(&0x1234u16.to_le_bytes());
        buf.push(0b0000_0100);
        buf.extend_from_slice(&0x0101u16.to_le_bytes());

        handle_message(&state, &rx(buf));
        assert!(state.rnl.lock().unwrap().is_empty());
    }

    #[test]
    fn test_relay_registration_enrolls_parent_and_children() {
        let state = test_state();
        let mut buf = vec![3u8 << 4];
        buf.extend_from_slice(&0x0101u16.to_le_bytes());
        buf.extend_from_slice(&frame::SERVER_ADDR.to_le_bytes());
        buf.push(0b0000_1010); // relay registration, two words
        buf.extend_from_slice(&0x0101u16.to_le_bytes());
        buf.extend_from_slice(&(0x0202u16 | 1 << 13).to_le_bytes());

        handle_message(&state, &rx(buf));
        let mut rnl = state.rnl.lock().unwrap();
        let relay = rnl.pop_front().unwrap();
        assert_eq!(relay.node_type, NodeType::OneHop);
        let child = rnl.pop_front().unwrap();
        assert_eq!(child.node_type, NodeType::TwoHop);
        assert_eq!(child.parent_addr, 0x0101);
        assert_eq!(child.slot_demand, 2);
    }

    #[test]
    fn test_data_updates_statistics_s4() {
        let state = test_state();
        state
            .nodes
            .lock()
            .unwrap()
            .commit(Node::new(0x0303, 0, NodeType::OneHop, 0));
        for seq in 1..=10 {
            handle_message(&state, &rx(data_frame(0x0303, seq, &[0x42])));
        }
        // Duplicate of the latest frame changes nothing.
        handle_message(&state, &rx(data_frame(0x0303, 10, &[0x42])));
        {
            let nodes = state.nodes.lock().unwrap();
            let node = nodes.get(0x0303).unwrap();
            assert_eq!(node.latest_seq, 10);
            assert_eq!(node.data_count, 10);
        }
        handle_message(&state, &rx(data_frame(0x0303, 11, &[0x42])));
        {
            let nodes = state.nodes.lock().unwrap();
            let node = nodes.get(0x0303).unwrap();
            assert_eq!(node.latest_seq, 11);
            assert_eq!(node.data_count, 11);
        }
        // Every frame reached the application handler, duplicates included.
        assert_eq!(state.app.lock().unwrap().parse_tick(), 12);
    }

    #[test]
    fn test_malformed_uplink_is_dropped() {
        let state = test_state();
        handle_message(&state, &rx(vec![0x40, 0x01]));
        handle_message(&state, &rx(vec![0xF0, 0, 0, 0, 0]));
        handle_message(&state, &rx(Vec::new()));
        assert!(state.rnl.lock().unwrap().is_empty());
        assert_eq!(state.nodes.lock().unwrap().len(), 0);
    }
}

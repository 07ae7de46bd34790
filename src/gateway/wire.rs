//! Gateway datagram format: JSON records over TCP with a small binary
//! header, as spoken by the packet forwarder.
//!
//! Downlinks are `{version, token_h, token_l, DOWNLINK_DATA}` followed by a
//! `{"txpk":{..}}` object with the payload in base64. Uplinks arrive as
//! `{version, token_h, token_l, id, gateway_eui(8)}` followed by a
//! `{"rxpk":[..]}` array, or as a bare timesync request that is answered
//! with the server's receive/transmit timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mac::types::{Modulation, TxMessage};

pub const PROTOCOL_VERSION: u8 = 2;

pub const DATAGRAM_TIMESYNC_REQ: u8 = 0;
pub const DATAGRAM_TIMESYNC_RES: u8 = 1;
pub const DATAGRAM_DOWNLINK_DATA: u8 = 2;
pub const DATAGRAM_UPLINK_DATA: u8 = 4;

/// Uplink datagrams carry the 4-byte header plus the 8-byte gateway EUI
/// before the JSON starts.
pub const UPLINK_HEADER_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unsupported datagram id {0}")]
    UnknownId(u8),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("downlink serialization failed: {0}")]
    Serialize(serde_json::Error),
}

/// Downlink transmit record, field for field what the gateway expects.
#[derive(Debug, Serialize)]
struct TxPk<'a> {
    tm_s: u64,
    tm_us: u32,
    imme: bool,
    rfch: u8,
    freq: f64,
    powe: i8,
    modu: &'a str,
    datr: String,
    codr: &'a str,
    ipol: bool,
    prea: u16,
    size: usize,
    data: String,
}

#[derive(Debug, Serialize)]
struct TxDatagram<'a> {
    txpk: TxPk<'a>,
}

/// One received radio packet inside an uplink datagram.
#[derive(Debug, Deserialize)]
struct RxPk {
    rssi: f32,
    lsnr: f32,
    size: u16,
    data: String,
}

#[derive(Debug, Deserialize)]
struct RxDatagram {
    rxpk: Vec<RxPk>,
}

/// A decoded uplink radio packet, payload already un-base64'd.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkPacket {
    pub rssi: f32,
    pub snr: f32,
    pub payload: Vec<u8>,
}

/// One datagram received from a gateway socket.
#[derive(Debug)]
pub enum GatewayDatagram {
    TimesyncReq { token_h: u8, token_l: u8 },
    /// Valid `rxpk` elements; malformed elements are logged and skipped.
    UplinkData(Vec<UplinkPacket>),
}

fn split_epoch(time: SystemTime) -> (u64, u32) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_secs(), since_epoch.subsec_micros())
}

/// Serialize a downlink message into a complete gateway datagram, random
/// acknowledgement tokens included.
pub fn encode_downlink_datagram(msg: &TxMessage) -> Result<Vec<u8>, WireError> {
    let (tm_s, tm_us) = split_epoch(msg.tx_time);
    let (modu, datr) = match msg.modulation {
        Modulation::Lora => (
            "LORA",
            format!("{}{}", msg.datarate.as_str(), msg.bandwidth.as_str()),
        ),
        Modulation::Fsk => ("FSK", String::from("50000")),
    };
    let record = TxDatagram {
        txpk: TxPk {
            tm_s,
            tm_us,
            imme: true,
            rfch: msg.rf_chain,
            freq: f64::from(msg.freq_hz) / 1e6,
            powe: msg.power_dbm,
            modu,
            datr,
            codr: msg.coderate.as_str(),
            ipol: msg.invert_pol,
            prea: msg.preamble,
            size: msg.payload.len(),
            data: BASE64.encode(&msg.payload),
        },
    };
    let json = serde_json::to_vec(&record).map_err(WireError::Serialize)?;

    let mut datagram = Vec::with_capacity(4 + json.len());
    datagram.push(PROTOCOL_VERSION);
    datagram.push(rand::random::<u8>());
    datagram.push(rand::random::<u8>());
    datagram.push(DATAGRAM_DOWNLINK_DATA);
    datagram.extend_from_slice(&json);
    Ok(datagram)
}

/// Parse one datagram received from a gateway socket.
pub fn parse_gateway_datagram(buf: &[u8]) -> Result<GatewayDatagram, WireError> {
    if buf.len() < UPLINK_HEADER_LEN {
        return Err(WireError::Truncated(buf.len()));
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(buf[0]));
    }
    match buf[3] {
        DATAGRAM_TIMESYNC_REQ => Ok(GatewayDatagram::TimesyncReq {
            token_h: buf[1],
            token_l: buf[2],
        }),
        DATAGRAM_UPLINK_DATA => {
            let parsed: RxDatagram = serde_json::from_slice(&buf[UPLINK_HEADER_LEN..])?;
            let mut packets = Vec::with_capacity(parsed.rxpk.len());
            for rxpk in parsed.rxpk {
                let payload = match BASE64.decode(&rxpk.data) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!("rxpk with undecodable payload skipped: {err}");
                        continue;
                    }
                };
                if payload.len() != usize::from(rxpk.size) {
                    log::warn!(
                        "rxpk size mismatch: advertised {}, decoded {}",
                        rxpk.size,
                        payload.len()
                    );
                    continue;
                }
                packets.push(UplinkPacket {
                    rssi: rxpk.rssi,
                    snr: rxpk.lsnr,
                    payload,
                });
            }
            Ok(GatewayDatagram::UplinkData(packets))
        }
        other => Err(WireError::UnknownId(other)),
    }
}

/// Build the timesync answer: echoed tokens plus server receive and
/// transmit timestamps as seconds/microseconds pairs.
pub fn encode_timesync_response(
    token_h: u8,
    token_l: u8,
    rx_time: SystemTime,
    tx_time: SystemTime,
) -> [u8; 20] {
    let (rx_s, rx_us) = split_epoch(rx_time);
    let (tx_s, tx_us) = split_epoch(tx_time);
    let mut buf = [0u8; 20];
    buf[0] = PROTOCOL_VERSION;
    buf[1] = token_h;
    buf[2] = token_l;
    buf[3] = DATAGRAM_TIMESYNC_RES;
    buf[4..8].copy_from_slice(&(rx_s as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&rx_us.to_le_bytes());
    buf[12..16].copy_from_slice(&(tx_s as u32).to_le_bytes());
    buf[16..20].copy_from_slice(&tx_us.to_le_bytes());
    buf
}

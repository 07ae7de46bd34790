//! Frame protocol codec: downlink RNL/SM/CM assembly and uplink RR/DATA
//! parsing.
//!
//! The wire format is byte-exact. Bit-packed control words are declared with
//! `modular-bitfield`, first field in the least significant bits; multi-byte
//! fields are little-endian. Every downlink frame starts with
//! `mac_header(1) | src(2) | dst(2) | mac_params(2)`; uplink frames carry
//! only `mac_header(1) | src(2) | dst(2)` (end-nodes do not echo the MAC
//! parameters).

use modular_bitfield::prelude::*;
use thiserror::Error;

use crate::config::MacConfig;

/// Source address of every server downlink.
pub const SERVER_ADDR: u16 = 0xAEBE;
/// Destination of every server downlink.
pub const BROADCAST_ADDR: u16 = 0xCAFE;

/// Address-word cap of one RNL message.
pub const MAX_RNL_NODES: usize = 20;
/// Node cap of one SM group section (5-bit count).
pub const MAX_SM_NODES: usize = 31;
/// Entry cap of one CM updated-schedule-info section (4-bit count).
pub const MAX_USI_RELAYS: usize = 15;

/// Downlink fixed prefix length.
pub const DL_HEADER_LEN: usize = 7;
/// Uplink fixed prefix length.
pub const UL_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 4]
pub enum PacketType {
    /// Registration Node List (downlink).
    Rnl = 0,
    /// Scheduling Message (downlink).
    Sm = 1,
    /// Command Message (downlink).
    Cm = 2,
    /// Registration Request (uplink).
    Rr = 3,
    /// Uplink data.
    Data = 4,
}

/// `mac_header`: packet type in the high nibble, low nibble reserved.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct MacHeader {
    pub rfu: B4,
    #[bits = 4]
    pub pkt_type: PacketType,
}

/// `mac_params`: the four remotely configured MAC parameters, packed into 16
/// bits. Slot sizes travel divided by 10.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct MacParams {
    pub frame_factor: B3,
    pub ul_slot_size: B5,
    pub dl_slot_size: B5,
    pub channel_count: B3,
}

/// 16-bit addressing word: 13-bit node address plus 3-bit class.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AddrWord {
    pub address: B13,
    pub class: B3,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct RnlCtrl {
    pub net_ready: bool,
    pub added_count: B7,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct RrCtrl {
    pub reg_type: B2,
    pub child_count: B6,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SmCtrl {
    pub sm_count: B4,
    pub sch1_size: B4,
}

/// Header of one SM group section.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct GroupCtrl {
    pub group_id: B3,
    pub node_count: B5,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct CmCtrl {
    pub usi_flag: bool,
    pub usi_count: B4,
    pub rfu: B3,
}

/// Header of one USI relay entry inside a CM.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct UsiCtrl {
    pub group_id: B3,
    pub child_count: B5,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct DataCtrl {
    pub relayed: bool,
    pub j_slot: bool,
    pub signal_meta: bool,
    pub rfu: B5,
}

/// Registration type values carried in `rr_ctrl.reg_type`.
pub const RR_TYPE_SELF: u8 = 0;
pub const RR_TYPE_RELAY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown packet type {0:#x}")]
    UnknownPacketType(u8),
    #[error("packet type {0:?} is not an uplink type")]
    UnexpectedPacketType(PacketType),
    #[error("unknown registration type {0}")]
    UnknownRegistrationType(u8),
    #[error("payload length {advertised} overruns frame ({available} bytes left)")]
    PayloadOverrun { advertised: usize, available: usize },
}

fn need(buf: &[u8], need: usize) -> Result<(), FrameError> {
    if buf.len() < need {
        Err(FrameError::Truncated {
            need,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Address/class pair as it appears in address words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrClass {
    pub addr: u16,
    pub class: u8,
}

impl AddrClass {
    fn to_word(self) -> [u8; 2] {
        AddrWord::new()
            .with_address(self.addr)
            .with_class(self.class)
            .into_bytes()
    }

    fn from_word(bytes: [u8; 2]) -> Self {
        let word = AddrWord::from_bytes(bytes);
        Self {
            addr: word.address(),
            class: word.class(),
        }
    }
}

fn push_downlink_header(buf: &mut Vec<u8>, pkt_type: PacketType, cfg: &MacConfig) {
    buf.extend_from_slice(
        &MacHeader::new()
            .with_rfu(0)
            .with_pkt_type(pkt_type)
            .into_bytes(),
    );
    buf.extend_from_slice(&SERVER_ADDR.to_le_bytes());
    buf.extend_from_slice(&BROADCAST_ADDR.to_le_bytes());
    buf.extend_from_slice(
        &MacParams::new()
            .with_frame_factor(cfg.frame_factor)
            .with_ul_slot_size((cfg.ul_slot_ms / 10) as u8)
            .with_dl_slot_size((cfg.dl_slot_ms / 10) as u8)
            .with_channel_count(cfg.channel_count)
            .into_bytes(),
    );
}

/// Encode a Registration Node List announcement. `admitted` carries the
/// nodes drained from the RNL into the population for this period, at most
/// [`MAX_RNL_NODES`].
pub fn encode_rnl(cfg: &MacConfig, seq: u16, net_ready: bool, admitted: &[AddrClass]) -> Vec<u8> {
    debug_assert!(admitted.len() <= MAX_RNL_NODES);
    let mut buf = Vec::with_capacity(DL_HEADER_LEN + 3 + 2 * admitted.len());
    push_downlink_header(&mut buf, PacketType::Rnl, cfg);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(
        &RnlCtrl::new()
            .with_net_ready(net_ready)
            .with_added_count(admitted.len() as u8)
            .into_bytes(),
    );
    for node in admitted {
        buf.extend_from_slice(&node.to_word());
    }
    buf
}

/// One node announced inside an SM group section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmNode {
    pub addr: u16,
    pub class: u8,
    pub slot_demand: u16,
}

/// The schedule run announced by one SM: a consecutive stretch of one
/// group's entries, starting at `start_lsi`. Receivers reconstruct each
/// node's slots from the start LSI and the demands in order.
#[derive(Debug, Clone)]
pub struct SmSection {
    pub group_id: u8,
    pub start_lsi: u16,
    pub nodes: Vec<SmNode>,
}

/// Encode a Scheduling Message for one SCH1 slot.
pub fn encode_sm(
    cfg: &MacConfig,
    sm_count: u8,
    sch1_size: u8,
    sch2_start_slot: u8,
    relay_count: u8,
    section: &SmSection,
) -> Vec<u8> {
    debug_assert!(section.nodes.len() <= MAX_SM_NODES);
    let mut buf = Vec::with_capacity(DL_HEADER_LEN + 5 + 3 * section.nodes.len());
    push_downlink_header(&mut buf, PacketType::Sm, cfg);
    buf.extend_from_slice(
        &SmCtrl::new()
            .with_sm_count(sm_count)
            .with_sch1_size(sch1_size)
            .into_bytes(),
    );
    buf.push(sch2_start_slot);
    buf.push(relay_count);
    buf.extend_from_slice(
        &GroupCtrl::new()
            .with_group_id(section.group_id)
            .with_node_count(section.nodes.len() as u8)
            .into_bytes(),
    );
    buf.push(section.start_lsi as u8);
    for node in &section.nodes {
        buf.extend_from_slice(
            &AddrClass {
                addr: node.addr,
                class: node.class,
            }
            .to_word(),
        );
        buf.push(node.slot_demand as u8);
    }
    buf
}

/// One relay's allocation inside a CM updated-schedule-info section.
#[derive(Debug, Clone)]
pub struct UsiEntry {
    pub group_id: u8,
    pub start_lsi: u16,
    pub parent: AddrClass,
    pub children: Vec<AddrClass>,
}

/// Encode a Command Message: last assigned LSI per group, plus updated
/// schedule info for entries still owing announcements.
pub fn encode_cm(cfg: &MacConfig, seq: u16, last_lsi: &[u16], usi: &[UsiEntry]) -> Vec<u8> {
    debug_assert!(usi.len() <= MAX_USI_RELAYS);
    let mut buf = Vec::with_capacity(DL_HEADER_LEN + 3 + last_lsi.len() + 8 * usi.len());
    push_downlink_header(&mut buf, PacketType::Cm, cfg);
    buf.extend_from_slice(&seq.to_le_bytes());
    for &lsi in last_lsi {
        buf.push(lsi as u8);
    }
    buf.extend_from_slice(
        &CmCtrl::new()
            .with_usi_flag(!usi.is_empty())
            .with_usi_count(usi.len() as u8)
            .with_rfu(0)
            .into_bytes(),
    );
    for entry in usi {
        buf.extend_from_slice(
            &UsiCtrl::new()
                .with_group_id(entry.group_id)
                .with_child_count(entry.children.len() as u8)
                .into_bytes(),
        );
        buf.push(entry.start_lsi as u8);
        buf.extend_from_slice(&entry.parent.to_word());
        for child in &entry.children {
            buf.extend_from_slice(&child.to_word());
        }
    }
    buf
}

/// Fixed uplink prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkHeader {
    pub pkt_type: PacketType,
    pub src: u16,
    pub dst: u16,
}

/// A decoded registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    /// Type 0: a one-hop node registering itself.
    SelfRegistration(AddrClass),
    /// Type 2: a relay registering itself and its children. The word whose
    /// address matches the frame source is the relay; the others are two-hop
    /// children of that source.
    Relay(Vec<AddrClass>),
}

/// A decoded uplink data frame. `relay_origin` is present when the frame was
/// forwarded by a relay parent; `link_rssi`/`link_snr` report the child-leg
/// signal quality when the node measured it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub seq: u16,
    pub relayed: bool,
    pub relay_origin: Option<u16>,
    pub link_rssi: Option<i16>,
    pub link_snr: Option<i8>,
    pub payload: &'a [u8],
}

impl DataFrame<'_> {
    /// The node the payload originates from.
    pub fn origin(&self, frame_src: u16) -> u16 {
        self.relay_origin.unwrap_or(frame_src)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkBody<'a> {
    Registration(RegistrationRequest),
    Data(DataFrame<'a>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUplink<'a> {
    pub header: UplinkHeader,
    pub body: UplinkBody<'a>,
}

/// Parse one uplink MAC frame.
pub fn parse_uplink(buf: &[u8]) -> Result<ParsedUplink<'_>, FrameError> {
    need(buf, UL_HEADER_LEN)?;
    let header_byte = MacHeader::from_bytes([buf[0]]);
    let pkt_type = header_byte
        .pkt_type_or_err()
        .map_err(|_| FrameError::UnknownPacketType(buf[0] >> 4))?;
    let header = UplinkHeader {
        pkt_type,
        src: u16::from_le_bytes([buf[1], buf[2]]),
        dst: u16::from_le_bytes([buf[3], buf[4]]),
    };
    let rest = &buf[UL_HEADER_LEN..];
    let body = match pkt_type {
        PacketType::Rr => UplinkBody::Registration(parse_rr(rest)?),
        PacketType::Data => UplinkBody::Data(parse_data(rest)?),
        other => return Err(FrameError::UnexpectedPacketType(other)),
    };
    Ok(ParsedUplink { header, body })
}

fn parse_rr(buf: &[u8]) -> Result<RegistrationRequest, FrameError> {
    need(buf, 1)?;
    let ctrl = RrCtrl::from_bytes([buf[0]]);
    let words = &buf[1..];
    match ctrl.reg_type() {
        RR_TYPE_SELF => {
            need(words, 2)?;
            Ok(RegistrationRequest::SelfRegistration(AddrClass::from_word(
                [words[0], words[1]],
            )))
        }
        RR_TYPE_RELAY => {
            let count = ctrl.child_count() as usize;
            need(words, 2 * count)?;
            let nodes = (0..count)
                .map(|i| AddrClass::from_word([words[2 * i], words[2 * i + 1]]))
                .collect();
            Ok(RegistrationRequest::Relay(nodes))
        }
        other => Err(FrameError::UnknownRegistrationType(other)),
    }
}

fn parse_data(buf: &[u8]) -> Result<DataFrame<'_>, FrameError> {
    need(buf, 3)?;
    let seq = u16::from_le_bytes([buf[0], buf[1]]);
    let ctrl = DataCtrl::from_bytes([buf[2]]);
    let mut offset = 3;
    if ctrl.j_slot() {
        offset += 1;
    }
    let relay_origin = if ctrl.relayed() {
        need(buf, offset + 2)?;
        let origin = u16::from_le_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;
        Some(origin)
    } else {
        None
    };
    let (link_rssi, link_snr) = if ctrl.signal_meta() {
        need(buf, offset + 3)?;
        let rssi = i16::from_le_bytes([buf[offset], buf[offset + 1]]);
        let snr = buf[offset + 2] as i8;
        offset += 3;
        (Some(rssi), Some(snr))
    } else {
        (None, None)
    };
    need(buf, offset + 1)?;
    let advertised = buf[offset] as usize;
    offset += 1;
    let available = buf.len() - offset;
    if advertised > available {
        return Err(FrameError::PayloadOverrun {
            advertised,
            available,
        });
    }
    Ok(DataFrame {
        seq,
        relayed: ctrl.relayed(),
        relay_origin,
        link_rssi,
        link_snr,
        payload: &buf[offset..offset + advertised],
    })
}

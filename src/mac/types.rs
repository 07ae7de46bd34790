//! Shared types for the MAC core.
//!
//! Contains the message envelopes moved through the inbound/outbound queues,
//! the bounded channel aliases binding the transport to the coordinator, the
//! radio metadata attached to every downlink, and the state shared between
//! the long-lived tasks.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::SystemTime;

use crate::app::AppHandler;
use crate::config::MacConfig;
use crate::gateway::GatewayTable;
use crate::mac::registry::{NodeList, NodeTable};
use crate::mac::schedule::SlotAllocator;

/// Maximum MAC payload carried in a single radio frame.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Depth of both packet queues. Producers never block; a full queue drops the
/// packet and the next tick retries.
pub const PACKET_QUEUE_SIZE: usize = 16;

/// Bounded channel carrying uplink messages from the gateway readers to the
/// uplink dispatcher.
pub type InboundQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, RxMessage, PACKET_QUEUE_SIZE>;
/// Receiver side of the inbound channel.
pub type InboundReceiver = embassy_sync::channel::Receiver<
    'static,
    CriticalSectionRawMutex,
    RxMessage,
    PACKET_QUEUE_SIZE,
>;
/// Sender side of the inbound channel.
pub type InboundSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, RxMessage, PACKET_QUEUE_SIZE>;

/// Bounded channel carrying downlink messages from the phase task to the
/// gateway writer.
pub type OutboundQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, TxMessage, PACKET_QUEUE_SIZE>;
/// Receiver side of the outbound channel.
pub type OutboundReceiver = embassy_sync::channel::Receiver<
    'static,
    CriticalSectionRawMutex,
    TxMessage,
    PACKET_QUEUE_SIZE,
>;
/// Sender side of the outbound channel.
pub type OutboundSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TxMessage, PACKET_QUEUE_SIZE>;

/// Shutdown notification used to wake a task blocked on a channel receive.
pub type ShutdownSignal = Signal<CriticalSectionRawMutex, ()>;

/// LoRa / FSK modulation selector for downlink metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Lora,
    Fsk,
}

/// LoRa spreading factors supported by the downlink channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datarate {
    Sf7,
    Sf8,
    Sf9,
    Sf10,
    Sf11,
    Sf12,
}

impl Datarate {
    pub fn as_str(self) -> &'static str {
        match self {
            Datarate::Sf7 => "SF7",
            Datarate::Sf8 => "SF8",
            Datarate::Sf9 => "SF9",
            Datarate::Sf10 => "SF10",
            Datarate::Sf11 => "SF11",
            Datarate::Sf12 => "SF12",
        }
    }
}

/// LoRa modulation bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn as_str(self) -> &'static str {
        match self {
            Bandwidth::Khz125 => "BW125",
            Bandwidth::Khz250 => "BW250",
            Bandwidth::Khz500 => "BW500",
        }
    }
}

/// LoRa error-correcting code rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coderate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl Coderate {
    pub fn as_str(self) -> &'static str {
        match self {
            Coderate::Cr4_5 => "4/5",
            Coderate::Cr4_6 => "4/6",
            Coderate::Cr4_7 => "4/7",
            Coderate::Cr4_8 => "4/8",
        }
    }
}

/// Downlink broadcast channel, Hz.
pub const DOWNLINK_FREQ_HZ: u32 = 922_100_000;
/// Downlink transmit power, dBm.
pub const DOWNLINK_POWER_DBM: i8 = 23;
/// Downlink preamble length, symbols.
pub const DOWNLINK_PREAMBLE: u16 = 8;

/// Downlink message envelope: radio metadata plus an opaque MAC payload.
/// Constructed by the phase task, moved through the outbound queue, and
/// consumed by the gateway writer exactly once.
#[derive(Debug, Clone)]
pub struct TxMessage {
    /// Absolute wall-clock instant at which the gateway should transmit.
    pub tx_time: SystemTime,
    pub freq_hz: u32,
    pub rf_chain: u8,
    pub power_dbm: i8,
    pub modulation: Modulation,
    pub bandwidth: Bandwidth,
    pub datarate: Datarate,
    pub coderate: Coderate,
    pub invert_pol: bool,
    pub preamble: u16,
    pub payload: Vec<u8>,
}

impl TxMessage {
    /// Envelope for a MAC broadcast on the downlink control channel.
    pub fn broadcast(payload: Vec<u8>, tx_time: SystemTime) -> Self {
        Self {
            tx_time,
            freq_hz: DOWNLINK_FREQ_HZ,
            rf_chain: 0,
            power_dbm: DOWNLINK_POWER_DBM,
            modulation: Modulation::Lora,
            bandwidth: Bandwidth::Khz125,
            datarate: Datarate::Sf7,
            coderate: Coderate::Cr4_5,
            invert_pol: false,
            preamble: DOWNLINK_PREAMBLE,
            payload,
        }
    }
}

/// Uplink message envelope: one radio frame as reported by a gateway.
#[derive(Debug, Clone)]
pub struct RxMessage {
    /// Identity of the gateway socket the frame arrived on.
    pub gateway_id: u64,
    /// Average frame RSSI reported by the gateway, dBm.
    pub rssi: f32,
    /// Average frame SNR reported by the gateway, dB.
    pub snr: f32,
    pub payload: Vec<u8>,
}

/// State shared between the phase task, the uplink dispatcher, the transport
/// and the operator console.
///
/// Each resource carries its own mutex and the locks are never nested: code
/// that needs data from two resources collects from one, releases it, then
/// acquires the next.
pub struct ServerState {
    pub config: MacConfig,
    /// Registration node list: nodes awaiting admission.
    pub rnl: Mutex<NodeList>,
    /// Committed node population with topology and statistics.
    pub nodes: Mutex<NodeTable>,
    /// Per-group slot schedules.
    pub schedules: Mutex<SlotAllocator>,
    /// Connected gateway sockets.
    pub gateways: Mutex<GatewayTable>,
    /// Application-domain handler fed by the uplink dispatcher.
    pub app: Mutex<AppHandler>,
    /// Set by the operator console (`PT`); cleared by the phase task once the
    /// transition has been flushed.
    pub phase_transition_request: AtomicBool,
    /// Set once on `x`; every task exits its loop at the next wake.
    pub quit: AtomicBool,
    pub uplink_shutdown: ShutdownSignal,
    pub downlink_shutdown: ShutdownSignal,
}

impl ServerState {
    pub fn new(config: MacConfig, app: AppHandler) -> Self {
        let groups = config.channel_count as usize;
        let max_lsi = config.max_lsi();
        Self {
            config,
            rnl: Mutex::new(NodeList::new()),
            nodes: Mutex::new(NodeTable::new()),
            schedules: Mutex::new(SlotAllocator::new(groups, max_lsi)),
            gateways: Mutex::new(GatewayTable::new()),
            app: Mutex::new(app),
            phase_transition_request: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            uplink_shutdown: Signal::new(),
            downlink_shutdown: Signal::new(),
        }
    }
}

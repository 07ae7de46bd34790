//! Two-hop RT-LoRa network server entry point.
//!
//! The server discovers end-nodes through a registration protocol, computes
//! a conflict-free TDMA schedule across the configured frequency groups, and
//! drives a periodic frame of control and data slots while collecting uplink
//! telemetry from the connected gateways.
//!
//! ## Architecture Overview
//!
//! Blocking surfaces run on OS threads, the coordination core runs as async
//! tasks on a dedicated Embassy executor thread:
//!
//! 1. **Main thread**: the operator console (`d`, `g`, `PT`, `x`).
//! 2. **Listener thread**: accepts gateway sockets; each gateway gets its
//!    own reader thread feeding the inbound queue.
//! 3. **Embassy executor thread**: the phase state machine, the uplink
//!    dispatcher and the downlink writer, joined by two bounded channels.
//!
//! Fatal conditions (bind failure, unusable record log, bad configuration)
//! abort startup before the network listener opens.

use clap::Parser;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info};
use std::net::TcpListener;
use std::thread;

mod app;
mod config;
mod console;
mod gateway;
mod mac;

use app::{AppHandler, RecordLog};
use config::{Cli, MacConfig, ServerConfig};
use mac::types::{
    InboundQueue, InboundReceiver, OutboundQueue, OutboundReceiver, OutboundSender, ServerState,
};

/// Spawn the MAC core tasks once the executor is running.
fn embassy_init(
    spawner: Spawner,
    state: &'static ServerState,
    inbound_rx: InboundReceiver,
    outbound_rx: OutboundReceiver,
    outbound_tx: OutboundSender,
) {
    let _ = spawner.spawn(mac::phase_task(state, outbound_tx));
    let _ = spawner.spawn(mac::uplink_task(state, inbound_rx));
    let _ = spawner.spawn(gateway::downlink_task(state, outbound_rx));
}

fn main() -> anyhow::Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("rtlora_server"), LevelFilter::Debug)
        .init();

    let cli = Cli::parse();
    let server_config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let mac_config = MacConfig::from_cli(&cli);

    info!("[ LoRa Network Server ]");
    info!("RT-LoRa MAC configuration:");
    info!("    frame factor N:     {}", mac_config.frame_factor);
    info!("    uplink slot size:   {} ms", mac_config.ul_slot_ms);
    info!("    downlink slot size: {} ms", mac_config.dl_slot_ms);
    info!("    channels:           {}", mac_config.channel_count);

    // Fail fast on everything fatal before any gateway can connect.
    let record_log = RecordLog::open(&server_config.record_log_dir, server_config.log_rotate_secs)?;
    let listener = TcpListener::bind(("0.0.0.0", server_config.listen_port))?;
    info!("gateway welcome server on port {}", server_config.listen_port);

    // The channels and the shared state outlive every task and thread; the
    // leaks satisfy the executor's 'static requirements and are reclaimed at
    // process exit.
    let state: &'static ServerState =
        Box::leak(Box::new(ServerState::new(mac_config, AppHandler::new(record_log))));
    let inbound: &'static InboundQueue = Box::leak(Box::new(InboundQueue::new()));
    let outbound: &'static OutboundQueue = Box::leak(Box::new(OutboundQueue::new()));

    let inbound_tx = inbound.sender();
    let inbound_rx = inbound.receiver();
    let outbound_tx = outbound.sender();
    let outbound_rx = outbound.receiver();

    thread::Builder::new()
        .name("gw-listener".to_string())
        .spawn(move || gateway::listener_loop(state, listener, inbound_tx))?;

    thread::Builder::new()
        .name("mac-executor".to_string())
        .spawn(move || {
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| {
                embassy_init(spawner, state, inbound_rx, outbound_rx, outbound_tx)
            });
        })?;

    // The operator console owns the main thread until shutdown.
    console::run(state);

    info!("end of program");
    Ok(())
}

//! Operator console.
//!
//! Runs on the main thread and reads single-line commands from stdin:
//! `d` dumps the node population, `g` dumps connected gateways, `PT`
//! requests a phase transition, `x` shuts the server down.

use std::io::BufRead;
use std::sync::atomic::Ordering;

use log::info;

use crate::mac::types::ServerState;

/// Blocking command loop; returns when the operator quits or stdin closes.
pub fn run(state: &ServerState) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "d" => print!("{}", state.nodes.lock().unwrap().dump()),
            "g" => print!("{}", state.gateways.lock().unwrap().dump()),
            "PT" => {
                info!("[SERVER] received phase transition request from operator");
                state.phase_transition_request.store(true, Ordering::SeqCst);
            }
            "x" => {
                info!("[SERVER] shutting down");
                state.quit.store(true, Ordering::SeqCst);
                state.uplink_shutdown.signal(());
                state.downlink_shutdown.signal(());
                return;
            }
            "" => {}
            other => println!("unknown command `{other}` (d, g, PT, x)"),
        }
    }
    // stdin closed without an explicit quit; shut down anyway.
    state.quit.store(true, Ordering::SeqCst);
    state.uplink_shutdown.signal(());
    state.downlink_shutdown.signal(());
}

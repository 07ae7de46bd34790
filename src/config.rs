//! Startup configuration: MAC parameters from the command line and optional
//! server settings from a TOML file.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

/// Two-hop RT-LoRa network server.
#[derive(Parser, Debug)]
#[command(name = "rtlora-server", version)]
pub struct Cli {
    /// MAC frame factor N; a frame carries 2^N uplink slots.
    #[arg(short = 'n', long = "frame-factor", default_value_t = 6,
          value_parser = clap::value_parser!(u8).range(1..=7))]
    pub frame_factor: u8,

    /// Uplink slot size in milliseconds (30..=310, multiple of 10).
    #[arg(short = 'u', long = "uplink-slot", default_value_t = 100, value_parser = parse_slot_size)]
    pub ul_slot_ms: u16,

    /// Downlink slot size in milliseconds (30..=310, multiple of 10).
    #[arg(short = 'd', long = "downlink-slot", default_value_t = 200, value_parser = parse_slot_size)]
    pub dl_slot_ms: u16,

    /// Number of radio channels; each channel carries its own scheduling group.
    /// Must match the channels enabled in the gateway configuration.
    #[arg(short = 'c', long = "channels", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(1..=7))]
    pub channel_count: u8,

    /// Server settings file; built-in defaults apply when omitted.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// Slot sizes travel on the wire divided by 10 in a 5-bit field, hence the
/// bounds and the granularity.
fn parse_slot_size(value: &str) -> Result<u16, String> {
    let ms: u16 = value.parse().map_err(|_| format!("`{value}` is not a number"))?;
    if !(30..=310).contains(&ms) {
        return Err(format!("slot size {ms} out of range 30..=310"));
    }
    if ms % 10 != 0 {
        return Err(format!("slot size {ms} must be a multiple of 10"));
    }
    Ok(ms)
}

/// The four remotely configured MAC parameters, fixed for the lifetime of
/// the network and announced in every downlink header.
#[derive(Debug, Clone, Copy)]
pub struct MacConfig {
    pub frame_factor: u8,
    pub ul_slot_ms: u16,
    pub dl_slot_ms: u16,
    pub channel_count: u8,
}

impl MacConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            frame_factor: cli.frame_factor,
            ul_slot_ms: cli.ul_slot_ms,
            dl_slot_ms: cli.dl_slot_ms,
            channel_count: cli.channel_count,
        }
    }

    /// Number of uplink slots per frame; LSIs run `1..=max_lsi`.
    pub fn max_lsi(self) -> u16 {
        1u16 << self.frame_factor
    }

    /// Data-Collection frame period: the uplink slots plus one downlink slot
    /// at each frame edge.
    pub fn frame_period_ms(self) -> u64 {
        u64::from(self.max_lsi()) * u64::from(self.ul_slot_ms) + 2 * u64::from(self.dl_slot_ms)
    }
}

/// Server-side settings loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    /// TCP port the gateway welcome server listens on.
    pub listen_port: u16,
    /// Directory the rotating data-record log is written to.
    pub record_log_dir: PathBuf,
    /// Record log rotation interval in seconds.
    pub log_rotate_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 8000,
            record_log_dir: PathBuf::from("records"),
            log_rotate_secs: 7200,
        }
    }
}

impl ServerConfig {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_period() {
        // N=6, u=100 ms, d=200 ms: 64*100 + 2*200 = 6800 ms.
        let cfg = MacConfig {
            frame_factor: 6,
            ul_slot_ms: 100,
            dl_slot_ms: 200,
            channel_count: 1,
        };
        assert_eq!(cfg.frame_period_ms(), 6800);
        assert_eq!(cfg.max_lsi(), 64);
    }

    #[test]
    fn test_slot_size_bounds() {
        assert_eq!(parse_slot_size("100"), Ok(100));
        assert_eq!(parse_slot_size("30"), Ok(30));
        assert_eq!(parse_slot_size("310"), Ok(310));
        assert!(parse_slot_size("20").is_err());
        assert!(parse_slot_size("320").is_err());
        assert!(parse_slot_size("105").is_err());
        assert!(parse_slot_size("abc").is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.listen_port, 8000);
        assert_eq!(cfg.log_rotate_secs, 7200);
    }

    #[test]
    fn test_server_config_parse() {
        let cfg: ServerConfig = toml::from_str("listen-port = 9001\nlog-rotate-secs = 60\n").unwrap();
        assert_eq!(cfg.listen_port, 9001);
        assert_eq!(cfg.log_rotate_secs, 60);
    }
}

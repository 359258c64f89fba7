//! Runtime configuration. Every knob has a built-in default, can be loaded
//! from a TOML document (services typically do this), and is finally
//! overridden by `POSITRON_*` environment variables so deployments can be
//! tuned without touching config files.

use serde_derive::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

pub const DEFAULT_SERVER_PORT: u16 = 5075;
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 16384;
pub const DEFAULT_CONNECTION_TIMEOUT: f64 = 30.0;
pub const DEFAULT_BEACON_PERIOD: f64 = 15.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection timeout in seconds. Heartbeats run at half this period.
    pub connection_timeout: f64,
    /// Beacon period in seconds (advisory, discovery is carried elsewhere).
    pub beacon_period: f64,
    /// Addresses to contact or announce on, space separated host[:port].
    pub addr_list: Vec<String>,
    /// Addresses never contacted or answered.
    pub ignore_addr_list: Vec<String>,
    /// Whether the local broadcast addresses are appended to `addr_list`.
    pub auto_addr_list: bool,
    pub broadcast_port: u16,
    pub server_port: u16,
    /// Target size for the TCP receive window and the codec buffers.
    pub recv_buffer_size: usize,
    /// Provider names consulted in order when resolving a channel.
    pub providers: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            beacon_period: DEFAULT_BEACON_PERIOD,
            addr_list: Vec::new(),
            ignore_addr_list: Vec::new(),
            auto_addr_list: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_port: DEFAULT_SERVER_PORT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            providers: Vec::new(),
        }
    }
}

impl Config {
    /// Defaults overridden by whatever `POSITRON_*` variables are set.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Applies environment overrides onto an already-loaded configuration.
    pub fn apply_env(&mut self) {
        env_value("POSITRON_CONNECTION_TIMEOUT", &mut self.connection_timeout);
        env_value("POSITRON_BEACON_PERIOD", &mut self.beacon_period);
        env_list("POSITRON_ADDR_LIST", &mut self.addr_list);
        env_list("POSITRON_IGNORE_ADDR_LIST", &mut self.ignore_addr_list);
        env_flag("POSITRON_AUTO_ADDR_LIST", &mut self.auto_addr_list);
        env_value("POSITRON_BROADCAST_PORT", &mut self.broadcast_port);
        env_value("POSITRON_SERVER_PORT", &mut self.server_port);
        env_value("POSITRON_RECV_BUFFER_SIZE", &mut self.recv_buffer_size);
        env_list("POSITRON_PROVIDER_NAMES", &mut self.providers);
    }

    /// Heartbeat period: half the connection timeout, floored at one second.
    #[inline]
    pub fn heartbeat_period(&self) -> f64 {
        (self.connection_timeout / 2.0).max(1.0)
    }
}

fn env_value<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => (),
        }
    }
}

fn env_list(key: &str, slot: &mut Vec<String>) {
    if let Ok(raw) = env::var(key) {
        *slot = raw.split_whitespace().map(str::to_owned).collect();
    }
}

fn env_flag(key: &str, slot: &mut bool) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => *slot = true,
            "0" | "no" | "false" | "off" => *slot = false,
            _ => (),
        }
    }
}

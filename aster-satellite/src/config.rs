use std::time::Duration;

use serde::Deserialize;

/// Transport server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Public address to listen on.
    pub address: String,

    /// Private address to listen on.
    pub private_address: String,

    /// Disable the QUIC listener on the server.
    pub disable_quic: bool,

    /// Disable the TCP listener on the server.
    pub disable_tcp: bool,

    /// Enable support for the TCP fast open experiment.
    pub tcp_fast_open: bool,

    /// The size of the TCP fast open queue.
    pub tcp_fast_open_queue: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ":7777".to_owned(),
            private_address: "127.0.0.1:7778".to_owned(),
            disable_quic: false,
            disable_tcp: false,
            tcp_fast_open: true,
            tcp_fast_open_queue: 256,
        }
    }
}

/// Catalog iteration loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// How long to wait for new observers before starting an iteration.
    #[serde(with = "humantime_serde")]
    pub coalesce_duration: Duration,

    /// Rate limit in segments per second; 0 is unlimited.
    pub rate_limit: u32,

    /// How many items to query in a batch.
    pub list_limit: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            coalesce_duration: Duration::from_secs(5),
            rate_limit: 0,
            list_limit: 2500,
        }
    }
}

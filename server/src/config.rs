//! Runtime configuration for the session server.

use shared::{GameOptions, LETTER_REVEAL_UNITS};
use std::path::PathBuf;
use std::time::Duration;

/// Every delay the server uses, expressed so tests can shrink them.
#[derive(Debug, Clone)]
pub struct Timing {
    /// One countdown step. Rounds are configured in these units.
    pub unit: Duration,
    /// Units between round start and the head letter, and again before the tail letter.
    pub reveal_units: u32,
    /// How often the reconnection monitor looks for a returning token.
    pub reconnect_interval: Duration,
    /// How many looks the monitor takes before evicting the participant.
    pub reconnect_retries: u32,
    /// Keep-alive ping period on the WebSocket.
    pub ping_period: Duration,
    /// A connection that sends nothing (not even a pong) for this long is closed.
    pub idle_timeout: Duration,
    /// A created session nobody joins within this long is dropped.
    pub join_deadline: Duration,
}

impl Timing {
    pub fn reveal_delay(&self) -> Duration {
        self.unit * self.reveal_units
    }

    pub fn grace_window(&self) -> Duration {
        self.reconnect_interval * self.reconnect_retries
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            reveal_units: LETTER_REVEAL_UNITS,
            reconnect_interval: Duration::from_secs(1),
            reconnect_retries: 10,
            ping_period: Duration::from_secs(9),
            idle_timeout: Duration::from_secs(10),
            join_deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub words_path: PathBuf,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    pub timing: Timing,
    /// Options a freshly created session starts with.
    pub defaults: GameOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            words_path: PathBuf::from("words_alpha.txt"),
            outbound_buffer: 64,
            timing: Timing::default(),
            defaults: GameOptions::default(),
        }
    }
}

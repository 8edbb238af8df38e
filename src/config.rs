//! Configuration types.

use std::{net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::nat_pmp::{protocol::SERVER_PORT, RetrySchedule};

/// Time to wait for the first response before retransmitting.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_millis(250);

/// Number of times a request is sent before giving up.
///
/// With [`DEFAULT_INITIAL_TIMEOUT`] a gateway that never answers is detected after 1750ms.
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Lifetime requested for a mapping: 7 days.
pub const DEFAULT_LIFETIME_SECONDS: u32 = 7 * 24 * 60 * 60;

/// Configuration of a port mapping [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Use this gateway instead of the system's default gateway.
    pub gateway: Option<Ipv4Addr>,
    /// UDP port of the NAT-PMP server on the gateway.
    pub server_port: u16,
    /// Time to wait for a response to the first attempt of a request. Each retry doubles it.
    pub initial_timeout: Duration,
    /// Number of times a request is sent before giving up.
    pub attempts: usize,
    /// Lifetime requested for new mappings.
    pub lifetime_seconds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: None,
            server_port: SERVER_PORT,
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            lifetime_seconds: DEFAULT_LIFETIME_SECONDS,
        }
    }
}

impl Config {
    /// Retransmission schedule used for every request.
    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            initial_timeout: self.initial_timeout,
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_port, 5351);
        assert_eq!(config.lifetime_seconds, 604800);
        assert_eq!(config.retry_schedule().total(), Duration::from_millis(1750));
    }
}

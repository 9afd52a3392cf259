use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use anyhow::bail;
use crate::comms::retry::RetryOptions;

pub const DEFAULT_PORT: u16 = 56700;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// identifies this process in every header it sends; random if not set
    pub source: Option<u32>,
    /// where devices are reached if their service announcement does not name a port
    pub default_port: u16,
    pub broadcast_addr: SocketAddr,

    /// how long a unicast send waits for the device's address to be discovered
    pub connect_timeout: Duration,
    /// upper bound for one request including all retransmissions
    pub message_timeout: Duration,
    pub retry_options: RetryOptions,

    /// number of entries in each of the codec's pack and unpack caches
    pub codec_cache_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            source: None,
            default_port: DEFAULT_PORT,
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_PORT)),
            connect_timeout: Duration::from_secs(1),
            message_timeout: Duration::from_secs(10),
            retry_options: RetryOptions::new(),
            codec_cache_capacity: 0xffff,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source == Some(0) {
            bail!("source 0 is reserved");
        }
        if self.default_port == 0 {
            bail!("default port must be nonzero");
        }
        if self.message_timeout.is_zero() {
            bail!("message timeout must be positive");
        }
        if self.codec_cache_capacity == 0 {
            bail!("codec cache capacity must be positive");
        }
        self.retry_options.validate()
    }
}

pub mod udp;

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::protocol::frame::{Serial, Target, BLANK_TARGET};
use crate::protocol::packet::Packet;

/// Where a packet goes: one device, or everybody on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Serial(Serial),
    /// to the configured broadcast address, or to an explicit one
    Broadcast(Option<SocketAddr>),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast(_))
    }

    /// The header target for packets sent to this destination
    pub fn target(&self) -> Target {
        match self {
            Destination::Serial(serial) => serial.target(),
            Destination::Broadcast(_) => BLANK_TARGET,
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Serial(serial) => write!(f, "{}", serial),
            Destination::Broadcast(None) => write!(f, "broadcast"),
            Destination::Broadcast(Some(addr)) => write!(f, "broadcast({})", addr),
        }
    }
}

/// Something a transport can write to. Handles are cheap, and a transport may hand out a new one
///  for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub destination: Destination,
    pub addr: Option<SocketAddr>,
}

/// The capabilities the retry engine needs from the network
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn spawn(&self, destination: &Destination, timeout: Duration) -> anyhow::Result<ConnectionHandle>;

    async fn write(&self, conn: &ConnectionHandle, bytes: &[u8], original: &Packet) -> anyhow::Result<()>;

    fn is_active(&self, conn: &ConnectionHandle) -> bool;

    async fn close(&self, conn: &ConnectionHandle) -> anyhow::Result<()>;

    /// A device announced where it can be reached
    fn device_found(&self, serial: Serial, addr: SocketAddr);
}

/// Receives the raw bytes a transport reads from the network
pub trait DataReceiver: Send + Sync {
    fn received_data(&self, bytes: &[u8], from: SocketAddr);
}

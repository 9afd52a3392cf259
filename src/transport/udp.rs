use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, trace, warn};
use crate::config::TransportConfig;
use crate::protocol::frame::Serial;
use crate::protocol::packet::Packet;
use crate::transport::{ConnectionHandle, DataReceiver, Destination, Transport};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Plain UDP: broadcasts go to the broadcast address, and unicast goes to the address a device
///  announced in its StateService reply.
pub struct UdpTransport {
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    devices: RwLock<FxHashMap<Serial, SocketAddr>>,
    device_found: Notify,
    next_conn_id: AtomicU64,
    cancel_sender: broadcast::Sender<()>,
}

impl UdpTransport {
    pub async fn new(bind_addr: SocketAddr, config: &TransportConfig) -> anyhow::Result<UdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        debug!(local_addr = ?socket.local_addr()?, "bound UDP socket");

        Ok(UdpTransport {
            socket,
            broadcast_addr: config.broadcast_addr,
            devices: Default::default(),
            device_found: Notify::new(),
            next_conn_id: AtomicU64::new(1),
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn device_addr(&self, serial: &Serial) -> Option<SocketAddr> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .copied()
    }

    /// A device's address, waiting up to `timeout` for a discovery reply to announce it
    async fn wait_for_device(&self, serial: &Serial, timeout: Duration) -> anyhow::Result<SocketAddr> {
        let lookup = async {
            loop {
                let found = self.device_found.notified();
                if let Some(addr) = self.device_addr(serial) {
                    return addr;
                }
                found.await;
            }
        };
        tokio::time::timeout(timeout, lookup).await
            .map_err(|_| anyhow!("no known address for {} after {:?}", serial, timeout))
    }

    pub async fn recv_loop(&self, receiver: Arc<dyn DataReceiver>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            receiver.received_data(&buf[..len], from);
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!("UDP receive loop finished");
        Ok(())
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn spawn(&self, destination: &Destination, timeout: Duration) -> anyhow::Result<ConnectionHandle> {
        let addr = match destination {
            Destination::Serial(serial) => self.wait_for_device(serial, timeout).await?,
            Destination::Broadcast(addr) => addr.unwrap_or(self.broadcast_addr),
        };

        Ok(ConnectionHandle {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            destination: *destination,
            addr: Some(addr),
        })
    }

    async fn write(&self, conn: &ConnectionHandle, bytes: &[u8], _original: &Packet) -> anyhow::Result<()> {
        let addr = conn.addr
            .ok_or_else(|| anyhow!("connection {} has no address", conn.id))?;
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }

    fn is_active(&self, conn: &ConnectionHandle) -> bool {
        conn.addr.is_some()
    }

    async fn close(&self, _conn: &ConnectionHandle) -> anyhow::Result<()> {
        Ok(())
    }

    fn device_found(&self, serial: Serial, addr: SocketAddr) {
        let previous = self.devices.write().unwrap_or_else(PoisonError::into_inner)
            .insert(serial, addr);
        if previous != Some(addr) {
            debug!(%serial, ?addr, "found device");
        }
        self.device_found.notify_waiters();
    }
}

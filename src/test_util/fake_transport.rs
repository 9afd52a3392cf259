use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::warn;
use crate::protocol::codec::BitCodec;
use crate::protocol::codec_error::CodecResult;
use crate::protocol::frame::{FrameExt, Serial};
use crate::protocol::messages::{CoreMessage, MessageRegistry};
use crate::protocol::packet::Packet;
use crate::protocol::value::Value;
use crate::transport::{ConnectionHandle, DataReceiver, Destination, Transport};

/// The address every reply of a [FakeTransport] comes from
pub const FAKE_DEVICE_ADDR: &str = "192.168.0.10:56700";

/// Scripted replies to a written packet, each delivered after its delay
pub type Responder = Arc<dyn Fn(&Packet) -> Vec<(Duration, Packet)> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WrittenPacket {
    pub destination: Destination,
    pub bytes: Vec<u8>,
    pub packet: Packet,
}

/// An in-memory transport that records what is written to it, and can play devices by replying
///  through a responder.
pub struct FakeTransport {
    myself: Weak<FakeTransport>,
    writes: Mutex<Vec<WrittenPacket>>,
    responder: Mutex<Option<Responder>>,
    receiver: Mutex<Option<Weak<dyn DataReceiver>>>,
    devices: Mutex<FxHashMap<Serial, SocketAddr>>,
    failing_writes: AtomicUsize,
    next_conn_id: AtomicU64,
    codec: BitCodec,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn device_addr() -> SocketAddr {
    FAKE_DEVICE_ADDR.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 56700)))
}

impl FakeTransport {
    pub fn new() -> Arc<FakeTransport> {
        Arc::new_cyclic(|myself| FakeTransport {
            myself: myself.clone(),
            writes: Default::default(),
            responder: Default::default(),
            receiver: Default::default(),
            devices: Default::default(),
            failing_writes: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            codec: BitCodec::new(1024),
        })
    }

    /// Replies go to `receiver`, which is typically the session using this transport
    pub fn connect<R: DataReceiver + 'static>(&self, receiver: &Arc<R>) {
        let weak: Weak<dyn DataReceiver> = Arc::downgrade(receiver) as Weak<dyn DataReceiver>;
        *locked(&self.receiver) = Some(weak);
    }

    pub fn respond_with(&self, responder: impl Fn(&Packet) -> Vec<(Duration, Packet)> + Send + Sync + 'static) {
        *locked(&self.responder) = Some(Arc::new(responder));
    }

    /// The next `n` writes fail
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<WrittenPacket> {
        locked(&self.writes).clone()
    }

    pub fn found_device(&self, serial: &Serial) -> Option<SocketAddr> {
        locked(&self.devices).get(serial).copied()
    }

    /// Hands a packet to the receiver right away, as if a device had sent it
    pub fn deliver(&self, packet: &Packet) {
        match self.codec.encode_bytes(packet) {
            Ok(bytes) => self.deliver_bytes(&bytes),
            Err(e) => warn!("can not encode {:?}: {}", packet, e),
        }
    }

    pub fn deliver_bytes(&self, bytes: &[u8]) {
        let receiver = locked(&self.receiver).as_ref().and_then(Weak::upgrade);
        match receiver {
            Some(receiver) => receiver.received_data(bytes, device_addr()),
            None => warn!("no receiver connected - dropping {} bytes", bytes.len()),
        }
    }

    fn schedule_replies(&self, packet: &Packet) {
        let responder = locked(&self.responder).clone();
        let Some(responder) = responder else {
            return;
        };

        for (delay, reply) in responder(packet) {
            let bytes = match self.codec.encode_bytes(&reply) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("can not encode scripted reply {:?}: {}", reply, e);
                    continue;
                }
            };
            let transport = self.myself.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(transport) = transport.upgrade() {
                    transport.deliver_bytes(&bytes);
                }
            });
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn spawn(&self, destination: &Destination, _timeout: Duration) -> anyhow::Result<ConnectionHandle> {
        Ok(ConnectionHandle {
            id: self.next_conn_id.fetch_add(1, Ordering::SeqCst),
            destination: *destination,
            addr: None,
        })
    }

    async fn write(&self, conn: &ConnectionHandle, bytes: &[u8], original: &Packet) -> anyhow::Result<()> {
        let failing = self.failing_writes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            bail!("simulated write failure");
        }

        locked(&self.writes).push(WrittenPacket {
            destination: conn.destination,
            bytes: bytes.to_vec(),
            packet: original.clone(),
        });
        self.schedule_replies(original);
        Ok(())
    }

    fn is_active(&self, _conn: &ConnectionHandle) -> bool {
        true
    }

    async fn close(&self, _conn: &ConnectionHandle) -> anyhow::Result<()> {
        Ok(())
    }

    fn device_found(&self, serial: Serial, addr: SocketAddr) {
        locked(&self.devices).insert(serial, addr);
    }
}

/// A reply to `request` as the device `serial` would send it
pub fn reply_to(registry: &MessageRegistry, request: &Packet, serial: Serial, pkt_type: u16, fields: &[(&str, Value)]) -> CodecResult<Packet> {
    let mut reply = registry.create(pkt_type, fields)?;
    reply.set("source", request.source()?)?;
    reply.set("sequence", request.sequence()?)?;
    reply.set("target", Value::Bytes(serial.target().to_vec()))?;
    reply.set("ack_required", false)?;
    reply.set("res_required", false)?;
    Ok(reply)
}

pub fn ack_for(registry: &MessageRegistry, request: &Packet, serial: Serial) -> CodecResult<Packet> {
    reply_to(registry, request, serial, CoreMessage::Acknowledgement.id(), &[])
}

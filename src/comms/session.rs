use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use crate::comms::errors::TransportError;
use crate::comms::result::RequestResult;
use crate::comms::retry::RetryOptions;
use crate::comms::scheduler::{Scheduler, TokioScheduler};
use crate::comms::stop::StopToken;
use crate::comms::waiter::Waiter;
use crate::comms::writer::Writer;
use crate::config::TransportConfig;
use crate::protocol::codec::BitCodec;
use crate::protocol::codec_error::CodecResult;
use crate::protocol::frame::{FrameExt, Serial, Target, BLANK_TARGET};
use crate::protocol::messages::{CoreMessage, MessageRegistry};
use crate::protocol::packet::Packet;
use crate::protocol::value::Value;
use crate::transport::{DataReceiver, Destination, Transport};
use crate::util::random::{new_source, RngRandom};

/// (source, sequence, target) of a request, which replies echo back
pub type ReceiverKey = (u32, u8, Target);

/// Gets every inbound packet that is not a reply to a pending request
pub type MessageCatcher = Arc<dyn Fn(Packet) + Send + Sync>;

/// Per-request settings that override the session's configuration
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub timeout: Option<Duration>,
    pub retry_options: Option<RetryOptions>,
    /// send once, then only wait
    pub no_retry: bool,
    /// stops the request in addition to the session's shutdown
    pub stop: Option<StopToken>,
}

/// Owns the source id and the sequence counters for talking to devices, and routes their replies
///  to the requests waiting for them.
pub struct Session {
    source: u32,
    config: TransportConfig,
    codec: BitCodec,
    registry: MessageRegistry,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    sequences: Mutex<FxHashMap<Target, u8>>,
    receivers: Mutex<FxHashMap<ReceiverKey, RequestResult>>,
    catcher: RwLock<Option<MessageCatcher>>,
    stop: StopToken,
}

impl Session {
    pub fn new(config: TransportConfig, registry: MessageRegistry, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<Session>> {
        Self::with_scheduler(config, registry, transport, Arc::new(TokioScheduler::default()))
    }

    pub fn with_scheduler(config: TransportConfig, registry: MessageRegistry, transport: Arc<dyn Transport>, scheduler: Arc<dyn Scheduler>) -> anyhow::Result<Arc<Session>> {
        config.validate()?;

        let source = config.source.unwrap_or_else(new_source::<RngRandom>);
        debug!(source, "starting session");

        Ok(Arc::new(Session {
            source,
            codec: BitCodec::new(config.codec_cache_capacity),
            config,
            registry,
            transport,
            scheduler,
            sequences: Default::default(),
            receivers: Default::default(),
            catcher: Default::default(),
            stop: StopToken::new(),
        }))
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn codec(&self) -> &BitCodec {
        &self.codec
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The next sequence number for a target. Allocation is atomic, so concurrent requests to the
    ///  same target never share a number (until it wraps around).
    pub fn next_sequence(&self, target: &Target) -> u8 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = sequences.entry(*target)
            .and_modify(|s| *s = s.wrapping_add(1))
            .or_insert(0);
        *sequence
    }

    fn receivers(&self) -> MutexGuard<'_, FxHashMap<ReceiverKey, RequestResult>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, packet: &Packet, result: &RequestResult) -> CodecResult<ReceiverKey> {
        let key = (packet.source()?, packet.sequence()?, packet.target()?);
        if let Some(previous) = self.receivers().insert(key, result.clone()) {
            if !previous.is_done() {
                warn!(?key, "sequence number reused while a request was still pending - cancelling the old one");
                previous.cancel();
            }
        }
        Ok(key)
    }

    /// Removes the registration, unless a different result was registered under the same key since
    pub fn deregister(&self, key: &ReceiverKey, result: &RequestResult) {
        let mut receivers = self.receivers();
        if receivers.get(key).map(|r| r.same_as(result)).unwrap_or(false) {
            receivers.remove(key);
        }
    }

    pub fn num_pending(&self) -> usize {
        self.receivers().len()
    }

    pub fn set_message_catcher(&self, catcher: impl Fn(Packet) + Send + Sync + 'static) {
        *self.catcher.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(catcher));
    }

    /// Routes a decoded packet to the request it replies to
    pub fn receive(&self, packet: Packet, from: SocketAddr) {
        let (source, sequence, target, pkt_type) = match (packet.source(), packet.sequence(), packet.target(), packet.pkt_type()) {
            (Ok(source), Ok(sequence), Ok(target), Ok(pkt_type)) => (source, sequence, target, pkt_type),
            _ => {
                warn!(?from, "received a packet with an invalid header - dropping");
                return;
            }
        };

        if pkt_type == CoreMessage::StateService.id() {
            self.record_device(&packet, from);
        }

        let found = {
            let receivers = self.receivers();
            [(source, sequence, target), (source, sequence, BLANK_TARGET)].into_iter()
                .find_map(|key| receivers.get(&key).map(|r| (key, r.clone())))
        };

        match found {
            Some((key, result)) => {
                if !result.add_packet(packet) {
                    trace!(?key, pkt_type, "reply does not match the request's expectation");
                }
                if result.is_done() {
                    self.deregister(&key, &result);
                }
            }
            None => {
                let catcher = self.catcher.read().unwrap_or_else(PoisonError::into_inner).clone();
                match catcher {
                    Some(catcher) => catcher(packet),
                    None => trace!(source, sequence, pkt_type, "unmatched packet: {:?}", packet),
                }
            }
        }
    }

    fn record_device(&self, packet: &Packet, from: SocketAddr) {
        let port = packet.get("port").ok()
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .map(|p| if p == 0 { self.config.default_port } else { p });
        match (packet.serial(), port) {
            (Ok(serial), Some(port)) => self.transport.device_found(serial, SocketAddr::new(from.ip(), port)),
            _ => debug!(?from, "ignoring service announcement without a usable port"),
        }
    }

    /// A clone of `packet` addressed to `destination`, with this session's source and a fresh
    ///  sequence number
    pub fn prepare(&self, packet: &Packet, destination: &Destination) -> CodecResult<Packet> {
        let mut packet = packet.clone();
        packet.set("source", self.source)?;
        if let Destination::Serial(serial) = destination {
            packet.set("target", Value::Bytes(serial.target().to_vec()))?;
        }
        let sequence = self.next_sequence(&packet.target()?);
        packet.set("sequence", sequence)?;
        Ok(packet)
    }

    pub fn waiter(self: &Arc<Self>, packet: &Packet, destination: Destination, options: SendOptions) -> Result<Waiter, TransportError> {
        let packet = self.prepare(packet, &destination)?;

        let retry_options = options.retry_options.unwrap_or_else(|| self.config.retry_options.clone());
        let timeout = options.timeout.unwrap_or(self.config.message_timeout);

        let stop = self.stop.child();
        if let Some(caller_stop) = &options.stop {
            stop.attach_to(caller_stop);
        }

        let writer = Writer::new(self.clone(), packet, destination, retry_options.clone());
        Ok(Waiter::new(writer, retry_options, timeout, options.no_retry, stop))
    }

    /// Sends a packet and waits for its replies, retransmitting as needed
    pub async fn send(self: &Arc<Self>, packet: &Packet, destination: Destination, options: SendOptions) -> Result<Vec<Packet>, TransportError> {
        self.waiter(packet, destination, options)?
            .run()
            .await
    }

    /// Sends a packet to several devices concurrently. Fails if any of them fails, reporting every
    ///  distinct error.
    pub async fn send_to_all(self: &Arc<Self>, packet: &Packet, serials: &[Serial], options: SendOptions) -> Result<Vec<Packet>, TransportError> {
        let mut join_set = JoinSet::new();
        for serial in serials {
            let session = self.clone();
            let packet = packet.clone();
            let options = options.clone();
            let destination = Destination::Serial(*serial);
            join_set.spawn(async move {
                session.send(&packet, destination, options).await
            });
        }

        let mut packets = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(replies)) => packets.extend(replies),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(TransportError::Connection(format!("send task failed: {}", e))),
            }
        }

        match TransportError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(packets),
        }
    }

    /// Cancels every pending request
    pub fn shutdown(&self) {
        debug!(source = self.source, "shutting down session");
        self.stop.stop();
    }

    pub fn is_shut_down(&self) -> bool {
        self.stop.is_stopped()
    }
}

impl DataReceiver for Session {
    fn received_data(&self, bytes: &[u8], from: SocketAddr) {
        match self.registry.decode(&self.codec, bytes) {
            Ok(packet) => self.receive(packet, from),
            Err(e) => warn!(?from, error = %e, "dropping data that can not be decoded"),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Builder;
    use crate::comms::retry::RetryOptions;
    use crate::test_util::fake_transport::{ack_for, reply_to, FakeTransport, FAKE_DEVICE_ADDR};

    fn serial(n: u8) -> Serial {
        Serial([0xd0, 0x73, 0xd5, 0, 0, n])
    }

    fn device_addr() -> SocketAddr {
        FAKE_DEVICE_ADDR.parse().unwrap()
    }

    fn config() -> TransportConfig {
        TransportConfig {
            source: Some(1234),
            message_timeout: Duration::from_secs(1),
            retry_options: RetryOptions::mimic(),
            ..TransportConfig::new()
        }
    }

    fn new_session(transport: &Arc<FakeTransport>) -> Arc<Session> {
        let session = Session::new(config(), MessageRegistry::with_core_messages().unwrap(), transport.clone()).unwrap();
        transport.connect(&session);
        session
    }

    fn echo_request(session: &Session) -> Packet {
        session.registry().create(CoreMessage::EchoRequest.id(), &[("echoing", Value::Bytes(b"ping".to_vec()))]).unwrap()
    }

    fn echo_response(session: &Session, request: &Packet, serial: Serial) -> Packet {
        reply_to(session.registry(), request, serial, CoreMessage::EchoResponse.id(), &[("echoing", Value::Bytes(b"ping".to_vec()))]).unwrap()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap()
    }

    #[test]
    fn test_sequences_per_target() {
        let transport = FakeTransport::new();
        let session = new_session(&transport);

        let a = serial(1).target();
        let b = serial(2).target();
        assert_eq!(session.next_sequence(&a), 0);
        assert_eq!(session.next_sequence(&a), 1);
        assert_eq!(session.next_sequence(&b), 0);
        assert_eq!(session.next_sequence(&a), 2);
        assert_eq!(session.next_sequence(&BLANK_TARGET), 0);
    }

    #[test]
    fn test_sequence_wraps() {
        let transport = FakeTransport::new();
        let session = new_session(&transport);
        let target = serial(1).target();
        for _ in 0..256 {
            session.next_sequence(&target);
        }
        assert_eq!(session.next_sequence(&target), 0);
    }

    #[test]
    fn test_source_from_config_or_random() {
        let transport = FakeTransport::new();
        let session = new_session(&transport);
        assert_eq!(session.source(), 1234);

        let random = Session::new(TransportConfig::new(), MessageRegistry::with_core_messages().unwrap(), transport.clone()).unwrap();
        assert_ne!(random.source(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let transport = FakeTransport::new();
        let config = TransportConfig { codec_cache_capacity: 0, ..config() };
        assert!(Session::new(config, MessageRegistry::with_core_messages().unwrap(), transport).is_err());
    }

    #[test]
    fn test_send_and_receive_reply() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            transport.respond_with(move |request| vec![
                (Duration::from_millis(10), ack_for(session2.registry(), request, serial(1)).unwrap()),
                (Duration::from_millis(20), echo_response(&session2, request, serial(1))),
            ]);

            let request = echo_request(&session);
            let replies = session.send(&request, Destination::Serial(serial(1)), SendOptions::default()).await.unwrap();

            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].pkt_type().unwrap(), CoreMessage::EchoResponse.id());
            assert_eq!(replies[0].serial().unwrap(), serial(1));

            let writes = transport.writes();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].packet.source().unwrap(), 1234);
            assert_eq!(writes[0].packet.serial().unwrap(), serial(1));
            assert_eq!(session.num_pending(), 0);
        });
    }

    #[test]
    fn test_broadcast_discovery_collects_replies_and_records_devices() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            transport.respond_with(move |request| (1..=3u8)
                .map(|n| {
                    let reply = reply_to(session2.registry(), request, serial(n), CoreMessage::StateService.id(), &[
                        ("service", Value::from("UDP")),
                        ("port", Value::Uint(56700 + n as u64)),
                    ]).unwrap();
                    (Duration::from_millis(10 * n as u64), reply)
                })
                .collect());

            let mut request = session.registry().create(CoreMessage::GetService.id(), &[]).unwrap();
            request.set("ack_required", false).unwrap();
            let replies = session.send(&request, Destination::Broadcast(None), SendOptions::default()).await.unwrap();

            let serials: Vec<Serial> = replies.iter().map(|r| r.serial().unwrap()).collect();
            assert_eq!(serials, vec![serial(1), serial(2), serial(3)]);
            assert_eq!(transport.found_device(&serial(2)), Some(SocketAddr::new(device_addr().ip(), 56702)));

            let writes = transport.writes();
            assert_eq!(writes[0].destination, Destination::Broadcast(None));
            assert!(writes[0].packet.get("tagged").unwrap().as_bool().unwrap());
        });
    }

    #[test]
    fn test_undecodable_and_unmatched_data() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let (sender, mut caught) = tokio::sync::mpsc::unbounded_channel();
            session.set_message_catcher(move |packet| sender.send(packet).unwrap());

            session.received_data(&[1, 2, 3], device_addr());
            assert!(caught.try_recv().is_err());

            let request = session.prepare(&echo_request(&session), &Destination::Serial(serial(1))).unwrap();
            let unsolicited = echo_response(&session, &request, serial(1));
            transport.deliver(&unsolicited);
            let caught = caught.try_recv().unwrap();
            assert_eq!(caught.pkt_type().unwrap(), CoreMessage::EchoResponse.id());
            assert_eq!(caught.sequence().unwrap(), request.sequence().unwrap());
        });
    }

    #[test]
    fn test_catcher_can_replace_itself() {
        let transport = FakeTransport::new();
        let session = new_session(&transport);

        let caught = Arc::new(AtomicUsize::new(0));
        let caught2 = caught.clone();
        let weak_session = Arc::downgrade(&session);
        session.set_message_catcher(move |_| {
            caught2.fetch_add(1, Ordering::SeqCst);
            if let Some(session) = weak_session.upgrade() {
                session.set_message_catcher(|_| {});
            }
        });

        let request = session.prepare(&echo_request(&session), &Destination::Serial(serial(1))).unwrap();
        let unsolicited = echo_response(&session, &request, serial(1));
        transport.deliver(&unsolicited);
        transport.deliver(&unsolicited);
        assert_eq!(caught.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_without_port_uses_default_port() {
        let transport = FakeTransport::new();
        let config = TransportConfig { default_port: 56800, ..config() };
        let session = Session::new(config, MessageRegistry::with_core_messages().unwrap(), transport.clone()).unwrap();
        transport.connect(&session);

        let request = session.prepare(&session.registry().create(CoreMessage::GetService.id(), &[]).unwrap(), &Destination::Broadcast(None)).unwrap();
        let announcement = |n: u8, port: u64| reply_to(session.registry(), &request, serial(n), CoreMessage::StateService.id(), &[
            ("service", Value::from("UDP")),
            ("port", Value::Uint(port)),
        ]).unwrap();
        transport.deliver(&announcement(1, 0));
        transport.deliver(&announcement(2, 56702));

        assert_eq!(transport.found_device(&serial(1)), Some(SocketAddr::new(device_addr().ip(), 56800)));
        assert_eq!(transport.found_device(&serial(2)), Some(SocketAddr::new(device_addr().ip(), 56702)));
    }

    #[test]
    fn test_replies_with_other_source_are_not_routed() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let request = session.prepare(&echo_request(&session), &Destination::Serial(serial(1))).unwrap();
            let result = RequestResult::new(
                crate::comms::result::Expectation::for_request(&request, false).unwrap(),
                RetryOptions::mimic(),
                session.scheduler().clone());
            let key = session.register(&request, &result).unwrap();
            assert_eq!(key, (1234, 0, serial(1).target()));

            let mut foreign = echo_response(&session, &request, serial(1));
            foreign.set("source", 999u32).unwrap();
            transport.deliver(&foreign);
            assert!(result.results().is_empty());

            transport.deliver(&echo_response(&session, &request, serial(1)));
            assert_eq!(result.results().len(), 1);
            assert_eq!(session.num_pending(), 0);
        });
    }

    #[test]
    fn test_send_to_all() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            transport.respond_with(move |request| {
                let target = request.serial().unwrap();
                // the third device never answers
                if target == serial(3) {
                    return vec![];
                }
                vec![(Duration::from_millis(5), echo_response(&session2, request, target))]
            });

            let mut request = echo_request(&session);
            request.set("ack_required", false).unwrap();

            let ok = session.send_to_all(&request, &[serial(1), serial(2)], SendOptions::default()).await.unwrap();
            assert_eq!(ok.len(), 2);

            let failed = session.send_to_all(&request, &[serial(1), serial(3)], SendOptions::default()).await;
            match failed {
                Err(TransportError::TimedOut { ident, .. }) => assert_eq!(ident.serial, serial(3)),
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_shutdown_cancels_pending_requests() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            let handle = tokio::spawn(async move {
                let request = echo_request(&session2);
                session2.send(&request, Destination::Serial(serial(1)), SendOptions::default()).await
            });

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(session.num_pending(), 1);
            session.shutdown();

            assert_eq!(handle.await.unwrap(), Err(TransportError::Cancelled));
            assert_eq!(session.num_pending(), 0);
            assert!(session.is_shut_down());
        });
    }
}

use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::comms::errors::{RequestIdent, TransportError};
use crate::comms::result::{Expectation, RequestResult};
use crate::comms::retry::RetryOptions;
use crate::comms::session::{ReceiverKey, Session};
use crate::protocol::frame::FrameExt;
use crate::protocol::packet::Packet;
use crate::transport::Destination;

const MAX_LOGGED_BYTES: usize = 64;

/// One transmission of a request, and the result tracking its replies
#[derive(Debug, Clone)]
pub struct Attempt {
    pub key: Option<ReceiverKey>,
    pub result: RequestResult,
}

/// Transmits a request, once per call to [Writer::write]. Every transmission after the first gets
///  a new sequence number so late replies to earlier ones can be told apart.
pub struct Writer {
    session: Arc<Session>,
    original: Packet,
    destination: Destination,
    retry_options: RetryOptions,
    num_attempts: usize,
}

impl Writer {
    pub fn new(session: Arc<Session>, original: Packet, destination: Destination, retry_options: RetryOptions) -> Writer {
        Writer {
            session,
            original,
            destination,
            retry_options,
            num_attempts: 0,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn original(&self) -> &Packet {
        &self.original
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }

    pub fn ident(&self) -> RequestIdent {
        let target = self.original.serial().unwrap_or_default();
        RequestIdent {
            serial: target,
            pkt_type: self.original.pkt_type().unwrap_or_default(),
            source: self.original.source().unwrap_or_default(),
            sequence: self.original.sequence().unwrap_or_default(),
        }
    }

    pub async fn write(&mut self) -> Result<Attempt, TransportError> {
        let mut packet = self.original.clone();
        if self.num_attempts > 0 {
            let sequence = self.session.next_sequence(&packet.target()?);
            packet.set("sequence", sequence)?;
        }
        self.num_attempts += 1;

        let expectation = Expectation::for_request(&packet, self.destination.is_broadcast())?;
        let result = RequestResult::new(expectation, self.retry_options.clone(), self.session.scheduler().clone());
        let key = if result.is_done() {
            None
        }
        else {
            Some(self.session.register(&packet, &result)?)
        };
        let attempt = Attempt { key, result };

        match self.transmit(&packet).await {
            Ok(()) => Ok(attempt),
            Err(e) => {
                attempt.result.fail(e.to_string());
                if let Some(key) = &attempt.key {
                    self.session.deregister(key, &attempt.result);
                }
                Err(e)
            }
        }
    }

    async fn transmit(&self, packet: &Packet) -> Result<(), TransportError> {
        let bytes = self.session.codec().encode_bytes(packet)?;
        debug!(destination = %self.destination, sequence = packet.sequence()?, attempt = self.num_attempts, "sending {:?}: {}", packet, hex_summary(&bytes));

        let transport = self.session.transport();
        let conn = transport.spawn(&self.destination, self.session.config().connect_timeout).await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if let Err(e) = transport.write(&conn, &bytes, packet).await {
            warn!(destination = %self.destination, "write failed: {}", e);
            return Err(TransportError::Connection(e.to_string()));
        }
        Ok(())
    }
}

fn hex_summary(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(2 * MAX_LOGGED_BYTES.min(bytes.len()) + 20);
    for b in bytes.iter().take(MAX_LOGGED_BYTES) {
        let _ = write!(result, "{:02x}", b);
    }
    if bytes.len() > MAX_LOGGED_BYTES {
        let _ = write!(result, " ({} more bytes)", bytes.len() - MAX_LOGGED_BYTES);
    }
    result
}

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};
use crate::comms::errors::TransportError;
use crate::comms::result::{ExpectedCount, ResultStatus};
use crate::comms::retry::{RetryOptions, RetryTicker, TickDecision};
use crate::comms::stop::StopToken;
use crate::comms::writer::{Attempt, Writer};
use crate::protocol::packet::Packet;

/// Drives one request to completion: writes it, and writes it again on the retry schedule for as
///  long as nothing suggests a reply is on its way.
///
/// Dropping a waiter (or stopping its token) cancels every result it created.
pub struct Waiter {
    writer: Writer,
    retry_options: RetryOptions,
    ticker: RetryTicker,
    no_retry: bool,
    stop: StopToken,
    attempts: Vec<Attempt>,
    done: Arc<Notify>,
    last_error: Option<TransportError>,
}

impl Waiter {
    pub fn new(writer: Writer, retry_options: RetryOptions, timeout: Duration, no_retry: bool, stop: StopToken) -> Waiter {
        let ticker = retry_options.ticker(Instant::now(), timeout);
        Waiter {
            writer,
            retry_options,
            ticker,
            no_retry,
            stop,
            attempts: Vec::new(),
            done: Arc::new(Notify::new()),
            last_error: None,
        }
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub async fn run(mut self) -> Result<Vec<Packet>, TransportError> {
        let outcome = self.drive().await;
        match &outcome {
            Ok(packets) => debug!(ident = %self.writer.ident(), num_replies = packets.len(), "request finished"),
            Err(e) => debug!(ident = %self.writer.ident(), "request failed: {}", e),
        }
        outcome
    }

    async fn drive(&mut self) -> Result<Vec<Packet>, TransportError> {
        loop {
            if self.stop.is_stopped() {
                return Err(TransportError::Cancelled);
            }
            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            match self.ticker.poll(Instant::now()) {
                TickDecision::Fire(tick) => {
                    if self.should_write(Instant::now()) {
                        trace!(remaining = ?tick.remaining, gap = ?tick.gap, "writing");
                        self.write().await?;
                    }
                }
                TickDecision::WaitUntil(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = self.done.notified() => {}
                        _ = self.stop.stopped() => {}
                    }
                }
                TickDecision::Exhausted => break,
            }
        }

        self.after_exhaustion().await
    }

    fn should_write(&self, now: Instant) -> bool {
        if self.writer.num_attempts() == 0 {
            return true;
        }
        if self.no_retry {
            return false;
        }
        !self.attempts.iter().any(|a| a.result.wait_for_result(now))
    }

    async fn write(&mut self) -> Result<(), TransportError> {
        match self.writer.write().await {
            Ok(attempt) => {
                attempt.result.notify_when_done(self.done.clone());
                self.attempts.push(attempt);
                Ok(())
            }
            // the packet can not be encoded: no point in trying again
            Err(e @ TransportError::Codec(_)) => Err(e),
            Err(e) => {
                warn!(ident = %self.writer.ident(), "attempt failed, will retry: {}", e);
                self.last_error = Some(e);
                Ok(())
            }
        }
    }

    /// The final outcome, if one of the attempts provides it
    fn outcome(&self) -> Option<Result<Vec<Packet>, TransportError>> {
        for attempt in &self.attempts {
            match attempt.result.status() {
                ResultStatus::Completed(packets) => {
                    // acknowledged without a reply: keep trying for the reply
                    if packets.is_empty() && attempt.result.expectation().res_required {
                        continue;
                    }
                    return Some(Ok(packets));
                }
                ResultStatus::Cancelled => return Some(Err(TransportError::Cancelled)),
                ResultStatus::Pending | ResultStatus::Failed(_) => {}
            }
        }
        None
    }

    /// Replies of a request with an open-ended number of them may still be trickling in when the
    ///  schedule runs out, so they get a grace period.
    async fn after_exhaustion(&mut self) -> Result<Vec<Packet>, TransportError> {
        let grace = self.retry_options.finish_multi_gap() + self.retry_options.gap_between_ack_and_res;
        let deadline = Instant::now() + grace;

        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            let now = Instant::now();
            let still_coming = self.attempts.iter()
                .any(|a| !a.result.is_done() && a.result.expected_count() == ExpectedCount::Unbounded && a.result.wait_for_result(now));
            if !still_coming || now >= deadline {
                break;
            }

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.done.notified() => {}
                _ = self.stop.stopped() => return Err(TransportError::Cancelled),
            }
        }

        Err(self.timeout_error())
    }

    fn timeout_error(&mut self) -> TransportError {
        let ident = self.writer.ident();
        let partial: Vec<Packet> = self.attempts.iter()
            .flat_map(|a| a.result.results())
            .collect();
        let res_required = self.attempts.iter().any(|a| a.result.expectation().res_required);
        let acked = self.attempts.iter().any(|a| a.result.acked());

        if res_required && acked {
            TransportError::TimedOutAfterAck { ident, partial }
        }
        else {
            TransportError::TimedOut {
                ident,
                partial,
                last_error: self.last_error.take().map(|e| e.to_string()),
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let session = self.writer.session();
        for attempt in &self.attempts {
            if !attempt.result.is_done() {
                attempt.result.cancel();
            }
            if let Some(key) = &attempt.key {
                session.deregister(key, &attempt.result);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Builder;
    use crate::comms::session::{SendOptions, Session};
    use crate::config::TransportConfig;
    use crate::protocol::frame::{FrameExt, Serial};
    use crate::protocol::messages::{CoreMessage, MessageRegistry};
    use crate::protocol::value::Value;
    use crate::test_util::fake_transport::{ack_for, reply_to, FakeTransport};
    use crate::transport::Destination;

    fn serial() -> Serial {
        Serial([0xd0, 0x73, 0xd5, 0, 0, 9])
    }

    fn retry_options() -> RetryOptions {
        RetryOptions {
            gap_between_ack_and_res: Duration::from_millis(200),
            gap_between_results: Duration::from_millis(100),
            timeouts: vec![(Duration::from_millis(300), Duration::from_millis(300))],
        }
    }

    fn new_session(transport: &Arc<FakeTransport>) -> Arc<Session> {
        let config = TransportConfig {
            source: Some(5),
            message_timeout: Duration::from_secs(1),
            retry_options: retry_options(),
            ..TransportConfig::new()
        };
        let session = Session::new(config, MessageRegistry::with_core_messages().unwrap(), transport.clone()).unwrap();
        transport.connect(&session);
        session
    }

    fn echo_request(session: &Session, ack: bool) -> Packet {
        let mut p = session.registry().create(CoreMessage::EchoRequest.id(), &[("echoing", Value::Bytes(b"x".to_vec()))]).unwrap();
        p.set("ack_required", ack).unwrap();
        p
    }

    fn echo_response(session: &Session, request: &Packet) -> Packet {
        reply_to(session.registry(), request, serial(), CoreMessage::EchoResponse.id(), &[("echoing", Value::Bytes(b"x".to_vec()))]).unwrap()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap()
    }

    fn send(session: &Arc<Session>, request: &Packet, options: SendOptions) -> tokio::task::JoinHandle<Result<Vec<Packet>, TransportError>> {
        let session = session.clone();
        let request = request.clone();
        tokio::spawn(async move {
            session.send(&request, Destination::Serial(serial()), options).await
        })
    }

    #[test]
    fn test_retries_until_reply_with_increasing_sequences() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            // only the third transmission gets through
            let count = AtomicUsize::new(0);
            let session2 = session.clone();
            transport.respond_with(move |request| {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    return vec![];
                }
                vec![(Duration::from_millis(10), echo_response(&session2, request))]
            });

            let start = Instant::now();
            let replies = send(&session, &echo_request(&session, false), SendOptions::default()).await.unwrap().unwrap();
            assert_eq!(replies.len(), 1);
            let elapsed = Instant::now() - start;
            assert!(elapsed >= Duration::from_millis(610) && elapsed < Duration::from_millis(620), "{:?}", elapsed);

            let sequences: Vec<u8> = transport.writes().iter().map(|w| w.packet.sequence().unwrap()).collect();
            assert_eq!(sequences, vec![0, 1, 2]);
        });
    }

    #[test]
    fn test_sequences_interleaved_with_other_target() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);
            let other = Serial([0xd0, 0x73, 0xd5, 0, 0, 10]);

            let handle = send(&session, &echo_request(&session, false), SendOptions { timeout: Some(Duration::from_millis(1000)), ..SendOptions::default() });
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(150)).await;
                session.prepare(&echo_request(&session, false), &Destination::Serial(other)).unwrap();
            }
            assert!(handle.await.unwrap().is_err());

            let sequences: Vec<u8> = transport.writes().iter()
                .filter(|w| w.packet.serial().unwrap() == serial())
                .map(|w| w.packet.sequence().unwrap())
                .collect();
            assert_eq!(sequences, vec![0, 1, 2, 3]);
            assert_eq!(session.next_sequence(&other.target()), 3);
        });
    }

    #[test]
    fn test_timeout_without_reply() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let request = echo_request(&session, true);
            let result = send(&session, &request, SendOptions::default()).await.unwrap();

            match result {
                Err(TransportError::TimedOut { ident, partial, last_error }) => {
                    assert_eq!(ident.serial, serial());
                    assert_eq!(ident.pkt_type, CoreMessage::EchoRequest.id());
                    assert_eq!(ident.source, 5);
                    assert!(partial.is_empty());
                    assert!(last_error.is_none());
                }
                other => panic!("unexpected {:?}", other),
            }
            // writes at 0, 300, 600 and 900ms
            assert_eq!(transport.writes().len(), 4);
            assert_eq!(session.num_pending(), 0);
        });
    }

    #[test]
    fn test_timed_out_after_ack() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            transport.respond_with(move |request| vec![
                (Duration::from_millis(5), ack_for(session2.registry(), request, serial()).unwrap()),
            ]);

            let result = send(&session, &echo_request(&session, true), SendOptions::default()).await.unwrap();
            assert!(matches!(result, Err(TransportError::TimedOutAfterAck { .. })), "{:?}", result);
        });
    }

    #[test]
    fn test_ack_delays_retransmission() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            // the reply comes after the first retry tick, but the ack is still recent then
            let session2 = session.clone();
            transport.respond_with(move |request| vec![
                (Duration::from_millis(5), ack_for(session2.registry(), request, serial()).unwrap()),
                (Duration::from_millis(150), echo_response(&session2, request)),
            ]);

            let options = SendOptions {
                retry_options: Some(RetryOptions {
                    timeouts: vec![(Duration::from_millis(100), Duration::from_millis(100))],
                    ..retry_options()
                }),
                ..SendOptions::default()
            };
            let replies = send(&session, &echo_request(&session, true), options).await.unwrap().unwrap();
            assert_eq!(replies.len(), 1);
            assert_eq!(transport.writes().len(), 1);
        });
    }

    #[test]
    fn test_transport_errors_are_retried_and_reported() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);
            transport.fail_next_writes(100);

            let result = send(&session, &echo_request(&session, false), SendOptions::default()).await.unwrap();
            match result {
                Err(TransportError::TimedOut { last_error: Some(e), .. }) => assert!(e.contains("simulated write failure"), "{}", e),
                other => panic!("unexpected {:?}", other),
            }
            assert!(transport.writes().is_empty());
        });
    }

    #[test]
    fn test_transport_error_then_success() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);
            transport.fail_next_writes(1);

            let session2 = session.clone();
            transport.respond_with(move |request| vec![(Duration::from_millis(10), echo_response(&session2, request))]);

            let replies = send(&session, &echo_request(&session, false), SendOptions::default()).await.unwrap().unwrap();
            assert_eq!(replies.len(), 1);
            assert_eq!(transport.writes().len(), 1);
        });
    }

    #[test]
    fn test_no_retry_writes_once() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let result = send(&session, &echo_request(&session, false), SendOptions { no_retry: true, ..SendOptions::default() }).await.unwrap();
            assert!(matches!(result, Err(TransportError::TimedOut { .. })));
            assert_eq!(transport.writes().len(), 1);
        });
    }

    #[test]
    fn test_caller_stop_cancels() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let stop = StopToken::new();
            let handle = send(&session, &echo_request(&session, true), SendOptions { stop: Some(stop.clone()), ..SendOptions::default() });

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(session.num_pending(), 2);
            stop.stop();

            assert_eq!(handle.await.unwrap(), Err(TransportError::Cancelled));
            assert_eq!(session.num_pending(), 0);
            assert!(!session.is_shut_down());
        });
    }

    #[test]
    fn test_aborting_the_caller_cleans_up() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let handle = send(&session, &echo_request(&session, true), SendOptions::default());
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(session.num_pending(), 1);

            handle.abort();
            assert!(handle.await.unwrap_err().is_cancelled());
            assert_eq!(session.num_pending(), 0);
        });
    }

    #[test]
    fn test_multi_reply_finishes_after_quiet_period() {
        paused_runtime().block_on(async move {
            let transport = FakeTransport::new();
            let session = new_session(&transport);

            let session2 = session.clone();
            transport.respond_with(move |request| (0..3u64)
                .map(|n| {
                    let reply = reply_to(session2.registry(), request, serial(), CoreMessage::StateService.id(), &[
                        ("service", Value::Uint(1)),
                        ("port", Value::Uint(56700)),
                    ]).unwrap();
                    (Duration::from_millis(20 + 40 * n), reply)
                })
                .collect());

            let mut request = session.registry().create(CoreMessage::GetService.id(), &[]).unwrap();
            request.set("ack_required", false).unwrap();
            let start = Instant::now();
            let replies = send(&session, &request, SendOptions::default()).await.unwrap().unwrap();

            assert_eq!(replies.len(), 3);
            // last reply at 100ms, then the quiet period of 150ms
            let elapsed = Instant::now() - start;
            assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(260), "{:?}", elapsed);
            assert_eq!(transport.writes().len(), 1);
        });
    }
}

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::comms::retry::RetryOptions;
use crate::comms::scheduler::{Scheduler, TimerHandle};
use crate::protocol::codec_error::CodecResult;
use crate::protocol::frame::FrameExt;
use crate::protocol::messages::CoreMessage;
use crate::protocol::packet::Packet;
use crate::protocol::schema::MultiReply;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultStatus {
    Pending,
    /// all expected information arrived, or no more is expected. The list is empty for requests
    ///  that only wanted an acknowledgement, or that were acknowledged but never answered.
    Completed(Vec<Packet>),
    Cancelled,
    Failed(String),
}

impl ResultStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedCount {
    Exactly(usize),
    Unbounded,
}

/// What a request expects to receive, derived from the request packet
#[derive(Clone)]
pub struct Expectation {
    pub ack_required: bool,
    pub res_required: bool,
    pub did_broadcast: bool,
    request: Packet,
}

impl Debug for Expectation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expectation{{ack:{}, res:{}, broadcast:{}, {:?}}}", self.ack_required, self.res_required, self.did_broadcast, self.request.schema())
    }
}

impl Expectation {
    pub fn for_request(request: &Packet, did_broadcast: bool) -> CodecResult<Expectation> {
        Ok(Expectation {
            ack_required: request.ack_required()?,
            res_required: request.res_required()?,
            did_broadcast,
            request: request.clone(),
        })
    }

    pub fn request(&self) -> &Packet {
        &self.request
    }

    /// Replies of other message types than the request declares are not for us. Requests that
    ///  declare nothing accept everything.
    pub fn accepts(&self, pkt_type: u16) -> bool {
        let responds_with = self.request.schema().responds_with();
        pkt_type == CoreMessage::Acknowledgement.id()
            || responds_with.is_empty()
            || responds_with.contains(&pkt_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuietCheck {
    /// no more stragglers after the last acknowledgement
    Ack,
    /// no more replies after the last one
    Res,
    /// no reply after an acknowledgement
    AckWithoutRes,
}

#[derive(Default)]
struct ResultState {
    last_ack: Option<Instant>,
    last_res: Option<Instant>,
    results: Vec<Packet>,
    expected: Option<ExpectedCount>,
    timers: Vec<TimerHandle>,
    listeners: Vec<Arc<Notify>>,
}

struct ResultInner {
    expectation: Expectation,
    gaps: RetryOptions,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<ResultState>,
    status: watch::Sender<ResultStatus>,
}

/// Tracks the acknowledgement and replies for one transmission of a request, and decides when
///  nothing more is coming. Clones share state.
#[derive(Clone)]
pub struct RequestResult {
    inner: Arc<ResultInner>,
}

impl Debug for RequestResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestResult({:?}, {:?})", self.inner.expectation, *self.inner.status.borrow())
    }
}

impl RequestResult {
    pub fn new(expectation: Expectation, gaps: RetryOptions, scheduler: Arc<dyn Scheduler>) -> RequestResult {
        let nothing_expected = !expectation.ack_required && !expectation.res_required;
        let (status, _) = watch::channel(ResultStatus::Pending);

        let result = RequestResult {
            inner: Arc::new(ResultInner {
                expectation,
                gaps,
                scheduler,
                state: Default::default(),
                status,
            }),
        };

        if nothing_expected {
            result.finish(&mut result.state(), Vec::new());
        }
        result
    }

    fn state(&self) -> MutexGuard<'_, ResultState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn same_as(&self, other: &RequestResult) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn expectation(&self) -> &Expectation {
        &self.inner.expectation
    }

    pub fn status(&self) -> ResultStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.status.borrow().is_done()
    }

    /// Completes when the result is done
    pub async fn wait(&self) -> ResultStatus {
        let mut receiver = self.inner.status.subscribe();
        let status = match receiver.wait_for(ResultStatus::is_done).await {
            Ok(status) => status.clone(),
            Err(_) => ResultStatus::Cancelled,
        };
        status
    }

    /// `notify` is signalled once when the result is done (right away if it already is)
    pub fn notify_when_done(&self, notify: Arc<Notify>) {
        let mut state = self.state();
        if self.is_done() {
            notify.notify_one();
        }
        else {
            state.listeners.push(notify);
        }
    }

    pub fn acked(&self) -> bool {
        self.state().last_ack.is_some()
    }

    pub fn results(&self) -> Vec<Packet> {
        self.state().results.clone()
    }

    /// Routes an inbound packet to [RequestResult::add_ack] or [RequestResult::add_result].
    ///  Returns false if the packet is not a reply to this request.
    pub fn add_packet(&self, packet: Packet) -> bool {
        let pkt_type = match packet.pkt_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("reply without a valid message type - discarding: {}", e);
                return false;
            }
        };
        if !self.inner.expectation.accepts(pkt_type) {
            trace!("ignoring reply of type {} for {:?}", pkt_type, self.inner.expectation);
            return false;
        }

        if pkt_type == CoreMessage::Acknowledgement.id() {
            self.add_ack();
        }
        else {
            self.add_result(packet);
        }
        true
    }

    pub fn add_ack(&self) {
        let mut state = self.state();
        if self.is_done() {
            return;
        }
        let now = Instant::now();
        state.last_ack = Some(now);

        let expectation = &self.inner.expectation;
        if !expectation.res_required {
            if expectation.did_broadcast {
                let delay = self.inner.gaps.finish_multi_gap();
                self.schedule_quiet_check(state, QuietCheck::Ack, now, delay);
            }
            else {
                self.finish(&mut state, Vec::new());
            }
        }
        else if !expectation.did_broadcast && state.results.is_empty() {
            let delay = self.inner.gaps.gap_between_ack_and_res;
            self.schedule_quiet_check(state, QuietCheck::AckWithoutRes, now, delay);
        }
    }

    pub fn add_result(&self, packet: Packet) {
        let mut state = self.state();
        if self.is_done() {
            trace!("late reply for a finished request: {:?}", packet);
            return;
        }
        let now = Instant::now();
        state.results.push(packet);
        state.last_res = Some(now);

        match self.expected_count_locked(&mut state) {
            ExpectedCount::Exactly(n) if state.results.len() >= n => {
                let results = state.results.clone();
                self.finish(&mut state, results);
            }
            ExpectedCount::Exactly(_) => {}
            ExpectedCount::Unbounded => {
                let delay = self.inner.gaps.finish_multi_gap();
                self.schedule_quiet_check(state, QuietCheck::Res, now, delay);
            }
        }
    }

    pub fn expected_count(&self) -> ExpectedCount {
        self.expected_count_locked(&mut self.state())
    }

    fn expected_count_locked(&self, state: &mut ResultState) -> ExpectedCount {
        if let Some(expected) = state.expected {
            return expected;
        }

        let expectation = &self.inner.expectation;
        let expected = if expectation.did_broadcast {
            ExpectedCount::Unbounded
        }
        else {
            match expectation.request.schema().multi() {
                MultiReply::Single => ExpectedCount::Exactly(1),
                MultiReply::Unbounded => ExpectedCount::Unbounded,
                MultiReply::Count(n) => ExpectedCount::Exactly(*n),
                MultiReply::FromResponse { response_type, count } => {
                    // the first matching reply decides, and the decision sticks
                    let first = state.results.iter()
                        .find(|p| p.pkt_type().ok() == Some(*response_type));
                    match first.map(|p| count(&expectation.request, p)) {
                        Some(Ok(n)) => ExpectedCount::Exactly(n),
                        Some(Err(e)) => {
                            warn!("could not determine the number of replies from {:?}: {}", first, e);
                            return ExpectedCount::Unbounded;
                        }
                        None => return ExpectedCount::Unbounded,
                    }
                }
            }
        };
        state.expected = Some(expected);
        expected
    }

    /// True while nothing suggests a retransmission is needed: the required acknowledgement and
    ///  replies have arrived, or arrived recently enough that more is still plausible.
    pub fn wait_for_result(&self, now: Instant) -> bool {
        let mut state = self.state();
        let expectation = &self.inner.expectation;
        let gaps = &self.inner.gaps;

        if expectation.ack_required && expectation.res_required {
            match state.last_ack {
                None => false,
                Some(_) if !state.results.is_empty() => true,
                Some(at) => now.saturating_duration_since(at) < gaps.gap_between_ack_and_res,
            }
        }
        else if expectation.ack_required && state.last_ack.is_some() {
            true
        }
        else if expectation.res_required {
            let Some(at) = state.last_res else {
                return false;
            };
            match self.expected_count_locked(&mut state) {
                ExpectedCount::Exactly(n) if n > 0 => now.saturating_duration_since(at) < gaps.gap_between_results,
                _ => true,
            }
        }
        else {
            false
        }
    }

    pub fn cancel(&self) {
        let mut state = self.state();
        self.set_status(&mut state, ResultStatus::Cancelled);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state();
        self.set_status(&mut state, ResultStatus::Failed(reason.into()));
    }

    fn finish(&self, state: &mut ResultState, results: Vec<Packet>) {
        self.set_status(state, ResultStatus::Completed(results));
    }

    fn set_status(&self, state: &mut ResultState, status: ResultStatus) {
        if self.is_done() {
            return;
        }
        debug!("request finished: {:?} -> {:?}", self.inner.expectation, status);
        self.inner.status.send_replace(status);

        for timer in state.timers.drain(..) {
            timer.cancel();
        }
        for listener in state.listeners.drain(..) {
            listener.notify_one();
        }
    }

    /// Schedules a check that finishes the result if nothing arrived in the meantime
    fn schedule_quiet_check(&self, state: MutexGuard<'_, ResultState>, check: QuietCheck, stamp: Instant, delay: std::time::Duration) {
        // the scheduler may run arbitrary code, so don't hold the lock while calling it
        drop(state);

        let weak: Weak<ResultInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(delay, Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                RequestResult { inner }.quiet_check(check, stamp);
            }
        }));

        let mut state = self.state();
        if self.is_done() {
            timer.cancel();
        }
        else {
            state.timers.push(timer);
        }
    }

    fn quiet_check(&self, check: QuietCheck, stamp: Instant) {
        let mut state = self.state();
        let unchanged = match check {
            QuietCheck::Ack => state.last_ack == Some(stamp),
            QuietCheck::Res => state.last_res == Some(stamp),
            QuietCheck::AckWithoutRes => state.last_ack == Some(stamp) && state.results.is_empty(),
        };
        if unchanged {
            let results = state.results.clone();
            self.finish(&mut state, results);
        }
    }
}

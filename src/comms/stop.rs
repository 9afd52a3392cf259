use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;

struct StopInner {
    stopped: watch::Sender<bool>,
    children: Mutex<Vec<Weak<StopInner>>>,
}

impl StopInner {
    fn stop(&self) {
        self.stopped.send_replace(true);
        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(PoisonError::into_inner));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.stop();
            }
        }
    }
}

/// A cancellation signal. Stopping a token stops every token derived from it with
///  [StopToken::child], but not the other way round.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

impl Debug for StopToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StopToken(stopped:{})", self.is_stopped())
    }
}

impl Default for StopToken {
    fn default() -> Self {
        StopToken::new()
    }
}

impl StopToken {
    pub fn new() -> StopToken {
        let (stopped, _) = watch::channel(false);
        StopToken {
            inner: Arc::new(StopInner {
                stopped,
                children: Default::default(),
            }),
        }
    }

    pub fn child(&self) -> StopToken {
        let child = StopToken::new();
        child.attach_to(self);
        child
    }

    /// Makes this token stop when `parent` stops, in addition to any parent it already has
    pub fn attach_to(&self, parent: &StopToken) {
        if parent.is_stopped() {
            self.stop();
            return;
        }

        let mut children = parent.inner.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&self.inner));
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }

    /// Completes when the token is stopped
    pub async fn stopped(&self) {
        let mut receiver = self.inner.stopped.subscribe();
        // the sender lives as long as self, so this can not fail
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

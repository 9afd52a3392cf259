use std::time::Duration;
#[cfg(test)] use mockall::automock;
use tokio::task::AbortHandle;

/// A pending delayed callback. Dropping the handle does not cancel it.
#[derive(Debug, Default)]
pub struct TimerHandle {
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn new(abort: AbortHandle) -> TimerHandle {
        TimerHandle { abort: Some(abort) }
    }

    /// A handle for something that was not scheduled with a real timer, e.g. by a mock
    pub fn detached() -> TimerHandle {
        TimerHandle { abort: None }
    }

    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Runs callbacks after a delay. This is the only way request tracking interacts with time, so
///  tests can replace it.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[cfg_attr(test, automock)]
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Schedules on the current tokio runtime
#[derive(Debug, Default)]
pub struct TokioScheduler {}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(handle.abort_handle())
    }
}

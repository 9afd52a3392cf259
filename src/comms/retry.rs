use std::collections::VecDeque;
use std::time::Duration;
use anyhow::bail;
use tokio::time::Instant;

/// Timing of retransmissions and of the 'no more data is coming' decisions for a request
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// How long after an acknowledgement a response is still expected
    pub gap_between_ack_and_res: Duration,
    /// How long after a response another one of a multi-reply is still expected
    pub gap_between_results: Duration,
    /// (gap, valid until elapsed) pairs: retransmit every `gap` until `valid until` has passed,
    ///  then switch to the next pair. The last pair applies forever.
    pub timeouts: Vec<(Duration, Duration)>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions::new()
    }
}

impl RetryOptions {
    pub fn new() -> RetryOptions {
        RetryOptions {
            gap_between_ack_and_res: Duration::from_millis(200),
            gap_between_results: Duration::from_millis(400),
            timeouts: vec![
                (Duration::from_millis(200), Duration::from_millis(200)),
                (Duration::from_millis(100), Duration::from_millis(500)),
                (Duration::from_millis(200), Duration::from_secs(1)),
                (Duration::from_secs(1), Duration::from_secs(5)),
            ],
        }
    }

    /// Short gaps, for talking to simulated devices
    pub fn mimic() -> RetryOptions {
        RetryOptions {
            gap_between_ack_and_res: Duration::from_millis(50),
            gap_between_results: Duration::from_millis(50),
            timeouts: vec![(Duration::from_millis(200), Duration::from_millis(200))],
        }
    }

    /// Quiet period after which an unbounded number of replies is considered complete
    pub fn finish_multi_gap(&self) -> Duration {
        self.gap_between_results + Duration::from_millis(50)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeouts.is_empty() {
            bail!("retry options need at least one timeout");
        }
        if self.timeouts.iter().any(|(gap, _)| gap.is_zero()) {
            bail!("retry gaps must be positive");
        }
        if self.timeouts.windows(2).any(|w| w[0].1 >= w[1].1) {
            bail!("retry timeouts must be valid until strictly increasing points in time");
        }
        Ok(())
    }

    pub fn ticker(&self, start: Instant, budget: Duration) -> RetryTicker {
        RetryTicker::new(&self.timeouts, start, budget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub remaining: Duration,
    /// time until the next regular tick
    pub gap: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// send now
    Fire(Tick),
    /// nothing to do before this point in time
    WaitUntil(Instant),
    /// the budget is used up
    Exhausted,
}

/// Decides when to (re)send, as a pure function of the current time.
///
/// Ticks fire on a grid of the current gap, anchored at the start. If the consumer comes back
///  late, the tick fires immediately and the grid continues from the last grid point that passed,
///  so the consumer's own processing time is not added to the gap.
#[derive(Debug, Clone)]
pub struct RetryTicker {
    start: Instant,
    budget: Duration,
    step: Duration,
    step_until: Option<Duration>,
    schedule: VecDeque<(Duration, Duration)>,
    next_grid: Duration,
}

impl RetryTicker {
    pub fn new(timeouts: &[(Duration, Duration)], start: Instant, budget: Duration) -> RetryTicker {
        let mut schedule: VecDeque<_> = timeouts.iter().copied().collect();
        let (step, step_until) = match schedule.pop_front() {
            Some((step, until)) => (step, Some(until)),
            None => (budget, None),
        };

        RetryTicker {
            start,
            budget,
            step,
            step_until,
            schedule,
            next_grid: Duration::ZERO,
        }
    }

    pub fn poll(&mut self, now: Instant) -> TickDecision {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed >= self.budget {
            return TickDecision::Exhausted;
        }
        if elapsed < self.next_grid {
            return TickDecision::WaitUntil(self.start + self.next_grid.min(self.budget));
        }

        let mut fired = self.next_grid;
        while fired + self.step <= elapsed {
            fired += self.step;
        }
        let gap = fired + self.step - elapsed;

        if let Some(until) = self.step_until {
            if elapsed > until {
                match self.schedule.pop_front() {
                    Some((step, until)) => {
                        self.step = step;
                        self.step_until = Some(until);
                    }
                    None => self.step_until = None,
                }
            }
        }
        self.next_grid = fired + self.step;

        TickDecision::Fire(Tick {
            remaining: self.budget - elapsed,
            gap,
        })
    }
}

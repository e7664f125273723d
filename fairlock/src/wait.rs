use crate::error::{Error, Result};
use exp_backoff::BackoffBuilder;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// Upper bound on a single uninterrupted sleep, so cancellation is noticed
// promptly even with long poll intervals.
const SLICE: Duration = Duration::from_millis(20);

/// How long a blocking `lock` call pauses between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// The same pause every time.
    Fixed(Duration),
    /// Pauses that start at `initial`, grow towards `max`, and carry random
    /// jitter, so competing waiters drift out of step.
    Backoff { initial: Duration, max: Duration },
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> PollPolicy {
        PollPolicy::Fixed(interval)
    }

    pub fn backoff(initial: Duration, max: Duration) -> PollPolicy {
        PollPolicy::Backoff {
            initial,
            max: max.max(initial),
        }
    }

    pub(crate) fn pacer(&self) -> Pacer {
        match *self {
            PollPolicy::Fixed(d) => Pacer::Fixed(d),
            PollPolicy::Backoff { initial, max } => {
                let min = nanos(initial);
                let max = nanos(max);
                let mut bo = BackoffBuilder::new().initial_ns(min).max_ns(max).build();
                Pacer::Backoff {
                    pause: Box::new(move || bo.pause()),
                    min,
                    max,
                }
            }
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::Fixed(Duration::from_millis(500))
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) enum Pacer {
    Fixed(Duration),
    Backoff {
        pause: Box<dyn FnMut() -> u64>,
        min: u64,
        max: u64,
    },
}

impl Pacer {
    pub(crate) fn next_pause(&mut self) -> Duration {
        match self {
            Pacer::Fixed(d) => *d,
            Pacer::Backoff { pause, min, max } => Duration::from_nanos(pause().clamp(*min, *max)),
        }
    }
}

/// Cooperative cancellation for blocking `lock` calls. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Options for a blocking `lock` call.
#[derive(Debug, Clone, Default)]
pub struct Wait {
    pub poll: PollPolicy,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

impl Wait {
    pub fn new(poll: PollPolicy) -> Wait {
        Wait {
            poll,
            ..Wait::default()
        }
    }

    /// Polls every `interval` with no deadline, the base behavior.
    pub fn every(interval: Duration) -> Wait {
        Wait::new(PollPolicy::fixed(interval))
    }

    pub fn deadline(mut self, at: Instant) -> Wait {
        self.deadline = Some(at);
        self
    }

    pub fn timeout(self, d: Duration) -> Wait {
        self.deadline(Instant::now() + d)
    }

    pub fn cancel(mut self, token: CancelToken) -> Wait {
        self.cancel = Some(token);
        self
    }

    /// Fails if the wait has been cancelled or has run out of time.
    pub(crate) fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        match self.deadline {
            Some(at) if Instant::now() >= at => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `pause`, cut short by cancellation or the deadline.
    pub(crate) fn sleep(&self, pause: Duration) -> Result<()> {
        let mut end = Instant::now() + pause;
        if let Some(at) = self.deadline {
            end = end.min(at);
        }

        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }

            thread::sleep((end - now).min(SLICE));
        }
    }
}

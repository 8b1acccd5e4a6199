use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// A stable handle to a scheduled timer, returned by `TimerQueue::add`.
///
/// muduo disambiguates two timers sharing an expiration and a recycled
/// raw pointer via a `(pointer, sequence)` pair; Rust timers live in an
/// `Arc` rather than a reused heap slot, so the monotonic `sequence`
/// alone is already a unique, stable identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    pub callback: TimerCallback,
    pub expiration: Instant,
    pub interval: Option<Duration>,
    pub sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> TimerId {
        TimerId(self.sequence)
    }

    pub fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub fn restart(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        } else {
            self.expiration = now;
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }
}

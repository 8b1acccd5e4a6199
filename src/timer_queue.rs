//! Orders pending Timers by expiration and drives them off a
//! `timerfd`-backed Channel. Grounded on §4.3 and muduo's
//! `TimerQueue.cc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::timerfd::TimerFd;
use crate::timer::{Timer, TimerCallback, TimerId};

/// Rearming the kernel timer to an expiration in the past (or only a few
/// microseconds out) makes `timerfd_settime` fire immediately and can
/// spin the loop; muduo's `howMuchTimeFromNow` clamps to this floor and
/// we keep the same number.
const MIN_INTERVAL: Duration = Duration::from_micros(100);

struct Inner {
    /// Ordered by `(expiration, sequence)` so `split_off` gives us every
    /// timer due at or before a cutoff in one slice, earliest first.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// sequence -> current expiration, so `cancel` can find a timer's
    /// BTreeMap key without a linear scan.
    active: HashMap<u64, Instant>,
    /// Sequence numbers cancelled while `handle_read` is running their
    /// callback; consulted before re-inserting a repeating timer so a
    /// timer that cancels itself during its own callback doesn't get
    /// re-armed.
    cancelling: HashSet<u64>,
    calling_expired: bool,
}

pub(crate) struct TimerQueue {
    loop_: Weak<EventLoop>,
    channel: Arc<Channel>,
    timerfd: TimerFd,
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new(loop_: Weak<EventLoop>) -> TimerQueue {
        let timerfd = TimerFd::new().unwrap_or_else(|e| {
            panic!("fatal: failed to create timerfd: {}", e);
        });
        let channel = Channel::new(loop_.clone(), timerfd.as_raw_fd());

        TimerQueue {
            loop_,
            channel,
            timerfd,
            inner: Mutex::new(Inner {
                timers: BTreeMap::new(),
                active: HashMap::new(),
                cancelling: HashSet::new(),
                calling_expired: false,
            }),
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Thread-safe entry point: always hands the actual insertion off to
    /// the owning Loop via `run_in_loop`, per §4.4.
    pub fn add_timer(
        &self,
        loop_: &Arc<EventLoop>,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = timer.id();
        let loop2 = loop_.clone();
        loop_.run_in_loop(move || loop2.timer_queue_add_timer_in_loop(timer));
        id
    }

    pub fn add_timer_in_loop(&self, timer: Timer) {
        let mut inner = self.inner.lock().unwrap();
        let earliest_changed = Self::insert(&mut inner, timer);
        if earliest_changed {
            let next = inner.timers.keys().next().map(|(when, _)| *when);
            drop(inner);
            self.rearm(next);
        }
    }

    /// Thread-safe entry point mirroring `add_timer`.
    pub fn cancel(&self, loop_: &Arc<EventLoop>, id: TimerId) {
        let loop2 = loop_.clone();
        loop_.run_in_loop(move || loop2.timer_queue_cancel_in_loop(id));
    }

    pub fn cancel_in_loop(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(expiration) = inner.active.remove(&id.0) {
            inner.timers.remove(&(expiration, id.0));
        } else if inner.calling_expired {
            // Firing right now; note it so the post-callback re-insert
            // step in handle_read skips it instead of re-arming it.
            inner.cancelling.insert(id.0);
        }
    }

    /// Drains the timerfd, runs every timer due by now, and re-arms
    /// repeating ones that survived their own callback uncancelled.
    pub fn handle_read(&self, now: Instant) {
        if let Err(e) = self.timerfd.read() {
            log::error!("TimerQueue::handle_read: timerfd read failed: {}", e);
        }

        let expired = {
            let mut inner = self.inner.lock().unwrap();
            inner.calling_expired = true;
            inner.cancelling.clear();

            let still_pending = inner.timers.split_off(&(now + Duration::from_nanos(1), 0));
            let due = std::mem::replace(&mut inner.timers, still_pending);
            for (expiration, seq) in due.keys() {
                inner.active.remove(seq);
                let _ = expiration;
            }
            due
        };

        for (_, mut timer) in expired {
            timer.run();

            let mut inner = self.inner.lock().unwrap();
            if timer.repeat() && !inner.cancelling.contains(&timer.sequence) {
                timer.restart(now);
                Self::insert(&mut inner, timer);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.calling_expired = false;
        let next = inner.timers.keys().next().map(|(when, _)| *when);
        drop(inner);

        self.rearm(next);
    }

    /// Inserts `timer`, returning whether it became the new earliest
    /// expiration (the only case that requires re-arming the kernel timer).
    fn insert(inner: &mut Inner, timer: Timer) -> bool {
        let earliest_changed = inner
            .timers
            .keys()
            .next()
            .map(|(when, _)| timer.expiration < *when)
            .unwrap_or(true);

        inner.active.insert(timer.sequence, timer.expiration);
        inner.timers.insert((timer.expiration, timer.sequence), timer);
        earliest_changed
    }

    /// Arms the kernel timer to `when`, or disarms it (`Duration::ZERO`)
    /// if there is nothing left pending.
    fn rearm(&self, when: Option<Instant>) {
        let delay = match when {
            Some(when) => {
                let now = Instant::now();
                if when > now {
                    (when - now).max(MIN_INTERVAL)
                } else {
                    MIN_INTERVAL
                }
            }
            None => Duration::ZERO,
        };
        if let Err(e) = self.timerfd.set(delay) {
            log::error!("TimerQueue::rearm: timerfd_settime failed: {}", e);
        }
    }
}

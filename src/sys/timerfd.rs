use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::sys::syscall;
use super::fd::FileDesc;

/// A Linux `timerfd(2)` bound to `CLOCK_MONOTONIC`, as muduo's
/// `TimerQueue::createTimerfd` uses — monotonic so that a clock step
/// (NTP, manual `settimeofday`) never misfires or starves a timer.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd {
            inner: FileDesc::new(fd),
        })
    }

    /// Arms the timer to fire once after `delay` (no kernel-native
    /// repeat: `it_interval` is always zero; periodic timers are
    /// re-armed by `TimerQueue` itself after each expiration, matching
    /// `muduo::net::detail::resetTimerfd`).
    pub fn set(&self, delay: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: duration_to_timespec(delay),
        };
        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;
        Ok(())
    }

    /// Drains the overrun counter. The count itself is discarded per
    /// §4.3 step 1 — only the wakeup matters, expiry bookkeeping lives
    /// in the ordered timer set.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.inner).read(&mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            Ok(n) => {
                log::error!("TimerFd::read() read {} bytes instead of 8", n);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd {
            inner: FileDesc::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

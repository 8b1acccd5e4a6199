//! The I/O multiplexer: waits on a set of descriptors and returns the
//! Channels that became ready. Grounded on §4.1.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::channel::Channel;
use crate::{Events, PollOpt, Ready, Token};
use crate::sys;

/// Three-valued tag for a Channel's relationship with the kernel
/// notifier, per §3's Channel invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerStatus {
    /// Not registered with the kernel, not present in the descriptor map.
    New,
    /// Registered with the kernel and present in the map, under `Token`.
    Added(Token),
    /// Present in the map, unregistered from the kernel, under `Token`.
    Deleted(Token),
}

impl PollerStatus {
    pub fn token(&self) -> Option<Token> {
        match self {
            PollerStatus::New => None,
            PollerStatus::Added(t) | PollerStatus::Deleted(t) => Some(*t),
        }
    }
}

pub struct Poller {
    epoll: sys::Epoll,
    channels: Mutex<Slab<Weak<Channel>>>,
    events: Mutex<Events>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        // A failure here is a kernel setup error (§7): the process has
        // no viable state without a notifier, so there is no Result to
        // hand back past this point — callers that need the error
        // surfaced (e.g. tests) still see it via `?` up to this call.
        let epoll = sys::Epoll::new()?;

        Ok(Poller {
            epoll,
            channels: Mutex::new(Slab::new()),
            events: Mutex::new(Events::with_capacity(1024)),
        })
    }

    /// Waits up to `timeout`; every ready Channel gets its
    /// `reported`-mask updated and is appended to `active`. Returns the
    /// timestamp captured right after wakeup.
    pub fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> io::Result<Instant> {
        let mut events = self.events.lock().unwrap();

        match self.epoll.wait(&mut events.inner, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                // Not an error: the loop just spins once more (§4.1 Failure).
            }
            Err(e) => {
                log::error!("Poller::poll epoll_wait failed: {}", e);
                return Err(e);
            }
        }

        if events.len() == events.capacity() {
            events.inner.grow();
        }

        let now = Instant::now();
        let channels = self.channels.lock().unwrap();

        for event in events.iter() {
            let idx = event.token().0;
            match channels.get(idx).and_then(Weak::upgrade) {
                Some(channel) => {
                    channel.set_reported(event.readiness());
                    active.push(channel);
                }
                None => {
                    // The Channel was dropped without calling remove_channel;
                    // nothing to dispatch to. This should not happen given
                    // the Drop-before-close discipline each owner follows.
                    log::trace!("Poller::poll: stale token {}", idx);
                }
            }
        }

        Ok(now)
    }

    /// Synchronizes the kernel notifier with `channel.interest()`.
    pub fn update_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        let interest = channel.interest();
        let status = channel.poller_status();
        let fd = channel.fd();

        match status {
            PollerStatus::New => {
                if interest.is_empty() {
                    return Ok(());
                }
                let mut channels = self.channels.lock().unwrap();
                let idx = channels.insert(Arc::downgrade(channel));
                let token = Token(idx);
                if let Err(e) = self.epoll.add(fd, token, interest, PollOpt::level()) {
                    channels.remove(idx);
                    log::error!("Poller::update_channel: epoll_ctl(ADD) failed: {}", e);
                    panic!("fatal: failed to register channel with the kernel notifier: {}", e);
                }
                channel.set_poller_status(PollerStatus::Added(token));
            }
            PollerStatus::Added(token) => {
                if interest.is_empty() {
                    if let Err(e) = self.epoll.delete(fd) {
                        log::error!("Poller::update_channel: epoll_ctl(DEL) failed: {}", e);
                    }
                    channel.set_poller_status(PollerStatus::Deleted(token));
                } else if let Err(e) = self.epoll.modify(fd, token, interest, PollOpt::level()) {
                    log::error!("Poller::update_channel: epoll_ctl(MOD) failed: {}", e);
                    panic!("fatal: failed to update channel interest with the kernel notifier: {}", e);
                }
            }
            PollerStatus::Deleted(token) => {
                if !interest.is_empty() {
                    if let Err(e) = self.epoll.add(fd, token, interest, PollOpt::level()) {
                        log::error!("Poller::update_channel: epoll_ctl(ADD) failed: {}", e);
                        panic!("fatal: failed to re-register channel with the kernel notifier: {}", e);
                    }
                    channel.set_poller_status(PollerStatus::Added(token));
                }
            }
        }

        Ok(())
    }

    /// Precondition: `channel.interest()` is empty. Drops the Channel
    /// from the descriptor map and, if still registered, unregisters it.
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        debug_assert!(
            channel.interest().is_empty(),
            "programmer error: remove_channel called with non-empty interest"
        );

        let status = channel.poller_status();
        let fd = channel.fd();

        match status {
            PollerStatus::New => {}
            PollerStatus::Added(token) => {
                if let Err(e) = self.epoll.delete(fd) {
                    log::error!("Poller::remove_channel: epoll_ctl(DEL) failed (non-fatal): {}", e);
                }
                self.channels.lock().unwrap().remove(token.0);
            }
            PollerStatus::Deleted(token) => {
                self.channels.lock().unwrap().remove(token.0);
            }
        }

        channel.set_poller_status(PollerStatus::New);
        Ok(())
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

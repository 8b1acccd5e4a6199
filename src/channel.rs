//! Per-descriptor handler: an interest mask plus read/write/close/error
//! callbacks, mediating between `Poller` and `EventLoop`. Grounded on
//! §4.2 and muduo's `Channel.h`.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::event_loop::EventLoop;
use crate::poller::PollerStatus;
use crate::Ready;

type ReadCb = Box<dyn FnMut(Instant) + Send>;
type EventCb = Box<dyn FnMut() + Send>;

struct ChannelInner {
    interest: Ready,
    reported: Ready,
    read_cb: Option<ReadCb>,
    write_cb: Option<EventCb>,
    close_cb: Option<EventCb>,
    error_cb: Option<EventCb>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

pub struct Channel {
    loop_: Weak<EventLoop>,
    fd: RawFd,
    inner: Mutex<ChannelInner>,
    status: Mutex<PollerStatus>,
    handling: AtomicBool,
    tied: AtomicBool,
}

impl Channel {
    /// `loop_` is a `Weak` handle rather than a strong one: every Channel
    /// lives inside a Loop (directly, as a field, or indirectly through a
    /// Connection/Acceptor the Loop's owner keeps alive), so a strong
    /// back-reference here would be a reference cycle the Loop could
    /// never drop out of.
    pub fn new(loop_: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            loop_,
            fd,
            inner: Mutex::new(ChannelInner {
                interest: Ready::empty(),
                reported: Ready::empty(),
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
                tie: None,
            }),
            status: Mutex::new(PollerStatus::New),
            handling: AtomicBool::new(false),
            tied: AtomicBool::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.inner.lock().unwrap().interest
    }

    pub fn set_reported(&self, reported: Ready) {
        self.inner.lock().unwrap().reported = reported;
    }

    pub fn poller_status(&self) -> PollerStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_poller_status(&self, status: PollerStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: FnMut(Instant) + Send + 'static,
    {
        self.inner.lock().unwrap().read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.lock().unwrap().write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.lock().unwrap().close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.lock().unwrap().error_cb = Some(Box::new(cb));
    }

    /// Stores a weak handle to `owner`, promoted to strong for the
    /// duration of `handle_event` so the owner cannot be destroyed
    /// mid-dispatch.
    pub fn tie<T: Any + Send + Sync + 'static>(&self, owner: &Arc<T>) {
        self.inner.lock().unwrap().tie = Some(Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>);
        self.tied.store(true, Ordering::Relaxed);
    }

    fn update(self: &Arc<Self>) {
        let Some(loop_) = self.loop_.upgrade() else {
            log::trace!("Channel::update: owning loop already gone");
            return;
        };
        if let Err(e) = loop_.update_channel(self) {
            log::error!("Channel::update: {}", e);
        }
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().interest.insert(Ready::readable());
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().interest.remove(Ready::readable());
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().interest.insert(Ready::writable());
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().interest.remove(Ready::writable());
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.inner.lock().unwrap().interest = Ready::empty();
        self.update();
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().unwrap().interest.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.inner.lock().unwrap().interest.is_readable()
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.lock().unwrap().interest.is_empty()
    }

    /// Dispatches the reported events in the priority order §4.2
    /// specifies: close, then error, then read, then write.
    pub fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let _guard = if self.tied.load(Ordering::Relaxed) {
            let tie = self.inner.lock().unwrap().tie.clone();
            match tie.and_then(|w| w.upgrade()) {
                Some(strong) => Some(strong),
                None => return, // owner already gone
            }
        } else {
            None
        };

        self.handling.store(true, Ordering::Relaxed);

        let reported = self.inner.lock().unwrap().reported;

        // Each callback is taken out of `inner` before being run and put
        // back afterward, so a callback that turns around and calls
        // enable_reading()/enable_writing() on this same Channel (a read
        // callback arming a write interest is the common case) doesn't
        // deadlock on its own Mutex.

        if reported.is_hup() && !reported.is_readable() {
            if let Some(mut cb) = self.inner.lock().unwrap().close_cb.take() {
                cb();
                self.inner.lock().unwrap().close_cb.get_or_insert(cb);
            }
        }

        if reported.is_error() {
            if let Some(mut cb) = self.inner.lock().unwrap().error_cb.take() {
                cb();
                self.inner.lock().unwrap().error_cb.get_or_insert(cb);
            }
        }

        if reported.is_readable() || reported.is_priority() || reported.is_peer_hup() {
            if let Some(mut cb) = self.inner.lock().unwrap().read_cb.take() {
                cb(receive_time);
                self.inner.lock().unwrap().read_cb.get_or_insert(cb);
            }
        }

        if reported.is_writable() {
            if let Some(mut cb) = self.inner.lock().unwrap().write_cb.take() {
                cb();
                self.inner.lock().unwrap().write_cb.get_or_insert(cb);
            }
        }

        self.handling.store(false, Ordering::Relaxed);
    }

    pub fn is_handling_event(&self) -> bool {
        self.handling.load(Ordering::Relaxed)
    }

    /// Requests removal from the owning Loop. Precondition: interest is
    /// already empty (callers disable_all() first).
    pub fn remove(self: &Arc<Self>) {
        let Some(loop_) = self.loop_.upgrade() else {
            return;
        };
        if let Err(e) = loop_.remove_channel(self) {
            log::error!("Channel::remove: {}", e);
        }
    }
}

//! Per-TCP-connection state machine: buffered reads, buffered writes
//! with backpressure, shutdown and force-close. Grounded on §4.7 and
//! muduo's `TcpConnection.{h,cc}`.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::fd::FileDesc;
use crate::sys::socket;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

type ConnectionCb = Box<dyn FnMut(&Arc<Connection>) + Send>;
type MessageCb = Box<dyn FnMut(&Arc<Connection>, &mut Buffer, Instant) + Send>;
type WriteCompleteCb = Box<dyn FnMut(&Arc<Connection>) + Send>;
type HighWaterMarkCb = Box<dyn FnMut(&Arc<Connection>, usize) + Send>;
type CloseCb = Box<dyn FnMut(&Arc<Connection>) + Send>;

struct Callbacks {
    connection: Option<ConnectionCb>,
    message: Option<MessageCb>,
    write_complete: Option<WriteCompleteCb>,
    high_water_mark: Option<HighWaterMarkCb>,
    high_water_mark_bytes: usize,
    close: Option<CloseCb>,
}

pub struct Connection {
    loop_: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    sock: FileDesc,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    #[cfg(feature = "stats")]
    bytes_read: std::sync::atomic::AtomicU64,
    #[cfg(feature = "stats")]
    bytes_written: std::sync::atomic::AtomicU64,
}

impl Connection {
    pub fn new(
        loop_: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Connection> {
        let channel = Channel::new(Arc::downgrade(&loop_), fd);
        let conn = Arc::new(Connection {
            loop_,
            name,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reading: AtomicBool::new(false),
            sock: FileDesc::new(fd),
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            callbacks: Mutex::new(Callbacks {
                connection: None,
                message: None,
                write_complete: None,
                high_water_mark: None,
                high_water_mark_bytes: 64 * 1024 * 1024,
                close: None,
            }),
            context: Mutex::new(None),
            #[cfg(feature = "stats")]
            bytes_read: std::sync::atomic::AtomicU64::new(0),
            #[cfg(feature = "stats")]
            bytes_written: std::sync::atomic::AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        conn.channel.set_error_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }
        });

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Total bytes delivered to the user message callback so far. Only
    /// present with the `stats` feature, matching the teacher's own
    /// `stats`-gated counters (`plus::ttl_cache`, dropped from this crate
    /// since it has no caching component, but its cost-free-when-disabled
    /// counter pattern is reused here).
    #[cfg(feature = "stats")]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    #[cfg(feature = "stats")]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn set_context<T: Any + Send + Sync + 'static>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    pub fn with_context<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Any + Send + Sync + 'static,
    {
        self.context
            .lock()
            .unwrap()
            .as_deref()
            .and_then(|v| v.downcast_ref::<T>())
            .map(f)
    }

    pub fn set_connection_callback<F: FnMut(&Arc<Connection>) + Send + 'static>(&self, cb: F) {
        self.callbacks.lock().unwrap().connection = Some(Box::new(cb));
    }

    pub fn set_message_callback<F: FnMut(&Arc<Connection>, &mut Buffer, Instant) + Send + 'static>(
        &self,
        cb: F,
    ) {
        self.callbacks.lock().unwrap().message = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback<F: FnMut(&Arc<Connection>) + Send + 'static>(&self, cb: F) {
        self.callbacks.lock().unwrap().write_complete = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback<F: FnMut(&Arc<Connection>, usize) + Send + 'static>(
        &self,
        cb: F,
        high_water_mark: usize,
    ) {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.high_water_mark = Some(Box::new(cb));
        callbacks.high_water_mark_bytes = high_water_mark;
    }

    pub(crate) fn set_close_callback<F: FnMut(&Arc<Connection>) + Send + 'static>(&self, cb: F) {
        self.callbacks.lock().unwrap().close = Some(Box::new(cb));
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        socket::set_tcp_nodelay(self.sock.raw(), on)
    }

    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || this.start_read_in_loop());
    }

    fn start_read_in_loop(self: &Arc<Self>) {
        if !self.reading.load(Ordering::Acquire) || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.store(true, Ordering::Release);
        }
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || this.stop_read_in_loop());
    }

    fn stop_read_in_loop(&self) {
        if self.reading.load(Ordering::Acquire) || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.store(false, Ordering::Release);
        }
    }

    /// Called exactly once by the Server, on this Connection's I/O loop.
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        self.channel.tie(self);
        self.channel.enable_reading();
        self.reading.store(true, Ordering::Release);

        if let Some(cb) = self.callbacks.lock().unwrap().connection.as_mut() {
            cb(self);
        }
    }

    /// Called exactly once when the Connection is removed from the
    /// Server. Idempotent.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.callbacks.lock().unwrap().connection.as_mut() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.sock.raw()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                #[cfg(feature = "stats")]
                self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                // Taken out of `callbacks` before being run and put back
                // afterward: `Mutex` is non-reentrant, and a message
                // callback that turns around and calls `conn.send()` would
                // otherwise deadlock re-locking `callbacks` from
                // `send_in_loop` on this same thread.
                if let Some(mut cb) = self.callbacks.lock().unwrap().message.take() {
                    cb(self, &mut input, receive_time);
                    self.callbacks.lock().unwrap().message.get_or_insert(cb);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                log::error!("Connection({}) handle_read failed: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            log::trace!("Connection({}) handle_write: no writing interest, nothing to do", self.name);
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match socket::write(self.sock.raw(), output.peek()) {
            Ok(n) => {
                #[cfg(feature = "stats")]
                self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    drop(output);
                    if let Some(cb) = self.callbacks.lock().unwrap().write_complete.as_mut() {
                        let this = self.clone();
                        self.loop_.queue_in_loop(move || cb_call(cb, &this));
                    }
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("Connection({}) handle_write failed: {}", self.name, e);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug_assert!(matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ));
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        if let Some(cb) = self.callbacks.lock().unwrap().connection.as_mut() {
            cb(self);
        }
        if let Some(cb) = self.callbacks.lock().unwrap().close.as_mut() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = socket::take_socket_error(self.sock.raw())
            .ok()
            .flatten()
            .unwrap_or_else(io::Error::last_os_error);
        log::error!("Connection({}) socket error: {}", self.name, err);
    }

    /// Thread-safe. Marshals to the I/O loop via `run_in_loop`.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let data = data.to_vec();
        let this = self.clone();
        self.loop_.run_in_loop(move || this.send_in_loop(&data));
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            log::trace!("Connection({}) send_in_loop: already disconnected, discarding", self.name);
            return;
        }

        let mut wrote = 0;
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match socket::write(self.sock.raw(), data) {
                Ok(n) => {
                    wrote = n;
                    #[cfg(feature = "stats")]
                    self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                    if wrote == data.len() {
                        if let Some(cb) = self.callbacks.lock().unwrap().write_complete.as_mut() {
                            let this = self.clone();
                            self.loop_.queue_in_loop(move || cb_call(cb, &this));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("Connection({}) send_in_loop write failed: {}", self.name, e);
                    fault = true;
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = &data[wrote..];
            let (old_len, new_len, high_water_mark) = {
                let mut output = self.output_buffer.lock().unwrap();
                let old_len = output.readable_bytes();
                output.append(remaining);
                let high_water_mark = self.callbacks.lock().unwrap().high_water_mark_bytes;
                (old_len, output.readable_bytes(), high_water_mark)
            };
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
            // Fires only on the upward crossing, not on every `send` that
            // keeps the buffer above the mark.
            if old_len < high_water_mark && new_len >= high_water_mark {
                if let Some(cb) = self.callbacks.lock().unwrap().high_water_mark.as_mut() {
                    cb(self, new_len);
                }
            }
        }
    }

    /// Thread-safe half-close: once the output buffer drains, the write
    /// direction is shut down and the state settles to `Disconnected`.
    pub fn shutdown(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || {
            if this.state() == ConnectionState::Connected {
                this.set_state(ConnectionState::Disconnecting);
                if !this.channel.is_writing() {
                    this.shutdown_in_loop();
                }
            }
        });
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.is_writing() {
            if let Err(e) = socket::shutdown_write(self.sock.raw()) {
                log::error!("Connection({}) shutdown(Write) failed: {}", self.name, e);
            }
        }
    }

    /// Thread-safe immediate close.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), ConnectionState::Connected | ConnectionState::Disconnecting) {
            self.set_state(ConnectionState::Disconnecting);
            let this = self.clone();
            self.loop_.queue_in_loop(move || this.force_close_in_loop());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state(), ConnectionState::Connected | ConnectionState::Disconnecting) {
            self.handle_close();
        }
    }

    /// Schedules a one-shot timer that force-closes this Connection only
    /// if it is still connected when the timer fires.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        let this = self.clone();
        self.loop_.run_after(
            delay,
            Box::new(move || {
                if matches!(this.state(), ConnectionState::Connected | ConnectionState::Disconnecting) {
                    this.force_close();
                }
            }),
        );
    }
}

fn cb_call(cb: &mut WriteCompleteCb, conn: &Arc<Connection>) {
    cb(conn);
}

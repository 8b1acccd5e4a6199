//! Ties an Acceptor, an I/O thread pool, and a name-keyed Connection
//! map into a complete TCP service. Grounded on §4.8 and muduo's
//! `TcpServer.{h,cc}`.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use indexmap::IndexMap;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::event_loop::EventLoop;
use crate::thread_pool::ThreadPool;

type ConnectionCb = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type MessageCb = Arc<dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync>;
type WriteCompleteCb = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type HighWaterMarkCb = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
pub type ThreadInitCallback = Box<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct Callbacks {
    connection: Option<ConnectionCb>,
    message: Option<MessageCb>,
    write_complete: Option<WriteCompleteCb>,
    high_water_mark: Option<(HighWaterMarkCb, usize)>,
}

/// A TCP service bound to one listening address. `base_loop` runs the
/// Acceptor; the I/O thread pool fans accepted connections out
/// round-robin across its loops (or, sized to zero, back onto
/// `base_loop` itself — the single-reactor configuration). Pool size
/// must be set with `set_thread_num` before `start()`; `start()`
/// constructs the pool and is idempotent thereafter.
pub struct Server {
    base_loop: Arc<EventLoop>,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_num: Mutex<usize>,
    thread_pool: OnceLock<ThreadPool>,
    connections: Mutex<IndexMap<String, Arc<Connection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    callbacks: Mutex<Callbacks>,
    #[cfg(feature = "stats")]
    connections_accepted: std::sync::atomic::AtomicU64,
}

impl Server {
    /// `reuseport` matches §6's `reuseport` Server option.
    pub fn new(base_loop: Arc<EventLoop>, addr: &SocketAddr, name: impl Into<String>, reuseport: bool) -> Arc<Server> {
        let acceptor = Acceptor::new(&base_loop, addr, reuseport);

        let server = Arc::new(Server {
            base_loop,
            name: name.into(),
            acceptor,
            thread_num: Mutex::new(0),
            thread_pool: OnceLock::new(),
            connections: Mutex::new(IndexMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks {
                connection: None,
                message: None,
                write_complete: None,
                high_water_mark: None,
            }),
            #[cfg(feature = "stats")]
            connections_accepted: std::sync::atomic::AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |fd, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer_addr);
            } else {
                unsafe { libc::close(fd) };
            }
        });

        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_(&self) -> &Arc<EventLoop> {
        &self.base_loop
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Sizes the I/O loop pool; `0` (the default) means the acceptor's
    /// own loop handles every connection's I/O. Must be called before
    /// `start()`.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(
            self.thread_pool.get().is_none(),
            "fatal: Server::set_thread_num called after start()"
        );
        *self.thread_num.lock().unwrap() = num_threads;
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback<F>(&self, cb: F, high_water_mark: usize)
    where
        F: Fn(&Arc<Connection>, usize) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().high_water_mark = Some((Arc::new(cb), high_water_mark));
    }

    /// Idempotent; thread-safe. Builds and starts the I/O thread pool
    /// (invoking `init_cb` once per loop before its first iteration),
    /// then posts `acceptor.listen()` to the base loop.
    pub fn start(self: &Arc<Self>, init_cb: Option<ThreadInitCallback>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let num_threads = *self.thread_num.lock().unwrap();
        let pool = self
            .thread_pool
            .get_or_init(|| ThreadPool::new(self.base_loop.clone(), num_threads));
        pool.start(init_cb);

        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || acceptor.listen());
    }

    pub fn thread_pool(&self) -> Option<&ThreadPool> {
        self.thread_pool.get()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Lifetime count of accepted connections. Only present with the
    /// `stats` feature.
    #[cfg(feature = "stats")]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Runs on the base loop (invoked as the Acceptor's new-connection
    /// callback). Picks an I/O loop round-robin, builds the Connection,
    /// installs the server's callbacks, then posts `connect_established`
    /// to the chosen loop.
    fn new_connection(self: &Arc<Self>, fd: i32, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        #[cfg(feature = "stats")]
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);

        let pool = self
            .thread_pool
            .get()
            .expect("fatal: Acceptor produced a connection before Server::start()");
        let io_loop = pool.get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, peer_addr, conn_id);

        let local_addr = match crate::sys::socket::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("Server({}) new_connection: getsockname failed: {}", self.name, e);
                unsafe { libc::close(fd) };
                return;
            }
        };

        log::info!(
            "Server({}) new_connection: [{}] from {}",
            self.name,
            name,
            peer_addr
        );

        let conn = Connection::new(io_loop.clone(), name.clone(), fd, local_addr, peer_addr);

        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(move |c| cb(c));
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(move |c, buf, t| cb(c, buf, t));
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(move |c| cb(c));
            }
            if let Some((cb, bytes)) = callbacks.high_water_mark.clone() {
                conn.set_high_water_mark_callback(move |c, n| cb(c, n), bytes);
            }
        }

        self.connections.lock().unwrap().insert(name, conn.clone());

        let this = self.clone();
        conn.set_close_callback(move |c| this.remove_connection(c));

        io_loop.run_in_loop({
            let conn = conn.clone();
            move || conn.connect_established()
        });
    }

    /// Thread-safe: marshals to the base loop, since the Connection map
    /// lives there but `close_cb` fires on the Connection's own I/O loop.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        let this = self.clone();
        let conn = conn.clone();
        self.base_loop.run_in_loop(move || this.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.base_loop.assert_in_loop_thread();
        log::info!(
            "Server({}) remove_connection_in_loop: [{}]",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());

        // `queue_in_loop`, not `run_in_loop`: keeps `conn`'s strong count
        // alive for the pending task itself, even when this runs on
        // `conn`'s own I/O loop (the single-reactor case), so the
        // Connection isn't dropped mid-callback.
        let conn = conn.clone();
        conn.loop_().queue_in_loop(move || conn.connect_destroyed());
    }
}

//! A pool of I/O loops, one per worker thread, with round-robin and
//! hash dispatch over the pool. Grounded on §4.5 and muduo's
//! `EventLoopThreadPool.{h,cc}`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

type ThreadInitCb = Box<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns `num_threads` worker threads, each running exactly one
/// `EventLoop::run()` for its lifetime. The base loop (the acceptor's
/// loop) is not one of the pool's threads; it is supplied by the
/// caller and returned whenever the pool has zero worker threads.
pub struct ThreadPool {
    base_loop: Arc<EventLoop>,
    num_threads: usize,
    next: AtomicUsize,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl ThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, num_threads: usize) -> ThreadPool {
        ThreadPool {
            base_loop,
            num_threads,
            next: AtomicUsize::new(0),
            loops: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    /// Spawns `num_threads` worker threads, each constructing its own
    /// `EventLoop`, invoking `init_cb` once on it before the first
    /// `poll`, then calling `run()`. Blocks until every child Loop is
    /// constructed and observable via `all_loops`, mirroring muduo's
    /// `EventLoopThreadPool::start` (which waits on a condition
    /// variable per spawned thread for the same reason: the caller is
    /// about to hand connections to these loops and must not race their
    /// construction).
    pub fn start(&self, init_cb: Option<ThreadInitCb>) {
        let mut started = self.started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;

        if self.num_threads == 0 {
            return;
        }

        let barrier = Arc::new(Barrier::new(self.num_threads + 1));
        let init_cb = init_cb.map(Arc::new);
        let mut handles = Vec::with_capacity(self.num_threads);
        let mut loops = Vec::with_capacity(self.num_threads);
        let loops_slot: Arc<Mutex<Vec<Option<Arc<EventLoop>>>>> =
            Arc::new(Mutex::new((0..self.num_threads).map(|_| None).collect()));

        for idx in 0..self.num_threads {
            let barrier = barrier.clone();
            let init_cb = init_cb.clone();
            let loops_slot = loops_slot.clone();

            let handle = thread::Builder::new()
                .name(format!("io-loop-{}", idx))
                .spawn(move || {
                    let loop_ = EventLoop::new();
                    if let Some(cb) = init_cb.as_ref() {
                        cb(&loop_);
                    }
                    loops_slot.lock().unwrap()[idx] = Some(loop_.clone());
                    barrier.wait();
                    loop_.run();
                })
                .unwrap_or_else(|e| panic!("fatal: failed to spawn I/O loop thread: {}", e));

            handles.push(handle);
        }

        barrier.wait();

        for slot in loops_slot.lock().unwrap().drain(..) {
            loops.push(slot.expect("I/O loop thread did not publish its EventLoop before the barrier"));
        }

        *self.loops.lock().unwrap() = loops;
        *self.handles.lock().unwrap() = handles;
    }

    /// Round-robins over the pool's loops; returns the base loop when
    /// the pool has zero worker threads.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[idx].clone()
    }

    /// Returns the loop at `hash % num_threads`, for affinity-based
    /// dispatch; the base loop when the pool has zero worker threads.
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        loops[hash % loops.len()].clone()
    }

    /// Snapshot of every worker loop, for user shutdown logic. Empty if
    /// the pool has zero worker threads or hasn't started yet.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.loops.lock().unwrap().clone()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

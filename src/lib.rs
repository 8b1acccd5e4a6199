//! A high-concurrency TCP server runtime built around the reactor
//! pattern: one single-threaded event loop per worker thread, a
//! level-triggered `epoll` multiplexer, a `timerfd`-backed timer queue,
//! and a per-connection state machine driving buffered reads and
//! writes.
//!
//! The moving pieces, leaves first:
//!
//! - [`Poller`] waits on a set of descriptors and reports the ones that
//!   became ready.
//! - [`Channel`] pairs one descriptor with an interest mask and
//!   read/write/close/error callbacks, mediating between a `Poller` and
//!   an [`EventLoop`].
//! - [`EventLoop`] is the reactor itself: poll, dispatch, run queued
//!   cross-thread tasks, repeat. Exactly one lives per OS thread.
//! - [`ThreadPool`] runs `N` `EventLoop`s on `N` worker threads and
//!   dispatches new connections across them round-robin or by hash.
//! - [`Acceptor`] is the listening-socket handler, including the
//!   idle-fd trick for recovering from `EMFILE`/`ENFILE` on `accept`.
//! - [`Connection`] is the per-TCP-connection state machine, with
//!   buffered, backpressured reads and writes.
//! - [`Server`] wires an `Acceptor`, a `ThreadPool`, and a
//!   name-keyed map of `Connection`s into a complete service.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_io::{EventLoop, Server};
//!
//! let base_loop = EventLoop::new();
//! let addr = "127.0.0.1:0".parse().unwrap();
//! let server = Server::new(base_loop.clone(), &addr, "echo", false);
//!
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buf, _received_at| {
//!     let bytes = buf.retrieve_all_as_vec();
//!     conn.send(&bytes);
//! });
//!
//! server.start(None);
//! base_loop.run();
//! ```

mod sys;

mod ready;
mod poll_opt;
mod token;
mod event;

pub mod channel;
pub mod poller;
pub mod event_loop;
mod timer;
pub mod timer_queue;
pub mod buffer;
pub mod acceptor;
pub mod connection;
pub mod thread_pool;
pub mod server;

pub use event::{Event, Events};
pub use poll_opt::PollOpt;
pub use ready::Ready;
pub use token::Token;

pub use channel::Channel;
pub use poller::Poller;
pub use event_loop::EventLoop;
pub use timer::TimerId;
pub use buffer::Buffer;
pub use acceptor::Acceptor;
pub use connection::{Connection, ConnectionState};
pub use thread_pool::ThreadPool;
pub use server::{Server, ThreadInitCallback};

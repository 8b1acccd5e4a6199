//! End-to-end scenarios from the runtime's testable-properties list:
//! echo round trip, round-robin dispatch across an I/O thread pool,
//! timer ordering, cancel-during-fire, and the high-water-mark /
//! write-complete backpressure handshake.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reactor_io::{Connection, EventLoop, Server};

fn recv_timeout<T>(rx: &std::sync::mpsc::Receiver<T>, timeout: Duration) -> T {
    rx.recv_timeout(timeout).expect("expected event did not arrive in time")
}

#[test]
fn echo_one_line() {
    let base_loop = EventLoop::new();
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = Server::new(base_loop.clone(), &addr, "echo", false);
    server.set_thread_num(0);

    let established = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(AtomicUsize::new(0));

    {
        let established = established.clone();
        let destroyed = destroyed.clone();
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                established.fetch_add(1, Ordering::SeqCst);
            } else {
                destroyed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    server.set_message_callback(|conn: &Arc<Connection>, buf, _received_at| {
        let bytes = buf.retrieve_all_as_vec();
        conn.send(&bytes);
    });

    server.start(None);
    let addr = server.local_addr().unwrap();

    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");

    drop(client);
    thread::sleep(Duration::from_millis(200));

    assert_eq!(established.load(Ordering::SeqCst), 1);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    base_loop.quit();
    loop_thread.join().unwrap();
}

#[test]
fn round_robin_dispatch_by_thread_id() {
    let base_loop = EventLoop::new();
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = Server::new(base_loop.clone(), &addr, "rr2", false);
    server.set_thread_num(3);
    server.start(None);
    let addr = server.local_addr().unwrap();

    let pool_loops = server.thread_pool().unwrap().all_loops();
    assert_eq!(pool_loops.len(), 3);
    let thread_ids: Vec<std::thread::ThreadId> = pool_loops.iter().map(|l| l.thread_id()).collect();

    let (tx, rx) = std::sync::mpsc::channel::<std::thread::ThreadId>();
    {
        let tx = Mutex::new(tx);
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                let _ = tx.lock().unwrap().send(conn.loop_().thread_id());
            }
        });
    }

    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let mut observed_indices = Vec::new();
    for _ in 0..6 {
        let client = TcpStream::connect(addr).unwrap();
        let tid = recv_timeout(&rx, Duration::from_secs(2));
        let idx = thread_ids.iter().position(|t| *t == tid).expect("connection dispatched to an unknown loop");
        observed_indices.push(idx);
        drop(client);
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(observed_indices, vec![0, 1, 2, 0, 1, 2]);

    base_loop.quit();
    loop_thread.join().unwrap();
}

#[test]
fn timer_ordering() {
    let loop_ = EventLoop::new();
    let fired: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    for (name, delay_ms) in [("T1", 50u64), ("T2", 30), ("T3", 40)] {
        let fired = fired.clone();
        loop_.run_after(
            Duration::from_millis(delay_ms),
            Box::new(move || {
                fired.lock().unwrap().push((name, Instant::now()));
            }),
        );
    }

    let loop_thread = {
        let loop_ = loop_.clone();
        thread::spawn(move || loop_.run())
    };

    thread::sleep(Duration::from_millis(150));
    loop_.quit();
    loop_thread.join().unwrap();

    let fired = fired.lock().unwrap();
    let names: Vec<&str> = fired.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["T2", "T3", "T1"]);

    let expected_ms = [("T2", 30u64), ("T3", 40), ("T1", 50)];
    for ((_, when), (_, expected)) in fired.iter().zip(expected_ms.iter()) {
        let elapsed = when.duration_since(start).as_millis() as i64;
        assert!(
            (elapsed - *expected as i64).abs() <= 20,
            "timer fired at {}ms, expected near {}ms",
            elapsed,
            expected
        );
    }
}

#[test]
fn cancel_during_fire_stops_a_repeating_timer() {
    let loop_ = EventLoop::new();
    let count = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<reactor_io::TimerId>>> = Arc::new(Mutex::new(None));

    let id = {
        let count = count.clone();
        let loop_for_cancel = loop_.clone();
        let id_slot = id_slot.clone();
        loop_.run_every(
            Duration::from_millis(20),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *id_slot.lock().unwrap() {
                    loop_for_cancel.cancel_timer(id);
                }
            }),
        )
    };
    *id_slot.lock().unwrap() = Some(id);

    let loop_thread = {
        let loop_ = loop_.clone();
        thread::spawn(move || loop_.run())
    };

    thread::sleep(Duration::from_millis(150));
    loop_.quit();
    loop_thread.join().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn high_water_mark_and_write_complete_fire_in_order() {
    let base_loop = EventLoop::new();
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = Server::new(base_loop.clone(), &addr, "hwm", false);
    server.set_thread_num(1);

    let high_water_hit = Arc::new(AtomicBool::new(false));
    let write_complete_count = Arc::new(AtomicUsize::new(0));

    {
        let high_water_hit = high_water_hit.clone();
        server.set_high_water_mark_callback(
            move |_conn, buffered| {
                if buffered >= 8 * 1024 {
                    high_water_hit.store(true, Ordering::SeqCst);
                }
            },
            8 * 1024,
        );
    }
    {
        let write_complete_count = write_complete_count.clone();
        server.set_write_complete_callback(move |_conn| {
            write_complete_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (conn_tx, conn_rx) = std::sync::mpsc::channel::<Arc<Connection>>();
    server.set_connection_callback(move |conn| {
        if conn.is_connected() {
            let _ = conn_tx.send(conn.clone());
        }
    });

    server.start(None);
    let addr = server.local_addr().unwrap();

    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    let conn = recv_timeout(&conn_rx, Duration::from_secs(2));

    let payload = vec![0xABu8; 64 * 1024];
    conn.send(&payload);

    // Peer drains slowly, in small chunks with pauses, so the sender's
    // output buffer is forced to hold a backlog long enough to cross
    // the 8 KiB high-water mark before the socket fully drains.
    let mut total_read = 0usize;
    let mut chunk = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(5);
    while total_read < payload.len() && Instant::now() < deadline {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(e) => panic!("client read failed: {}", e),
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(total_read, payload.len());
    thread::sleep(Duration::from_millis(100));

    assert!(high_water_hit.load(Ordering::SeqCst), "high-water-mark callback never fired");
    assert_eq!(write_complete_count.load(Ordering::SeqCst), 1);

    drop(client);
    base_loop.quit();
    loop_thread.join().unwrap();
}

//! Discard server (RFC 863): reads and throws away, reporting throughput
//! once per second via a repeating timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use loopline::{EventLoop, TcpServer};

fn main() -> Result<(), loopline::Error> {
    let mut event_loop = EventLoop::new()?;
    let server = TcpServer::new(
        &event_loop,
        "127.0.0.1:7879".parse().unwrap(),
        "discard",
        false,
    )?;

    let received = Arc::new(AtomicU64::new(0));

    let counter = received.clone();
    server.set_message_callback(Arc::new(move |_conn, buf, _when| {
        counter.fetch_add(buf.readable_bytes() as u64, Ordering::Relaxed);
        buf.retrieve_all();
    }));
    server.start();

    let counter = received.clone();
    event_loop.run_every(Duration::from_secs(1), move || {
        let bytes = counter.swap(0, Ordering::Relaxed);
        println!("{:.3} MiB/s", bytes as f64 / (1024.0 * 1024.0));
    });

    println!("discard server listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}

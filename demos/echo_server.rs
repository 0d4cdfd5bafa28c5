//! Echo server: every byte received goes straight back.
//!
//! Run with `cargo run --example echo_server`, then
//! `nc 127.0.0.1 7878` to talk to it.

use std::sync::Arc;

use loopline::{EventLoop, TcpServer};

fn main() -> Result<(), loopline::Error> {
    let mut event_loop = EventLoop::new()?;
    let server = TcpServer::new(
        &event_loop,
        "127.0.0.1:7878".parse().unwrap(),
        "echo",
        false,
    )?;

    server.set_connection_callback(Arc::new(|conn| {
        println!(
            "{} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let bytes = buf.retrieve_all_as_bytes();
        conn.send(&bytes);
    }));
    server.set_thread_num(4);
    server.start();

    println!("echo server listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}

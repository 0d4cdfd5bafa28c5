//! loopline — multi-reactor TCP server runtime for Linux.
//!
//! loopline drives TCP servers with one epoll-based event loop per
//! thread: an acceptor loop takes new connections and hands each one to a
//! worker loop, which owns it for life. Cross-thread work enters a loop
//! through a mutex-guarded task queue paired with an eventfd wakeup;
//! timers ride a timerfd armed to the earliest expiration. User code
//! reacts through callbacks that always run on the owning loop's thread.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use loopline::{EventLoop, TcpServer};
//!
//! fn main() -> Result<(), loopline::Error> {
//!     let mut event_loop = EventLoop::new()?;
//!     let server = TcpServer::new(&event_loop, "127.0.0.1:7878".parse().unwrap(), "echo", false)?;
//!     server.set_message_callback(std::sync::Arc::new(|conn, buf, _when| {
//!         let bytes = buf.retrieve_all_as_bytes();
//!         conn.send(&bytes);
//!     }));
//!     server.set_thread_num(4);
//!     server.start();
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: epoll, eventfd, and timerfd. The optional `RUST_LOG`-style
//! environment filtering comes from whatever `log` sink the host
//! application installs; loopline never installs one itself.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod channel;
pub(crate) mod poller;
pub(crate) mod sockets;
pub(crate) mod timer;

// ── Public modules ──────────────────────────────────────────────────
pub mod buffer;
pub mod callbacks;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod metrics;
pub mod server;

// ── Re-exports: core types ──────────────────────────────────────────

/// Growable byte buffer with prepend/readable/writable windows.
pub use buffer::Buffer;
/// Runtime errors.
pub use error::Error;
/// Single-threaded reactor; construct on the thread that runs it.
pub use event_loop::EventLoop;
/// Clonable `Send + Sync` reference to a loop.
pub use event_loop::LoopHandle;
/// Cancellation handle for a timer registration.
pub use timer::TimerId;

// ── Re-exports: server surface ──────────────────────────────────────

/// One accepted TCP connection.
pub use connection::TcpConnection;
/// A worker loop on a dedicated thread.
pub use event_loop_thread::EventLoopThread;
/// Pool of worker loops with round-robin assignment.
pub use event_loop_thread::EventLoopGroup;
/// TCP server bound to one listen address.
pub use server::TcpServer;

// ── Re-exports: callback aliases ────────────────────────────────────

/// Fired on connection establishment and teardown.
pub use callbacks::ConnectionCallback;
/// Fired once per upward crossing of the output high-water mark.
pub use callbacks::HighWaterMarkCallback;
/// Fired when bytes arrive.
pub use callbacks::MessageCallback;
/// Shared handle passed to every callback.
pub use callbacks::TcpConnectionPtr;
/// Run on each worker thread before its loop starts.
pub use callbacks::ThreadInitCallback;
/// Timer callback.
pub use callbacks::TimerCallback;
/// Fired when the output buffer drains to empty.
pub use callbacks::WriteCompleteCallback;

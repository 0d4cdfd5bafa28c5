//! Callback aliases shared across the runtime.
//!
//! Connections are handed to user code as shared handles; every callback
//! runs synchronously on the loop thread that owns the connection.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;

/// Shared handle to a connection. Callbacks may clone and stash it; the
/// connection object outlives the server map entry for as long as any
/// handle does.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired exactly twice per connection: once on establishment
/// (`conn.connected() == true`) and once on teardown.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when bytes arrive. The buffer holds everything received and not
/// yet retrieved; the timestamp is the poll-return time of the readiness
/// event that produced the bytes.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Fired when the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired once per upward crossing of the output-buffer high-water mark,
/// with the buffered byte count at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal: installed by the server so a closing connection can remove
/// itself from the connection map.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Timer callback. Repeating timers invoke it once per expiration.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Internal: the acceptor hands each accepted descriptor and peer address
/// to this callback on the acceptor loop's thread.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

/// Run on each worker thread of a loop group before its loop starts.
pub type ThreadInitCallback = Arc<dyn Fn(&crate::event_loop::LoopHandle) + Send + Sync>;

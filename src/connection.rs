//! Per-connection state machine.
//!
//! A connection moves through
//! `Connecting → Connected → Disconnecting → Disconnected`; peer close or
//! error short-circuits straight to `Disconnected`. Only the owning
//! loop's thread mutates the state. The object is shared: the server map
//! and any in-flight dispatch hold strong references, and it is destroyed
//! only after both release it and its channel has left the poller.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};
use crate::sockets::{self, Socket};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }

    fn name(self) -> &'static str {
        match self {
            State::Connecting => "Connecting",
            State::Connected => "Connected",
            State::Disconnecting => "Disconnecting",
            State::Disconnected => "Disconnected",
        }
    }
}

/// One accepted TCP connection: owned socket, registration channel, and
/// input/output buffers, driven by the loop it was assigned to.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
}

impl TcpConnection {
    /// Wrap an already-connected descriptor. The server posts
    /// [`connect_established`](Self::connect_established) into the
    /// assigned loop afterwards; until then the state is `Connecting`.
    pub(crate) fn new(
        loop_: LoopHandle,
        name: String,
        sockfd: libc::c_int,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(loop_.core_weak(), sockfd);
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |receive_time| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(receive_time);
                }
            }));
            let w = weak.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            }));
            let w = weak.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            }));
            let w = weak.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            }));

            let socket = Socket::new(sockfd);
            socket.set_keep_alive(true);

            TcpConnection {
                loop_,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                reading: AtomicBool::new(true),
                socket,
                channel,
                local_addr,
                peer_addr,
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            }
        });
        debug!("TcpConnection [{}] fd={}", conn.name, sockfd);
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

    /// The loop this connection is driven by.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether read interest is currently enabled.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Output-buffer size beyond which the high-water callback fires.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Toggle Nagle's algorithm for this connection.
    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    /// Send a copy of `data`. From the owning thread the write is
    /// attempted immediately; from any other thread the bytes are copied
    /// into the closure (the caller's buffer may vanish before the loop
    /// runs it). Sending on a connection that is not `Connected` is
    /// silently discarded.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.loop_.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Send the readable window of `buf` and retrieve it.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let conn = self.clone();
            let owned = buf.retrieve_all_as_bytes();
            self.loop_.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-close the write side once pending output drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Tear the connection down without waiting for output to drain.
    /// Idempotent: a no-op on an already-disconnected connection.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Like [`force_close`](Self::force_close), after `delay`. The timer
    /// holds only a weak reference, so a connection that closes normally
    /// in the meantime is not kept alive (or re-closed) by it.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Re-enable read interest after [`stop_read`](Self::stop_read).
    pub fn start_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_.run_in_loop(move || conn.start_read_in_loop());
    }

    /// Pause read interest; bytes queue up in the kernel until resumed.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_.run_in_loop(move || conn.stop_read_in_loop());
    }

    /// Replace the connection (up/down) callback.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    /// Replace the message callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    /// Replace the write-complete callback.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    /// Replace the high-water callback.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// First half of the lifecycle handshake, posted by the server once
    /// the connection is assigned to its loop: tie the channel, enable
    /// reading, and report the up-transition.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(Arc::downgrade(&tie));
        self.channel.enable_reading();
        self.run_connection_callback();
    }

    /// Second half, posted when the server drops the connection from its
    /// map. Reports the down-transition if `handle_close` has not already
    /// done so, and removes the channel from the poller.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            self.run_connection_callback();
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn run_connection_callback(self: &Arc<Self>) {
        let cb = self.connection_cb.lock().unwrap().clone();
        match cb {
            Some(cb) => cb(self),
            None => trace!(
                "{} -> {} is {}",
                self.local_addr,
                self.peer_addr,
                if self.connected() { "UP" } else { "DOWN" }
            ),
        }
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut saved_errno = 0;
        let mut input = self.input.lock().unwrap();
        let n = input.read_fd(self.channel.fd(), &mut saved_errno);
        if n > 0 {
            BYTES_RECEIVED.add(n as u64);
            let cb = self.message_cb.lock().unwrap().clone();
            match cb {
                Some(cb) => cb(self, &mut input, receive_time),
                None => input.retrieve_all(),
            }
        } else if n == 0 {
            drop(input);
            self.handle_close();
        } else {
            drop(input);
            error!("read on [{}]: errno {saved_errno}", self.name);
            self.handle_error();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection [{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match sockets::write(self.channel.fd(), output.peek()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    // Level-triggered: keeping write interest on an empty
                    // buffer would spin the loop.
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        let conn = self.clone();
                        self.loop_.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                error!("write on [{}]: {e}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        trace!(
            "fd={} state={}",
            self.channel.fd(),
            self.state().name()
        );
        debug_assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        // Keep a strong reference across both callbacks: the close
        // callback drops the server map entry, which may be the only
        // other owner.
        let guard = self.clone();
        guard.run_connection_callback();
        let close_cb = self.close_cb.lock().unwrap().clone();
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        error!(
            "connection [{}] SO_ERROR={} ({})",
            self.name,
            err,
            std::io::Error::from_raw_os_error(err)
        );
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("[{}] disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        // Nothing in flight and nothing queued: try the direct write.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0
                        && let Some(cb) = self.write_complete_cb.lock().unwrap().clone()
                    {
                        let conn = self.clone();
                        self.loop_.queue_in_loop(move || cb(&conn));
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        error!("write on [{}]: {e}", self.name);
                        let errno = e.raw_os_error().unwrap_or(0);
                        // Expected on a peer that already closed; suppress
                        // buffering so the bytes are not retried.
                        if errno == libc::EPIPE || errno == libc::ECONNRESET {
                            fault = true;
                        }
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            // One shot per upward crossing of the mark.
            if old_len + remaining >= mark
                && old_len < mark
                && let Some(cb) = self.high_water_cb.lock().unwrap().clone()
            {
                let conn = self.clone();
                let size = old_len + remaining;
                self.loop_.queue_in_loop(move || cb(&conn, size));
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.reading.load(Ordering::Acquire) || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.store(true, Ordering::Release);
        }
    }

    fn stop_read_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if self.reading.load(Ordering::Acquire) || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.store(false, Ordering::Release);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection [{}] dropped, state={}",
            self.name,
            self.state().name()
        );
        debug_assert!(matches!(
            self.state(),
            State::Disconnected | State::Connecting
        ));
    }
}

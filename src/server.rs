//! TCP server: accepts connections and assigns them to loops.
//!
//! The server owns the acceptor (driven by the loop it was constructed
//! on) and a name → connection map. With a thread pool attached, accepted
//! connections are distributed round-robin over the worker loops;
//! otherwise they share the acceptor's loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::event_loop_thread::EventLoopGroup;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED};
use crate::sockets;

struct ServerInner {
    loop_: LoopHandle,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    group: Arc<EventLoopGroup>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

/// A TCP server bound to one listen address.
///
/// Set callbacks and the worker-thread count before [`start`](Self::start);
/// dropping the server tears down every remaining connection through its
/// own loop.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Create a server listening on `listen_addr`, accepting on `loop_`'s
    /// thread. `reuse_port` enables `SO_REUSEPORT` so several servers can
    /// share the address.
    pub fn new(
        loop_: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<TcpServer, Error> {
        let name = name.into();
        let handle = loop_.handle();
        let acceptor = Acceptor::new(handle.clone(), &listen_addr, reuse_port)?;
        let group = Arc::new(EventLoopGroup::new(handle.clone(), format!("{name}-io")));

        let inner = Arc::new(ServerInner {
            loop_: handle,
            ip_port: listen_addr.to_string(),
            name,
            acceptor,
            group,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |sockfd, peer_addr| {
                match weak.upgrade() {
                    Some(server) => server.new_connection(sockfd, peer_addr),
                    None => sockets::close(sockfd),
                }
            }));

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The listen address as `ip:port` text.
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The acceptor loop's handle.
    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.loop_.clone()
    }

    /// Number of worker loops. Zero (the default) drives all connections
    /// on the acceptor's loop. Must be called before `start`.
    pub fn set_thread_num(&self, num: usize) {
        self.inner.group.set_thread_num(num);
    }

    /// Hook run on each worker thread before its loop starts.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.inner.high_water_cb.lock().unwrap() = Some(cb);
    }

    /// Start the worker loops and begin accepting. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .group
            .start(self.inner.thread_init_cb.lock().unwrap().clone());
        let acceptor = self.inner.acceptor.clone();
        self.inner.loop_.run_in_loop(move || {
            if !acceptor.is_listening() {
                acceptor.listen();
            }
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> = self
            .inner
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            CONNECTIONS_CLOSED.increment();
            CONNECTIONS_ACTIVE.decrement();
            let io_loop = conn.loop_handle().clone();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl ServerInner {
    /// Runs on the acceptor loop for every accepted descriptor.
    fn new_connection(self: &Arc<Self>, sockfd: libc::c_int, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.group.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer [{}]: new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = sockets::local_addr(sockfd).unwrap_or_else(|e| {
            warn!("getsockname fd={sockfd}: {e}");
            SocketAddr::from(([0, 0, 0, 0], 0))
        });

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            sockfd,
            local_addr,
            peer_addr,
        );
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// May run on any loop thread (it is the connection's close
    /// callback); hops to the server loop first.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = self.clone();
        let conn = conn.clone();
        self.loop_
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        info!(
            "TcpServer [{}]: remove connection [{}]",
            self.name,
            conn.name()
        );
        if self
            .connections
            .lock()
            .unwrap()
            .remove(conn.name())
            .is_none()
        {
            // Already drained by the server's destructor.
            return;
        }
        CONNECTIONS_CLOSED.increment();
        CONNECTIONS_ACTIVE.decrement();

        // The map entry may have been the last strong reference besides
        // ours; hand the final one to the connection's own loop so
        // destruction happens there.
        let io_loop = conn.loop_handle().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

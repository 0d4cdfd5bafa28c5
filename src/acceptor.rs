//! Listening socket plus its readable-event handler.
//!
//! Accepted descriptors are handed to the server's new-connection
//! callback on the acceptor loop's thread; with no callback installed
//! they are closed immediately.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, warn};

use crate::callbacks::NewConnectionCallback;
use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::metrics::ACCEPT_FD_EXHAUSTED_RECOVERIES;
use crate::sockets::{self, Socket};

pub(crate) struct Acceptor {
    loop_: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    /// Idle reserve descriptor. When accept fails with the process
    /// descriptor table full, closing this frees one slot, the pending
    /// connection is accepted and dropped, and the reserve is reopened —
    /// so exhaustion cannot wedge the listen backlog.
    idle_fd: Mutex<libc::c_int>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

fn open_idle_fd() -> libc::c_int {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

impl Acceptor {
    pub(crate) fn new(
        loop_: LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let socket = Socket::listener_for(listen_addr)?;
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind_address(listen_addr)?;

        let idle_fd = open_idle_fd();
        if idle_fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let channel = Channel::new(loop_.core_weak(), socket.fd());
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |_| {
                if let Some(acceptor) = w.upgrade() {
                    acceptor.handle_read();
                }
            }));
            Acceptor {
                loop_,
                socket,
                channel,
                idle_fd: Mutex::new(idle_fd),
                listening: AtomicBool::new(false),
                new_connection_cb: Mutex::new(None),
            }
        }))
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Begin listening and watch for readability. In-loop.
    pub(crate) fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        self.socket
            .listen()
            .expect("listen on a bound socket failed");
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        match sockets::accept(self.socket.fd()) {
            Ok((fd, peer_addr)) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(fd, peer_addr),
                    None => sockets::close(fd),
                }
            }
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(0);
                if errno == libc::EMFILE {
                    warn!("accept: process descriptor table full, using idle reserve");
                    self.recover_from_fd_exhaustion();
                } else if sockets::accept_error_is_fatal(errno) {
                    error!("accept failed with unrecoverable errno {errno}: {e}");
                    std::process::abort();
                } else {
                    warn!("accept: {e}");
                }
            }
        }
    }

    fn recover_from_fd_exhaustion(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        unsafe {
            libc::close(*idle);
        }
        let drained = unsafe {
            libc::accept(
                self.socket.fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if drained >= 0 {
            unsafe {
                libc::close(drained);
            }
        }
        *idle = open_idle_fd();
        ACCEPT_FD_EXHAUSTED_RECOVERIES.increment();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.loop_.is_in_loop_thread() {
            self.channel.disable_all();
            self.channel.remove();
        } else {
            let channel = self.channel.clone();
            self.loop_.run_in_loop(move || {
                channel.disable_all();
                channel.remove();
            });
        }
        unsafe {
            libc::close(*self.idle_fd.lock().unwrap());
        }
    }
}

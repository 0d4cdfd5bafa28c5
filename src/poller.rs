//! epoll-backed readiness multiplexer.
//!
//! Owns the epoll descriptor, the fd → channel map, and a pre-allocated
//! event array that doubles whenever a poll fills it. Touched only by the
//! owning loop's thread.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, trace};

use crate::channel::{Channel, PollerState};
use crate::error::Error;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll_fd: libc::c_int,
    channels: HashMap<libc::c_int, Arc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller, Error> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::LoopSetup(io::Error::last_os_error()));
        }
        Ok(Poller {
            epoll_fd,
            channels: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
        })
    }

    /// Wait for readiness, stash each ready mask into its channel, and
    /// push the channel into `active`. Returns the poll-return timestamp.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if n > 0 {
            trace!("{n} events ready");
            for i in 0..n as usize {
                let event = self.events[i];
                let fd = event.u64 as libc::c_int;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
            }
            if n as usize == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            trace!("nothing ready");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait: {saved}");
        }
        now
    }

    /// Register or re-register a channel per its lifecycle state.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        match channel.poller_state() {
            PollerState::New | PollerState::Deleted => {
                if channel.poller_state() == PollerState::New {
                    debug_assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel.clone());
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_poller_state(PollerState::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Added => {
                debug_assert!(self.channels.contains_key(&fd));
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drop a channel from the map (and the kernel, if still registered).
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        let state = channel.poller_state();
        debug_assert!(state == PollerState::Added || state == PollerState::Deleted);
        self.channels.remove(&fd);
        if state == PollerState::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    pub(crate) fn has_channel(&self, fd: libc::c_int) -> bool {
        self.channels.contains_key(&fd)
    }

    fn update(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                // The fd may already be closed; the kernel dropped it.
                debug!("epoll_ctl del fd={fd}: {err}");
            } else {
                error!("epoll_ctl op={op} fd={fd}: {err}");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

//! Per-descriptor registration handle.
//!
//! A channel binds one descriptor to one loop: it carries the interest
//! mask pushed into the poller, the readiness mask reported back, and the
//! callbacks dispatch fans out to. A channel never owns its descriptor.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::warn;

use crate::event_loop::LoopCore;

pub(crate) type ReadEventCallback = Box<dyn FnMut(Instant) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const HUP_EVENT: u32 = libc::EPOLLHUP as u32;
const RDHUP_EVENT: u32 = libc::EPOLLRDHUP as u32;
const ERROR_EVENT: u32 = libc::EPOLLERR as u32;
const PRI_EVENT: u32 = libc::EPOLLPRI as u32;
const IN_EVENT: u32 = libc::EPOLLIN as u32;
// Only produced by poll(2)-class multiplexers; epoll reports a bad fd as
// an EPOLL_CTL error instead.
const INVALID_EVENT: u32 = libc::POLLNVAL as u32;

/// Where the poller believes this channel is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    New,
    /// Registered with the kernel and present in the fd map.
    Added,
    /// Present in the fd map but unregistered (interest went empty).
    Deleted,
}

struct ChannelInner {
    events: u32,
    revents: u32,
    state: PollerState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    added_to_loop: bool,
    log_hup: bool,
    read_cb: Option<ReadEventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

pub(crate) struct Channel {
    fd: libc::c_int,
    owner: Weak<LoopCore>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(owner: Weak<LoopCore>, fd: libc::c_int) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            owner,
            inner: Mutex::new(ChannelInner {
                events: NONE_EVENT,
                revents: NONE_EVENT,
                state: PollerState::New,
                tie: None,
                event_handling: false,
                added_to_loop: false,
                log_hup: true,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            }),
        })
    }

    #[inline]
    pub(crate) fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        self.inner.lock().unwrap().read_cb = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.inner.lock().unwrap().write_cb = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.inner.lock().unwrap().close_cb = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.inner.lock().unwrap().error_cb = Some(cb);
    }

    /// Record a weak back-reference to the owning object. While a tie is
    /// installed, dispatch first upgrades it and becomes a no-op if the
    /// owner is gone; the upgraded reference is held across dispatch so
    /// the owner cannot be destroyed mid-callback.
    pub(crate) fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        self.inner.lock().unwrap().tie = Some(owner);
    }

    pub(crate) fn events(&self) -> u32 {
        self.inner.lock().unwrap().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.lock().unwrap().revents = revents;
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.inner.lock().unwrap().events == NONE_EVENT
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.inner.lock().unwrap().events & READ_EVENT != 0
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.inner.lock().unwrap().events & WRITE_EVENT != 0
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.inner.lock().unwrap().state = state;
    }

    pub(crate) fn enable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().events |= READ_EVENT;
        self.update();
    }

    pub(crate) fn disable_reading(self: &Arc<Self>) {
        self.inner.lock().unwrap().events &= !READ_EVENT;
        self.update();
    }

    pub(crate) fn enable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().events |= WRITE_EVENT;
        self.update();
    }

    pub(crate) fn disable_writing(self: &Arc<Self>) {
        self.inner.lock().unwrap().events &= !WRITE_EVENT;
        self.update();
    }

    pub(crate) fn disable_all(self: &Arc<Self>) {
        self.inner.lock().unwrap().events = NONE_EVENT;
        self.update();
    }

    /// Unregister from the owning loop's poller. Interest must already be
    /// empty.
    pub(crate) fn remove(self: &Arc<Self>) {
        debug_assert!(self.is_none_event());
        self.inner.lock().unwrap().added_to_loop = false;
        if let Some(core) = self.owner.upgrade() {
            core.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        self.inner.lock().unwrap().added_to_loop = true;
        if let Some(core) = self.owner.upgrade() {
            core.update_channel(self);
        }
    }

    /// Dispatch the readiness mask recorded by the last poll.
    ///
    /// Dispatch order: hangup-without-input delivers close first, then
    /// error, then read (so a callback can observe terminal data before
    /// reacting to writability), then write.
    pub(crate) fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let guard: Option<Arc<dyn Any + Send + Sync>> = {
            let inner = self.inner.lock().unwrap();
            match &inner.tie {
                Some(tie) => match tie.upgrade() {
                    Some(owner) => Some(owner),
                    // Owner destroyed between poll return and dispatch.
                    None => return,
                },
                None => None,
            }
        };
        self.handle_event_with_guard(receive_time);
        drop(guard);
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let (revents, mut read_cb, mut write_cb, mut close_cb, mut error_cb, log_hup) = {
            let mut inner = self.inner.lock().unwrap();
            inner.event_handling = true;
            (
                inner.revents,
                inner.read_cb.take(),
                inner.write_cb.take(),
                inner.close_cb.take(),
                inner.error_cb.take(),
                inner.log_hup,
            )
        };

        if revents & HUP_EVENT != 0 && revents & IN_EVENT == 0 {
            if log_hup {
                warn!("fd={} hangup without pending input", self.fd);
            }
            if let Some(cb) = close_cb.as_mut() {
                cb();
            }
        }

        if revents & INVALID_EVENT != 0 {
            warn!("fd={} invalid descriptor event", self.fd);
        }

        if revents & (ERROR_EVENT | INVALID_EVENT) != 0
            && let Some(cb) = error_cb.as_mut()
        {
            cb();
        }

        if revents & (IN_EVENT | PRI_EVENT | RDHUP_EVENT) != 0
            && let Some(cb) = read_cb.as_mut()
        {
            cb(receive_time);
        }

        if revents & WRITE_EVENT != 0
            && let Some(cb) = write_cb.as_mut()
        {
            cb();
        }

        let mut inner = self.inner.lock().unwrap();
        // A callback may have replaced its own slot; the newer one wins.
        if inner.read_cb.is_none() {
            inner.read_cb = read_cb;
        }
        if inner.write_cb.is_none() {
            inner.write_cb = write_cb;
        }
        if inner.close_cb.is_none() {
            inner.close_cb = close_cb;
        }
        if inner.error_cb.is_none() {
            inner.error_cb = error_cb;
        }
        inner.event_handling = false;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        debug_assert!(!inner.event_handling);
        // A registration left behind is only legal when the loop itself
        // is already gone (the kernel dropped it with the epoll fd).
        debug_assert!(!inner.added_to_loop || self.owner.upgrade().is_none());
    }
}

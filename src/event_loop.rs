//! One-loop-per-thread reactor.
//!
//! An [`EventLoop`] owns an epoll poller, a timer queue, and an eventfd
//! wakeup, and drives the poll → dispatch → pending-task cycle on the
//! thread that constructed it. [`LoopHandle`] is the `Send + Sync` face
//! of a loop: any thread may post closures, arm timers, or request quit
//! through it, and the loop observes the wakeup descriptor to pick the
//! work up without waiting out its poll timeout.

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::metrics::{LOOP_TASKS, LOOP_WAKEUPS};
use crate::poller::Poller;
use crate::timer::{self, Timer, TimerId, TimerQueue};

/// Upper bound on one blocking multiplexer call.
const POLL_TIMEOUT_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// State shared between a loop and its handles.
pub(crate) struct LoopCore {
    thread_id: ThreadId,
    wakeup_fd: libc::c_int,
    /// Cleared when the owning `EventLoop` is destroyed; posts after that
    /// are dropped rather than written into a recycled descriptor.
    alive: AtomicBool,
    quit: AtomicBool,
    looping: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poll_return: Mutex<Instant>,
    pending: Mutex<Vec<Task>>,
    poller: Mutex<Poller>,
    timers: Mutex<TimerQueue>,
}

impl LoopCore {
    #[inline]
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop owned by thread {:?} was touched from thread {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, fd: libc::c_int) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().has_channel(fd)
    }

    pub(crate) fn timers_mut(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap()
    }

    fn wakeup(&self) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup write returned {n}: {}", io::Error::last_os_error());
        }
        LOOP_WAKEUPS.increment();
    }
}

/// Clonable, `Send + Sync` reference to an event loop.
///
/// A handle may outlive its loop; posting to a destroyed loop logs a
/// warning and drops the task.
#[derive(Clone)]
pub struct LoopHandle {
    core: Arc<LoopCore>,
}

impl LoopHandle {
    /// Whether the calling thread owns the loop.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.core.is_in_loop_thread()
    }

    /// Panic unless called on the owning thread.
    pub fn assert_in_loop_thread(&self) {
        self.core.assert_in_loop_thread();
    }

    /// Run `f` inline when called on the owning thread, otherwise queue
    /// it for the loop's next pending-task drain.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for the loop's pending-task drain.
    ///
    /// The wakeup write is skipped only when the caller is the loop
    /// thread outside the drain phase: the loop is then still upstream of
    /// `do_pending_tasks` in the current iteration and will pick the task
    /// up anyway. A task queued from inside the drain would be missed
    /// until a later poll return, so that case wakes up too.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if !self.core.alive.load(Ordering::Acquire) {
            warn!("task posted to a destroyed event loop; dropped");
            return;
        }
        self.core.pending.lock().unwrap().push(Box::new(f));
        if !self.is_in_loop_thread() || self.core.calling_pending.load(Ordering::Acquire) {
            self.core.wakeup();
        }
    }

    /// Number of tasks currently queued.
    pub fn queue_size(&self) -> usize {
        self.core.pending.lock().unwrap().len()
    }

    /// Ask the loop to exit. Honored at the top of its next iteration.
    pub fn quit(&self) {
        self.core.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.core.wakeup();
        }
    }

    /// Run `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timer::new(when, None, Box::new(cb)))
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Run `cb` every `interval`, starting one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timer::new(
            Instant::now() + interval,
            Some(interval),
            Box::new(cb),
        ))
    }

    /// Cancel a timer. Safe to race with its expiration: the callback
    /// either already ran (and a repeating timer will not re-arm) or
    /// never runs.
    pub fn cancel(&self, id: TimerId) {
        let core = self.core.clone();
        self.run_in_loop(move || core.timers_mut().cancel(id));
    }

    fn add_timer(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        let core = self.core.clone();
        self.run_in_loop(move || core.timers_mut().add_timer(timer));
        id
    }

    pub(crate) fn core_weak(&self) -> Weak<LoopCore> {
        Arc::downgrade(&self.core)
    }
}

/// A single-threaded reactor. Construct it on the thread that will call
/// [`run`](Self::run); at most one loop may exist per thread.
pub struct EventLoop {
    core: Arc<LoopCore>,
    wakeup_channel: Arc<Channel>,
    timer_channel: Arc<Channel>,
    active_channels: Vec<Arc<Channel>>,
    #[allow(dead_code)]
    current_active: Option<libc::c_int>,
    // One loop per thread: an EventLoop never moves off the thread that
    // built it.
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<EventLoop, Error> {
        if LOOP_IN_THIS_THREAD.get() {
            panic!(
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
        }

        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(Error::LoopSetup(io::Error::last_os_error()));
        }

        let core = Arc::new(LoopCore {
            thread_id: thread::current().id(),
            wakeup_fd,
            alive: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return: Mutex::new(Instant::now()),
            pending: Mutex::new(Vec::new()),
            poller: Mutex::new(poller),
            timers: Mutex::new(timers),
        });

        let wakeup_channel = Channel::new(Arc::downgrade(&core), wakeup_fd);
        wakeup_channel.set_read_callback(Box::new(move |_| {
            let mut count: u64 = 0;
            let n = unsafe {
                libc::read(wakeup_fd, &mut count as *mut u64 as *mut libc::c_void, 8)
            };
            if n != 8 {
                warn!("wakeup read returned {n}: {}", io::Error::last_os_error());
            }
        }));
        wakeup_channel.enable_reading();

        let timerfd = core.timers_mut().timerfd();
        let timer_channel = Channel::new(Arc::downgrade(&core), timerfd);
        {
            let weak = Arc::downgrade(&core);
            timer_channel.set_read_callback(Box::new(move |_| {
                if let Some(core) = weak.upgrade() {
                    timer::handle_timerfd_read(&core);
                }
            }));
        }
        timer_channel.enable_reading();

        LOOP_IN_THIS_THREAD.set(true);
        trace!("event loop created in thread {:?}", thread::current().id());

        Ok(EventLoop {
            core,
            wakeup_channel,
            timer_channel,
            active_channels: Vec::with_capacity(16),
            current_active: None,
            _not_send: PhantomData,
        })
    }

    /// The cross-thread handle for this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: self.core.clone(),
        }
    }

    /// Drive the reactor until [`quit`](Self::quit) is observed. Must be
    /// called on the owning thread and may not be re-entered.
    pub fn run(&mut self) {
        assert!(
            !self.core.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run re-entered"
        );
        self.core.assert_in_loop_thread();
        self.core.quit.store(false, Ordering::SeqCst);
        trace!("event loop on {:?} starts", self.core.thread_id);

        while !self.core.quit.load(Ordering::Acquire) {
            let core = self.core.clone();
            let mut active = std::mem::take(&mut self.active_channels);
            active.clear();

            let poll_return = core
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT_MS, &mut active);
            *core.poll_return.lock().unwrap() = poll_return;
            core.iteration.fetch_add(1, Ordering::Relaxed);

            core.event_handling.store(true, Ordering::Release);
            for channel in &active {
                self.current_active = Some(channel.fd());
                channel.handle_event(poll_return);
            }
            self.current_active = None;
            core.event_handling.store(false, Ordering::Release);
            self.active_channels = active;

            self.do_pending_tasks();
        }

        self.core.looping.store(false, Ordering::SeqCst);
        trace!("event loop on {:?} stops", self.core.thread_id);
    }

    /// Ask the loop to exit at its next iteration boundary.
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(f);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(f);
    }

    /// Number of queued pending tasks.
    pub fn queue_size(&self) -> usize {
        self.handle().queue_size()
    }

    /// Run `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_at(when, cb)
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_after(delay, cb)
    }

    /// Run `cb` every `interval`.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_every(interval, cb)
    }

    /// Cancel a timer.
    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.core.is_in_loop_thread()
    }

    /// Completed poll iterations.
    pub fn iteration(&self) -> u64 {
        self.core.iteration.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent poll return.
    pub fn poll_return_time(&self) -> Instant {
        *self.core.poll_return.lock().unwrap()
    }

    /// Swap the queued tasks out under the lock, then run them unlocked:
    /// a task may queue another task (which must not deadlock), and the
    /// snapshot caps this iteration's work so I/O keeps getting serviced.
    fn do_pending_tasks(&self) {
        let tasks = std::mem::take(&mut *self.core.pending.lock().unwrap());
        if tasks.is_empty() {
            return;
        }
        self.core.calling_pending.store(true, Ordering::Release);
        let count = tasks.len() as u64;
        for task in tasks {
            task();
        }
        LOOP_TASKS.add(count);
        self.core.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug_assert!(!self.core.looping.load(Ordering::SeqCst));
        self.core.alive.store(false, Ordering::Release);
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        unsafe {
            libc::close(self.core.wakeup_fd);
        }
        if self.core.is_in_loop_thread() {
            LOOP_IN_THIS_THREAD.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_is_inline_on_owner_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(event_loop.queue_size(), 0);
    }

    #[test]
    fn queue_in_loop_defers_on_owner_thread() {
        let event_loop = EventLoop::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        event_loop.queue_in_loop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.queue_size(), 1);
    }

    #[test]
    #[should_panic(expected = "another EventLoop")]
    fn second_loop_on_one_thread_is_fatal() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn cross_thread_in_loop_assert_is_fatal() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = rx.recv().unwrap();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handle.assert_in_loop_thread()));
        assert!(result.is_err());

        handle.quit();
        worker.join().unwrap();
    }
}

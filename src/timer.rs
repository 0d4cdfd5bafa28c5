//! timerfd-backed timer queue.
//!
//! One kernel timer descriptor per loop, always armed to the earliest
//! pending expiration. Timers live in an ordered map keyed by
//! `(expiration, sequence)`; a parallel index keyed by sequence alone
//! supports cancellation in logarithmic time. The two containers always
//! hold the same timers.
//!
//! Sequence numbers come from a process-wide counter, so a `TimerId`
//! uniquely names a timer for its whole life, including across the
//! re-arm of a repeating timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::callbacks::TimerCallback;
use crate::error::Error;
use crate::event_loop::LoopCore;
use crate::metrics::{TIMERS_CANCELLED, TIMERS_FIRED};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Minimum lead time when arming the kernel timer; an expiration already
/// in the past still produces a readiness event.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

/// Opaque handle naming one timer registration; pass it back to
/// `cancel`. Remains valid (and inert) after the timer has fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

pub(crate) struct Timer {
    sequence: u64,
    expiration: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl Timer {
    pub(crate) fn new(expiration: Instant, interval: Option<Duration>, callback: TimerCallback) -> Timer {
        Timer {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            expiration,
            interval,
            callback,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
        }
    }
}

pub(crate) struct TimerQueue {
    timerfd: libc::c_int,
    timers: BTreeMap<(Instant, u64), Timer>,
    active: HashMap<u64, Instant>,
    calling_expired: bool,
    canceling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> Result<TimerQueue, Error> {
        let timerfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timerfd < 0 {
            return Err(Error::LoopSetup(io::Error::last_os_error()));
        }
        Ok(TimerQueue {
            timerfd,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            calling_expired: false,
            canceling: HashSet::new(),
        })
    }

    #[inline]
    pub(crate) fn timerfd(&self) -> libc::c_int {
        self.timerfd
    }

    /// Add a timer; re-arms the kernel timer when the new entry becomes
    /// the earliest.
    pub(crate) fn add_timer(&mut self, timer: Timer) {
        let when = timer.expiration;
        if self.insert(timer) {
            self.arm(when);
        }
    }

    /// Cancel by id. A timer that has just fired and awaits re-insertion
    /// is marked so the pending re-arm skips it instead.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        debug_assert_eq!(self.timers.len(), self.active.len());
        if let Some(expiration) = self.active.remove(&id.sequence) {
            let removed = self.timers.remove(&(expiration, id.sequence));
            debug_assert!(removed.is_some());
            TIMERS_CANCELLED.increment();
        } else if self.calling_expired {
            self.canceling.insert(id.sequence);
        }
    }

    /// Quiesce the kernel timer by reading its expiration count.
    pub(crate) fn read_timerfd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timerfd,
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n == 8 {
            trace!("timerfd fired {count} time(s)");
        } else {
            warn!(
                "timerfd read returned {n}: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Atomically move every timer with `expiration <= now` out of both
    /// containers and enter the dispatch phase.
    pub(crate) fn begin_expired(&mut self, now: Instant) -> Vec<Timer> {
        debug_assert_eq!(self.timers.len(), self.active.len());
        self.calling_expired = true;
        self.canceling.clear();

        let rest = self.timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut self.timers, rest);
        for &(_, sequence) in expired.keys() {
            let removed = self.active.remove(&sequence);
            debug_assert!(removed.is_some());
        }
        expired.into_values().collect()
    }

    /// Leave the dispatch phase: re-insert repeating timers that were not
    /// cancelled mid-dispatch, then re-arm (or disarm) the kernel timer.
    pub(crate) fn finish_expired(&mut self, fired: Vec<Timer>, now: Instant) {
        self.calling_expired = false;
        for mut timer in fired {
            if let Some(interval) = timer.interval
                && !self.canceling.contains(&timer.sequence)
            {
                timer.expiration = now + interval;
                self.insert(timer);
            }
        }
        self.canceling.clear();

        match self.timers.keys().next() {
            Some(&(expiration, _)) => self.arm(expiration),
            None => self.disarm(),
        }
    }

    fn insert(&mut self, timer: Timer) -> bool {
        debug_assert_eq!(self.timers.len(), self.active.len());
        let earliest_changed = match self.timers.keys().next() {
            Some(&(first, _)) => timer.expiration < first,
            None => true,
        };
        self.active.insert(timer.sequence, timer.expiration);
        let replaced = self
            .timers
            .insert((timer.expiration, timer.sequence), timer);
        debug_assert!(replaced.is_none());
        earliest_changed
    }

    fn arm(&self, expiration: Instant) {
        let delay = expiration
            .saturating_duration_since(Instant::now())
            .max(MIN_ARM_DELAY);
        self.settime(libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        });
    }

    fn disarm(&self) {
        self.settime(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        });
    }

    fn settime(&self, value: libc::timespec) {
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        let ret =
            unsafe { libc::timerfd_settime(self.timerfd, 0, &new_value, std::ptr::null_mut()) };
        if ret < 0 {
            warn!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        debug_assert_eq!(self.timers.len(), self.active.len());
        self.timers.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timerfd);
        }
    }
}

/// Readable-event handler for the loop's timer descriptor. Fires expired
/// callbacks in expiration order with the queue unlocked, so a callback
/// may itself add or cancel timers.
pub(crate) fn handle_timerfd_read(core: &Arc<LoopCore>) {
    core.assert_in_loop_thread();
    let now = Instant::now();

    let expired = {
        let mut queue = core.timers_mut();
        queue.read_timerfd();
        queue.begin_expired(now)
    };

    let mut fired = Vec::with_capacity(expired.len());
    for mut timer in expired {
        (timer.callback)();
        TIMERS_FIRED.increment();
        fired.push(timer);
    }

    core.timers_mut().finish_expired(fired, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn noop() -> TimerCallback {
        Box::new(|| {})
    }

    #[test]
    fn sequences_are_unique_and_increasing() {
        let now = Instant::now();
        let a = Timer::new(now, None, noop());
        let b = Timer::new(now, None, noop());
        assert!(b.sequence > a.sequence);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn expiry_cut_takes_due_timers_in_order() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let due1 = Timer::new(now - Duration::from_millis(20), None, noop());
        let due2 = Timer::new(now - Duration::from_millis(10), None, noop());
        let later = Timer::new(now + Duration::from_secs(60), None, noop());
        let (s1, s2) = (due1.sequence, due2.sequence);
        // Insertion order should not matter.
        queue.add_timer(later);
        queue.add_timer(due2);
        queue.add_timer(due1);
        assert_eq!(queue.len(), 3);

        let expired = queue.begin_expired(now);
        assert_eq!(
            expired.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![s1, s2]
        );
        assert_eq!(queue.len(), 1);
        queue.finish_expired(expired, now);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn equal_expirations_fire_in_insertion_order() {
        let mut queue = TimerQueue::new().unwrap();
        let when = Instant::now() - Duration::from_millis(1);
        let first = Timer::new(when, None, noop());
        let second = Timer::new(when, None, noop());
        let (s1, s2) = (first.sequence, second.sequence);
        queue.add_timer(second);
        queue.add_timer(first);

        let expired = queue.begin_expired(Instant::now());
        assert_eq!(
            expired.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![s1, s2]
        );
        queue.finish_expired(expired, Instant::now());
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut queue = TimerQueue::new().unwrap();
        let timer = Timer::new(Instant::now() + Duration::from_secs(60), None, noop());
        let id = timer.id();
        queue.add_timer(timer);
        assert_eq!(queue.len(), 1);
        queue.cancel(id);
        assert_eq!(queue.len(), 0);
        // Cancelling twice is a no-op.
        queue.cancel(id);
    }

    #[test]
    fn repeating_timer_rearms_unless_cancelled_mid_dispatch() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let interval = Duration::from_millis(50);
        let repeating = Timer::new(now - Duration::from_millis(1), Some(interval), noop());
        let id = repeating.id();
        queue.add_timer(repeating);

        // First round: fires and re-arms.
        let expired = queue.begin_expired(now);
        assert_eq!(expired.len(), 1);
        queue.finish_expired(expired, now);
        assert_eq!(queue.len(), 1);

        // Second round: cancelled between cut and re-insertion, so the
        // re-arm must skip it.
        let later = now + interval + Duration::from_millis(1);
        let expired = queue.begin_expired(later);
        assert_eq!(expired.len(), 1);
        queue.cancel(id);
        queue.finish_expired(expired, later);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn callbacks_keep_state() {
        let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        for tag in [1u32, 2, 3] {
            let log = log.clone();
            queue.add_timer(Timer::new(
                now - Duration::from_millis(3 - tag as u64),
                None,
                Box::new(move || log.lock().unwrap().push(tag)),
            ));
        }
        let expired = queue.begin_expired(now);
        let mut fired = Vec::new();
        for mut timer in expired {
            (timer.callback)();
            fired.push(timer);
        }
        queue.finish_expired(fired, now);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }
}

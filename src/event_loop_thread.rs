//! Worker loop threads and the round-robin loop group.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};

/// One event loop running on a dedicated thread.
///
/// Dropping the thread object quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init_cb: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init_cb: None,
            handle: None,
            thread: None,
        }
    }

    /// Like [`new`](Self::new), with a hook run on the spawned thread
    /// before its loop starts.
    pub fn with_init(name: impl Into<String>, init_cb: ThreadInitCallback) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init_cb: Some(init_cb),
            handle: None,
            thread: None,
        }
    }

    /// Spawn the thread, wait for its loop to exist, and return the
    /// loop's handle.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let (tx, rx) = crossbeam_channel::bounded(1);
        let init_cb = self.init_cb.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::new().expect("event loop setup failed");
                if let Some(cb) = &init_cb {
                    cb(&event_loop.handle());
                }
                tx.send(event_loop.handle())
                    .expect("parent dropped the startup channel");
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let handle = rx
            .recv()
            .expect("event loop thread died during startup");
        self.handle = Some(handle.clone());
        self.thread = Some(thread);
        handle
    }

    /// The loop's handle, once started.
    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A pool of worker loops with round-robin assignment.
///
/// With zero threads configured, [`next_loop`](Self::next_loop) always
/// returns the base loop.
pub struct EventLoopGroup {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    handles: Mutex<Vec<LoopHandle>>,
}

impl EventLoopGroup {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopGroup {
        EventLoopGroup {
            base,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads to spawn on `start`.
    pub fn set_thread_num(&self, num: usize) {
        assert!(!self.started(), "thread count fixed after start");
        self.num_threads.store(num, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the worker threads; each publishes its loop handle before
    /// entering its loop. Idempotent.
    pub fn start(&self, init_cb: Option<ThreadInitCallback>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let num = self.num_threads.load(Ordering::Acquire);
        let mut threads = self.threads.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for i in 0..num {
            let name = format!("{}-{}", self.name, i);
            let mut thread = match &init_cb {
                Some(cb) => EventLoopThread::with_init(name, cb.clone()),
                None => EventLoopThread::new(name),
            };
            handles.push(thread.start_loop());
            threads.push(thread);
        }
        if num == 0
            && let Some(cb) = &init_cb
        {
            cb(&self.base);
        }
    }

    /// Round-robin over the workers; the base loop when there are none.
    pub fn next_loop(&self) -> LoopHandle {
        let handles = self.handles.lock().unwrap();
        if handles.is_empty() {
            self.base.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % handles.len();
            handles[index].clone()
        }
    }

    /// Handles of every worker loop (empty before `start` or with zero
    /// threads).
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        self.handles.lock().unwrap().clone()
    }
}

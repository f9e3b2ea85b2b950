//! The off-RT worker pool.
//!
//! Nodes in the signal graph hand latency-tolerant work (chunk loads from
//! disk, render writes, coefficient recomputation) to a small fixed pool
//! of threads. The RT side of the handoff is a slot write plus one atomic
//! increment; the pool mutex is only ever taken by the workers themselves.

use core::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of deferred work.
///
/// Tasks are held as `Arc`s so that enqueueing from the RT thread is a
/// reference-count bump, never a heap allocation. A node typically builds
/// its task object once at creation time and re-defers the same `Arc`
/// whenever it needs the work done again.
pub trait WorkerTask: Send + Sync + 'static {
    fn run(&self);
}

struct TaskSlot(UnsafeCell<Option<Arc<dyn WorkerTask>>>);

// SAFETY: slot access is governed by `pending`: the single producer only
// writes the slot at index `pending` before its release increment, and
// consumers only read slots below `pending` (serialized among themselves
// by the pool mutex) with the matching acquire load.
unsafe impl Sync for TaskSlot {}

struct PoolShared {
    slots: Box<[TaskSlot]>,
    pending: AtomicUsize,
    running: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl PoolShared {
    /// Append a task at index `pending`, then publish it with an atomic
    /// increment.
    ///
    /// Non-blocking and safe to invoke from the RT thread. Producers are
    /// serialized by convention: only one thread (the RT thread, once the
    /// stream runs) enqueues.
    fn defer(&self, task: Arc<dyn WorkerTask>) {
        let index = self.pending.load(Ordering::Acquire);
        assert!(
            index < self.slots.len(),
            "worker task queue reached capacity ({})",
            self.slots.len()
        );

        // SAFETY: no consumer touches this slot until the increment below
        // publishes it, and there is only one producer.
        unsafe {
            *self.slots[index].0.get() = Some(task);
        }
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Wake the workers if there is anything for them to do.
    fn flush(&self) {
        if self.pending.load(Ordering::Acquire) > 0 {
            self.cond.notify_all();
        }
    }

    fn worker_loop(&self) {
        loop {
            let mut guard = self.lock.lock().unwrap();

            while self.pending.load(Ordering::Acquire) == 0 && self.running.load(Ordering::Acquire)
            {
                guard = self.cond.wait(guard).unwrap();
            }

            if self.pending.load(Ordering::Acquire) == 0 && !self.running.load(Ordering::Acquire) {
                return;
            }

            // Pop the top entry (LIFO). Take the task *before* the
            // decrement: the decrement's release publishes the emptied
            // slot back to the producer.
            let index = self.pending.load(Ordering::Acquire) - 1;
            // SAFETY: the mutex serializes consumers, and the producer
            // never writes below `pending`.
            let task = unsafe { (*self.slots[index].0.get()).take() };
            self.pending.fetch_sub(1, Ordering::Release);

            drop(guard);

            if let Some(task) = task {
                task.run();
            }
        }
    }
}

/// A lightweight, cloneable handle for deferring work onto a pool.
///
/// This is what nodes hold; the [`WorkerPool`] itself stays with the
/// engine context.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<PoolShared>,
}

impl WorkerHandle {
    /// See [`WorkerPool::defer`].
    pub fn defer(&self, task: Arc<dyn WorkerTask>) {
        self.shared.defer(task);
    }

    /// See [`WorkerPool::flush`].
    pub fn flush(&self) {
        self.shared.flush();
    }
}

/// A fixed-size thread pool with a bounded task queue.
///
/// Tasks run in LIFO order; callbacks must not assume FIFO. Once a task is
/// dequeued it runs to completion; [`WorkerPool::stop`] cancels the wait,
/// not in-flight work, and the workers drain whatever is still queued
/// before exiting.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl WorkerPool {
    pub fn new(num_threads: usize, capacity: usize) -> Self {
        assert!(num_threads > 0, "worker pool needs at least one thread");
        assert!(capacity > 0, "worker queue capacity must be greater than zero");

        log::info!(
            "creating worker pool with {} threads and capacity for {} tasks",
            num_threads,
            capacity
        );

        let slots = (0..capacity)
            .map(|_| TaskSlot(UnsafeCell::new(None)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shared: Arc::new(PoolShared {
                slots,
                pending: AtomicUsize::new(0),
                running: AtomicBool::new(true),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            num_threads,
        }
    }

    /// Spawn the worker threads.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "worker pool already started");

        for i in 0..self.num_threads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("cadenza-worker-{i}"))
                .spawn(move || shared.worker_loop())
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
    }

    /// A cloneable handle nodes can defer through.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enqueue a task. Non-blocking and RT-safe; see
    /// [`WorkerHandle::defer`] for the handle nodes use.
    ///
    /// # Panics
    ///
    /// Panics if the queue is at capacity.
    pub fn defer(&self, task: Arc<dyn WorkerTask>) {
        self.shared.defer(task);
    }

    /// Wake the workers if any tasks are pending.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// The number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop accepting wakeups and join every worker. Queued tasks are
    /// drained before the workers exit.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        log::info!("stopping worker pool");
        self.shared.cond.notify_all();

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountTask {
        count: AtomicU32,
    }

    impl WorkerTask for CountTask {
        fn run(&self) {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
    }

    struct OrderTask {
        tag: u32,
        order: Arc<Mutex<Vec<u32>>>,
    }

    impl WorkerTask for OrderTask {
        fn run(&self) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn runs_every_deferred_task() {
        let pool = WorkerPool::new(4, 16);
        pool.start();

        let task = Arc::new(CountTask {
            count: AtomicU32::new(0),
        });

        for _ in 0..10 {
            pool.defer(task.clone());
        }
        pool.flush();
        pool.stop();

        assert_eq!(task.count.load(Ordering::Acquire), 10);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn drains_queue_on_stop_without_flush() {
        let pool = WorkerPool::new(2, 8);
        pool.start();

        let task = Arc::new(CountTask {
            count: AtomicU32::new(0),
        });

        for _ in 0..5 {
            pool.defer(task.clone());
        }
        // No flush: stop's broadcast must still drain the queue.
        pool.stop();

        assert_eq!(task.count.load(Ordering::Acquire), 5);
    }

    #[test]
    fn pops_in_lifo_order() {
        let pool = WorkerPool::new(1, 8);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            pool.defer(Arc::new(OrderTask {
                tag,
                order: Arc::clone(&order),
            }));
        }

        // Deferred before start: the single worker drains top-down.
        pool.start();
        pool.stop();

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    #[should_panic(expected = "worker task queue reached capacity")]
    fn capacity_overflow_is_fatal() {
        let pool = WorkerPool::new(1, 2);
        let task = Arc::new(CountTask {
            count: AtomicU32::new(0),
        });
        pool.defer(task.clone());
        pool.defer(task.clone());
        pool.defer(task);
    }
}

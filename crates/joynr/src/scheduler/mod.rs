// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 joynr-rs contributors

//! Delayed work scheduler.
//!
//! A timer thread orders pending runnables by due time and hands due work
//! to a small fixed pool of worker threads over a crossbeam channel.
//! Every runnable carries an absolute decay time: work whose decay time
//! has passed is dropped, never executed (see `Runnable::expiry_ms`).
//!
//! Cancellation is by opaque [`ScheduleHandle`]. Handles become stale once
//! the runnable fires, so cancelling twice (or cancelling after the fact)
//! is a safe no-op.

use crate::util::time::{is_expired, now_ms, TimePoint, NO_EXPIRY};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A unit of deferred work.
///
/// `run` consumes the runnable; the scheduler never executes a runnable
/// twice. `expiry_ms` is the decay time: once it has passed the scheduler
/// silently drops the work instead of running it.
pub trait Runnable: Send {
    fn run(self: Box<Self>);

    fn expiry_ms(&self) -> TimePoint {
        NO_EXPIRY
    }
}

struct FnRunnable<F: FnOnce() + Send> {
    f: F,
    expiry_ms: TimePoint,
}

impl<F: FnOnce() + Send> Runnable for FnRunnable<F> {
    fn run(self: Box<Self>) {
        (self.f)();
    }

    fn expiry_ms(&self) -> TimePoint {
        self.expiry_ms
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Opaque cancellation handle for a scheduled runnable.
///
/// `INVALID` is the sentinel used after a handle has been consumed;
/// cancelling an invalid handle does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHandle(u64);

impl ScheduleHandle {
    pub const INVALID: ScheduleHandle = ScheduleHandle(u64::MAX);

    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for ScheduleHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct QueueState {
    /// Pending runnables ordered by (due instant, schedule id).
    queue: BTreeMap<(Instant, u64), Box<dyn Runnable>>,
    /// Reverse index for cancellation by handle.
    ids: HashMap<u64, Instant>,
}

struct Inner {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

/// Thread-pool backed delayed scheduler.
///
/// Dropping the scheduler without calling [`DelayedScheduler::shutdown`]
/// detaches the threads; owners are expected to shut it down explicitly.
pub struct DelayedScheduler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DelayedScheduler {
    /// Spawn the timer thread plus `worker_count` workers (minimum 1).
    #[must_use]
    pub fn new(worker_count: usize) -> Arc<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                queue: BTreeMap::new(),
                ids: HashMap::new(),
            }),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let (work_tx, work_rx): (Sender<Box<dyn Runnable>>, Receiver<Box<dyn Runnable>>) =
            crossbeam::channel::unbounded();

        let mut threads = Vec::new();
        for i in 0..worker_count.max(1) {
            let rx = work_rx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("joynr-sched-{}", i))
                    .spawn(move || worker_loop(&rx))
                    .unwrap_or_else(|e| panic!("failed to spawn scheduler worker: {}", e)),
            );
        }
        drop(work_rx);

        // Timer thread owns the sender; when it exits the channel closes
        // and the workers drain out.
        let timer_inner = Arc::clone(&inner);
        threads.push(
            thread::Builder::new()
                .name("joynr-sched-timer".into())
                .spawn(move || timer_loop(&timer_inner, &work_tx))
                .unwrap_or_else(|e| panic!("failed to spawn scheduler timer: {}", e)),
        );

        Arc::new(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Schedule a runnable after `delay`. Returns a cancellation handle.
    ///
    /// Work submitted after shutdown is dropped and `INVALID` is returned.
    pub fn schedule(&self, runnable: Box<dyn Runnable>, delay: Duration) -> ScheduleHandle {
        if self.inner.shutdown.load(Ordering::Acquire) {
            log::debug!("[SCHED] dropping runnable scheduled after shutdown");
            return ScheduleHandle::INVALID;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            state.queue.insert((due, id), runnable);
            state.ids.insert(id, due);
        }
        self.inner.wakeup.notify_one();
        ScheduleHandle(id)
    }

    /// Schedule a plain closure with no decay time.
    pub fn schedule_fn<F: FnOnce() + Send + 'static>(
        &self,
        delay: Duration,
        f: F,
    ) -> ScheduleHandle {
        self.schedule(
            Box::new(FnRunnable {
                f,
                expiry_ms: NO_EXPIRY,
            }),
            delay,
        )
    }

    /// Schedule a closure that decays at `expiry_ms` (absolute unix ms).
    pub fn schedule_fn_with_expiry<F: FnOnce() + Send + 'static>(
        &self,
        delay: Duration,
        expiry_ms: TimePoint,
        f: F,
    ) -> ScheduleHandle {
        self.schedule(Box::new(FnRunnable { f, expiry_ms }), delay)
    }

    /// Cancel a pending runnable. Returns true if it was still pending.
    ///
    /// The handle is invalidated either way, so a second call is a no-op.
    pub fn unschedule(&self, handle: &mut ScheduleHandle) -> bool {
        if !handle.is_valid() {
            return false;
        }
        let id = handle.0;
        *handle = ScheduleHandle::INVALID;
        let mut state = self.inner.state.lock();
        match state.ids.remove(&id) {
            Some(due) => state.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Number of runnables not yet handed to a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Stop accepting work, drop pending runnables and join all threads.
    ///
    /// Idempotent; the second call returns once the first has joined.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let mut state = self.inner.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            state.ids.clear();
            if dropped > 0 {
                log::debug!("[SCHED] shutdown dropped {} pending runnables", dropped);
            }
        }
        self.inner.wakeup.notify_all();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn timer_loop(inner: &Inner, work_tx: &Sender<Box<dyn Runnable>>) {
    let mut state = inner.state.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        match state.queue.keys().next().copied() {
            Some((due, id)) if due <= now => {
                let runnable = state
                    .queue
                    .remove(&(due, id))
                    .unwrap_or_else(|| unreachable!("key observed under lock"));
                state.ids.remove(&id);
                // Dispatch outside the lock so schedule() never blocks on
                // a slow channel.
                drop(state);
                if is_expired(runnable.expiry_ms()) {
                    log::debug!(
                        "[SCHED] dropping decayed runnable (expiry={} now={})",
                        runnable.expiry_ms(),
                        now_ms()
                    );
                } else if work_tx.send(runnable).is_err() {
                    return;
                }
                state = inner.state.lock();
            }
            Some((due, _)) => {
                let timeout = due.saturating_duration_since(now);
                inner.wakeup.wait_for(&mut state, timeout);
            }
            None => {
                inner.wakeup.wait(&mut state);
            }
        }
    }
}

fn worker_loop(work_rx: &Receiver<Box<dyn Runnable>>) {
    for runnable in work_rx.iter() {
        // Re-check decay at execution time; the item may have sat in the
        // channel behind slow work.
        if is_expired(runnable.expiry_ms()) {
            log::debug!("[SCHED] worker dropping decayed runnable");
            continue;
        }
        runnable.run();
    }
}

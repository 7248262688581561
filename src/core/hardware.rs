//! Hardware access mutex
//!
//! A binary lock guarding direct device interaction. Unlike a guard-based
//! mutex it can be released from a thread other than the one that acquired
//! it, which is what deferred release needs: after a hardware operation the
//! caller hands the unlock to a [`ReleaseScheduler`] and returns right away,
//! and the lock only frees once the device had time to settle.

use super::error::{CaptureError, Result};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
    shutdown: bool,
}

struct SchedulerShared {
    queue: Mutex<SchedulerQueue>,
    wakeup: Condvar,
}

/// Runs one-shot jobs at deadlines from a single timer thread
///
/// Pending deadlines sit in a min-heap; the timer thread sleeps until the
/// earliest one. Thread count stays at one no matter how many releases are
/// scheduled. The thread starts on first use and stops on drop, running any
/// jobs still pending.
pub struct ReleaseScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReleaseScheduler {
    /// Create an idle scheduler
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                queue: Mutex::new(SchedulerQueue::default()),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Run `job` once `delay` has elapsed
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_worker();

        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Pending {
            deadline: Instant::now() + delay,
            seq,
            job: Box::new(job),
        });
        drop(queue);

        self.shared.wakeup.notify_one();
    }

    /// Number of jobs waiting for their deadline
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("hw-release-timer".to_string())
            .spawn(move || Self::run(&shared));

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => tracing::error!("Could not start release timer thread: {}", e),
        }
    }

    fn run(shared: &SchedulerShared) {
        let mut queue = shared.queue.lock();

        loop {
            let now = Instant::now();
            let due = queue.heap.peek().map(|p| p.deadline <= now || queue.shutdown);

            match due {
                Some(true) => {
                    if let Some(pending) = queue.heap.pop() {
                        // Jobs may take other locks; never run them under ours.
                        drop(queue);
                        (pending.job)();
                        queue = shared.queue.lock();
                    }
                }
                Some(false) => {
                    if let Some(deadline) = queue.heap.peek().map(|p| p.deadline) {
                        shared.wakeup.wait_until(&mut queue, deadline);
                    }
                }
                None if queue.shutdown => break,
                None => shared.wakeup.wait(&mut queue),
            }
        }
    }
}

impl Default for ReleaseScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReleaseScheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
struct LockFlags {
    locked: bool,
    // Callers blocked in `try_acquire_for`
    waiting: usize,
}

struct LockState {
    flags: Mutex<LockFlags>,
    changed: Condvar,
}

impl LockState {
    fn unlock(&self) {
        let mut flags = self.flags.lock();
        if !flags.locked {
            tracing::warn!("Hardware mutex released while not held");
        }
        flags.locked = false;
        drop(flags);
        self.changed.notify_all();
    }
}

/// Binary hardware mutex with optional deferred release
///
/// Background pollers use [`try_acquire_idle_for`](Self::try_acquire_idle_for),
/// which gives way to any caller blocked in a regular acquire.
pub struct HardwareMutex {
    state: Arc<LockState>,
    recovery: Duration,
    scheduler: ReleaseScheduler,
}

impl HardwareMutex {
    /// Create an unlocked mutex; `recovery` of zero releases immediately
    pub fn new(recovery: Duration) -> Self {
        Self {
            state: Arc::new(LockState {
                flags: Mutex::new(LockFlags::default()),
                changed: Condvar::new(),
            }),
            recovery,
            scheduler: ReleaseScheduler::new(),
        }
    }

    /// Acquire, failing with [`CaptureError::MutexAcquisitionTimeout`] after `timeout`
    pub fn acquire(&self, timeout: Duration) -> Result<()> {
        if self.try_acquire_for(timeout) {
            Ok(())
        } else {
            Err(CaptureError::MutexAcquisitionTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    /// Acquire within `timeout`, returning whether the lock was obtained
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.state.flags.lock();

        if flags.locked {
            flags.waiting += 1;
            while flags.locked {
                if self.state.changed.wait_until(&mut flags, deadline).timed_out() {
                    // A release can land right at the deadline.
                    break;
                }
            }
            flags.waiting -= 1;
        }

        if flags.locked {
            drop(flags);
            // Idle pollers may have been holding back for us.
            self.state.changed.notify_all();
            return false;
        }

        flags.locked = true;
        true
    }

    /// Acquire within `timeout` only while nobody else is waiting for it
    pub fn try_acquire_idle_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.state.flags.lock();

        while flags.locked || flags.waiting > 0 {
            if self.state.changed.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }

        if flags.locked || flags.waiting > 0 {
            return false;
        }

        flags.locked = true;
        true
    }

    /// Release, honoring the recovery delay
    pub fn release(&self) {
        if self.recovery.is_zero() {
            self.state.unlock();
            return;
        }

        tracing::debug!("Deferring hardware mutex release by {:?}", self.recovery);
        let state = self.state.clone();
        self.scheduler.schedule(self.recovery, move || state.unlock());
    }

    /// Release immediately, ignoring the recovery delay
    pub fn release_now(&self) {
        self.state.unlock();
    }

    /// Whether the lock is currently held (including a pending deferred release)
    pub fn is_locked(&self) -> bool {
        self.state.flags.lock().locked
    }

    /// Deferred releases not yet performed
    pub fn pending_releases(&self) -> usize {
        self.scheduler.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_acquire_release() {
        let mutex = HardwareMutex::new(Duration::ZERO);
        mutex.acquire(Duration::from_millis(10)).unwrap();
        assert!(mutex.is_locked());
        mutex.release();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_acquire_timeout() {
        let mutex = HardwareMutex::new(Duration::ZERO);
        mutex.acquire(Duration::from_millis(10)).unwrap();

        let start = Instant::now();
        let err = mutex.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, CaptureError::MutexAcquisitionTimeout { timeout_ms: 50 }));
    }

    #[test]
    fn test_deferred_release() {
        let mutex = HardwareMutex::new(Duration::from_millis(100));
        mutex.acquire(Duration::from_millis(10)).unwrap();

        let start = Instant::now();
        mutex.release();
        assert!(start.elapsed() < Duration::from_millis(50), "release must not block");
        assert!(mutex.is_locked());

        mutex.acquire(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_release_now_skips_delay() {
        let mutex = HardwareMutex::new(Duration::from_secs(60));
        mutex.acquire(Duration::from_millis(10)).unwrap();
        mutex.release_now();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.pending_releases(), 0);
    }

    #[test]
    fn test_acquire_from_other_thread() {
        let mutex = Arc::new(HardwareMutex::new(Duration::ZERO));
        mutex.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let mutex = mutex.clone();
            std::thread::spawn(move || mutex.try_acquire_for(Duration::from_secs(2)))
        };

        std::thread::sleep(Duration::from_millis(20));
        mutex.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_idle_acquire_yields_to_waiter() {
        let mutex = Arc::new(HardwareMutex::new(Duration::ZERO));
        mutex.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let mutex = mutex.clone();
            std::thread::spawn(move || mutex.try_acquire_for(Duration::from_secs(2)))
        };
        while mutex.state.flags.lock().waiting == 0 {
            std::thread::yield_now();
        }

        mutex.release_now();
        assert!(!mutex.try_acquire_idle_for(Duration::from_millis(20)));
        assert!(waiter.join().unwrap());
        mutex.release_now();
        assert!(mutex.try_acquire_idle_for(Duration::from_millis(20)));
    }

    #[test]
    fn test_scheduler_runs_in_deadline_order() {
        let scheduler = ReleaseScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(60u64, 3), (20, 1), (40, 2)] {
            let order = order.clone();
            scheduler.schedule(Duration::from_millis(delay), move || order.lock().push(tag));
        }

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_scheduler_flushes_on_drop() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = ReleaseScheduler::new();
            let ran = ran.clone();
            scheduler.schedule(Duration::from_secs(5), move || {
                ran.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }
}

//! # Wait Engine
//!
//! Blocking waits with timeout and interruption, built on thread parking.
//!
//! A [`WaitQueue`] holds the threads sleeping on one management object or
//! channel. Waking is non-blocking: it flags an entry and unparks its thread,
//! so interrupt dispatch may wake from inside its spinlocks. The queue lock
//! is never held while a wait condition runs, which lets conditions take the
//! context locks freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::sync::IrqLock;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup<T> {
    /// The object became ready
    Ready(T),
    /// The timeout elapsed first
    TimedOut,
    /// The waiter's signal was raised
    Interrupted,
    /// The object or its context went away
    Released,
}

impl<T> Wakeup<T> {
    /// Wait completed with a result
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Ready value, if any
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Map the ready value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Wakeup<U> {
        match self {
            Self::Ready(value) => Wakeup::Ready(f(value)),
            Self::TimedOut => Wakeup::TimedOut,
            Self::Interrupted => Wakeup::Interrupted,
            Self::Released => Wakeup::Released,
        }
    }
}

/// How long a wait may block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until ready, released or interrupted
    #[default]
    Infinite,
    /// Block at most this long
    After(Duration),
}

impl Timeout {
    /// Milliseconds as passed by the ioctl layer; negative means infinite
    pub fn from_millis(ms: i64) -> Self {
        u64::try_from(ms).map_or(Self::Infinite, |ms| Self::After(Duration::from_millis(ms)))
    }

    fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::After(duration) => Some(now + duration),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Interruption source for a waiting thread
///
/// Raising is sticky: the signal stays pending until [`Signal::clear`].
#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    parked: IrqLock<Vec<Thread>>,
}

impl Signal {
    /// Create a new, clear signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark pending and wake every thread waiting under this signal
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        for thread in self.parked.lock().iter() {
            thread.unpark();
        }
    }

    /// Signal is pending
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear a pending signal
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn register(&self) -> SignalRegistration<'_> {
        let thread = thread::current();
        let id = thread.id();
        self.parked.lock().push(thread);
        SignalRegistration { signal: self, id }
    }
}

struct SignalRegistration<'a> {
    signal: &'a Signal,
    id: thread::ThreadId,
}

impl Drop for SignalRegistration<'_> {
    fn drop(&mut self) {
        let mut parked = self.signal.parked.lock();
        if let Some(pos) = parked.iter().position(|t| t.id() == self.id) {
            parked.swap_remove(pos);
        }
    }
}

/// Options for a blocking wait
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Maximum time to block
    pub timeout: Timeout,
    /// Interruption source
    pub signal: Option<Arc<Signal>>,
    /// Token echoed by the arming command
    pub arm_token: u64,
    /// Token echoed by the disarming command
    pub disarm_token: u64,
}

impl WaitOptions {
    /// Wait at most `timeout`
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Timeout::After(timeout),
            ..Self::default()
        }
    }

    /// Wait without a time limit
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Attach an interruption source
    pub fn with_signal(mut self, signal: Arc<Signal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Set the arm and disarm command tokens
    pub fn with_tokens(mut self, arm: u64, disarm: u64) -> Self {
        self.arm_token = arm;
        self.disarm_token = disarm;
        self
    }
}

// =============================================================================
// Wait Queue
// =============================================================================

#[derive(Debug)]
struct WaitEntry {
    thread: Thread,
    woken: AtomicBool,
}

impl WaitEntry {
    /// Flag and unpark. Returns false if already flagged.
    fn wake(&self) -> bool {
        if self.woken.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.thread.unpark();
        true
    }
}

/// Threads sleeping on one object or channel
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: IrqLock<Vec<Arc<WaitEntry>>>,
}

impl WaitQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the longest-sleeping waiter not already woken
    pub fn wake_one(&self) -> bool {
        self.entries.lock().iter().any(|entry| entry.wake())
    }

    /// Wake every waiter, returning how many were newly woken
    pub fn wake_all(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.wake())
            .count()
    }

    /// Number of threads currently waiting
    pub fn waiters(&self) -> usize {
        self.entries.lock().len()
    }

    fn enqueue(&self, entry: Arc<WaitEntry>) {
        self.entries.lock().push(entry);
    }

    fn dequeue(&self, entry: &Arc<WaitEntry>) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(pos);
        }
    }
}

/// Result of [`wait_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus<R> {
    /// The condition produced a value
    Ready(R),
    /// The deadline passed
    TimedOut,
    /// The signal was raised
    Interrupted,
}

/// Block until `condition` yields a value, the timeout elapses, or `signal`
/// is raised
///
/// The caller must not hold any lock. The condition is evaluated once before
/// sleeping and again after every wakeup; it always runs after this thread
/// is on the queue, so a wake issued between a failed check and sleeping is
/// not lost.
pub fn wait_event<R>(
    queue: &WaitQueue,
    timeout: Timeout,
    signal: Option<&Signal>,
    mut condition: impl FnMut() -> Option<R>,
) -> WaitStatus<R> {
    let deadline = timeout.deadline(Instant::now());
    let entry = Arc::new(WaitEntry {
        thread: thread::current(),
        woken: AtomicBool::new(false),
    });
    queue.enqueue(entry.clone());
    let _registration = signal.map(Signal::register);

    let status = loop {
        if let Some(value) = condition() {
            break WaitStatus::Ready(value);
        }
        if signal.is_some_and(Signal::is_pending) {
            break WaitStatus::Interrupted;
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break WaitStatus::TimedOut;
                }
                thread::park_timeout(deadline - now);
            }
            None => thread::park(),
        }
        entry.woken.store(false, Ordering::Release);
    };

    queue.dequeue(&entry);
    status
}

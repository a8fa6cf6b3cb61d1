//! # Lock Tiers
//!
//! Three lock tiers with a fixed acquisition order:
//!
//! 1. [`ContextLock`]: per-context reader-writer lock. Readers are every
//!    event operation; the writer is teardown.
//! 2. [`EventMutex`]: per-context mutex over the handle tables. Taking it
//!    requires proof that a tier-1 guard is held.
//! 3. [`IrqLock`]: spinlocks touched by interrupt dispatch (vector lists,
//!    object targets, wait queues). Code holding one never takes tier 1 or 2.
//!
//! Debug builds track the tiers held by the current thread and assert on
//! any out-of-order acquisition.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock tier, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockTier {
    /// Per-context reader-writer lock
    Context = 0,
    /// Per-context table mutex
    Event = 1,
    /// Interrupt-safe spinlocks
    Irq = 2,
}

#[cfg(debug_assertions)]
mod tracking {
    use super::LockTier;
    use std::cell::Cell;

    thread_local! {
        static HELD: Cell<[u32; 3]> = const { Cell::new([0; 3]) };
    }

    pub(super) fn acquire(tier: LockTier) {
        HELD.with(|held| {
            let mut counts = held.get();
            let above = counts[tier as usize + 1..].iter().any(|&n| n > 0);
            debug_assert!(!above, "{:?} lock taken while holding a higher tier: {:?}", tier, counts);
            debug_assert!(
                tier == LockTier::Irq || counts[tier as usize] == 0,
                "{:?} lock taken recursively",
                tier
            );
            counts[tier as usize] += 1;
            held.set(counts);
        });
    }

    pub(super) fn release(tier: LockTier) {
        HELD.with(|held| {
            let mut counts = held.get();
            counts[tier as usize] = counts[tier as usize].saturating_sub(1);
            held.set(counts);
        });
    }

    pub(super) fn holds(tier: LockTier) -> bool {
        HELD.with(|held| held.get()[tier as usize] > 0)
    }
}

#[cfg(not(debug_assertions))]
mod tracking {
    use super::LockTier;

    pub(super) fn acquire(_tier: LockTier) {}

    pub(super) fn release(_tier: LockTier) {}

    pub(super) fn holds(_tier: LockTier) -> bool {
        true
    }
}

/// Whether the current thread holds a lock of `tier`
///
/// Always true in release builds.
pub fn holds(tier: LockTier) -> bool {
    tracking::holds(tier)
}

/// Records one held tier for the lifetime of a guard
#[derive(Debug)]
struct TierToken(LockTier);

impl TierToken {
    fn acquire(tier: LockTier) -> Self {
        tracking::acquire(tier);
        Self(tier)
    }
}

impl Drop for TierToken {
    fn drop(&mut self) {
        tracking::release(self.0);
    }
}

// =============================================================================
// Tier 1
// =============================================================================

/// Per-context reader-writer lock
#[derive(Debug)]
pub struct ContextLock<T> {
    inner: RwLock<T>,
}

impl<T> ContextLock<T> {
    /// Create a new lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Shared access
    pub fn read(&self) -> ContextReadGuard<'_, T> {
        let token = TierToken::acquire(LockTier::Context);
        ContextReadGuard {
            guard: self.inner.read().unwrap_or_else(PoisonError::into_inner),
            _token: token,
        }
    }

    /// Exclusive access
    pub fn write(&self) -> ContextWriteGuard<'_, T> {
        let token = TierToken::acquire(LockTier::Context);
        ContextWriteGuard {
            guard: self.inner.write().unwrap_or_else(PoisonError::into_inner),
            _token: token,
        }
    }
}

/// Shared tier-1 guard
#[derive(Debug)]
pub struct ContextReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _token: TierToken,
}

impl<T> Deref for ContextReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive tier-1 guard
#[derive(Debug)]
pub struct ContextWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _token: TierToken,
}

impl<T> Deref for ContextWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ContextWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Proof that a tier-1 guard is held
pub trait ContextHeld {}

impl<T> ContextHeld for ContextReadGuard<'_, T> {}
impl<T> ContextHeld for ContextWriteGuard<'_, T> {}

// =============================================================================
// Tier 2
// =============================================================================

/// Per-context table mutex
#[derive(Debug)]
pub struct EventMutex<T> {
    inner: Mutex<T>,
}

impl<T> EventMutex<T> {
    /// Create a new mutex
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Lock while `held` proves a tier-1 guard is live
    ///
    /// The returned guard borrows the tier-1 guard, so it cannot outlive it.
    pub fn lock<'a, C: ContextHeld>(&'a self, _held: &'a C) -> EventGuard<'a, T> {
        let token = TierToken::acquire(LockTier::Event);
        EventGuard {
            guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            _token: token,
        }
    }
}

/// Tier-2 guard
#[derive(Debug)]
pub struct EventGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: TierToken,
}

impl<T> Deref for EventGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for EventGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// =============================================================================
// Tier 3
// =============================================================================

/// Interrupt-safe spinlock
///
/// Critical sections must be short and must not block.
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    /// Create a new spinlock
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Spin until the lock is acquired
    pub fn lock(&self) -> IrqGuard<'_, T> {
        let token = TierToken::acquire(LockTier::Irq);
        IrqGuard {
            guard: self.inner.lock(),
            _token: token,
        }
    }
}

impl<T: Default> Default for IrqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for IrqLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

/// Tier-3 guard
pub struct IrqGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _token: TierToken,
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> core::fmt::Debug for IrqGuard<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("IrqGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_in_order() {
        let context = ContextLock::new(1u32);
        let tables = EventMutex::new(2u32);
        let irq = IrqLock::new(3u32);

        let state = context.read();
        let mut guard = tables.lock(&state);
        *guard += 1;
        {
            let inner = irq.lock();
            assert_eq!(*inner, 3);
            assert!(holds(LockTier::Irq));
        }
        assert_eq!(*guard, 3);
        assert!(holds(LockTier::Event));
        drop(guard);
        drop(state);
        #[cfg(debug_assertions)]
        assert!(!holds(LockTier::Context));
    }

    #[test]
    fn test_irq_locks_nest() {
        let outer = IrqLock::new(());
        let inner = IrqLock::new(());
        let _a = outer.lock();
        let _b = inner.lock();
    }

    #[test]
    fn test_write_guard_mutates() {
        let context = ContextLock::new(false);
        {
            let mut state = context.write();
            *state = true;
        }
        assert!(*context.read());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "higher tier")]
    fn test_context_after_irq_asserts() {
        let context = ContextLock::new(());
        let irq = IrqLock::new(());
        let _irq = irq.lock();
        let _state = context.read();
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let context = std::sync::Arc::new(ContextLock::new(7u32));
        let clone = context.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.write();
            panic!("poison");
        })
        .join();
        assert_eq!(*context.read(), 7);
    }
}

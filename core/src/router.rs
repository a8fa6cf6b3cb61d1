//! # Interrupt Router
//!
//! Maps interrupt vectors to the management objects armed on them.
//!
//! Vectors are handed out round-robin. Each vector keeps a list of armed
//! objects, newest first. Dispatch walks that list under the vector's
//! spinlock and delivers the interrupt to each object's target; it takes no
//! other kind of lock, never blocks and never allocates.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fabric_hal::VectorId;

use crate::object::{DispatchTarget, ManagementObject};
use crate::sync::{self, IrqLock, LockTier};

/// Per-vector dispatch state
#[derive(Debug, Default)]
struct VectorEntry {
    /// Armed objects, newest first
    waiters: IrqLock<Vec<Weak<ManagementObject>>>,
    /// Interrupts dispatched on this vector
    fired: AtomicU64,
}

/// Interrupt router
#[derive(Debug)]
pub struct InterruptRouter {
    /// Dispatch state per vector
    vectors: Box<[VectorEntry]>,
    /// Round-robin counter
    rr_counter: AtomicUsize,
}

impl InterruptRouter {
    /// Create a router over `num_vectors` vectors
    pub fn new(num_vectors: usize) -> Self {
        Self {
            vectors: (0..num_vectors.max(1)).map(|_| VectorEntry::default()).collect(),
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// Number of vectors in the pool
    pub fn num_vectors(&self) -> usize {
        self.vectors.len()
    }

    /// Next vector in round-robin order
    pub fn assign_vector(&self) -> VectorId {
        let counter = self.rr_counter.fetch_add(1, Ordering::Relaxed);
        VectorId::new((counter.wrapping_add(1) % self.vectors.len()) as u8)
    }

    /// Put `object` on `vector`'s dispatch list, delivering to `target`
    ///
    /// The caller must hold the owning context's table mutex. An object
    /// already armed elsewhere is moved.
    pub(crate) fn arm(&self, object: &Arc<ManagementObject>, vector: VectorId, target: DispatchTarget) {
        debug_assert!(sync::holds(LockTier::Event), "arm requires the table mutex");
        let Some(entry) = self.vectors.get(vector.index()) else {
            log::warn!("arm on {} outside the vector pool", vector);
            return;
        };
        if let Some(previous) = object.vector() {
            log::debug!("{:?} re-armed from {} to {}", object.source(), previous, vector);
            self.disarm(object);
        }

        object.install(vector, target);
        entry.waiters.lock().insert(0, Arc::downgrade(object));
        log::debug!("{:?} armed on {}", object.source(), vector);
    }

    /// Take `object` off its vector. Returns false if it was not armed.
    pub fn disarm(&self, object: &ManagementObject) -> bool {
        let Some(vector) = object.take_vector() else {
            return false;
        };
        if let Some(entry) = self.vectors.get(vector.index()) {
            let ptr: *const ManagementObject = object;
            entry.waiters.lock().retain(|w| w.as_ptr() != ptr);
        }
        object.clear_target();
        true
    }

    /// Deliver an interrupt on `vector` to every object armed on it
    ///
    /// Returns the number of objects notified.
    pub fn dispatch(&self, vector: VectorId) -> usize {
        let Some(entry) = self.vectors.get(vector.index()) else {
            log::trace!("spurious interrupt on {}", vector);
            return 0;
        };
        entry.fired.fetch_add(1, Ordering::Relaxed);

        let mut notified = 0;
        entry.waiters.lock().retain(|weak| {
            let Some(object) = weak.upgrade() else {
                return false;
            };
            notified += 1;
            if object.fire() {
                return true;
            }
            object.take_vector();
            object.clear_target();
            false
        });
        notified
    }

    /// Objects armed on `vector`
    pub fn waiter_count(&self, vector: VectorId) -> usize {
        self.vectors
            .get(vector.index())
            .map_or(0, |entry| entry.waiters.lock().len())
    }

    /// Interrupts dispatched on `vector` so far
    pub fn interrupt_count(&self, vector: VectorId) -> u64 {
        self.vectors
            .get(vector.index())
            .map_or(0, |entry| entry.fired.load(Ordering::Relaxed))
    }

    /// `object` is on `vector`'s dispatch list
    pub fn is_listed(&self, vector: VectorId, object: &ManagementObject) -> bool {
        let ptr: *const ManagementObject = object;
        self.vectors.get(vector.index()).is_some_and(|entry| {
            entry.waiters.lock().iter().any(|w| w.as_ptr() == ptr)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CtHandle, EqHandle, EventSource};
    use crate::object::IsrCallback;
    use crate::sync::{ContextLock, EventMutex};
    use std::sync::atomic::AtomicUsize;

    fn eq_object(raw: u16) -> Arc<ManagementObject> {
        Arc::new(ManagementObject::for_source(EventSource::Eq(EqHandle::new(raw))))
    }

    /// Run `f` with the tier-2 lock held, as arm requires
    fn with_tables<R>(f: impl FnOnce() -> R) -> R {
        let context = ContextLock::new(());
        let tables = EventMutex::new(());
        let state = context.read();
        let _guard = tables.lock(&state);
        f()
    }

    #[test]
    fn test_round_robin_assignment() {
        let router = InterruptRouter::new(4);
        let assigned: Vec<u8> = (0..6).map(|_| router.assign_vector().raw()).collect();
        assert_eq!(assigned, vec![1, 2, 3, 0, 1, 2]);
    }

    #[test]
    fn test_arm_and_disarm() {
        let router = InterruptRouter::new(8);
        let object = eq_object(1);
        let vector = VectorId::new(3);

        with_tables(|| router.arm(&object, vector, DispatchTarget::SelfChannel));
        assert!(object.is_armed());
        assert!(router.is_listed(vector, &object));
        assert_eq!(router.waiter_count(vector), 1);

        assert!(router.disarm(&object));
        assert!(!object.is_armed());
        assert!(!router.is_listed(vector, &object));
    }

    #[test]
    fn test_disarm_is_idempotent() {
        let router = InterruptRouter::new(8);
        let object = eq_object(1);

        assert!(!router.disarm(&object));
        with_tables(|| router.arm(&object, VectorId::new(2), DispatchTarget::SelfChannel));
        assert!(router.disarm(&object));
        assert!(!router.disarm(&object));
        assert_eq!(router.waiter_count(VectorId::new(2)), 0);
    }

    #[test]
    fn test_rearm_moves_object() {
        let router = InterruptRouter::new(8);
        let object = eq_object(1);

        with_tables(|| {
            router.arm(&object, VectorId::new(1), DispatchTarget::SelfChannel);
            router.arm(&object, VectorId::new(5), DispatchTarget::SelfChannel);
        });
        assert_eq!(router.waiter_count(VectorId::new(1)), 0);
        assert_eq!(router.waiter_count(VectorId::new(5)), 1);
        router.disarm(&object);
    }

    #[test]
    fn test_dispatch_reaches_every_armed_object() {
        let router = InterruptRouter::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let objects: Vec<_> = (0..3).map(eq_object).collect();

        with_tables(|| {
            for object in &objects {
                let hits = hits.clone();
                let callback: IsrCallback = Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
                router.arm(object, VectorId::new(2), DispatchTarget::Callback(callback));
            }
        });

        assert_eq!(router.dispatch(VectorId::new(2)), 3);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert_eq!(router.dispatch(VectorId::new(1)), 0);
        assert_eq!(router.interrupt_count(VectorId::new(2)), 1);

        for object in &objects {
            router.disarm(object);
        }
    }

    #[test]
    fn test_dispatch_wakes_self_waiter() {
        let router = Arc::new(InterruptRouter::new(4));
        let object = Arc::new(ManagementObject::for_source(EventSource::Ct(CtHandle::new(0))));
        with_tables(|| router.arm(&object, VectorId::new(0), DispatchTarget::SelfChannel));

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waiter = {
            let object = object.clone();
            let fired = fired.clone();
            std::thread::spawn(move || {
                crate::wait::wait_event(object.queue(), crate::wait::Timeout::Infinite, None, || {
                    fired.load(Ordering::Acquire).then_some(())
                })
            })
        };

        while object.queue().waiters() == 0 {
            std::thread::yield_now();
        }
        fired.store(true, Ordering::Release);
        router.dispatch(VectorId::new(0));

        assert_eq!(waiter.join().unwrap(), crate::wait::WaitStatus::Ready(()));
        router.disarm(&object);
    }

    #[test]
    fn test_spurious_vector_ignored() {
        let router = InterruptRouter::new(2);
        assert_eq!(router.dispatch(VectorId::new(200)), 0);
    }
}

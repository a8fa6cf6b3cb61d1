//! # Management Objects
//!
//! The blocking state attached to an event queue, counting event or
//! completion queue. A management object owns the wait queue its waiters
//! sleep on and records which interrupt vector it is armed on and where that
//! vector's dispatch should go.
//!
//! Lifetime is reference counted: the handle table holds one reference and
//! every waiter holds one for the duration of its wait. The last reference
//! frees the object. Freeing an object that is still armed on a vector or
//! still linked into a channel is a bug and panics.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use fabric_hal::VectorId;

use crate::channel::{ChannelMode, ChannelShared};
use crate::cq::CqShared;
use crate::error::{EventError, EventResult};
use crate::handle::{ChannelHandle, EventSource};
use crate::sync::IrqLock;
use crate::wait::WaitQueue;

/// Interrupt-time callback for blocking event queues assigned with one
pub type IsrCallback = Arc<dyn Fn(EventSource) + Send + Sync>;

/// Kind of management object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMode {
    /// Event queue waited on directly or through a channel
    EventQueueSelf,
    /// Counting event waited on directly or through a channel
    CountingEventSelf,
    /// Completion-queue notifier; one-shot
    IbCompletionQueue,
}

impl ObjectMode {
    /// Mode for the management object of `source`
    pub fn of(source: EventSource) -> Self {
        match source {
            EventSource::Eq(_) => Self::EventQueueSelf,
            EventSource::Ct(_) => Self::CountingEventSelf,
        }
    }
}

/// Where an interrupt on the object's vector is delivered
pub(crate) enum DispatchTarget {
    /// Not armed
    None,
    /// Caller-supplied callback
    Callback(IsrCallback),
    /// The object's own wait queue
    SelfChannel,
    /// A shared event channel
    Channel {
        shared: Arc<ChannelShared>,
        mode: ChannelMode,
    },
    /// A completion-queue notifier
    CompletionQueue(Arc<CqShared>),
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Callback(_) => f.write_str("Callback"),
            Self::SelfChannel => f.write_str("SelfChannel"),
            Self::Channel { shared, mode } => f
                .debug_struct("Channel")
                .field("handle", &shared.handle())
                .field("mode", mode)
                .finish(),
            Self::CompletionQueue(_) => f.write_str("CompletionQueue"),
        }
    }
}

const NO_VECTOR: u16 = u16::MAX;

/// Blocking state for one event source
pub struct ManagementObject {
    mode: ObjectMode,
    source: Option<EventSource>,
    queue: WaitQueue,
    vector: AtomicU16,
    target: IrqLock<DispatchTarget>,
    linked: AtomicBool,
}

impl ManagementObject {
    /// Create an unarmed, unlinked object
    pub fn new(mode: ObjectMode, source: Option<EventSource>) -> Self {
        Self {
            mode,
            source,
            queue: WaitQueue::new(),
            vector: AtomicU16::new(NO_VECTOR),
            target: IrqLock::new(DispatchTarget::None),
            linked: AtomicBool::new(false),
        }
    }

    /// Object for an event queue or counting event
    pub fn for_source(source: EventSource) -> Self {
        Self::new(ObjectMode::of(source), Some(source))
    }

    /// Object kind
    pub fn mode(&self) -> ObjectMode {
        self.mode
    }

    /// Event source this object belongs to
    pub fn source(&self) -> Option<EventSource> {
        self.source
    }

    /// Queue direct waiters sleep on
    pub fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    /// Vector the object is armed on
    pub fn vector(&self) -> Option<VectorId> {
        match self.vector.load(Ordering::Acquire) {
            NO_VECTOR => None,
            raw => Some(VectorId::new(raw as u8)),
        }
    }

    /// Object is on a vector's dispatch list
    pub fn is_armed(&self) -> bool {
        self.vector().is_some()
    }

    /// Object is a member of an event channel
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub(crate) fn install(&self, vector: VectorId, target: DispatchTarget) {
        *self.target.lock() = target;
        self.vector.store(vector.raw() as u16, Ordering::Release);
    }

    pub(crate) fn take_vector(&self) -> Option<VectorId> {
        match self.vector.swap(NO_VECTOR, Ordering::AcqRel) {
            NO_VECTOR => None,
            raw => Some(VectorId::new(raw as u8)),
        }
    }

    pub(crate) fn clear_target(&self) {
        *self.target.lock() = DispatchTarget::None;
    }

    fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    /// Deliver one interrupt. Returns false if the object must come off the
    /// vector list.
    pub(crate) fn fire(&self) -> bool {
        let target = self.target.lock();
        match &*target {
            DispatchTarget::None => {
                log::trace!("interrupt for {:?} with no dispatch target", self.source);
                true
            },
            DispatchTarget::Callback(callback) => {
                if let Some(source) = self.source {
                    callback(source);
                }
                true
            },
            DispatchTarget::SelfChannel => {
                match self.mode {
                    ObjectMode::CountingEventSelf => {
                        self.queue.wake_all();
                    },
                    _ => {
                        self.queue.wake_one();
                    },
                }
                true
            },
            DispatchTarget::Channel { shared, mode } => {
                match mode {
                    ChannelMode::CountingEvent => {
                        shared.queue().wake_all();
                    },
                    ChannelMode::EventQueue => {
                        shared.queue().wake_one();
                    },
                }
                true
            },
            DispatchTarget::CompletionQueue(cq) => {
                cq.on_interrupt();
                false
            },
        }
    }
}

impl fmt::Debug for ManagementObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementObject")
            .field("mode", &self.mode)
            .field("source", &self.source)
            .field("vector", &self.vector())
            .field("linked", &self.is_linked())
            .finish()
    }
}

impl Drop for ManagementObject {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert!(
            self.vector().is_none(),
            "{:?} freed while armed on {:?}",
            self.source,
            self.vector()
        );
        assert!(
            !self.is_linked(),
            "{:?} freed while linked into an event channel",
            self.source
        );
    }
}

// =============================================================================
// Table-Side State
// =============================================================================

/// What a management object is currently waited through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Association {
    /// Its own wait queue
    SelfChannel,
    /// A shared event channel
    Channel(ChannelHandle),
}

/// A management object as owned by its handle-table slot
///
/// Fields here are guarded by the context's table mutex.
#[derive(Debug)]
pub(crate) struct Managed {
    pub(crate) object: Arc<ManagementObject>,
    association: Option<Association>,
    /// Channel wakeups not yet acknowledged
    pub(crate) unacked: i32,
    /// Value reported by channel waits for event queues
    pub(crate) user_handle: u64,
    /// Armed at assignment and kept armed until release
    pub(crate) persistent: bool,
    /// Threads inside a direct wait on this object
    pub(crate) waiting: u32,
}

impl Managed {
    pub(crate) fn new(object: Arc<ManagementObject>) -> Self {
        Self {
            object,
            association: None,
            unacked: 0,
            user_handle: 0,
            persistent: false,
            waiting: 0,
        }
    }

    pub(crate) fn association(&self) -> Option<Association> {
        self.association
    }

    pub(crate) fn associate(&mut self, association: Association) {
        self.object
            .set_linked(matches!(association, Association::Channel(_)));
        self.association = Some(association);
    }

    pub(crate) fn dissociate(&mut self) -> Option<Association> {
        self.object.set_linked(false);
        self.association.take()
    }

    /// Retire `count` channel wakeups
    ///
    /// The balance may go negative but saturates instead of wrapping.
    pub(crate) fn acknowledge(&mut self, count: u32) -> EventResult<()> {
        let count = i32::try_from(count).map_err(|_| EventError::InvalidArgument)?;
        self.unacked = self.unacked.saturating_sub(count);
        Ok(())
    }

    /// Same object as `other`
    pub(crate) fn holds(&self, other: &Arc<ManagementObject>) -> bool {
        Arc::ptr_eq(&self.object, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CtHandle, EqHandle};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_mode_of_source() {
        assert_eq!(
            ObjectMode::of(EventSource::Eq(EqHandle::new(1))),
            ObjectMode::EventQueueSelf
        );
        assert_eq!(
            ObjectMode::of(EventSource::Ct(CtHandle::new(1))),
            ObjectMode::CountingEventSelf
        );
    }

    #[test]
    fn test_install_and_take_vector() {
        let object = ManagementObject::for_source(EventSource::Eq(EqHandle::new(3)));
        assert!(!object.is_armed());

        object.install(VectorId::new(12), DispatchTarget::SelfChannel);
        assert_eq!(object.vector(), Some(VectorId::new(12)));

        assert_eq!(object.take_vector(), Some(VectorId::new(12)));
        assert_eq!(object.take_vector(), None);
        object.clear_target();
    }

    #[test]
    fn test_fire_invokes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let callback: IsrCallback = Arc::new(move |source| {
            assert_eq!(source, EventSource::Eq(EqHandle::new(9)));
            seen.fetch_add(1, Ordering::Relaxed);
        });

        let object = ManagementObject::for_source(EventSource::Eq(EqHandle::new(9)));
        object.install(VectorId::new(1), DispatchTarget::Callback(callback));
        assert!(object.fire());
        assert!(object.fire());
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        object.take_vector();
        object.clear_target();
    }

    #[test]
    fn test_association_tracks_link() {
        let object = Arc::new(ManagementObject::for_source(EventSource::Ct(CtHandle::new(0))));
        let mut managed = Managed::new(object.clone());

        managed.associate(Association::SelfChannel);
        assert!(!object.is_linked());

        managed.dissociate();
        managed.associate(Association::Channel(ChannelHandle::new(2)));
        assert!(object.is_linked());
        assert_eq!(
            managed.association(),
            Some(Association::Channel(ChannelHandle::new(2)))
        );

        assert_eq!(
            managed.dissociate(),
            Some(Association::Channel(ChannelHandle::new(2)))
        );
        assert!(!object.is_linked());
        assert!(managed.holds(&object));
    }

    #[test]
    fn test_acknowledge_bounds() {
        let object = Arc::new(ManagementObject::for_source(EventSource::Eq(EqHandle::new(0))));
        let mut managed = Managed::new(object);
        managed.unacked = 2;

        assert_eq!(managed.acknowledge(u32::MAX), Err(EventError::InvalidArgument));
        assert_eq!(managed.acknowledge(0x8000_0000), Err(EventError::InvalidArgument));
        assert_eq!(managed.unacked, 2);

        managed.acknowledge(1).unwrap();
        assert_eq!(managed.unacked, 1);

        managed.acknowledge(i32::MAX as u32).unwrap();
        managed.acknowledge(i32::MAX as u32).unwrap();
        assert_eq!(managed.unacked, i32::MIN);
    }

    #[test]
    #[should_panic(expected = "freed while armed")]
    fn test_drop_while_armed_panics() {
        let object = ManagementObject::for_source(EventSource::Eq(EqHandle::new(0)));
        object.install(VectorId::new(4), DispatchTarget::SelfChannel);
        drop(object);
    }

    #[test]
    #[should_panic(expected = "freed while linked")]
    fn test_drop_while_linked_panics() {
        let object = Arc::new(ManagementObject::for_source(EventSource::Eq(EqHandle::new(0))));
        let mut managed = Managed::new(object);
        managed.associate(Association::Channel(ChannelHandle::new(0)));
        drop(managed);
    }
}

//! Direct waits on a single event queue or counting event, and the arm and
//! disarm steps shared with channel waits.

use std::sync::Arc;

use fabric_hal::{DescriptorUpdate, EqEntry, VectorId};

use super::{EventContext, EventTables};
use crate::error::{EventError, EventResult};
use crate::handle::EventSource;
use crate::object::{Association, DispatchTarget, Managed, ManagementObject};
use crate::wait::{self, WaitOptions, WaitStatus, Wakeup};

/// What a wait condition found
pub(super) enum Readiness<T> {
    Ready(T),
    Released,
    Failed(EventError),
}

/// Ready value of a direct wait
pub(super) enum SourceEvent {
    Queue(EqEntry),
    Counter(u64),
}

pub(super) fn settle<T>(status: WaitStatus<Readiness<T>>) -> EventResult<Wakeup<T>> {
    match status {
        WaitStatus::Ready(Readiness::Ready(value)) => Ok(Wakeup::Ready(value)),
        WaitStatus::Ready(Readiness::Released) => Ok(Wakeup::Released),
        WaitStatus::Ready(Readiness::Failed(err)) => Err(err),
        WaitStatus::TimedOut => Ok(Wakeup::TimedOut),
        WaitStatus::Interrupted => Ok(Wakeup::Interrupted),
    }
}

impl EventContext {
    /// Management object for `source`, created on first use
    pub(super) fn setup_object(
        &self,
        tables: &mut EventTables,
        source: EventSource,
    ) -> EventResult<Arc<ManagementObject>> {
        let slot = tables
            .managed_slot(source)
            .ok_or(EventError::InvalidArgument)?;
        let managed = slot.get_or_insert_with(|| {
            log::debug!("{}: management object created", source);
            Managed::new(Arc::new(ManagementObject::for_source(source)))
        });
        Ok(managed.object.clone())
    }

    /// Program `source`'s interrupt and put its object on a fresh vector
    pub(super) fn arm_source(
        &self,
        object: &Arc<ManagementObject>,
        source: EventSource,
        target: DispatchTarget,
        solicited: bool,
        token: u64,
    ) -> EventResult<VectorId> {
        let vector = self.router.assign_vector();
        self.router.arm(object, vector, target);

        match source {
            EventSource::Eq(handle) => {
                let raw = handle.raw();
                let update = self.eq_update(
                    DescriptorUpdate::interrupt(raw, self.eq_interface(raw), Some(vector), solicited, token),
                    true,
                );
                if let Err(err) = self.submit(&update) {
                    self.router.disarm(object);
                    return Err(err);
                }
                self.eq_descs.set_interrupt(raw, Some(vector), solicited);
            },
            EventSource::Ct(handle) => {
                self.ct_descs.set_interrupt(handle.raw(), Some(vector));
            },
        }
        Ok(vector)
    }

    /// Take `source`'s object off its vector and turn its interrupt off
    ///
    /// The object leaves the router even if the command fails; a stale
    /// hardware vector only raises spurious interrupts.
    pub(super) fn disarm_source(
        &self,
        object: &ManagementObject,
        source: EventSource,
        token: u64,
    ) -> EventResult<()> {
        self.router.disarm(object);
        match source {
            EventSource::Eq(handle) => {
                let raw = handle.raw();
                let update = self.eq_update(
                    DescriptorUpdate::interrupt(raw, self.eq_interface(raw), None, false, token),
                    true,
                );
                self.submit(&update)?;
                self.eq_descs.set_interrupt(raw, None, false);
            },
            EventSource::Ct(handle) => {
                self.ct_descs.set_interrupt(handle.raw(), None);
            },
        }
        Ok(())
    }

    /// Readiness test shared by direct and channel waits
    pub(super) fn is_ready(&self, tables: &EventTables, source: EventSource) -> bool {
        match source {
            EventSource::Eq(handle) => tables
                .eqs
                .get(handle.raw())
                .is_some_and(|slot| self.device.read_ring_head(&slot.ring).is_some()),
            EventSource::Ct(handle) => {
                tables.cts.contains(handle.raw()) && self.ct_descs.is_triggered(handle.raw())
            },
        }
    }

    fn source_readiness(
        &self,
        source: EventSource,
        object: &Arc<ManagementObject>,
    ) -> Option<Readiness<SourceEvent>> {
        let state = self.state.read();
        if state.closed {
            return Some(Readiness::Released);
        }
        let tables = self.tables.lock(&state);
        if !tables.managed(source).is_some_and(|m| m.holds(object)) {
            return Some(Readiness::Released);
        }

        match source {
            EventSource::Eq(handle) => {
                let raw = handle.raw();
                if !self.eq_descs.is_valid(raw) {
                    return Some(Readiness::Released);
                }
                let slot = tables.eqs.get(raw)?;
                self.device
                    .read_ring_head(&slot.ring)
                    .map(|entry| Readiness::Ready(SourceEvent::Queue(entry)))
            },
            EventSource::Ct(handle) => {
                let raw = handle.raw();
                if !self.ct_descs.is_valid(raw) {
                    return Some(Readiness::Released);
                }
                self.ct_descs
                    .is_triggered(raw)
                    .then(|| Readiness::Ready(SourceEvent::Counter(self.ct_descs.threshold(raw))))
            },
        }
    }

    /// Block on one event queue or counting event
    ///
    /// An object not yet waited on is bound to its own wait queue and armed.
    /// The last direct waiter to leave disarms it again, unless it was armed
    /// for its whole lifetime at assignment.
    pub(super) fn wait_source(
        &self,
        source: EventSource,
        options: &WaitOptions,
    ) -> EventResult<Wakeup<SourceEvent>> {
        let object = {
            let state = self.state.read();
            state.check_open()?;
            let mut tables = self.tables.lock(&state);
            let object = self.setup_object(&mut tables, source)?;
            let managed = tables
                .managed_mut(source)
                .ok_or(EventError::InvalidArgument)?;

            match managed.association() {
                Some(Association::Channel(channel)) => {
                    log::debug!("{}: waited through {}", source, channel);
                    return Err(EventError::Busy);
                },
                Some(Association::SelfChannel) => {},
                None => {
                    managed.associate(Association::SelfChannel);
                    if let Err(err) = self.arm_source(
                        &object,
                        source,
                        DispatchTarget::SelfChannel,
                        false,
                        options.arm_token,
                    ) {
                        managed.dissociate();
                        return Err(err);
                    }
                },
            }
            managed.waiting += 1;
            object
        };

        let status = wait::wait_event(
            object.queue(),
            options.timeout,
            options.signal.as_deref(),
            || self.source_readiness(source, &object),
        );
        let mut outcome = settle(status);

        let state = self.state.read();
        let mut tables = self.tables.lock(&state);
        if let Some(managed) = tables.managed_mut(source).filter(|m| m.holds(&object)) {
            managed.waiting = managed.waiting.saturating_sub(1);
            let last = managed.waiting == 0
                && !managed.persistent
                && managed.association() == Some(Association::SelfChannel);
            if !state.closed && last {
                managed.dissociate();
                if let Err(err) = self.disarm_source(&object, source, options.disarm_token) {
                    outcome = Err(err);
                }
            }
        }
        let watch = Arc::downgrade(&object);
        drop(object);
        match source {
            EventSource::Eq(handle) => tables.eqs.reclaim(handle.raw(), &watch),
            EventSource::Ct(handle) => tables.cts.reclaim(handle.raw(), &watch),
        };
        outcome
    }
}

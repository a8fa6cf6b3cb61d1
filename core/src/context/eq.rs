//! Event queues

use std::sync::Arc;

use fabric_hal::ring::num_user_pages;
use fabric_hal::{DescriptorUpdate, EqEntry, EventDescriptor, PinnedPages, RingCursor, VectorId};

use super::blocking::SourceEvent;
use super::{EqSlot, EventContext};
use crate::cq::{CompletionNotifier, CqBinding};
use crate::error::{EventError, EventResult};
use crate::handle::{EqHandle, EventSource};
use crate::object::{Association, DispatchTarget, IsrCallback, Managed, ManagementObject};
use crate::wait::{WaitOptions, Wakeup};

/// How an event queue is consumed
#[derive(Clone, Default)]
pub enum EqMode {
    /// Polled, or waited on with per-wait arming
    #[default]
    Polled,
    /// Armed at assignment for its whole lifetime
    Blocking {
        /// Called from interrupt dispatch instead of waking waiters
        callback: Option<IsrCallback>,
    },
}

impl core::fmt::Debug for EqMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Polled => f.write_str("Polled"),
            Self::Blocking { callback } => f
                .debug_struct("Blocking")
                .field("callback", &callback.is_some())
                .finish(),
        }
    }
}

/// Event-queue assignment request
#[derive(Debug, Clone)]
pub struct EqAssign {
    /// Interface the queue belongs to
    pub interface: u8,
    /// Ring base address
    pub base: u64,
    /// Number of ring entries; a power of two
    pub entry_count: u32,
    /// 128-byte entries
    pub jumbo: bool,
    /// Token echoed by the assignment command
    pub user_data: u64,
    /// Consumption mode
    pub mode: EqMode,
}

impl EqAssign {
    /// Polled queue with standard entries
    pub fn new(interface: u8, base: u64, entry_count: u32) -> Self {
        Self {
            interface,
            base,
            entry_count,
            jumbo: false,
            user_data: 0,
            mode: EqMode::Polled,
        }
    }

    /// Use 128-byte entries
    pub fn jumbo(mut self) -> Self {
        self.jumbo = true;
        self
    }

    /// Set the consumption mode
    pub fn with_mode(mut self, mode: EqMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the command token
    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }
}

/// A direct event-queue wait found an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqEvent {
    /// Queue that became ready
    pub handle: EqHandle,
    /// Entry at the ring head; not consumed
    pub entry: EqEntry,
}

impl EventContext {
    fn check_eq(&self, request: &EqAssign) -> EventResult<u8> {
        if request.interface as usize >= self.config.num_interfaces {
            log::debug!("assign_eq: interface {} out of range", request.interface);
            return Err(EventError::InvalidArgument);
        }
        if request.base % self.config.eq_alignment != 0 {
            log::debug!("assign_eq: base {:#x} misaligned", request.base);
            return Err(EventError::InvalidArgument);
        }
        if !request.entry_count.is_power_of_two() {
            log::debug!("assign_eq: {} entries is not a power of two", request.entry_count);
            return Err(EventError::InvalidArgument);
        }
        let order = request.entry_count.trailing_zeros() as u8;
        if order < self.config.min_order || order > self.config.max_order {
            log::debug!("assign_eq: order {} out of range", order);
            return Err(EventError::InvalidArgument);
        }
        Ok(order)
    }

    fn pin_ring(&self, descriptor: &EventDescriptor) -> EventResult<Option<PinnedPages>> {
        let Some(pinner) = self.pinner.as_ref() else {
            return Ok(None);
        };
        let npages = num_user_pages(descriptor.base, descriptor.ring_bytes(), self.config.page_size);
        pinner.pin(descriptor.base, npages).map(Some).map_err(|err| {
            log::warn!("context {}: pinning {} ring pages failed: {}", self.id, npages, err);
            EventError::from(err)
        })
    }

    /// Undo a partially built event-queue slot
    fn discard_eq_slot(&self, slot: EqSlot) {
        if let Some(mut managed) = slot.managed {
            self.router.disarm(&managed.object);
            managed.dissociate();
        }
        self.unpin(slot.pinned);
    }

    /// Assign an event queue
    ///
    /// Blocking queues are armed here and stay armed until released.
    pub fn assign_eq(&self, request: EqAssign) -> EventResult<EqHandle> {
        let order = self.check_eq(&request)?;
        let state = self.state.read();
        state.check_attached()?;

        let mut descriptor = EventDescriptor {
            index: 0,
            interface: request.interface,
            base: request.base,
            order,
            jumbo: request.jumbo,
            valid: true,
            interrupt_vector: None,
            solicited_only: false,
        };
        let pinned = self.pin_ring(&descriptor)?;

        let mut tables = self.tables.lock(&state);
        let inserted = tables.eqs.insert_with(request.interface as usize, |raw| EqSlot {
            ring: RingCursor::new(&EventDescriptor {
                index: raw,
                ..descriptor
            }),
            interface: request.interface,
            pinned: None,
            managed: None,
        });
        let raw = match inserted {
            Ok(raw) => raw,
            Err(err) => {
                self.unpin(pinned);
                return Err(err);
            },
        };
        descriptor.index = raw;
        let handle = EqHandle::new(raw);

        let Some(slot) = tables.eqs.get_mut(raw) else {
            self.unpin(pinned);
            return Err(EventError::InvalidState);
        };
        slot.pinned = pinned;

        if let EqMode::Blocking { callback } = request.mode {
            let object = Arc::new(ManagementObject::for_source(EventSource::Eq(handle)));
            let mut managed = Managed::new(object.clone());
            managed.persistent = true;
            managed.associate(Association::SelfChannel);

            let vector = self.router.assign_vector();
            let target = callback.map_or(DispatchTarget::SelfChannel, DispatchTarget::Callback);
            self.router.arm(&object, vector, target);
            descriptor.interrupt_vector = Some(vector);
            slot.managed = Some(managed);
        }

        let update = self.eq_update(DescriptorUpdate::load(&descriptor, request.user_data), true);
        let published = self
            .eq_descs
            .publish(&descriptor)
            .map_err(EventError::from)
            .and_then(|()| self.submit(&update));
        if let Err(err) = published {
            self.eq_descs.invalidate(raw);
            if let Some(slot) = tables.eqs.remove(raw) {
                self.discard_eq_slot(slot);
            }
            return Err(err);
        }

        log::debug!(
            "context {}: {} assigned, {} entries on interface {}",
            self.id,
            handle,
            request.entry_count,
            request.interface
        );
        Ok(handle)
    }

    /// Release an event queue
    ///
    /// Fails with `Busy` while channel wakeups are unacknowledged. Waiters
    /// wake with `Released`.
    pub fn release_eq(&self, handle: EqHandle, user_data: u64) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let raw = handle.raw();

        let slot = tables.eqs.get(raw).ok_or(EventError::InvalidArgument)?;
        if slot.managed.as_ref().is_some_and(|m| m.unacked > 0) {
            return Err(EventError::Busy);
        }
        let object = slot.managed.as_ref().map(|m| m.object.clone());

        self.eq_descs.invalidate(raw);
        let slot = match &object {
            Some(object) => tables.eqs.retire(raw, object),
            None => tables.eqs.remove(raw),
        }
        .ok_or(EventError::InvalidState)?;

        let interface = slot.interface;
        if let Some(managed) = slot.managed {
            self.release_object(&mut tables, EventSource::Eq(handle), managed);
        }
        self.unpin(slot.pinned);
        if let Some(object) = object {
            let watch = Arc::downgrade(&object);
            drop(object);
            tables.eqs.reclaim(raw, &watch);
        }

        let update = self.eq_update(DescriptorUpdate::clear(raw, interface, user_data), true);
        self.submit(&update)?;
        log::debug!("context {}: {} released", self.id, handle);
        Ok(())
    }

    /// Block until the queue has an entry
    pub fn wait_eq(&self, handle: EqHandle, options: &WaitOptions) -> EventResult<Wakeup<EqEvent>> {
        let wakeup = self.wait_source(EventSource::Eq(handle), options)?;
        Ok(wakeup.map(|event| match event {
            SourceEvent::Queue(entry) => EqEvent { handle, entry },
            SourceEvent::Counter(_) => unreachable!("event queue reported a counter"),
        }))
    }

    /// Acknowledge `count` channel wakeups
    pub fn ack_eq(&self, handle: EqHandle, count: u32) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let slot = tables
            .eqs
            .get_mut(handle.raw())
            .ok_or(EventError::InvalidArgument)?;
        let managed = slot.managed.as_mut().ok_or(EventError::InvalidState)?;
        managed.acknowledge(count)
    }

    /// Consume the entry at the ring head, if any
    pub fn poll_eq(&self, handle: EqHandle) -> EventResult<Option<EqEntry>> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let slot = tables
            .eqs
            .get_mut(handle.raw())
            .ok_or(EventError::InvalidArgument)?;

        let entry = self.device.read_ring_head(&slot.ring);
        if let Some(entry) = &entry {
            self.device.advance_ring(&mut slot.ring, entry);
        }
        Ok(entry)
    }

    /// Current hardware descriptor of a queue
    pub fn eq_descriptor(&self, handle: EqHandle) -> EventResult<EventDescriptor> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        if !tables.eqs.contains(handle.raw()) {
            return Err(EventError::InvalidArgument);
        }
        self.eq_descs
            .load(handle.raw())
            .ok_or(EventError::InvalidArgument)
    }

    /// Program a queue's interrupt delivery directly
    ///
    /// `vector` must lie in the router's pool. A queue the router has armed
    /// is `Busy`.
    pub fn setup_eq_interrupt(
        &self,
        handle: EqHandle,
        vector: Option<VectorId>,
        solicited: bool,
        user_data: u64,
    ) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        let raw = handle.raw();
        let slot = tables.eqs.get(raw).ok_or(EventError::InvalidArgument)?;
        if !self.eq_descs.is_valid(raw) {
            return Err(EventError::InvalidArgument);
        }
        if vector.is_some_and(|vector| vector.index() >= self.router.num_vectors()) {
            return Err(EventError::InvalidArgument);
        }
        if slot.managed.as_ref().is_some_and(|m| m.object.is_armed()) {
            log::debug!("{}: interrupt owned by a waiter", handle);
            return Err(EventError::Busy);
        }
        let update = self.eq_update(
            DescriptorUpdate::interrupt(raw, self.eq_interface(raw), vector, solicited, user_data),
            true,
        );
        self.submit(&update)?;
        self.eq_descs.set_interrupt(raw, vector, solicited);
        Ok(())
    }

    /// Feed a completion notifier from this queue
    pub fn bind_eq_to_cq(
        &self,
        handle: EqHandle,
        notifier: &CompletionNotifier,
        arm_token: u64,
        disarm_token: u64,
    ) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        let slot = tables
            .eqs
            .get(handle.raw())
            .ok_or(EventError::InvalidArgument)?;
        notifier.bind(CqBinding {
            context: self.id,
            index: handle.raw(),
            interface: slot.interface,
            descriptors: self.eq_descs.clone(),
            arm_token,
            disarm_token,
        })
    }

    /// Stop feeding a completion notifier from this queue
    pub fn unbind_eq_from_cq(&self, handle: EqHandle, notifier: &CompletionNotifier) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        notifier.unbind(self.id, handle.raw())
    }
}

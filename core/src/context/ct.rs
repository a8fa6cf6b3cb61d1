//! Counting events

use std::sync::Arc;

use fabric_hal::CtDescriptor;

use super::blocking::SourceEvent;
use super::{CtSlot, EventContext};
use crate::error::{EventError, EventResult};
use crate::handle::{CtHandle, EventSource};
use crate::wait::{WaitOptions, Wakeup};

/// Counting-event assignment request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtAssign {
    /// Interface the counter belongs to
    pub interface: u8,
    /// Initial success count
    pub success: u64,
    /// Initial failure count
    pub failure: u64,
    /// Success count that triggers the event
    pub threshold: u64,
}

impl CtAssign {
    /// Zeroed counter triggering at `threshold`
    pub fn new(interface: u8, threshold: u64) -> Self {
        Self {
            interface,
            success: 0,
            failure: 0,
            threshold,
        }
    }
}

/// A direct counting-event wait saw the threshold reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtEvent {
    /// Counter that triggered
    pub handle: CtHandle,
    /// Threshold it reached
    pub threshold: u64,
}

impl EventContext {
    /// Assign a counting event
    ///
    /// The descriptor goes straight into host memory; no command is issued.
    pub fn assign_ct(&self, request: CtAssign) -> EventResult<CtHandle> {
        if request.interface as usize >= self.config.num_interfaces {
            log::debug!("assign_ct: interface {} out of range", request.interface);
            return Err(EventError::InvalidArgument);
        }
        let state = self.state.read();
        state.check_attached()?;
        let mut tables = self.tables.lock(&state);

        let raw = tables
            .cts
            .insert_with(request.interface as usize, |_| CtSlot { managed: None })?;
        let descriptor = CtDescriptor {
            index: raw,
            interface: request.interface,
            success: request.success,
            failure: request.failure,
            threshold: request.threshold,
            valid: true,
            interrupt_vector: None,
        };
        if let Err(err) = self.ct_descs.publish(&descriptor) {
            tables.cts.remove(raw);
            return Err(err.into());
        }

        let handle = CtHandle::new(raw);
        log::debug!(
            "context {}: {} assigned, threshold {}",
            self.id,
            handle,
            request.threshold
        );
        Ok(handle)
    }

    /// Release a counting event
    pub fn release_ct(&self, handle: CtHandle) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let raw = handle.raw();

        let slot = tables.cts.get(raw).ok_or(EventError::InvalidArgument)?;
        if slot.managed.as_ref().is_some_and(|m| m.unacked > 0) {
            return Err(EventError::Busy);
        }
        let object = slot.managed.as_ref().map(|m| m.object.clone());

        self.ct_descs.invalidate(raw);
        let slot = match &object {
            Some(object) => tables.cts.retire(raw, object),
            None => tables.cts.remove(raw),
        }
        .ok_or(EventError::InvalidState)?;

        if let Some(managed) = slot.managed {
            self.release_object(&mut tables, EventSource::Ct(handle), managed);
        }
        if let Some(object) = object {
            let watch = Arc::downgrade(&object);
            drop(object);
            tables.cts.reclaim(raw, &watch);
        }
        log::debug!("context {}: {} released", self.id, handle);
        Ok(())
    }

    /// Block until the counter reaches its threshold
    pub fn wait_ct(&self, handle: CtHandle, options: &WaitOptions) -> EventResult<Wakeup<CtEvent>> {
        let wakeup = self.wait_source(EventSource::Ct(handle), options)?;
        Ok(wakeup.map(|event| match event {
            SourceEvent::Counter(threshold) => CtEvent { handle, threshold },
            SourceEvent::Queue(_) => unreachable!("counting event reported a queue entry"),
        }))
    }

    /// Acknowledge `count` channel wakeups
    pub fn ack_ct(&self, handle: CtHandle, count: u32) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let slot = tables
            .cts
            .get_mut(handle.raw())
            .ok_or(EventError::InvalidArgument)?;
        let managed = slot.managed.as_mut().ok_or(EventError::InvalidState)?;
        managed.acknowledge(count)
    }

    /// Move a counter's threshold
    pub fn set_ct_threshold(&self, handle: CtHandle, threshold: u64) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        if !tables.cts.contains(handle.raw()) {
            return Err(EventError::InvalidArgument);
        }
        self.ct_descs.set_threshold(handle.raw(), threshold);
        Ok(())
    }

    /// Current hardware descriptor of a counter
    pub fn ct_descriptor(&self, handle: CtHandle) -> EventResult<CtDescriptor> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        if !tables.cts.contains(handle.raw()) {
            return Err(EventError::InvalidArgument);
        }
        self.ct_descs
            .load(handle.raw())
            .ok_or(EventError::InvalidArgument)
    }
}

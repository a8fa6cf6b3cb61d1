//! # Client Contexts
//!
//! One [`EventContext`] per client. It owns the client's handle tables and
//! descriptor tables and exposes the event API: event queues, counting
//! events and event channels.
//!
//! ## Components
//!
//! - `eq`: event-queue assignment, release, polling and direct waits
//! - `ct`: counting-event assignment, release and direct waits
//! - `ec`: event channels and multiplexed waits
//! - `blocking`: the direct-wait path shared by event queues and counters
//!
//! ## Locking
//!
//! Every operation takes the context lock shared, then the table mutex.
//! Teardown takes the context lock exclusively. A blocked thread holds
//! neither; its wait condition retakes both on every check.

mod blocking;
mod ct;
mod ec;
mod eq;


use std::sync::Arc;

use fabric_hal::{
    CtDescriptorTable, DescriptorUpdate, EqDescriptorTable, FabricDevice, PagePinner, PinnedPages,
    RingCursor,
};

use crate::channel::EventChannel;
use crate::config::{ContextKind, EngineConfig};
use crate::engine::EventEngine;
use crate::error::{EventError, EventResult};
use crate::handle::{ChannelHandle, CtHandle, EqHandle, EventSource, HandleTable};
use crate::object::{Association, Managed};
use crate::router::InterruptRouter;
use crate::sync::{ContextLock, EventMutex};

pub use ct::{CtAssign, CtEvent};
pub use ec::ChannelEvent;
pub use eq::{EqAssign, EqEvent, EqMode};

/// Tier-1 protected state
#[derive(Debug)]
struct ContextState {
    /// Process the context is attached to
    owner: Option<u32>,
    closed: bool,
}

impl ContextState {
    fn check_open(&self) -> EventResult<()> {
        if self.closed {
            return Err(EventError::PermissionDenied);
        }
        Ok(())
    }

    fn check_attached(&self) -> EventResult<()> {
        self.check_open()?;
        if self.owner.is_none() {
            return Err(EventError::PermissionDenied);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EqSlot {
    ring: RingCursor,
    interface: u8,
    pinned: Option<PinnedPages>,
    managed: Option<Managed>,
}

#[derive(Debug)]
struct CtSlot {
    managed: Option<Managed>,
}

/// Tier-2 protected handle tables
#[derive(Debug)]
struct EventTables {
    eqs: HandleTable<EqSlot>,
    cts: HandleTable<CtSlot>,
    channels: HandleTable<EventChannel>,
}

impl EventTables {
    fn managed_slot(&mut self, source: EventSource) -> Option<&mut Option<Managed>> {
        match source {
            EventSource::Eq(handle) => self.eqs.get_mut(handle.raw()).map(|slot| &mut slot.managed),
            EventSource::Ct(handle) => self.cts.get_mut(handle.raw()).map(|slot| &mut slot.managed),
        }
    }

    fn managed(&self, source: EventSource) -> Option<&Managed> {
        match source {
            EventSource::Eq(handle) => self.eqs.get(handle.raw())?.managed.as_ref(),
            EventSource::Ct(handle) => self.cts.get(handle.raw())?.managed.as_ref(),
        }
    }

    fn managed_mut(&mut self, source: EventSource) -> Option<&mut Managed> {
        self.managed_slot(source)?.as_mut()
    }

    fn contains(&self, source: EventSource) -> bool {
        match source {
            EventSource::Eq(handle) => self.eqs.contains(handle.raw()),
            EventSource::Ct(handle) => self.cts.contains(handle.raw()),
        }
    }
}

/// Per-client event state
pub struct EventContext {
    id: u64,
    kind: ContextKind,
    config: Arc<EngineConfig>,
    state: ContextLock<ContextState>,
    tables: EventMutex<EventTables>,
    eq_descs: Arc<EqDescriptorTable>,
    ct_descs: Arc<CtDescriptorTable>,
    device: Arc<dyn FabricDevice>,
    pinner: Option<Arc<dyn PagePinner>>,
    router: Arc<InterruptRouter>,
}

impl EventContext {
    pub(crate) fn new(id: u64, kind: ContextKind, engine: &EventEngine) -> Self {
        let config = engine.config_arc().clone();
        let tables = EventTables {
            eqs: HandleTable::new("eq", config.num_interfaces, config.eqs_per_interface),
            cts: HandleTable::new("ct", config.num_interfaces, config.cts_per_interface),
            channels: HandleTable::new("ec", 1, config.max_channels),
        };
        let owner = match kind {
            ContextKind::Kernel => Some(0),
            ContextKind::User => None,
        };
        let pinner = match kind {
            ContextKind::Kernel => None,
            ContextKind::User => engine.pinner().cloned(),
        };

        Self {
            id,
            kind,
            state: ContextLock::new(ContextState {
                owner,
                closed: false,
            }),
            tables: EventMutex::new(tables),
            eq_descs: Arc::new(EqDescriptorTable::new(config.total_eqs())),
            ct_descs: Arc::new(CtDescriptorTable::new(config.total_cts())),
            device: engine.device().clone(),
            pinner,
            router: engine.router().clone(),
            config,
        }
    }

    /// Context identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kernel or user context
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Process the context is attached to
    pub fn owner(&self) -> Option<u32> {
        self.state.read().owner
    }

    /// Context has been torn down
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Attach a user context to process `pid`
    pub fn bind(&self, pid: u32) -> EventResult<()> {
        let mut state = self.state.write();
        state.check_open()?;
        if let Some(owner) = state.owner {
            log::warn!("context {} already attached to {}", self.id, owner);
            return Err(EventError::InvalidState);
        }
        state.owner = Some(pid);
        log::debug!("context {} attached to pid {}", self.id, pid);
        Ok(())
    }

    /// Event-queue descriptor table shared with the adapter
    pub fn eq_descriptors(&self) -> &Arc<EqDescriptorTable> {
        &self.eq_descs
    }

    /// Counting-event descriptor table shared with the adapter
    pub fn ct_descriptors(&self) -> &Arc<CtDescriptorTable> {
        &self.ct_descs
    }

    /// Channel wakeups not yet acknowledged on `source`
    pub fn unacknowledged(&self, source: EventSource) -> EventResult<i32> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        if !tables.contains(source) {
            return Err(EventError::InvalidArgument);
        }
        Ok(tables.managed(source).map_or(0, |managed| managed.unacked))
    }

    /// Tear the context down
    ///
    /// Counting events go first, then event queues, then channels. Every
    /// in-flight wait wakes with `Released`, and later calls fail with
    /// `PermissionDenied`.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.closed = true;
        let mut tables = self.tables.lock(&state);

        let cts = tables.cts.drain();
        let ct_count = cts.len();
        for (raw, slot) in cts {
            self.ct_descs.invalidate(raw);
            if let Some(managed) = slot.managed {
                self.release_object(&mut tables, EventSource::Ct(CtHandle::new(raw)), managed);
            }
        }

        let eqs = tables.eqs.drain();
        let eq_count = eqs.len();
        for (raw, slot) in eqs {
            self.eq_descs.invalidate(raw);
            if let Some(managed) = slot.managed {
                self.release_object(&mut tables, EventSource::Eq(EqHandle::new(raw)), managed);
            }
            self.unpin(slot.pinned);
            let update = self.eq_update(DescriptorUpdate::clear(raw, slot.interface, 0), true);
            if let Err(err) = self.submit(&update) {
                log::warn!("context {}: eq{} left programmed after close: {}", self.id, raw, err);
            }
        }

        let channels = tables.channels.drain();
        for (_, channel) in &channels {
            channel.shared().queue().wake_all();
        }

        log::debug!(
            "context {} closed: {} counting events, {} event queues, {} channels",
            self.id,
            ct_count,
            eq_count,
            channels.len()
        );
    }

    /// Unlink and disarm an object whose handle is going away, waking its
    /// waiters
    fn release_object(&self, tables: &mut EventTables, source: EventSource, mut managed: Managed) {
        self.router.disarm(&managed.object);
        if let EventSource::Ct(handle) = source {
            self.ct_descs.set_interrupt(handle.raw(), None);
        }

        if let Some(Association::Channel(handle)) = managed.dissociate() {
            if let Some(channel) = tables.channels.get_mut(handle.raw()) {
                channel.unlink(source);
                if channel.is_empty() {
                    channel.shared().queue().wake_all();
                }
            }
        }
        managed.object.queue().wake_all();
    }

    /// Set the completion flag on an event-queue command
    ///
    /// The first queue of each interface never gets command completions.
    fn eq_update(&self, update: DescriptorUpdate, wait: bool) -> DescriptorUpdate {
        if wait && !self.config.is_first_eq(update.index) {
            update
        } else {
            update.without_completion()
        }
    }

    fn submit(&self, update: &DescriptorUpdate) -> EventResult<()> {
        self.device.submit(update).map_err(|err| {
            log::error!("eq{}: descriptor command failed: {}", update.index, err);
            EventError::HardwareCommandFailed
        })
    }

    fn unpin(&self, pinned: Option<PinnedPages>) {
        if let (Some(pages), Some(pinner)) = (pinned, self.pinner.as_ref()) {
            pinner.unpin(pages);
        }
    }

    fn eq_interface(&self, raw: u16) -> u8 {
        self.config.eq_interface(raw) as u8
    }

    /// Channel members in attach order
    pub fn channel_members(&self, channel: ChannelHandle) -> EventResult<Vec<EventSource>> {
        let state = self.state.read();
        state.check_open()?;
        let tables = self.tables.lock(&state);
        tables
            .channels
            .get(channel.raw())
            .map(|channel| channel.members().to_vec())
            .ok_or(EventError::InvalidArgument)
    }
}

impl core::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for EventContext {
    fn drop(&mut self) {
        self.close();
    }
}

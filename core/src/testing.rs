//! Software fabric for tests
//!
//! [`SimDevice`] stands in for the adapter: it keeps ring memory, logs every
//! descriptor command, accounts pinned pages and raises the programmed
//! vector when an event is posted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use fabric_hal::ring::EQ_ENTRY_VALID;
use fabric_hal::{
    CommandTicket, DescriptorUpdate, EqEntry, FabricDevice, HalError, HalResult, PagePinner,
    PinnedPages, RingCursor,
};

use crate::context::EventContext;
use crate::engine::EventEngine;
use crate::handle::{CtHandle, EqHandle};

#[derive(Debug, Default)]
pub(crate) struct SimDevice {
    /// First word of every written ring slot, by address
    memory: Mutex<HashMap<u64, u64>>,
    /// Producer index per ring base
    tails: Mutex<HashMap<u64, u32>>,
    commands: Mutex<Vec<DescriptorUpdate>>,
    fail_commands: AtomicBool,
    next_ticket: AtomicU64,
    pinned: AtomicU64,
    pin_limit: AtomicU64,
}

impl SimDevice {
    pub(crate) fn new() -> Self {
        Self {
            pin_limit: AtomicU64::new(u64::MAX),
            ..Self::default()
        }
    }

    pub(crate) fn commands(&self) -> Vec<DescriptorUpdate> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn last_command(&self) -> Option<DescriptorUpdate> {
        self.commands.lock().unwrap().last().copied()
    }

    pub(crate) fn fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_pin_limit(&self, pages: u64) {
        self.pin_limit.store(pages, Ordering::SeqCst);
    }

    pub(crate) fn pinned_pages(&self) -> u64 {
        self.pinned.load(Ordering::SeqCst)
    }

    /// Write an entry at the ring tail and raise the queue's vector
    pub(crate) fn post_eq_event(
        &self,
        engine: &EventEngine,
        ctx: &EventContext,
        eq: EqHandle,
        payload: u64,
    ) {
        let desc = ctx.eq_descriptor(eq).unwrap();
        let ring = RingCursor::new(&desc);
        {
            let mut tails = self.tails.lock().unwrap();
            let tail = tails.entry(desc.base).or_insert(0);
            let address = ring.slot_address(*tail);
            self.memory
                .lock()
                .unwrap()
                .insert(address, payload | EQ_ENTRY_VALID);
            *tail = (*tail + 1) & (ring.entry_count() - 1);
        }
        if let Some(vector) = desc.interrupt_vector {
            engine.dispatch(vector);
        }
    }

    /// Add to a counter's success count and raise its vector once triggered
    pub(crate) fn bump_ct(&self, engine: &EventEngine, ctx: &EventContext, ct: CtHandle, count: u64) {
        let table = ctx.ct_descriptors();
        table.add_success(ct.raw(), count);
        if !table.is_triggered(ct.raw()) {
            return;
        }
        if let Some(vector) = table.load(ct.raw()).and_then(|desc| desc.interrupt_vector) {
            engine.dispatch(vector);
        }
    }
}

impl FabricDevice for SimDevice {
    fn issue_descriptor_update(&self, update: &DescriptorUpdate) -> HalResult<CommandTicket> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(HalError::CommandRejected);
        }
        self.commands.lock().unwrap().push(*update);
        Ok(CommandTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst)))
    }

    fn wait_command(&self, _ticket: CommandTicket) -> HalResult<()> {
        Ok(())
    }

    fn read_ring_head(&self, ring: &RingCursor) -> Option<EqEntry> {
        let slot = ring.head();
        let word = *self.memory.lock().unwrap().get(&ring.slot_address(slot))?;
        let entry = EqEntry { slot, word };
        entry.is_valid().then_some(entry)
    }

    fn advance_ring(&self, ring: &mut RingCursor, entry: &EqEntry) {
        if let Some(word) = self
            .memory
            .lock()
            .unwrap()
            .get_mut(&ring.slot_address(entry.slot))
        {
            *word &= !EQ_ENTRY_VALID;
        }
        ring.advance(1);
    }
}

impl PagePinner for SimDevice {
    fn pin(&self, vaddr: u64, npages: u64) -> HalResult<PinnedPages> {
        let limit = self.pin_limit.load(Ordering::SeqCst);
        let pinned = self.pinned.load(Ordering::SeqCst);
        if pinned.saturating_add(npages) > limit {
            return Err(HalError::PinLimitExceeded);
        }
        self.pinned.fetch_add(npages, Ordering::SeqCst);
        Ok(PinnedPages {
            vaddr,
            npages,
            frames: (0..npages).map(|n| (vaddr >> 12) + n).collect(),
        })
    }

    fn unpin(&self, pages: PinnedPages) {
        self.pinned.fetch_sub(pages.npages, Ordering::SeqCst);
    }
}

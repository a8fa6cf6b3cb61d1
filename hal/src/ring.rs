//! # Event-Queue Rings
//!
//! Ring geometry shared by the engine and the adapter. The adapter writes
//! entries at the tail; the consumer cursor tracks the software head. An
//! entry is present when bit 63 of its first word is set, and consuming it
//! clears that bit.

use crate::descriptor::EventDescriptor;

/// Valid bit in the first word of every ring entry
pub const EQ_ENTRY_VALID: u64 = 1 << 63;

/// log2 of the standard ring entry width
pub const EQ_ENTRY_LOG2: u32 = 6;

/// log2 of the jumbo ring entry width
pub const EQ_JUMBO_ENTRY_LOG2: u32 = 7;

/// One entry observed at the head of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqEntry {
    /// Ring slot the entry was read from
    pub slot: u32,
    /// First word of the entry, valid bit included
    pub word: u64,
}

impl EqEntry {
    /// Entry carries the valid bit
    pub const fn is_valid(&self) -> bool {
        self.word & EQ_ENTRY_VALID != 0
    }

    /// First word with the valid bit stripped
    pub const fn payload(&self) -> u64 {
        self.word & !EQ_ENTRY_VALID
    }
}

/// Consumer-side view of one event-queue ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCursor {
    index: u16,
    base: u64,
    entry_count: u32,
    width_log2: u32,
    head: u32,
}

impl RingCursor {
    /// Cursor positioned at the first slot of the ring described by `desc`
    pub fn new(desc: &EventDescriptor) -> Self {
        Self {
            index: desc.index,
            base: desc.base,
            entry_count: desc.entry_count(),
            width_log2: desc.entry_width_log2(),
            head: 0,
        }
    }

    /// Event-queue index this ring belongs to
    pub const fn index(&self) -> u16 {
        self.index
    }

    /// Ring base address
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Number of entries in the ring
    pub const fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Slot the next entry will be read from
    pub const fn head(&self) -> u32 {
        self.head
    }

    /// Slot `n` entries past the head, wrapping
    pub const fn nth_slot(&self, n: u32) -> u32 {
        self.head.wrapping_add(n) & (self.entry_count - 1)
    }

    /// Address of a slot
    pub const fn slot_address(&self, slot: u32) -> u64 {
        self.base + ((slot as u64) << self.width_log2)
    }

    /// Move the head forward by `n` entries
    pub fn advance(&mut self, n: u32) {
        self.head = self.nth_slot(n);
    }
}

/// Number of pages spanned by `[addr, addr + len)`
pub const fn num_user_pages(addr: u64, len: u64, page_size: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let first = addr / page_size;
    let last = (addr + len - 1) / page_size;
    last - first + 1
}

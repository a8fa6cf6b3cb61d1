//! # Device Capabilities
//!
//! The engine drives the adapter through two narrow traits. [`FabricDevice`]
//! issues descriptor-update commands and reads event-queue rings;
//! [`PagePinner`] pins the user memory backing a ring.
//!
//! Command issue must never block. Some commands are issued from interrupt
//! dispatch, where only completion-free updates are allowed.

use alloc::vec::Vec;

use crate::descriptor::EventDescriptor;
use crate::error::HalResult;
use crate::ring::{EqEntry, RingCursor};
use crate::VectorId;

/// What a descriptor-update command changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePayload {
    /// Load a whole event-queue descriptor (all-zero words clear it)
    Descriptor([u64; 2]),
    /// Change only interrupt delivery
    Interrupt {
        /// Vector to raise, `None` disables interrupts
        vector: Option<VectorId>,
        /// Only solicited entries raise the vector
        solicited: bool,
    },
}

/// A descriptor-update command for one event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorUpdate {
    /// Event-queue index
    pub index: u16,
    /// Interface the event queue belongs to
    pub interface: u8,
    /// Change to apply
    pub payload: UpdatePayload,
    /// Opaque value echoed back in the command completion
    pub user_token: u64,
    /// Caller will wait for the command to complete
    pub completion: bool,
}

impl DescriptorUpdate {
    /// Load `desc` into the adapter
    pub fn load(desc: &EventDescriptor, user_token: u64) -> Self {
        Self {
            index: desc.index,
            interface: desc.interface,
            payload: UpdatePayload::Descriptor(desc.encode()),
            user_token,
            completion: true,
        }
    }

    /// Clear the adapter's copy of an event-queue descriptor
    pub fn clear(index: u16, interface: u8, user_token: u64) -> Self {
        Self {
            index,
            interface,
            payload: UpdatePayload::Descriptor([0; 2]),
            user_token,
            completion: true,
        }
    }

    /// Change interrupt delivery for an event queue
    pub fn interrupt(
        index: u16,
        interface: u8,
        vector: Option<VectorId>,
        solicited: bool,
        user_token: u64,
    ) -> Self {
        Self {
            index,
            interface,
            payload: UpdatePayload::Interrupt { vector, solicited },
            user_token,
            completion: true,
        }
    }

    /// Issue without waiting for completion
    pub fn without_completion(mut self) -> Self {
        self.completion = false;
        self
    }
}

/// Handle to an in-flight command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandTicket(pub u64);

/// Adapter command and ring access
pub trait FabricDevice: Send + Sync {
    /// Queue a descriptor-update command. Must not block.
    fn issue_descriptor_update(&self, update: &DescriptorUpdate) -> HalResult<CommandTicket>;

    /// Wait until a previously issued command has completed
    fn wait_command(&self, ticket: CommandTicket) -> HalResult<()>;

    /// Read the entry at the ring head, if it carries the valid bit
    fn read_ring_head(&self, ring: &RingCursor) -> Option<EqEntry>;

    /// Consume `entry`: clear its valid bit and advance the head
    fn advance_ring(&self, ring: &mut RingCursor, entry: &EqEntry);

    /// Issue a command and wait for it if it requests a completion
    fn submit(&self, update: &DescriptorUpdate) -> HalResult<()> {
        let ticket = self.issue_descriptor_update(update)?;
        if update.completion {
            self.wait_command(ticket)?;
        }
        Ok(())
    }
}

/// Pages pinned in memory on behalf of a ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedPages {
    /// First virtual address of the pinned range
    pub vaddr: u64,
    /// Number of pages
    pub npages: u64,
    /// Physical frames backing the range
    pub frames: Vec<u64>,
}

/// Pins user memory so the adapter can write into it
pub trait PagePinner: Send + Sync {
    /// Pin `npages` pages starting at `vaddr`
    fn pin(&self, vaddr: u64, npages: u64) -> HalResult<PinnedPages>;

    /// Release a pinned range
    fn unpin(&self, pages: PinnedPages);
}

//! # Fabric Hardware Abstraction Layer
//!
//! The hardware-facing half of the fabric event engine. Nothing in here
//! blocks, allocates on a hot path, or knows about client contexts: it
//! describes what the adapter reads and the capabilities the engine needs
//! from it.
//!
//! ## Components
//!
//! - [`descriptor`]: Event-queue and counting-event descriptor layouts and the
//!   shared descriptor tables the adapter reads
//! - [`ring`]: Event-queue ring geometry and consumer cursors
//! - [`device`]: The command and page-pinning capabilities of the adapter
//! - [`error`]: Hardware-level error type
//!
//! ## Publication Model
//!
//! A descriptor becomes visible to the adapter only when its valid bit is
//! set. Every other word of the descriptor is written first, and the valid
//! word is stored with release ordering last. Tearing a descriptor down
//! runs the same sequence backwards: the valid bit is cleared before any
//! other word is touched.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod descriptor;
pub mod device;
pub mod error;
pub mod ring;

pub use descriptor::{CtDescriptor, CtDescriptorTable, EqDescriptorTable, EventDescriptor};
pub use device::{CommandTicket, DescriptorUpdate, FabricDevice, PagePinner, PinnedPages, UpdatePayload};
pub use error::{HalError, HalResult};
pub use ring::{EqEntry, RingCursor};

/// Interrupt vector number as programmed into a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VectorId(u8);

impl VectorId {
    /// Create a vector identifier
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw vector number
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index into per-vector tables
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for VectorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

/// HAL version
pub const HAL_VERSION: &str = env!("CARGO_PKG_VERSION");

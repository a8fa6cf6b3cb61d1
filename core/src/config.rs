//! # Engine Configuration
//!
//! Table sizes, ring geometry limits and the interrupt vector pool. The
//! defaults describe the production adapter; [`EngineConfig::compact`] is a
//! small layout for tests and simulation.

use static_assertions::const_assert;

use crate::error::{EventError, EventResult};

/// Network interfaces per adapter
pub const DEFAULT_NUM_INTERFACES: usize = 4;

/// Event-queue handles per interface
pub const DEFAULT_EQS_PER_INTERFACE: usize = 2048;

/// Counting-event handles per interface
pub const DEFAULT_CTS_PER_INTERFACE: usize = 2048;

/// Event channels per context
pub const DEFAULT_MAX_CHANNELS: usize = DEFAULT_NUM_INTERFACES * DEFAULT_EQS_PER_INTERFACE;

/// Interrupt vectors reserved for event queues
pub const DEFAULT_NUM_VECTORS: usize = 255;

/// Smallest ring, as log2 of the entry count
pub const DEFAULT_MIN_ORDER: u8 = 6;

/// Largest ring, as log2 of the entry count
pub const DEFAULT_MAX_ORDER: u8 = 22;

/// Required ring base alignment
pub const DEFAULT_EQ_ALIGNMENT: u64 = 0x40;

const_assert!(DEFAULT_EQS_PER_INTERFACE.is_power_of_two());
const_assert!(DEFAULT_NUM_INTERFACES * DEFAULT_EQS_PER_INTERFACE <= 1 << 16);
const_assert!(DEFAULT_NUM_VECTORS <= 256);
const_assert!(DEFAULT_MIN_ORDER <= DEFAULT_MAX_ORDER);

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Network interfaces; handle tables are partitioned per interface
    pub num_interfaces: usize,
    /// Event-queue handles per interface
    pub eqs_per_interface: usize,
    /// Counting-event handles per interface
    pub cts_per_interface: usize,
    /// Event channels per context
    pub max_channels: usize,
    /// Interrupt vectors in the round-robin pool
    pub num_vectors: usize,
    /// Smallest ring order
    pub min_order: u8,
    /// Largest ring order
    pub max_order: u8,
    /// Required ring base alignment in bytes
    pub eq_alignment: u64,
    /// Page size used when pinning user rings
    pub page_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_interfaces: DEFAULT_NUM_INTERFACES,
            eqs_per_interface: DEFAULT_EQS_PER_INTERFACE,
            cts_per_interface: DEFAULT_CTS_PER_INTERFACE,
            max_channels: DEFAULT_MAX_CHANNELS,
            num_vectors: DEFAULT_NUM_VECTORS,
            min_order: DEFAULT_MIN_ORDER,
            max_order: DEFAULT_MAX_ORDER,
            eq_alignment: DEFAULT_EQ_ALIGNMENT,
            page_size: 4096,
        }
    }
}

impl EngineConfig {
    /// Small layout for tests and simulation
    pub fn compact() -> Self {
        Self {
            num_interfaces: 2,
            eqs_per_interface: 16,
            cts_per_interface: 16,
            max_channels: 8,
            num_vectors: 8,
            min_order: DEFAULT_MIN_ORDER,
            max_order: 12,
            ..Self::default()
        }
    }

    /// Check that the configuration is internally consistent
    pub fn validate(&self) -> EventResult<()> {
        let fits_u16 = |n: usize| n > 0 && n <= 1 << 16;

        if self.num_interfaces == 0 || self.num_interfaces > 256 {
            return Err(EventError::InvalidArgument);
        }
        if !fits_u16(self.num_interfaces * self.eqs_per_interface)
            || !fits_u16(self.num_interfaces * self.cts_per_interface)
            || !fits_u16(self.max_channels)
        {
            return Err(EventError::InvalidArgument);
        }
        if self.num_vectors == 0 || self.num_vectors > 256 {
            return Err(EventError::InvalidArgument);
        }
        if self.min_order > self.max_order || self.max_order > 31 {
            return Err(EventError::InvalidArgument);
        }
        if !self.eq_alignment.is_power_of_two() || !self.page_size.is_power_of_two() {
            return Err(EventError::InvalidArgument);
        }
        Ok(())
    }

    /// Total event-queue handles across interfaces
    pub fn total_eqs(&self) -> usize {
        self.num_interfaces * self.eqs_per_interface
    }

    /// Total counting-event handles across interfaces
    pub fn total_cts(&self) -> usize {
        self.num_interfaces * self.cts_per_interface
    }

    /// Interface an event-queue index belongs to
    pub fn eq_interface(&self, index: u16) -> usize {
        index as usize / self.eqs_per_interface
    }

    /// Interface a counting-event index belongs to
    pub fn ct_interface(&self, index: u16) -> usize {
        index as usize / self.cts_per_interface
    }

    /// First event queue of an interface
    ///
    /// Descriptor commands for it are issued without completion waits.
    pub fn is_first_eq(&self, index: u16) -> bool {
        index as usize % self.eqs_per_interface == 0
    }
}

/// Who owns an event context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// In-kernel consumer; rings are not pinned
    Kernel,
    /// User process; rings are pinned and bind() gates access
    User,
}

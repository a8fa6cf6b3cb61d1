//! # Event Descriptors
//!
//! Host-memory descriptor tables read by the adapter. Each event queue owns a
//! two-word descriptor and each counting event a four-word descriptor. The
//! adapter only honors a descriptor whose valid bit is set.
//!
//! ## Event-Queue Descriptor Layout
//!
//! ```text
//! word 0:  [3:0] control flags  [15:8] vector  [20:16] order  [31:24] interface
//! word 1:  ring base address
//! ```
//!
//! ## Counting-Event Descriptor Layout
//!
//! ```text
//! word 0:  success counter
//! word 1:  failure counter
//! word 2:  threshold
//! word 3:  [1:0] control flags  [15:8] vector  [31:24] interface
//! ```

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{HalError, HalResult};
use crate::ring::{EQ_ENTRY_LOG2, EQ_JUMBO_ENTRY_LOG2};
use crate::VectorId;

// =============================================================================
// Layout
// =============================================================================

bitflags! {
    /// Control bits in word 0 of an event-queue descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EqControl: u64 {
        /// Descriptor is live
        const VALID = 1 << 0;
        /// Raise the programmed vector on new entries
        const INTERRUPT = 1 << 1;
        /// Only solicited entries raise the vector
        const SOLICITED = 1 << 2;
        /// Ring uses 128-byte entries
        const JUMBO = 1 << 3;
    }
}

bitflags! {
    /// Control bits in word 3 of a counting-event descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtControl: u64 {
        /// Descriptor is live
        const VALID = 1 << 0;
        /// Raise the programmed vector when success reaches threshold
        const INTERRUPT = 1 << 1;
    }
}

const VECTOR_SHIFT: u32 = 8;
const VECTOR_MASK: u64 = 0xFF << VECTOR_SHIFT;
const ORDER_SHIFT: u32 = 16;
const ORDER_MASK: u64 = 0x1F << ORDER_SHIFT;
const INTERFACE_SHIFT: u32 = 24;
const INTERFACE_MASK: u64 = 0xFF << INTERFACE_SHIFT;

/// Index of the word holding the valid bit in an event-queue descriptor
const EQ_VALID_WORD: usize = 0;
/// Index of the word holding the valid bit in a counting-event descriptor
const CT_VALID_WORD: usize = 3;

const_assert_eq!(EqControl::all().bits() & VECTOR_MASK, 0);
const_assert_eq!(VECTOR_MASK & ORDER_MASK, 0);
const_assert_eq!(ORDER_MASK & INTERFACE_MASK, 0);
const_assert_eq!(CtControl::all().bits() & VECTOR_MASK, 0);

fn pack_vector(vector: Option<VectorId>) -> u64 {
    vector.map_or(0, |v| (v.raw() as u64) << VECTOR_SHIFT)
}

fn unpack_vector(word: u64, enabled: bool) -> Option<VectorId> {
    enabled.then(|| VectorId::new(((word & VECTOR_MASK) >> VECTOR_SHIFT) as u8))
}

// =============================================================================
// Event-Queue Descriptor
// =============================================================================

/// Decoded event-queue descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Descriptor index (the event-queue handle)
    pub index: u16,
    /// Network interface the ring belongs to
    pub interface: u8,
    /// Ring base address
    pub base: u64,
    /// log2 of the number of ring entries
    pub order: u8,
    /// 128-byte entries instead of 64-byte
    pub jumbo: bool,
    /// Hardware honors the descriptor
    pub valid: bool,
    /// Programmed interrupt vector, if interrupts are enabled
    pub interrupt_vector: Option<VectorId>,
    /// Only solicited entries raise the vector
    pub solicited_only: bool,
}

impl EventDescriptor {
    /// Number of ring entries
    pub const fn entry_count(&self) -> u32 {
        1 << self.order
    }

    /// log2 of the entry width in bytes
    pub const fn entry_width_log2(&self) -> u32 {
        if self.jumbo {
            EQ_JUMBO_ENTRY_LOG2
        } else {
            EQ_ENTRY_LOG2
        }
    }

    /// Entry width in bytes
    pub const fn entry_width(&self) -> u32 {
        1 << self.entry_width_log2()
    }

    /// Ring size in bytes
    pub const fn ring_bytes(&self) -> u64 {
        (self.entry_count() as u64) << self.entry_width_log2()
    }

    /// Encode into the two hardware words
    pub fn encode(&self) -> [u64; 2] {
        let mut control = EqControl::empty();
        control.set(EqControl::VALID, self.valid);
        control.set(EqControl::INTERRUPT, self.interrupt_vector.is_some());
        control.set(EqControl::SOLICITED, self.solicited_only);
        control.set(EqControl::JUMBO, self.jumbo);

        let word0 = control.bits()
            | pack_vector(self.interrupt_vector)
            | (((self.order as u64) << ORDER_SHIFT) & ORDER_MASK)
            | ((self.interface as u64) << INTERFACE_SHIFT);
        [word0, self.base]
    }

    /// Decode from the two hardware words
    pub fn decode(index: u16, words: [u64; 2]) -> Self {
        let control = EqControl::from_bits_truncate(words[0]);
        Self {
            index,
            interface: ((words[0] & INTERFACE_MASK) >> INTERFACE_SHIFT) as u8,
            base: words[1],
            order: ((words[0] & ORDER_MASK) >> ORDER_SHIFT) as u8,
            jumbo: control.contains(EqControl::JUMBO),
            valid: control.contains(EqControl::VALID),
            interrupt_vector: unpack_vector(words[0], control.contains(EqControl::INTERRUPT)),
            solicited_only: control.contains(EqControl::SOLICITED),
        }
    }
}

// =============================================================================
// Counting-Event Descriptor
// =============================================================================

/// Decoded counting-event descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtDescriptor {
    /// Descriptor index (the counting-event handle)
    pub index: u16,
    /// Network interface the counter belongs to
    pub interface: u8,
    /// Success counter
    pub success: u64,
    /// Failure counter
    pub failure: u64,
    /// Success value at which the counter triggers
    pub threshold: u64,
    /// Hardware honors the descriptor
    pub valid: bool,
    /// Programmed interrupt vector, if interrupts are enabled
    pub interrupt_vector: Option<VectorId>,
}

impl CtDescriptor {
    /// Encode into the four hardware words
    pub fn encode(&self) -> [u64; 4] {
        let mut control = CtControl::empty();
        control.set(CtControl::VALID, self.valid);
        control.set(CtControl::INTERRUPT, self.interrupt_vector.is_some());

        let word3 = control.bits()
            | pack_vector(self.interrupt_vector)
            | ((self.interface as u64) << INTERFACE_SHIFT);
        [self.success, self.failure, self.threshold, word3]
    }

    /// Decode from the four hardware words
    pub fn decode(index: u16, words: [u64; 4]) -> Self {
        let control = CtControl::from_bits_truncate(words[3]);
        Self {
            index,
            interface: ((words[3] & INTERFACE_MASK) >> INTERFACE_SHIFT) as u8,
            success: words[0],
            failure: words[1],
            threshold: words[2],
            valid: control.contains(CtControl::VALID),
            interrupt_vector: unpack_vector(words[3], control.contains(CtControl::INTERRUPT)),
        }
    }

    /// Success counter has reached the threshold
    pub const fn is_triggered(&self) -> bool {
        self.success >= self.threshold
    }
}

// =============================================================================
// Shared Slots
// =============================================================================

/// A fixed table of N-word descriptors shared with the adapter
struct Slots<const N: usize> {
    words: Box<[[AtomicU64; N]]>,
}

impl<const N: usize> Slots<N> {
    fn new(len: usize) -> Self {
        Self {
            words: (0..len)
                .map(|_| core::array::from_fn(|_| AtomicU64::new(0)))
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    fn slot(&self, index: u16) -> Option<&[AtomicU64; N]> {
        self.words.get(index as usize)
    }

    /// Store every word except `valid_word`, then store `valid_word` last
    fn publish(&self, index: u16, words: [u64; N], valid_word: usize) -> HalResult<()> {
        let slot = self.slot(index).ok_or(HalError::InvalidRange)?;
        for (i, word) in words.iter().enumerate() {
            if i != valid_word {
                slot[i].store(*word, Ordering::Relaxed);
            }
        }
        slot[valid_word].store(words[valid_word], Ordering::Release);
        Ok(())
    }

    fn load(&self, index: u16, valid_word: usize) -> Option<[u64; N]> {
        let slot = self.slot(index)?;
        let mut words = [0u64; N];
        words[valid_word] = slot[valid_word].load(Ordering::Acquire);
        for (i, word) in words.iter_mut().enumerate() {
            if i != valid_word {
                *word = slot[i].load(Ordering::Relaxed);
            }
        }
        Some(words)
    }

    /// Clear `bit` in `valid_word`, returning whether it was set
    fn clear(&self, index: u16, valid_word: usize, bit: u64) -> bool {
        self.slot(index)
            .map(|slot| slot[valid_word].fetch_and(!bit, Ordering::Release) & bit != 0)
            .unwrap_or(false)
    }

    fn test(&self, index: u16, valid_word: usize, bit: u64) -> bool {
        self.slot(index)
            .map(|slot| slot[valid_word].load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    /// Read-modify-write of the control word
    fn update(&self, index: u16, valid_word: usize, f: impl Fn(u64) -> u64) {
        if let Some(slot) = self.slot(index) {
            let mut current = slot[valid_word].load(Ordering::Relaxed);
            loop {
                match slot[valid_word].compare_exchange_weak(
                    current,
                    f(current),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }
}

// =============================================================================
// Event-Queue Descriptor Table
// =============================================================================

/// Event-queue descriptors for every interface
pub struct EqDescriptorTable {
    slots: Slots<2>,
}

impl EqDescriptorTable {
    /// Allocate a zeroed (all invalid) table
    pub fn new(len: usize) -> Self {
        Self {
            slots: Slots::new(len),
        }
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Table has no descriptors
    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Write a descriptor, making it visible only once fully written
    pub fn publish(&self, descriptor: &EventDescriptor) -> HalResult<()> {
        self.slots
            .publish(descriptor.index, descriptor.encode(), EQ_VALID_WORD)
    }

    /// Clear the valid bit. Returns whether the descriptor was valid.
    pub fn invalidate(&self, index: u16) -> bool {
        self.slots
            .clear(index, EQ_VALID_WORD, EqControl::VALID.bits())
    }

    /// Valid bit is set
    pub fn is_valid(&self, index: u16) -> bool {
        self.slots
            .test(index, EQ_VALID_WORD, EqControl::VALID.bits())
    }

    /// Reprogram interrupt delivery without touching the valid bit
    pub fn set_interrupt(&self, index: u16, vector: Option<VectorId>, solicited: bool) {
        self.slots.update(index, EQ_VALID_WORD, |word| {
            let mut control = EqControl::from_bits_truncate(word);
            control.set(EqControl::INTERRUPT, vector.is_some());
            control.set(EqControl::SOLICITED, vector.is_some() && solicited);
            (word & !(VECTOR_MASK | EqControl::all().bits())) | control.bits() | pack_vector(vector)
        });
    }

    /// Decode the current descriptor contents
    pub fn load(&self, index: u16) -> Option<EventDescriptor> {
        self.slots
            .load(index, EQ_VALID_WORD)
            .map(|words| EventDescriptor::decode(index, words))
    }
}

impl core::fmt::Debug for EqDescriptorTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EqDescriptorTable")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Counting-Event Descriptor Table
// =============================================================================

/// Counting-event descriptors for every interface
pub struct CtDescriptorTable {
    slots: Slots<4>,
}

impl CtDescriptorTable {
    /// Allocate a zeroed (all invalid) table
    pub fn new(len: usize) -> Self {
        Self {
            slots: Slots::new(len),
        }
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Table has no descriptors
    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Write a descriptor: counters and threshold first, control word last
    pub fn publish(&self, descriptor: &CtDescriptor) -> HalResult<()> {
        self.slots
            .publish(descriptor.index, descriptor.encode(), CT_VALID_WORD)
    }

    /// Clear the valid bit. Returns whether the descriptor was valid.
    pub fn invalidate(&self, index: u16) -> bool {
        self.slots
            .clear(index, CT_VALID_WORD, CtControl::VALID.bits())
    }

    /// Valid bit is set
    pub fn is_valid(&self, index: u16) -> bool {
        self.slots
            .test(index, CT_VALID_WORD, CtControl::VALID.bits())
    }

    /// Reprogram interrupt delivery without touching the valid bit
    pub fn set_interrupt(&self, index: u16, vector: Option<VectorId>) {
        self.slots.update(index, CT_VALID_WORD, |word| {
            let mut control = CtControl::from_bits_truncate(word);
            control.set(CtControl::INTERRUPT, vector.is_some());
            (word & !(VECTOR_MASK | CtControl::all().bits())) | control.bits() | pack_vector(vector)
        });
    }

    /// Current success counter
    pub fn success(&self, index: u16) -> u64 {
        self.slots
            .slot(index)
            .map_or(0, |slot| slot[0].load(Ordering::Acquire))
    }

    /// Current threshold
    pub fn threshold(&self, index: u16) -> u64 {
        self.slots
            .slot(index)
            .map_or(0, |slot| slot[2].load(Ordering::Acquire))
    }

    /// Success counter has reached the threshold
    pub fn is_triggered(&self, index: u16) -> bool {
        self.success(index) >= self.threshold(index)
    }

    /// Advance the success counter, returning the new value
    ///
    /// This is the adapter's side of the counter.
    pub fn add_success(&self, index: u16, count: u64) -> u64 {
        self.slots.slot(index).map_or(0, |slot| {
            slot[0].fetch_add(count, Ordering::AcqRel).wrapping_add(count)
        })
    }

    /// Move the trigger threshold
    pub fn set_threshold(&self, index: u16, threshold: u64) {
        if let Some(slot) = self.slots.slot(index) {
            slot[2].store(threshold, Ordering::Release);
        }
    }

    /// Decode the current descriptor contents
    pub fn load(&self, index: u16) -> Option<CtDescriptor> {
        self.slots
            .load(index, CT_VALID_WORD)
            .map(|words| CtDescriptor::decode(index, words))
    }
}

impl core::fmt::Debug for CtDescriptorTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CtDescriptorTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_eq(index: u16) -> EventDescriptor {
        EventDescriptor {
            index,
            interface: 2,
            base: 0x7f00_0000_1000,
            order: 10,
            jumbo: false,
            valid: true,
            interrupt_vector: Some(VectorId::new(37)),
            solicited_only: true,
        }
    }

    #[test]
    fn test_eq_descriptor_encoding() {
        let desc = sample_eq(5);
        let decoded = EventDescriptor::decode(5, desc.encode());
        assert_eq!(decoded, desc);
        assert_eq!(decoded.entry_count(), 1024);
        assert_eq!(decoded.entry_width(), 64);
        assert_eq!(decoded.ring_bytes(), 64 * 1024);
    }

    #[test]
    fn test_jumbo_entry_width() {
        let desc = EventDescriptor {
            jumbo: true,
            ..sample_eq(0)
        };
        assert_eq!(desc.entry_width(), 128);
    }

    #[test]
    fn test_publish_and_invalidate() {
        let table = EqDescriptorTable::new(8);
        assert!(!table.is_valid(3));

        table.publish(&sample_eq(3)).unwrap();
        assert!(table.is_valid(3));
        assert_eq!(table.load(3).unwrap().base, 0x7f00_0000_1000);

        assert!(table.invalidate(3));
        assert!(!table.is_valid(3));
        assert!(!table.invalidate(3));
        // The rest of the descriptor is left in place
        assert_eq!(table.load(3).unwrap().order, 10);
    }

    #[test]
    fn test_publish_out_of_range() {
        let table = EqDescriptorTable::new(4);
        assert_eq!(table.publish(&sample_eq(4)), Err(HalError::InvalidRange));
        assert!(!table.is_valid(4));
        assert!(table.load(4).is_none());
    }

    #[test]
    fn test_set_interrupt_preserves_valid() {
        let table = EqDescriptorTable::new(4);
        let desc = EventDescriptor {
            interrupt_vector: None,
            solicited_only: false,
            ..sample_eq(1)
        };
        table.publish(&desc).unwrap();

        table.set_interrupt(1, Some(VectorId::new(200)), true);
        let loaded = table.load(1).unwrap();
        assert!(loaded.valid);
        assert_eq!(loaded.interrupt_vector, Some(VectorId::new(200)));
        assert!(loaded.solicited_only);
        assert_eq!(loaded.order, 10);

        table.set_interrupt(1, None, true);
        let loaded = table.load(1).unwrap();
        assert!(loaded.valid);
        assert_eq!(loaded.interrupt_vector, None);
        assert!(!loaded.solicited_only);
    }

    #[test]
    fn test_ct_counter_and_threshold() {
        let table = CtDescriptorTable::new(4);
        table
            .publish(&CtDescriptor {
                index: 2,
                interface: 0,
                success: 1,
                failure: 0,
                threshold: 5,
                valid: true,
                interrupt_vector: None,
            })
            .unwrap();

        assert!(table.is_valid(2));
        assert!(!table.is_triggered(2));
        assert_eq!(table.add_success(2, 4), 5);
        assert!(table.is_triggered(2));

        table.set_threshold(2, 9);
        assert!(!table.is_triggered(2));
        assert_eq!(table.load(2).unwrap().threshold, 9);
    }

    #[test]
    fn test_ct_set_interrupt() {
        let table = CtDescriptorTable::new(2);
        table
            .publish(&CtDescriptor {
                index: 0,
                interface: 1,
                success: 0,
                failure: 0,
                threshold: 1,
                valid: true,
                interrupt_vector: None,
            })
            .unwrap();

        table.set_interrupt(0, Some(VectorId::new(9)));
        let loaded = table.load(0).unwrap();
        assert_eq!(loaded.interrupt_vector, Some(VectorId::new(9)));
        assert_eq!(loaded.interface, 1);
        assert!(loaded.valid);

        assert!(table.invalidate(0));
        assert_eq!(table.load(0).unwrap().interrupt_vector, Some(VectorId::new(9)));
    }
}

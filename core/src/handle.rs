//! # Handle Tables
//!
//! Per-context handle allocation for event queues, counting events and
//! channels. Event-queue and counting-event handles are partitioned per
//! interface: the partition is `handle / per_partition`, so every handle
//! encodes the interface it was allocated on.
//!
//! A released handle whose management object still has waiters is kept as a
//! retired tombstone until the last waiter lets go. This keeps the index from
//! being reused underneath a sleeping thread.

use core::fmt;
use std::sync::{Arc, Weak};

use slab::Slab;

use crate::error::{EventError, EventResult};
use crate::object::ManagementObject;

// =============================================================================
// Handle Types
// =============================================================================

macro_rules! event_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u16);

        impl $name {
            /// Wrap a raw table index
            pub const fn new(raw: u16) -> Self {
                Self(raw)
            }

            /// Raw table index
            pub const fn raw(self) -> u16 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

event_handle!(
    /// Event-queue handle; also the descriptor index
    EqHandle,
    "eq"
);

event_handle!(
    /// Counting-event handle; also the descriptor index
    CtHandle,
    "ct"
);

event_handle!(
    /// Event-channel handle
    ChannelHandle,
    "ec"
);

/// An object that can be waited on or attached to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Event queue
    Eq(EqHandle),
    /// Counting event
    Ct(CtHandle),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(handle) => fmt::Display::fmt(handle, f),
            Self::Ct(handle) => fmt::Display::fmt(handle, f),
        }
    }
}

// =============================================================================
// Handle Table
// =============================================================================

enum Slot<T> {
    Live(T),
    Retired(Weak<ManagementObject>),
}

/// Partitioned handle table
pub struct HandleTable<T> {
    kind: &'static str,
    partitions: Box<[Slab<Slot<T>>]>,
    per_partition: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table of `partitions * per_partition` handles
    pub fn new(kind: &'static str, partitions: usize, per_partition: usize) -> Self {
        Self {
            kind,
            partitions: (0..partitions).map(|_| Slab::new()).collect(),
            per_partition,
        }
    }

    /// Total handle capacity
    pub fn capacity(&self) -> usize {
        self.partitions.len() * self.per_partition
    }

    /// Partition a handle belongs to
    pub fn partition_of(&self, raw: u16) -> usize {
        raw as usize / self.per_partition
    }

    fn locate(&self, raw: u16) -> Option<(usize, usize)> {
        let partition = self.partition_of(raw);
        (partition < self.partitions.len())
            .then_some((partition, raw as usize % self.per_partition))
    }

    /// Allocate a free handle in `partition`, building the value
    /// from the handle
    pub fn insert_with(
        &mut self,
        partition: usize,
        make: impl FnOnce(u16) -> T,
    ) -> EventResult<u16> {
        let per_partition = self.per_partition;
        let kind = self.kind;
        let slab = self
            .partitions
            .get_mut(partition)
            .ok_or(EventError::InvalidArgument)?;

        if slab.len() >= per_partition {
            slab.retain(|_, slot| !matches!(slot, Slot::Retired(w) if w.strong_count() == 0));
        }
        if slab.len() >= per_partition {
            log::warn!("{} handles exhausted on partition {}", kind, partition);
            return Err(EventError::ResourceExhausted);
        }

        let entry = slab.vacant_entry();
        let raw = (partition * per_partition + entry.key()) as u16;
        entry.insert(Slot::Live(make(raw)));
        Ok(raw)
    }

    /// Live value for a handle
    pub fn get(&self, raw: u16) -> Option<&T> {
        let (partition, key) = self.locate(raw)?;
        match self.partitions[partition].get(key)? {
            Slot::Live(value) => Some(value),
            Slot::Retired(_) => None,
        }
    }

    /// Live value for a handle, mutably
    pub fn get_mut(&mut self, raw: u16) -> Option<&mut T> {
        let (partition, key) = self.locate(raw)?;
        match self.partitions[partition].get_mut(key)? {
            Slot::Live(value) => Some(value),
            Slot::Retired(_) => None,
        }
    }

    /// Free a live handle immediately
    pub fn remove(&mut self, raw: u16) -> Option<T> {
        let (partition, key) = self.locate(raw)?;
        let slab = &mut self.partitions[partition];
        if !matches!(slab.get(key), Some(Slot::Live(_))) {
            return None;
        }
        match slab.remove(key) {
            Slot::Live(value) => Some(value),
            Slot::Retired(_) => None,
        }
    }

    /// Take a live value out but keep the handle reserved until `object`
    /// has no strong references left
    pub fn retire(&mut self, raw: u16, object: &Arc<ManagementObject>) -> Option<T> {
        let (partition, key) = self.locate(raw)?;
        let slot = self.partitions[partition].get_mut(key)?;
        if !matches!(slot, Slot::Live(_)) {
            return None;
        }
        match std::mem::replace(slot, Slot::Retired(Arc::downgrade(object))) {
            Slot::Live(value) => Some(value),
            Slot::Retired(_) => None,
        }
    }

    /// Free a retired handle held for `object` once no strong reference to
    /// it is left
    pub fn reclaim(&mut self, raw: u16, object: &Weak<ManagementObject>) -> bool {
        let Some((partition, key)) = self.locate(raw) else {
            return false;
        };
        let slab = &mut self.partitions[partition];
        let reclaimable = matches!(
            slab.get(key),
            Some(Slot::Retired(w)) if w.ptr_eq(object) && object.strong_count() == 0
        );
        if reclaimable {
            slab.remove(key);
        }
        reclaimable
    }

    /// Handle is live
    pub fn contains(&self, raw: u16) -> bool {
        self.get(raw).is_some()
    }

    /// Handle is reserved by a retired tombstone
    pub fn is_retired(&self, raw: u16) -> bool {
        self.locate(raw).is_some_and(|(partition, key)| {
            matches!(self.partitions[partition].get(key), Some(Slot::Retired(_)))
        })
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .flat_map(|slab| slab.iter())
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// No live handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles in ascending order
    pub fn handles(&self) -> Vec<u16> {
        self.iter_live().map(|(raw, _)| raw).collect()
    }

    fn iter_live(&self) -> impl Iterator<Item = (u16, &T)> + '_ {
        let per_partition = self.per_partition;
        self.partitions
            .iter()
            .enumerate()
            .flat_map(move |(partition, slab)| {
                slab.iter().filter_map(move |(key, slot)| match slot {
                    Slot::Live(value) => Some(((partition * per_partition + key) as u16, value)),
                    Slot::Retired(_) => None,
                })
            })
    }

    /// Remove every handle, returning live values in ascending handle order
    pub fn drain(&mut self) -> Vec<(u16, T)> {
        let per_partition = self.per_partition;
        let mut drained = Vec::new();
        for (partition, slab) in self.partitions.iter_mut().enumerate() {
            for (key, slot) in std::mem::take(slab) {
                if let Slot::Live(value) = slot {
                    drained.push(((partition * per_partition + key) as u16, value));
                }
            }
        }
        drained
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .field("live", &self.len())
            .finish()
    }
}

//! # Fabric Event Engine
//!
//! Event notification for a fabric adapter. Clients assign hardware event
//! queues and counting events, then either poll them, block on them
//! directly, or gather several of them into an event channel and block on
//! the channel. Interrupts from the adapter arrive through
//! [`EventEngine::dispatch`] and wake whichever waiters are armed on the
//! raised vector.
//!
//! ## Components
//!
//! - **Engine**: Device-wide state and the interrupt entry point
//! - **Contexts**: Per-client handle tables and the event API
//! - **Interrupt Router**: Round-robin vector pool and per-vector dispatch
//! - **Management Objects**: Arm state and wait queue of one event source
//! - **Event Channels**: Multiplexed waits in attach order
//! - **Handle Tables**: Interface-partitioned handle allocation
//! - **Wait Engine**: Timeout-bounded, interruptible blocking waits
//! - **Completion Notifier**: One-shot completion-queue notification
//!
//! ## Lock Order
//!
//! Context lock, then table mutex, then interrupt-safe spinlocks. See
//! [`sync`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod context;
pub mod cq;
pub mod engine;
pub mod error;
pub mod handle;
pub mod object;
pub mod router;
pub mod sync;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelMode, EventChannel};
pub use config::{ContextKind, EngineConfig};
pub use context::{ChannelEvent, CtAssign, CtEvent, EqAssign, EqEvent, EqMode, EventContext};
pub use cq::{CompletionHandler, CompletionNotifier};
pub use engine::EventEngine;
pub use error::{EventError, EventResult};
pub use handle::{ChannelHandle, CtHandle, EqHandle, EventSource};
pub use object::{IsrCallback, ManagementObject, ObjectMode};
pub use router::InterruptRouter;
pub use wait::{Signal, Timeout, WaitOptions, Wakeup};

/// Engine version
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

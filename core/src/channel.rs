//! # Event Channels
//!
//! A channel multiplexes blocking waits across several event queues or
//! several counting events. Members are kept in attach order; a channel wait
//! reports the earliest-attached member that is ready.

use std::sync::Arc;

use crate::error::{EventError, EventResult};
use crate::handle::{ChannelHandle, EventSource};
use crate::wait::WaitQueue;

/// Kind of members a channel holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Event queues; an interrupt wakes one waiter
    EventQueue,
    /// Counting events; an interrupt wakes every waiter
    CountingEvent,
}

impl ChannelMode {
    /// Mode a member of this kind requires
    pub fn of(source: EventSource) -> Self {
        match source {
            EventSource::Eq(_) => Self::EventQueue,
            EventSource::Ct(_) => Self::CountingEvent,
        }
    }
}

/// The part of a channel interrupt dispatch can reach
#[derive(Debug)]
pub(crate) struct ChannelShared {
    handle: ChannelHandle,
    queue: WaitQueue,
}

impl ChannelShared {
    pub(crate) fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub(crate) fn queue(&self) -> &WaitQueue {
        &self.queue
    }
}

/// An event channel
#[derive(Debug)]
pub struct EventChannel {
    shared: Arc<ChannelShared>,
    mode: Option<ChannelMode>,
    members: Vec<EventSource>,
}

impl EventChannel {
    pub(crate) fn new(handle: ChannelHandle) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                handle,
                queue: WaitQueue::new(),
            }),
            mode: None,
            members: Vec::new(),
        }
    }

    /// Channel handle
    pub fn handle(&self) -> ChannelHandle {
        self.shared.handle
    }

    /// Mode fixed by the current members; `None` while empty
    pub fn mode(&self) -> Option<ChannelMode> {
        if self.members.is_empty() {
            None
        } else {
            self.mode
        }
    }

    /// Members in attach order
    pub fn members(&self) -> &[EventSource] {
        &self.members
    }

    /// No members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Threads blocked in a wait on this channel
    pub fn waiters(&self) -> usize {
        self.shared.queue.waiters()
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    /// Check that `source` may join
    pub(crate) fn admit(&self, source: EventSource) -> EventResult<ChannelMode> {
        let mode = ChannelMode::of(source);
        match self.mode() {
            Some(current) if current != mode => {
                log::debug!(
                    "{}: {} does not match channel mode {:?}",
                    self.handle(),
                    source,
                    current
                );
                Err(EventError::InvalidArgument)
            },
            _ => Ok(mode),
        }
    }

    /// Append a member; the first member fixes the mode
    pub(crate) fn link(&mut self, source: EventSource) {
        if self.members.is_empty() {
            self.mode = Some(ChannelMode::of(source));
        }
        self.members.push(source);
    }

    /// Remove a member, keeping the order of the rest
    pub(crate) fn unlink(&mut self, source: EventSource) -> bool {
        match self.members.iter().position(|&m| m == source) {
            Some(pos) => {
                self.members.remove(pos);
                true
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CtHandle, EqHandle};

    fn eq(raw: u16) -> EventSource {
        EventSource::Eq(EqHandle::new(raw))
    }

    fn ct(raw: u16) -> EventSource {
        EventSource::Ct(CtHandle::new(raw))
    }

    #[test]
    fn test_first_member_fixes_mode() {
        let mut channel = EventChannel::new(ChannelHandle::new(0));
        assert_eq!(channel.mode(), None);
        assert_eq!(channel.admit(ct(1)), Ok(ChannelMode::CountingEvent));

        channel.link(eq(4));
        assert_eq!(channel.mode(), Some(ChannelMode::EventQueue));
        assert_eq!(channel.admit(ct(1)), Err(EventError::InvalidArgument));
        assert_eq!(channel.admit(eq(5)), Ok(ChannelMode::EventQueue));
    }

    #[test]
    fn test_mode_resets_when_empty() {
        let mut channel = EventChannel::new(ChannelHandle::new(0));
        channel.link(eq(1));
        assert!(channel.unlink(eq(1)));
        assert!(channel.is_empty());
        assert_eq!(channel.admit(ct(2)), Ok(ChannelMode::CountingEvent));
    }

    #[test]
    fn test_unlink_keeps_order() {
        let mut channel = EventChannel::new(ChannelHandle::new(3));
        for raw in [7, 2, 9] {
            channel.link(eq(raw));
        }
        assert!(channel.unlink(eq(2)));
        assert!(!channel.unlink(eq(2)));
        assert_eq!(channel.members(), &[eq(7), eq(9)]);
        assert_eq!(channel.len(), 2);
    }
}

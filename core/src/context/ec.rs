//! Event channels: multiplexed waits over several event queues or counters

use std::sync::Arc;

use super::blocking::{settle, Readiness};
use super::EventContext;
use crate::channel::{ChannelShared, EventChannel};
use crate::error::{EventError, EventResult};
use crate::handle::{ChannelHandle, EventSource};
use crate::object::{Association, DispatchTarget};
use crate::wait::{self, WaitOptions, Wakeup};

/// A member claimed by a channel wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    /// Member that was ready; it has left the channel
    pub source: EventSource,
    /// Attach-time user data for event queues, threshold for counters
    pub value: u64,
}

impl EventContext {
    /// Create an empty channel
    pub fn assign_channel(&self) -> EventResult<ChannelHandle> {
        let state = self.state.read();
        state.check_attached()?;
        let mut tables = self.tables.lock(&state);
        let raw = tables
            .channels
            .insert_with(0, |raw| EventChannel::new(ChannelHandle::new(raw)))?;
        let handle = ChannelHandle::new(raw);
        log::debug!("context {}: {} assigned", self.id, handle);
        Ok(handle)
    }

    /// Destroy an empty channel
    ///
    /// A channel with members is `Busy`; its waiters keep waiting.
    pub fn release_channel(&self, handle: ChannelHandle) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);
        let channel = tables
            .channels
            .get(handle.raw())
            .ok_or(EventError::InvalidArgument)?;
        if !channel.is_empty() {
            log::debug!("{}: release with {} members", handle, channel.len());
            return Err(EventError::Busy);
        }
        if let Some(channel) = tables.channels.remove(handle.raw()) {
            channel.shared().queue().wake_all();
        }
        log::debug!("context {}: {} released", self.id, handle);
        Ok(())
    }

    /// Add an event queue or counter to a channel and arm it
    ///
    /// `user_data` is reported back when an event-queue member is claimed.
    /// A source already in a channel is `AlreadyAssociated`; one being
    /// waited on directly is `Busy`.
    pub fn attach_to_channel(
        &self,
        handle: ChannelHandle,
        source: EventSource,
        user_data: u64,
        arm_token: u64,
    ) -> EventResult<()> {
        let state = self.state.read();
        state.check_open()?;
        let mut tables = self.tables.lock(&state);

        let channel = tables
            .channels
            .get(handle.raw())
            .ok_or(EventError::InvalidArgument)?;
        let mode = channel.admit(source)?;
        let shared = channel.shared().clone();

        let object = self.setup_object(&mut tables, source)?;
        let managed = tables
            .managed_mut(source)
            .ok_or(EventError::InvalidArgument)?;
        match managed.association() {
            Some(Association::Channel(current)) => {
                log::debug!("{}: already in {}", source, current);
                return Err(EventError::AlreadyAssociated);
            },
            Some(Association::SelfChannel) => return Err(EventError::Busy),
            None => {},
        }

        managed.user_handle = user_data;
        managed.associate(Association::Channel(handle));
        let target = DispatchTarget::Channel { shared, mode };
        if let Err(err) = self.arm_source(&object, source, target, false, arm_token) {
            managed.dissociate();
            return Err(err);
        }

        if let Some(channel) = tables.channels.get_mut(handle.raw()) {
            channel.link(source);
        }
        log::debug!("{} attached to {}", source, handle);
        Ok(())
    }

    /// Block until a member is ready and claim it
    ///
    /// Members are scanned in attach order. The claimed member leaves the
    /// channel, is disarmed and owes one acknowledgement. An empty channel
    /// reports `Released`. If the disarm command fails the member still
    /// leaves the channel but owes no acknowledgement.
    pub fn wait_channel(
        &self,
        handle: ChannelHandle,
        options: &WaitOptions,
    ) -> EventResult<Wakeup<ChannelEvent>> {
        let shared = {
            let state = self.state.read();
            state.check_open()?;
            let tables = self.tables.lock(&state);
            let channel = tables
                .channels
                .get(handle.raw())
                .ok_or(EventError::InvalidArgument)?;
            if channel.is_empty() {
                return Ok(Wakeup::Released);
            }
            channel.shared().clone()
        };

        let status = wait::wait_event(
            shared.queue(),
            options.timeout,
            options.signal.as_deref(),
            || self.claim_member(handle, &shared, options.disarm_token),
        );
        let outcome = settle(status)?;
        if outcome.is_ready() {
            self.pass_wakeup(handle, &shared);
        }
        Ok(outcome)
    }

    /// Wait condition: claim the first ready member
    fn claim_member(
        &self,
        handle: ChannelHandle,
        shared: &Arc<ChannelShared>,
        disarm_token: u64,
    ) -> Option<Readiness<ChannelEvent>> {
        let state = self.state.read();
        if state.closed {
            return Some(Readiness::Released);
        }
        let mut tables = self.tables.lock(&state);

        let Some(channel) = tables
            .channels
            .get(handle.raw())
            .filter(|channel| Arc::ptr_eq(channel.shared(), shared))
        else {
            return Some(Readiness::Released);
        };
        if channel.is_empty() {
            return Some(Readiness::Released);
        }
        let source = channel
            .members()
            .iter()
            .copied()
            .find(|&member| self.is_ready(&tables, member))?;

        let emptied = match tables.channels.get_mut(handle.raw()) {
            Some(channel) => {
                channel.unlink(source);
                channel.is_empty()
            },
            None => true,
        };
        let Some(managed) = tables.managed_mut(source) else {
            return Some(Readiness::Released);
        };
        managed.dissociate();
        let object = managed.object.clone();
        let value = match source {
            EventSource::Eq(_) => managed.user_handle,
            EventSource::Ct(ct) => self.ct_descs.threshold(ct.raw()),
        };

        let disarmed = self.disarm_source(&object, source, disarm_token);
        if disarmed.is_ok() {
            managed.unacked += 1;
        }
        if emptied {
            shared.queue().wake_all();
        }
        log::trace!("{}: claimed {}", handle, source);
        Some(match disarmed {
            Ok(()) => Readiness::Ready(ChannelEvent { source, value }),
            Err(err) => Readiness::Failed(err),
        })
    }

    /// A single wakeup may have been consumed by a waiter that claimed a
    /// different member; hand it on if another member is still ready.
    fn pass_wakeup(&self, handle: ChannelHandle, shared: &Arc<ChannelShared>) {
        let state = self.state.read();
        if state.closed {
            return;
        }
        let tables = self.tables.lock(&state);
        let pending = tables
            .channels
            .get(handle.raw())
            .filter(|channel| Arc::ptr_eq(channel.shared(), shared))
            .is_some_and(|channel| {
                channel
                    .members()
                    .iter()
                    .any(|&member| self.is_ready(&tables, member))
            });
        if pending {
            shared.queue().wake_one();
        }
    }
}

//! # Completion-Queue Notifier
//!
//! Verbs-style completion notification layered on hardware event queues.
//! A [`CompletionNotifier`] is armed on a vector; the next interrupt on that
//! vector calls its handler once, turns interrupts off on every bound event
//! queue and takes the notifier off the vector. The consumer re-arms when it
//! wants the next notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fabric_hal::{DescriptorUpdate, EqDescriptorTable, FabricDevice, VectorId};

use crate::engine::EventEngine;
use crate::error::{EventError, EventResult};
use crate::object::{DispatchTarget, ManagementObject, ObjectMode};
use crate::router::InterruptRouter;
use crate::sync::{ContextLock, EventMutex, IrqLock};

/// Receives completion notifications
///
/// Called from interrupt dispatch: must not block and must not re-arm the
/// notifier synchronously.
pub trait CompletionHandler: Send + Sync {
    /// A completion is pending on one of the bound event queues
    fn on_completion(&self);
}

impl<F: Fn() + Send + Sync> CompletionHandler for F {
    fn on_completion(&self) {
        self()
    }
}

/// A hardware event queue feeding a notifier
pub(crate) struct CqBinding {
    pub(crate) context: u64,
    pub(crate) index: u16,
    pub(crate) interface: u8,
    pub(crate) descriptors: Arc<EqDescriptorTable>,
    pub(crate) arm_token: u64,
    pub(crate) disarm_token: u64,
}

/// The part of a notifier interrupt dispatch can reach
pub(crate) struct CqShared {
    handler: Box<dyn CompletionHandler>,
    device: Arc<dyn FabricDevice>,
    bindings: IrqLock<Vec<CqBinding>>,
    solicited: AtomicBool,
}

impl CqShared {
    /// One-shot delivery: quiesce the bound queues, then notify
    pub(crate) fn on_interrupt(&self) {
        for binding in self.bindings.lock().iter() {
            self.program(binding, None);
        }
        self.handler.on_completion();
    }

    /// Reprogram one bound queue's interrupt without waiting for completion
    fn program(&self, binding: &CqBinding, vector: Option<VectorId>) {
        let solicited = vector.is_some() && self.solicited.load(Ordering::Acquire);
        let token = if vector.is_some() {
            binding.arm_token
        } else {
            binding.disarm_token
        };
        let update =
            DescriptorUpdate::interrupt(binding.index, binding.interface, vector, solicited, token)
                .without_completion();
        if let Err(err) = self.device.issue_descriptor_update(&update) {
            log::error!("eq{}: completion-queue interrupt update failed: {}", binding.index, err);
        }
        binding
            .descriptors
            .set_interrupt(binding.index, vector, solicited);
    }
}

/// Completion-queue notifier
pub struct CompletionNotifier {
    object: Arc<ManagementObject>,
    shared: Arc<CqShared>,
    router: Arc<InterruptRouter>,
    gate: ContextLock<()>,
    serial: EventMutex<()>,
}

impl CompletionNotifier {
    /// Create an unarmed notifier with no bound queues
    pub fn new(engine: &EventEngine, handler: impl CompletionHandler + 'static) -> Self {
        Self {
            object: Arc::new(ManagementObject::new(ObjectMode::IbCompletionQueue, None)),
            shared: Arc::new(CqShared {
                handler: Box::new(handler),
                device: engine.device().clone(),
                bindings: IrqLock::new(Vec::new()),
                solicited: AtomicBool::new(false),
            }),
            router: engine.router().clone(),
            gate: ContextLock::new(()),
            serial: EventMutex::new(()),
        }
    }

    /// Request one notification on the next (solicited) completion
    ///
    /// Arming an armed notifier moves it to a fresh vector.
    pub fn arm(&self, solicited: bool) -> VectorId {
        let gate = self.gate.read();
        let _serial = self.serial.lock(&gate);

        self.router.disarm(&self.object);
        let vector = self.router.assign_vector();
        self.shared.solicited.store(solicited, Ordering::Release);
        self.router.arm(
            &self.object,
            vector,
            DispatchTarget::CompletionQueue(self.shared.clone()),
        );
        for binding in self.shared.bindings.lock().iter() {
            self.shared.program(binding, Some(vector));
        }
        vector
    }

    /// Notifier is waiting for an interrupt
    pub fn is_armed(&self) -> bool {
        self.object.is_armed()
    }

    /// Vector the notifier is armed on
    pub fn vector(&self) -> Option<VectorId> {
        self.object.vector()
    }

    /// Cancel a pending notification. Returns false if not armed.
    pub fn disarm(&self) -> bool {
        let gate = self.gate.read();
        let _serial = self.serial.lock(&gate);

        if !self.router.disarm(&self.object) {
            return false;
        }
        for binding in self.shared.bindings.lock().iter() {
            self.shared.program(binding, None);
        }
        true
    }

    /// Number of bound event queues
    pub fn bound(&self) -> usize {
        self.shared.bindings.lock().len()
    }

    pub(crate) fn bind(&self, binding: CqBinding) -> EventResult<()> {
        let mut bindings = self.shared.bindings.lock();
        if bindings
            .iter()
            .any(|b| b.context == binding.context && b.index == binding.index)
        {
            return Err(EventError::AlreadyAssociated);
        }
        if let Some(vector) = self.object.vector() {
            self.shared.program(&binding, Some(vector));
        }
        bindings.push(binding);
        Ok(())
    }

    pub(crate) fn unbind(&self, context: u64, index: u16) -> EventResult<()> {
        let mut bindings = self.shared.bindings.lock();
        let pos = bindings
            .iter()
            .position(|b| b.context == context && b.index == index)
            .ok_or(EventError::InvalidArgument)?;
        let binding = bindings.remove(pos);
        if self.object.is_armed() {
            self.shared.program(&binding, None);
        }
        Ok(())
    }
}

impl core::fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("vector", &self.vector())
            .field("bound", &self.bound())
            .finish()
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextKind, EngineConfig};
    use crate::context::{EqAssign, EqMode};
    use crate::testing::SimDevice;
    use fabric_hal::UpdatePayload;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<SimDevice>, EventEngine) {
        let device = Arc::new(SimDevice::new());
        let engine = EventEngine::new(EngineConfig::compact(), device.clone()).unwrap();
        (device, engine)
    }

    fn counting_handler() -> (Arc<AtomicUsize>, impl CompletionHandler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        (hits, move || {
            seen.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_arm_fires_once() {
        let (_device, engine) = setup();
        let (hits, handler) = counting_handler();
        let notifier = CompletionNotifier::new(&engine, handler);

        assert!(!notifier.is_armed());
        let vector = notifier.arm(false);
        assert!(notifier.is_armed());

        assert_eq!(engine.dispatch(vector), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!notifier.is_armed());

        assert_eq!(engine.dispatch(vector), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disarm_is_idempotent() {
        let (_device, engine) = setup();
        let (hits, handler) = counting_handler();
        let notifier = CompletionNotifier::new(&engine, handler);

        assert!(!notifier.disarm());
        let vector = notifier.arm(true);
        assert!(notifier.disarm());
        assert!(!notifier.disarm());
        engine.dispatch(vector);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bound_queue_programmed_and_quiesced() {
        let (device, engine) = setup();
        let ctx = engine.open_context(ContextKind::Kernel).unwrap();
        let eq = ctx
            .assign_eq(EqAssign::new(0, 0x10000, 64))
            .unwrap();

        let (hits, handler) = counting_handler();
        let notifier = CompletionNotifier::new(&engine, handler);
        ctx.bind_eq_to_cq(eq, &notifier, 11, 22).unwrap();
        assert_eq!(
            ctx.bind_eq_to_cq(eq, &notifier, 11, 22),
            Err(EventError::AlreadyAssociated)
        );

        let vector = notifier.arm(true);
        let desc = ctx.eq_descriptor(eq).unwrap();
        assert_eq!(desc.interrupt_vector, Some(vector));
        assert!(desc.solicited_only);

        let last = device.last_command().unwrap();
        assert_eq!(
            last.payload,
            UpdatePayload::Interrupt {
                vector: Some(vector),
                solicited: true
            }
        );
        assert!(!last.completion);
        assert_eq!(last.user_token, 11);

        engine.dispatch(vector);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.eq_descriptor(eq).unwrap().interrupt_vector, None);
        assert_eq!(device.last_command().unwrap().user_token, 22);

        ctx.unbind_eq_from_cq(eq, &notifier).unwrap();
        assert_eq!(
            ctx.unbind_eq_from_cq(eq, &notifier),
            Err(EventError::InvalidArgument)
        );
        assert_eq!(notifier.bound(), 0);
        ctx.release_eq(eq, 0).unwrap();
    }

    #[test]
    fn test_bind_while_armed_programs_immediately() {
        let (_device, engine) = setup();
        let ctx = engine.open_context(ContextKind::Kernel).unwrap();
        let eq = ctx
            .assign_eq(EqAssign::new(0, 0x20000, 64).with_mode(EqMode::Polled))
            .unwrap();

        let (_hits, handler) = counting_handler();
        let notifier = CompletionNotifier::new(&engine, handler);
        let vector = notifier.arm(false);

        ctx.bind_eq_to_cq(eq, &notifier, 1, 2).unwrap();
        assert_eq!(ctx.eq_descriptor(eq).unwrap().interrupt_vector, Some(vector));

        drop(notifier);
        assert_eq!(ctx.eq_descriptor(eq).unwrap().interrupt_vector, None);
    }
}

//! # Event Engine
//!
//! Device-wide state shared by every client context: the configuration,
//! the interrupt router and the device capabilities. Descriptor tables
//! belong to each context. The engine is also the interrupt entry point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fabric_hal::{FabricDevice, PagePinner, VectorId};

use crate::config::{ContextKind, EngineConfig};
use crate::context::EventContext;
use crate::error::{EventError, EventResult};
use crate::router::InterruptRouter;

/// Event-notification engine for one adapter
pub struct EventEngine {
    config: Arc<EngineConfig>,
    router: Arc<InterruptRouter>,
    device: Arc<dyn FabricDevice>,
    pinner: Option<Arc<dyn PagePinner>>,
    next_context: AtomicU64,
}

impl EventEngine {
    /// Create an engine over `device`
    pub fn new(config: EngineConfig, device: Arc<dyn FabricDevice>) -> EventResult<Self> {
        config.validate()?;
        log::debug!(
            "event engine: {} interfaces, {} vectors",
            config.num_interfaces,
            config.num_vectors
        );
        Ok(Self {
            router: Arc::new(InterruptRouter::new(config.num_vectors)),
            config: Arc::new(config),
            device,
            pinner: None,
            next_context: AtomicU64::new(1),
        })
    }

    /// Use `pinner` to pin user-context rings
    pub fn with_page_pinner(mut self, pinner: Arc<dyn PagePinner>) -> Self {
        self.pinner = Some(pinner);
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Interrupt router
    pub fn router(&self) -> &Arc<InterruptRouter> {
        &self.router
    }

    /// Adapter command interface
    pub fn device(&self) -> &Arc<dyn FabricDevice> {
        &self.device
    }

    pub(crate) fn config_arc(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub(crate) fn pinner(&self) -> Option<&Arc<dyn PagePinner>> {
        self.pinner.as_ref()
    }

    /// Create a client context
    ///
    /// User contexts need a page pinner and start unattached.
    pub fn open_context(&self, kind: ContextKind) -> EventResult<Arc<EventContext>> {
        if kind == ContextKind::User && self.pinner.is_none() {
            return Err(EventError::InvalidArgument);
        }
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        log::debug!("context {} opened ({:?})", id, kind);
        Ok(Arc::new(EventContext::new(id, kind, self)))
    }

    /// Tear down a context whose client went away
    pub fn on_client_context_closed(&self, context: &EventContext) {
        context.close();
    }

    /// Interrupt entry point
    pub fn dispatch(&self, vector: VectorId) -> usize {
        self.router.dispatch(vector)
    }
}

impl core::fmt::Debug for EventEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventEngine")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("pinner", &self.pinner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimDevice;

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            num_vectors: 0,
            ..EngineConfig::compact()
        };
        let result = EventEngine::new(config, Arc::new(SimDevice::new()));
        assert_eq!(result.err(), Some(EventError::InvalidArgument));
    }

    #[test]
    fn test_user_context_needs_pinner() {
        let device = Arc::new(SimDevice::new());
        let engine = EventEngine::new(EngineConfig::compact(), device.clone()).unwrap();
        assert_eq!(
            engine.open_context(ContextKind::User).err(),
            Some(EventError::InvalidArgument)
        );

        let engine = engine.with_page_pinner(device);
        assert!(engine.open_context(ContextKind::User).is_ok());
    }

    #[test]
    fn test_contexts_get_distinct_ids() {
        let engine = EventEngine::new(EngineConfig::compact(), Arc::new(SimDevice::new())).unwrap();
        let a = engine.open_context(ContextKind::Kernel).unwrap();
        let b = engine.open_context(ContextKind::Kernel).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_router_sized_from_config() {
        let engine = EventEngine::new(EngineConfig::compact(), Arc::new(SimDevice::new())).unwrap();
        assert_eq!(engine.router().num_vectors(), 8);
    }
}

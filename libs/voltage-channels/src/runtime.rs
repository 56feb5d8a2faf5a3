//! Process-wide channel runtime
//!
//! Bundles the registry, bus, diagnostics sink, configuration and transport.
//! Applications either build their own `ChannelRuntime` or install one in the
//! global slot with `init_global`.

use std::sync::Arc;

use errors::{ChannelError, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::bus::NotificationBus;
use crate::config::ChannelsConfig;
use crate::descriptors::LocalChannelDescriptor;
use crate::diagnostics::Diagnostics;
use crate::handle::ChannelHandle;
use crate::handler::{ChannelsHandler, HandlerOptions};
use crate::identity::ChannelIdentity;
use crate::registry::ChannelsRegistry;
use crate::transport::{ChannelTransport, MemoryTransport};

static GLOBAL_RUNTIME: RwLock<Option<Arc<ChannelRuntime>>> = RwLock::new(None);

pub struct ChannelRuntime {
    config: ChannelsConfig,
    diagnostics: Arc<Diagnostics>,
    bus: Arc<NotificationBus>,
    registry: ChannelsRegistry,
}

impl ChannelRuntime {
    pub fn new(config: ChannelsConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(
            config.diagnostics_capacity,
            config.warnings_capacity,
        ));
        let bus = Arc::new(NotificationBus::with_diagnostics(diagnostics.clone()));
        let registry = ChannelsRegistry::new(transport, bus.clone(), config.clone());
        info!(
            "Channel runtime ready (transport: {})",
            registry.transport().name()
        );
        Self {
            config,
            diagnostics,
            bus,
            registry,
        }
    }

    /// Runtime over an in-process `MemoryTransport`
    pub fn in_memory(config: ChannelsConfig) -> (Self, MemoryTransport) {
        let transport = MemoryTransport::new();
        (Self::new(config, Arc::new(transport.clone())), transport)
    }

    /// Install the process-wide runtime; fails if one is already installed
    pub fn init_global(
        config: ChannelsConfig,
        transport: Arc<dyn ChannelTransport>,
    ) -> Result<Arc<ChannelRuntime>> {
        let mut slot = GLOBAL_RUNTIME.write();
        if slot.is_some() {
            return Err(ChannelError::usage("global channel runtime already initialised"));
        }
        let runtime = Arc::new(Self::new(config, transport));
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// The process-wide runtime, created over a `MemoryTransport` on first use
    pub fn global() -> Arc<ChannelRuntime> {
        if let Some(runtime) = Self::try_global() {
            return runtime;
        }
        let mut slot = GLOBAL_RUNTIME.write();
        slot.get_or_insert_with(|| {
            warn!("No channel runtime installed, using an in-memory transport");
            Arc::new(Self::new(
                ChannelsConfig::default(),
                Arc::new(MemoryTransport::new()),
            ))
        })
        .clone()
    }

    pub fn try_global() -> Option<Arc<ChannelRuntime>> {
        GLOBAL_RUNTIME.read().clone()
    }

    /// Tear down every channel of the global runtime and clear the slot
    ///
    /// Returns the number of channels torn down.
    pub fn reset_global() -> usize {
        let runtime = GLOBAL_RUNTIME.write().take();
        runtime.map_or(0, |runtime| runtime.shutdown())
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn registry(&self) -> &ChannelsRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        self.registry.transport()
    }

    pub fn get_or_create(&self, identity: impl Into<ChannelIdentity>) -> ChannelHandle {
        self.registry.get_or_create(identity)
    }

    pub fn create_local(
        &self,
        descriptor: LocalChannelDescriptor,
        initially_connected: bool,
    ) -> Result<ChannelHandle> {
        self.registry.create_local(descriptor, initially_connected)
    }

    pub fn get_or_create_local(
        &self,
        descriptor: LocalChannelDescriptor,
        initially_connected: bool,
    ) -> Result<ChannelHandle> {
        self.registry
            .get_or_create_local(descriptor, initially_connected)
    }

    /// A group handler on this runtime's bus with configured defaults
    pub fn handler(&self, name: impl Into<String>) -> ChannelsHandler {
        self.handler_with(HandlerOptions::from_config(&self.config).with_name(name))
    }

    pub fn handler_with(&self, options: HandlerOptions) -> ChannelsHandler {
        ChannelsHandler::new(self.bus.clone(), options)
    }

    /// Tear down every registered channel and stop the transport
    pub fn shutdown(&self) -> usize {
        let count = self.registry.teardown_all();
        self.transport().shutdown();
        info!("Channel runtime shut down, {} channels closed", count);
        count
    }
}

impl std::fmt::Debug for ChannelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRuntime")
            .field("transport", &self.transport().name())
            .field("channels", &self.registry.len())
            .field("recipients", &self.bus.recipient_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    #[serial]
    async fn test_global_lifecycle() {
        ChannelRuntime::reset_global();
        assert!(ChannelRuntime::try_global().is_none());

        let (runtime, transport) = ChannelRuntime::in_memory(ChannelsConfig::default());
        drop(runtime);
        let installed =
            ChannelRuntime::init_global(ChannelsConfig::default(), Arc::new(transport)).unwrap();
        assert!(
            ChannelRuntime::init_global(ChannelsConfig::default(), Arc::new(MemoryTransport::new()))
                .is_err()
        );
        assert!(Arc::ptr_eq(&installed, &ChannelRuntime::global()));

        let handle = installed.get_or_create("global:pv");
        assert_eq!(ChannelRuntime::reset_global(), 1);
        assert!(installed.registry().is_empty());
        handle.release().unwrap();
        assert!(ChannelRuntime::try_global().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_global_falls_back_to_memory() {
        ChannelRuntime::reset_global();
        let runtime = ChannelRuntime::global();
        assert_eq!(runtime.transport().name(), "memory");
        assert!(Arc::ptr_eq(&runtime, &ChannelRuntime::global()));
        ChannelRuntime::reset_global();
    }

    #[tokio::test]
    async fn test_handler_uses_config_timeout() {
        let config = ChannelsConfig {
            connect_timeout_ms: 50,
            ..ChannelsConfig::default()
        };
        let (runtime, _transport) = ChannelRuntime::in_memory(config);
        let handler = runtime.handler("ready-check");
        handler
            .install(runtime.get_or_create("never:served"), Default::default())
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(!handler.wait_until_ready().await);
        assert!(started.elapsed() >= Duration::from_millis(50));
        handler.dispose();
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_is_logged() {
        let (runtime, _transport) = ChannelRuntime::in_memory(ChannelsConfig::default());
        let _handle = runtime.get_or_create("logged:pv");
        assert_eq!(runtime.shutdown(), 1);
        assert!(logs_contain("Channel runtime ready (transport: memory)"));
        assert!(logs_contain("Channel runtime shut down, 1 channels closed"));
    }
}

//! Shared fixtures for the channel runtime integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use voltage_channels::{
    ChannelsConfig, ChannelsRegistry, Diagnostics, FieldInfo, FieldType, FnRecipient,
    MemoryTransport, Notification, NotificationBus, NotificationRecipient,
};

pub struct Harness {
    pub registry: ChannelsRegistry,
    pub transport: MemoryTransport,
    pub diagnostics: Arc<Diagnostics>,
}

impl Harness {
    pub fn bus(&self) -> &Arc<NotificationBus> {
        self.registry.bus()
    }
}

pub fn harness() -> Harness {
    harness_with(ChannelsConfig::default())
}

static LOGGING: Once = Once::new();

/// Console logging for the test binary; `RUST_LOG` overrides the level
pub fn init_logging() {
    LOGGING.call_once(|| {
        let config = common::LogConfig {
            console_level: tracing::Level::ERROR,
            enable_file: false,
            ..Default::default()
        };
        if let Err(e) = common::logging::init_with_config(config) {
            eprintln!("test logging not initialised: {}", e);
        }
    });
}

pub fn harness_with(config: ChannelsConfig) -> Harness {
    init_logging();
    let diagnostics = Arc::new(Diagnostics::unbounded());
    let transport = MemoryTransport::new();
    let registry = ChannelsRegistry::new(
        Arc::new(transport.clone()),
        Arc::new(NotificationBus::with_diagnostics(diagnostics.clone())),
        config,
    );
    Harness {
        registry,
        transport,
        diagnostics,
    }
}

pub fn double() -> FieldInfo {
    FieldInfo::scalar(FieldType::Double)
}

/// Recipient that keeps every notification it sees
pub fn collector(name: &str) -> (Arc<dyn NotificationRecipient>, Arc<Mutex<Vec<Notification>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let recipient: Arc<dyn NotificationRecipient> = Arc::new(FnRecipient::new(
        name,
        move |n: &Notification| {
            sink.lock().push(n.clone());
            Ok(())
        },
    ));
    (recipient, seen)
}

//! Process-wide runtime tests
//!
//! Every test here touches the global slot and runs serially.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use voltage_channels::{
    ChannelCallbacks, ChannelRuntime, ChannelsConfig, FieldInfo, FieldType, MemoryTransport,
    ValueInfo,
};

#[tokio::test]
#[serial]
async fn installed_runtime_serves_handlers() {
    ChannelRuntime::reset_global();

    let transport = MemoryTransport::new();
    transport.serve(
        "feeder:current",
        FieldInfo::scalar(FieldType::Double),
        Some(ValueInfo::new(12.0)),
    );
    let config = ChannelsConfig {
        connect_timeout_ms: 500,
        diagnostics_capacity: Some(16),
        ..ChannelsConfig::default()
    };
    let runtime = ChannelRuntime::init_global(config, Arc::new(transport.clone())).unwrap();

    let handler = ChannelRuntime::global().handler("feeder-panel");
    handler
        .install(
            runtime.get_or_create("feeder:current"),
            ChannelCallbacks::new(),
        )
        .unwrap();
    assert!(handler.wait_until_ready().await);
    assert!(runtime.diagnostics().progress_count() >= 3);
    assert!(runtime.diagnostics().entries().len() <= 16);

    handler.dispose();
    assert!(runtime.registry().is_empty());
    assert_eq!(ChannelRuntime::reset_global(), 0);
    assert_eq!(transport.subscriber_count(), 0);
}

#[tokio::test]
#[serial]
async fn reset_tears_down_outstanding_channels() {
    ChannelRuntime::reset_global();
    let runtime = ChannelRuntime::global();
    let local = runtime
        .create_local("sim:breaker enum 0".parse().unwrap(), true)
        .unwrap();
    let remote = runtime.get_or_create("remote:unserved");

    assert_eq!(ChannelRuntime::reset_global(), 2);
    assert!(ChannelRuntime::try_global().is_none());
    assert!(!remote.connect_and_wait_async(Duration::from_millis(10)).await);
    assert!(!local.snapshot().is_connected());

    // Late releases after teardown only update counts
    local.release().unwrap();
    remote.release().unwrap();
    assert_eq!(runtime.diagnostics().anomaly_count(), 0);
}

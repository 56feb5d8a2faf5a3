//! Channel state machine tests
//!
//! - Consecutive sequence numbers across a full lifecycle
//! - connect_and_wait_async against early and late first values
//! - Retained values across disconnects
//! - Puts and gets through handles

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use common::{collector, double, harness, harness_with};
use voltage_channels::{
    ChannelValue, ChannelsConfig, ConnectionStatus, FieldInfo, FieldType, PutValueResult,
    StateChangeKind, ValueInfo, WhyGetValueFailed,
};

#[tokio::test]
async fn sequence_numbers_are_consecutive() {
    let h = harness();
    let (recipient, seen) = collector("sequence-check");
    h.bus().register(recipient);
    h.transport
        .serve("line:voltage", double(), Some(ValueInfo::new(230.0)));

    let handle = h.registry.get_or_create("line:voltage");
    assert!(handle.connect_and_wait_async(Duration::from_secs(1)).await);
    h.transport.post_value("line:voltage", 231.0);
    h.transport.take_offline("line:voltage");
    h.transport.bring_online("line:voltage");
    h.transport.post_value("line:voltage", 229.5);
    handle.release().unwrap();

    let seen = seen.lock();
    let transitions: Vec<_> = seen.iter().filter_map(|n| n.states()).collect();
    let kinds: Vec<_> = transitions.iter().map(|s| s.change.kind.name()).collect();
    assert_eq!(
        kinds,
        vec![
            "ChannelCreated",
            "ConnectionEstablished",
            "ValueAcquired",
            "ValueChangeNotified",
            "ConnectionLost",
            "ConnectionRestored",
            "ValueChangeNotified",
            "ValueChangeNotified",
            "ChannelDisconnecting",
        ]
    );

    for (k, snapshot) in transitions.iter().enumerate() {
        assert_eq!(snapshot.current.sequence_number, k as u64 + 1);
        match &snapshot.previous {
            Some(previous) => {
                assert_eq!(snapshot.current.sequence_number, previous.sequence_number + 1)
            },
            None => assert_eq!(k, 0),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn first_value_within_timeout_resolves_true() {
    let h = harness();
    h.transport.serve("tank:level", double(), None);
    let handle = h.registry.get_or_create("tank:level");

    let transport = h.transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.post_value("tank:level", 3.5);
    });

    let started = tokio::time::Instant::now();
    assert!(handle.connect_and_wait_async(Duration::from_millis(500)).await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn late_first_value_is_retained_for_next_wait() {
    let h = harness();
    h.transport.serve("tank:level", double(), None);
    let handle = h.registry.get_or_create("tank:level");

    let transport = h.transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        transport.post_value("tank:level", 3.5);
    });

    assert!(!handle.connect_and_wait_async(Duration::from_millis(500)).await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let started = tokio::time::Instant::now();
    assert!(handle.connect_and_wait_async(Duration::from_millis(500)).await);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn concurrent_waiters_share_one_transition() {
    let h = harness();
    h.transport.serve("tank:level", double(), None);
    let handle = h.registry.get_or_create("tank:level");

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let channel = handle.channel().clone();
            tokio::spawn(
                async move { channel.connect_and_wait_async(Duration::from_secs(2)).await },
            )
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.transport.post_value("tank:level", 1.0);

    for waiter in waiters {
        assert!(waiter.await.unwrap());
    }
}

#[tokio::test]
async fn disconnect_retains_last_value() {
    let h = harness();
    h.transport.serve(
        "boiler:temp",
        FieldInfo::scalar(FieldType::Long),
        Some(ValueInfo::new(42)),
    );
    let handle = h.registry.get_or_create("boiler:temp");
    assert!(handle.connect_and_wait_async(Duration::from_secs(1)).await);

    h.transport.take_offline("boiler:temp");
    let state = handle.snapshot();
    assert_eq!(state.connection, ConnectionStatus::Disconnected);
    assert_eq!(
        state.value_info.as_ref().unwrap().value,
        ChannelValue::Integer(42)
    );
    assert!(!handle.has_connected_and_acquired_value());
    assert_eq!(
        handle.get_value_async().await,
        Err(WhyGetValueFailed::ChannelNotConnected)
    );

    // Puts are not buffered while disconnected
    assert_eq!(handle.put_value_async(43).await, PutValueResult::Timeout);
}

#[tokio::test]
async fn put_and_get_through_handles() {
    let h = harness_with(ChannelsConfig {
        put_timeout_ms: 500,
        ..ChannelsConfig::default()
    });
    h.transport
        .serve("pump:speed", FieldInfo::scalar(FieldType::Long), Some(ValueInfo::new(0)));
    h.transport.serve(
        "pump:model",
        FieldInfo::scalar(FieldType::String).read_only(),
        Some(ValueInfo::new("PX-200")),
    );
    let speed = h.registry.get_or_create("pump:speed");
    let model = h.registry.get_or_create("pump:model");
    assert!(speed.connect_and_wait().await);
    assert!(model.connect_and_wait().await);

    assert_eq!(speed.put_value_ack_async(1450).await, PutValueResult::Success);
    assert_eq!(
        speed.snapshot().value_info.as_ref().unwrap().value,
        ChannelValue::Integer(1450)
    );
    assert_eq!(
        speed.get_value_async().await.unwrap().value,
        ChannelValue::Integer(1450)
    );

    assert_eq!(
        model.put_value_async("PX-300").await,
        PutValueResult::Rejected("channel is read-only".to_string())
    );
    assert_eq!(
        h.transport.current_value("pump:model").unwrap().value,
        ChannelValue::String("PX-200".to_string())
    );
}

#[tokio::test]
async fn local_channel_follows_the_same_contract() {
    let h = harness();
    let (recipient, seen) = collector("local-watch");
    h.bus().register(recipient);

    let handle = h
        .registry
        .create_local("sim:setpoint double 10".parse().unwrap(), false)
        .unwrap();
    assert!(!handle.connect_and_wait_async(Duration::from_secs(5)).await);
    assert_eq!(handle.put_value_async(11.0).await, PutValueResult::Timeout);

    handle.as_local().unwrap().set_connection_status(true);
    assert!(handle.has_connected_and_acquired_value());
    assert_eq!(handle.put_value_ack_async(12.5).await, PutValueResult::Success);
    assert_eq!(
        handle.snapshot().value_info.as_ref().unwrap().value,
        ChannelValue::Float(12.5)
    );

    let kinds: Vec<_> = seen
        .lock()
        .iter()
        .filter_map(|n| n.state_change().map(|c| c.kind.clone()))
        .collect();
    assert!(matches!(kinds[0], StateChangeKind::ChannelCreated));
    assert!(matches!(kinds[1], StateChangeKind::ConnectionEstablished(_)));
    assert!(matches!(kinds[2], StateChangeKind::ValueAcquired(_)));
    assert!(matches!(kinds[3], StateChangeKind::ValueChangeNotified(_)));

    assert!(h
        .registry
        .create_local("sim:setpoint double".parse().unwrap(), false)
        .is_err());
}

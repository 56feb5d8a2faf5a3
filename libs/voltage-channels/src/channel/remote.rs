//! Transport-backed channel

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::base::{ChannelBase, ChannelEvent};
use super::{Channel, ChannelKind, PutValueResult, WhyGetValueFailed};
use crate::bus::NotificationBus;
use crate::descriptors::{ChannelValue, FieldInfo, ValueInfo};
use crate::identity::ChannelIdentity;
use crate::notification::{Anomaly, Notification};
use crate::snapshot::ValidityStatus;
use crate::transport::{
    ChannelTransport, Subscription, TransportError, TransportEvents, WriteAck,
};

/// Channel whose state follows asynchronous transport events
pub struct RemoteChannel {
    base: ChannelBase,
    transport: Arc<dyn ChannelTransport>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
}

/// Routes transport callbacks into the state machine without keeping it alive
struct RemoteEvents {
    channel: Weak<RemoteChannel>,
}

impl TransportEvents for RemoteEvents {
    fn connected(&self, field_info: FieldInfo) {
        if let Some(channel) = self.channel.upgrade() {
            channel.base.apply(ChannelEvent::Connected(field_info));
        }
    }

    fn disconnected(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.base.apply(ChannelEvent::Disconnected);
        }
    }

    fn value_update(&self, value: ValueInfo) {
        if let Some(channel) = self.channel.upgrade() {
            channel.base.apply(ChannelEvent::Value(value));
        }
    }
}

fn map_write(result: Result<WriteAck, TransportError>) -> PutValueResult {
    match result {
        Ok(WriteAck::Accepted) => PutValueResult::Success,
        Ok(WriteAck::Rejected(reason)) | Err(TransportError::Rejected(reason)) => {
            PutValueResult::Rejected(reason)
        },
        Err(TransportError::NotConnected) => PutValueResult::Timeout,
        Err(TransportError::Failed(reason)) => PutValueResult::Failed(reason),
    }
}

impl RemoteChannel {
    pub(crate) fn new(
        id: u64,
        identity: ChannelIdentity,
        bus: Arc<NotificationBus>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ChannelBase::new(id, identity, ValidityStatus::Valid, bus),
            transport,
            subscription: Mutex::new(None),
        })
    }

    /// Event sink handed to the transport
    pub(crate) fn events(self: &Arc<Self>) -> Arc<dyn TransportEvents> {
        Arc::new(RemoteEvents {
            channel: Arc::downgrade(self),
        })
    }

    pub(crate) fn attach(&self, subscription: Box<dyn Subscription>) {
        *self.subscription.lock() = Some(subscription);
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    fn report_put_failure(&self, result: &PutValueResult) {
        if let PutValueResult::Failed(error) = result {
            self.base.publish_anomaly(Anomaly::PutFailed {
                error: error.clone(),
            });
        }
    }
}

#[async_trait]
impl Channel for RemoteChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Remote
    }

    fn put_value(&self, value: ChannelValue) {
        if !self.snapshot().is_connected() {
            self.base.publish_anomaly(Anomaly::PutFailed {
                error: "channel not connected".to_string(),
            });
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.base.publish_anomaly(Anomaly::UnexpectedError {
                context: "put_value".to_string(),
                error: "no tokio runtime available".to_string(),
            });
            return;
        };

        let transport = self.transport.clone();
        let bus = self.base.bus().clone();
        let identity = self.identity().clone();
        runtime.spawn(async move {
            let result = map_write(transport.write(&identity, value).await);
            if !result.is_success() {
                debug!("Put {} failed: {}", identity, result);
                bus.publish(Notification::anomaly(
                    Some(identity),
                    Anomaly::PutFailed {
                        error: result.to_string(),
                    },
                ));
            }
        });
    }

    async fn put_value_async(&self, value: ChannelValue, timeout: Duration) -> PutValueResult {
        if !self.snapshot().is_connected() {
            return PutValueResult::Timeout;
        }
        let write = self.transport.write(self.identity(), value);
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(result) => map_write(result),
            Err(_) => PutValueResult::Timeout,
        };
        self.report_put_failure(&result);
        result
    }

    async fn put_value_ack_async(
        &self,
        value: ChannelValue,
        timeout: Duration,
    ) -> PutValueResult {
        let deadline = Instant::now() + timeout;
        let generation = self.snapshot().value_generation;

        let sent = self.put_value_async(value, timeout).await;
        if !sent.is_success() {
            return sent;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let confirmed = self
            .base
            .wait_until(remaining, |state| state.value_generation > generation)
            .await;
        if confirmed {
            PutValueResult::Success
        } else {
            PutValueResult::Timeout
        }
    }

    async fn get_value_async(&self, timeout: Duration) -> Result<ValueInfo, WhyGetValueFailed> {
        match tokio::time::timeout(timeout, self.transport.query_once(self.identity())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(TransportError::NotConnected)) => Err(WhyGetValueFailed::ChannelNotConnected),
            Ok(Err(TransportError::Rejected(reason) | TransportError::Failed(reason))) => {
                Err(WhyGetValueFailed::ServerError(reason))
            },
            Err(_) => Err(WhyGetValueFailed::TimeoutOnThisQuery),
        }
    }

    fn teardown(&self) {
        self.base.apply(ChannelEvent::Disposing);
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        info!("Ch{} {} closed", self.id(), self.identity());
    }
}

impl std::fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("id", &self.base.id())
            .field("identity", self.base.identity())
            .field("transport", &self.transport.name())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::descriptors::FieldType;
    use crate::diagnostics::Diagnostics;
    use crate::transport::MemoryTransport;

    fn connect(transport: &MemoryTransport, name: &str) -> (Arc<RemoteChannel>, Arc<Diagnostics>) {
        let diag = Arc::new(Diagnostics::unbounded());
        let bus = Arc::new(NotificationBus::with_diagnostics(diag.clone()));
        let shared: Arc<dyn ChannelTransport> = Arc::new(transport.clone());
        let channel = RemoteChannel::new(1, name.into(), bus, shared.clone());
        let sub = shared
            .attempt_connect(channel.identity(), channel.events())
            .unwrap();
        channel.attach(sub);
        channel.base().publish_created();
        (channel, diag)
    }

    #[tokio::test]
    async fn test_connect_and_wait() {
        let transport = MemoryTransport::new();
        transport.serve(
            "tank:level",
            FieldInfo::scalar(FieldType::Double),
            Some(ValueInfo::new(1.5)),
        );
        let (channel, _) = connect(&transport, "tank:level");

        assert!(channel.connect_and_wait_async(Duration::from_secs(1)).await);
        assert!(channel.has_connected_and_acquired_value());
        assert_eq!(channel.snapshot().sequence_number, 3);
    }

    #[tokio::test]
    async fn test_put_ack_waits_for_echo() {
        let transport = MemoryTransport::new();
        transport.serve("pump:speed", FieldInfo::scalar(FieldType::Long), None);
        let (channel, _) = connect(&transport, "pump:speed");
        assert!(
            channel
                .base()
                .wait_until(Duration::from_secs(1), |s| s.is_connected())
                .await
        );

        let result = channel
            .put_value_ack_async(ChannelValue::Integer(1200), Duration::from_secs(1))
            .await;
        assert_eq!(result, PutValueResult::Success);
        assert_eq!(
            channel.snapshot().value_info.as_ref().unwrap().value,
            ChannelValue::Integer(1200)
        );

        let result = channel
            .put_value_async(ChannelValue::from("fast"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, PutValueResult::Rejected(_)));
    }

    #[tokio::test]
    async fn test_put_while_disconnected_is_timeout() {
        let transport = MemoryTransport::new();
        let (channel, diag) = connect(&transport, "never:served");

        let result = channel
            .put_value_async(ChannelValue::Integer(1), Duration::from_millis(50))
            .await;
        assert_eq!(result, PutValueResult::Timeout);

        channel.put_value(ChannelValue::Integer(1));
        assert_eq!(diag.anomaly_count(), 1);

        assert_eq!(
            channel.get_value_async(Duration::from_millis(50)).await,
            Err(WhyGetValueFailed::ChannelNotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_value_timeout() {
        let transport = MemoryTransport::new();
        transport.serve(
            "slow:pv",
            FieldInfo::scalar(FieldType::Double),
            Some(ValueInfo::new(2.0)),
        );
        transport.set_latency(Duration::from_secs(5));
        let (channel, _) = connect(&transport, "slow:pv");

        assert_eq!(
            channel.get_value_async(Duration::from_secs(1)).await,
            Err(WhyGetValueFailed::TimeoutOnThisQuery)
        );
        assert_eq!(
            channel
                .get_value_async(Duration::from_secs(10))
                .await
                .unwrap()
                .value,
            ChannelValue::Float(2.0)
        );
    }

    #[tokio::test]
    async fn test_teardown_cancels_subscription() {
        let transport = MemoryTransport::new();
        let (channel, _) = connect(&transport, "a:b");
        assert_eq!(transport.subscriber_count(), 1);

        channel.teardown();
        assert_eq!(transport.subscriber_count(), 0);
        assert!(channel.base().is_disposed());
    }
}

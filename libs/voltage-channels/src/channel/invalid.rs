//! Channel for a malformed name or a failed connection attempt
//!
//! Callers still get a handle; every operation reports the reason.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::base::{ChannelBase, ChannelEvent};
use super::{Channel, ChannelKind, PutValueResult, WhyGetValueFailed};
use crate::bus::NotificationBus;
use crate::descriptors::{ChannelValue, ValueInfo};
use crate::identity::ChannelIdentity;
use crate::snapshot::ValidityStatus;

pub struct InvalidChannel {
    base: ChannelBase,
    reason: String,
}

impl InvalidChannel {
    pub(crate) fn new(
        id: u64,
        identity: ChannelIdentity,
        reason: impl Into<String>,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let reason = reason.into();
        Arc::new(Self {
            base: ChannelBase::new(id, identity, ValidityStatus::Invalid(reason.clone()), bus),
            reason,
        })
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl Channel for InvalidChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Invalid
    }

    fn put_value(&self, _value: ChannelValue) {
        debug!("Ch{} put ignored: {}", self.id(), self.reason);
    }

    async fn put_value_async(&self, _value: ChannelValue, _timeout: Duration) -> PutValueResult {
        PutValueResult::ChannelInvalid(self.reason.clone())
    }

    async fn put_value_ack_async(
        &self,
        _value: ChannelValue,
        _timeout: Duration,
    ) -> PutValueResult {
        PutValueResult::ChannelInvalid(self.reason.clone())
    }

    async fn get_value_async(&self, _timeout: Duration) -> Result<ValueInfo, WhyGetValueFailed> {
        Err(WhyGetValueFailed::ChannelIsInvalid(self.reason.clone()))
    }

    async fn connect_and_wait_async(&self, _timeout: Duration) -> bool {
        false
    }

    fn teardown(&self) {
        self.base.apply(ChannelEvent::Disposing);
    }
}

impl std::fmt::Debug for InvalidChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidChannel")
            .field("id", &self.base.id())
            .field("identity", self.base.identity())
            .field("reason", &self.reason)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_operation_reports_reason() {
        let channel = InvalidChannel::new(
            4,
            "pump:speed.val".into(),
            "field suffix \"val\" must be 1-4 uppercase letters",
            Arc::new(NotificationBus::new()),
        );
        let reason = channel.reason().to_string();

        assert!(!channel.snapshot().is_valid());
        assert_eq!(channel.snapshot().validity.reason(), Some(reason.as_str()));
        assert_eq!(
            channel
                .put_value_async(ChannelValue::Integer(1), Duration::ZERO)
                .await,
            PutValueResult::ChannelInvalid(reason.clone())
        );
        assert_eq!(
            channel.get_value_async(Duration::ZERO).await,
            Err(WhyGetValueFailed::ChannelIsInvalid(reason))
        );
        assert!(!channel.connect_and_wait_async(Duration::from_secs(5)).await);
        assert_eq!(channel.kind(), ChannelKind::Invalid);
    }
}

//! In-process simulated channel
//!
//! Same contract as a remote channel, but every operation completes
//! synchronously: a put transitions the state before it returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::base::{ChannelBase, ChannelEvent};
use super::{Channel, ChannelKind, PutValueResult, WhyGetValueFailed};
use crate::bus::NotificationBus;
use crate::descriptors::{ChannelValue, FieldInfo, LocalChannelDescriptor, ValueInfo};
use crate::identity::{AccessMode, ChannelIdentity};
use crate::snapshot::ValidityStatus;

pub struct LocalChannel {
    base: ChannelBase,
    field_info: FieldInfo,
    /// Descriptor value, applied on the first connect
    pending_initial: Mutex<Option<ChannelValue>>,
}

impl LocalChannel {
    pub(crate) fn new(
        id: u64,
        descriptor: LocalChannelDescriptor,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let identity = ChannelIdentity::new(descriptor.name, AccessMode::Value);
        Arc::new(Self {
            base: ChannelBase::new(id, identity, ValidityStatus::Valid, bus),
            field_info: descriptor.field_info,
            pending_initial: Mutex::new(descriptor.initial_value),
        })
    }

    pub fn field_info(&self) -> &FieldInfo {
        &self.field_info
    }

    /// Drive the connection status; an unchanged status is a logged no-op
    pub fn set_connection_status(&self, connected: bool) {
        if !connected {
            self.base.apply(ChannelEvent::Disconnected);
            return;
        }
        if self
            .base
            .apply(ChannelEvent::Connected(self.field_info.clone()))
            .is_some()
        {
            if let Some(initial) = self.pending_initial.lock().take() {
                self.base.apply(ChannelEvent::Value(ValueInfo::new(initial)));
            }
        }
    }

    /// Synchronous write
    pub fn put(&self, value: ChannelValue) -> PutValueResult {
        if !self.snapshot().is_connected() {
            return PutValueResult::Timeout;
        }
        if !self.field_info.writable {
            return PutValueResult::Rejected("channel is read-only".to_string());
        }
        if !self.field_info.accepts(&value) {
            return PutValueResult::Rejected(format!(
                "value {} does not fit field {}",
                value, self.field_info
            ));
        }
        match self.base.apply(ChannelEvent::Value(ValueInfo::new(value))) {
            Some(_) => PutValueResult::Success,
            // Disposed in the meantime
            None => PutValueResult::Timeout,
        }
    }

    /// Simulate a server-side update, bypassing the writable check
    pub fn post_value(&self, value: ValueInfo) -> bool {
        self.base.apply(ChannelEvent::Value(value)).is_some()
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Local
    }

    fn put_value(&self, value: ChannelValue) {
        let result = self.put(value);
        if !result.is_success() {
            debug!("Ch{} local put: {}", self.id(), result);
        }
    }

    async fn put_value_async(&self, value: ChannelValue, _timeout: Duration) -> PutValueResult {
        self.put(value)
    }

    async fn put_value_ack_async(
        &self,
        value: ChannelValue,
        _timeout: Duration,
    ) -> PutValueResult {
        self.put(value)
    }

    async fn get_value_async(&self, _timeout: Duration) -> Result<ValueInfo, WhyGetValueFailed> {
        let state = self.snapshot();
        if !state.is_connected() {
            return Err(WhyGetValueFailed::ChannelNotConnected);
        }
        state
            .value_info
            .clone()
            .ok_or_else(|| WhyGetValueFailed::ServerError("no value available".to_string()))
    }

    async fn connect_and_wait_async(&self, _timeout: Duration) -> bool {
        self.has_connected_and_acquired_value()
    }

    fn as_local(&self) -> Option<&LocalChannel> {
        Some(self)
    }

    fn teardown(&self) {
        self.base.apply(ChannelEvent::Disposing);
        info!("Ch{} {} closed (local)", self.id(), self.identity());
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("id", &self.base.id())
            .field("identity", self.base.identity())
            .field("field_info", &self.field_info)
            .finish()
    }
}

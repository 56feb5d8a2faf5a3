//! Reference-counted channel handle
//!
//! Every holder of a channel owns a `ChannelHandle`. `release` must be called
//! exactly once per handle; dropping an unreleased handle releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{ChannelError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{
    Channel, ChannelKind, ChannelRef, LocalChannel, PutValueResult, WhyGetValueFailed,
};
use crate::descriptors::{ChannelValue, ValueInfo};
use crate::identity::{AccessMode, ChannelIdentity};
use crate::registry::{Registration, RegistryInner};
use crate::snapshot::ChannelState;

pub struct ChannelHandle {
    registration: Arc<Registration>,
    registry: Arc<RegistryInner>,
    released: AtomicBool,
}

impl ChannelHandle {
    pub(crate) fn new(registration: Arc<Registration>, registry: Arc<RegistryInner>) -> Self {
        Self {
            registration,
            registry,
            released: AtomicBool::new(false),
        }
    }

    /// The underlying channel, shared by every handle of the same identity
    pub fn channel(&self) -> &ChannelRef {
        &self.registration.channel
    }

    pub fn id(&self) -> u64 {
        self.channel().id()
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel().kind()
    }

    pub fn identity(&self) -> &ChannelIdentity {
        self.channel().identity()
    }

    pub fn name(&self) -> &str {
        self.channel().name()
    }

    pub fn access_mode(&self) -> AccessMode {
        self.channel().access_mode()
    }

    pub fn snapshot(&self) -> Arc<ChannelState> {
        self.channel().snapshot()
    }

    pub fn states(&self) -> (Arc<ChannelState>, Option<Arc<ChannelState>>) {
        self.channel().states()
    }

    pub fn has_connected_and_acquired_value(&self) -> bool {
        self.channel().has_connected_and_acquired_value()
    }

    pub fn as_local(&self) -> Option<&LocalChannel> {
        self.channel().as_local()
    }

    pub fn put_value(&self, value: impl Into<ChannelValue>) {
        self.channel().put_value(value.into());
    }

    /// Write with the configured put timeout, waiting for the send acknowledgement
    pub async fn put_value_async(&self, value: impl Into<ChannelValue>) -> PutValueResult {
        let timeout = self.registry.config().put_timeout();
        self.channel().put_value_async(value.into(), timeout).await
    }

    /// Write with the configured put timeout, waiting for the confirming update
    pub async fn put_value_ack_async(&self, value: impl Into<ChannelValue>) -> PutValueResult {
        let timeout = self.registry.config().put_timeout();
        self.channel().put_value_ack_async(value.into(), timeout).await
    }

    pub async fn get_value_async(&self) -> std::result::Result<ValueInfo, WhyGetValueFailed> {
        let timeout = self.registry.config().get_timeout();
        self.channel().get_value_async(timeout).await
    }

    pub async fn connect_and_wait_async(&self, timeout: Duration) -> bool {
        self.channel().connect_and_wait_async(timeout).await
    }

    /// `connect_and_wait_async` with the configured connect timeout
    pub async fn connect_and_wait(&self) -> bool {
        self.connect_and_wait_async(self.registry.config().connect_timeout())
            .await
    }

    /// `connect_and_wait_async` that also gives up when `cancel` fires
    pub async fn connect_and_wait_cancellable(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        tokio::select! {
            ready = self.connect_and_wait_async(timeout) => ready,
            _ = cancel.cancelled() => {
                debug!("Ch{} connect wait cancelled", self.id());
                false
            },
        }
    }

    /// Number of live handles on the underlying channel
    pub fn reference_count(&self) -> usize {
        self.registration.refs()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Another counted handle for the same channel
    pub fn duplicate(&self) -> Result<ChannelHandle> {
        if self.is_released() {
            let error = ChannelError::already_released(self.identity().to_string());
            self.registry.report_usage_error(self.channel().as_ref(), &error);
            return Err(error);
        }
        self.registry.acquire(&self.registration);
        Ok(ChannelHandle::new(
            self.registration.clone(),
            self.registry.clone(),
        ))
    }

    /// Give this handle back; a second call is a reported usage error
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            let error = ChannelError::already_released(self.identity().to_string());
            self.registry.report_usage_error(self.channel().as_ref(), &error);
            return Err(error);
        }
        self.registry.release(&self.registration);
        Ok(())
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("Ch{} handle dropped without release", self.id());
            self.registry.release(&self.registration);
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id())
            .field("identity", self.identity())
            .field("released", &self.is_released())
            .finish()
    }
}

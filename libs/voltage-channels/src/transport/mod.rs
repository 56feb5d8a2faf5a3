//! Transport abstraction
//!
//! The wire protocol lives behind `ChannelTransport`. A transport reports
//! connection and value events for each subscription through `TransportEvents`,
//! usually from its own tasks. Events reported from inside `attempt_connect`
//! are queued behind the channel's creation notification.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::descriptors::{ChannelValue, FieldInfo, ValueInfo};
use crate::identity::ChannelIdentity;

pub use memory::{MemoryTransport, MemoryTransportStats};

/// Callbacks a transport drives for one subscription
pub trait TransportEvents: Send + Sync {
    fn connected(&self, field_info: FieldInfo);
    fn disconnected(&self);
    fn value_update(&self, value: ValueInfo);
}

/// Live subscription; dropping it cancels the subscription
pub trait Subscription: Send + Sync {
    fn cancel(&self);
}

/// Acknowledgement of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Client side of the channel access protocol
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Start a subscription for `identity`
    ///
    /// Errors here mean the subscription could not even be set up; the caller
    /// turns them into an invalid channel.
    fn attempt_connect(
        &self,
        identity: &ChannelIdentity,
        events: Arc<dyn TransportEvents>,
    ) -> anyhow::Result<Box<dyn Subscription>>;

    /// Write a value, resolving once the server acknowledged the request
    async fn write(
        &self,
        identity: &ChannelIdentity,
        value: ChannelValue,
    ) -> Result<WriteAck, TransportError>;

    /// One-shot read independent of any subscription
    async fn query_once(&self, identity: &ChannelIdentity) -> Result<ValueInfo, TransportError>;

    /// Process-wide teardown of the client context
    fn shutdown(&self) {}
}

impl fmt::Debug for dyn ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelTransport({})", self.name())
    }
}

//! Channels
//!
//! One contract, three variants: `RemoteChannel` (driven by a transport),
//! `LocalChannel` (driven synchronously in-process) and `InvalidChannel`
//! (a malformed name or a failed connection attempt).

pub mod base;
pub mod invalid;
pub mod local;
pub mod remote;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::descriptors::{ChannelValue, ValueInfo};
use crate::identity::{AccessMode, ChannelIdentity};
use crate::snapshot::ChannelState;

pub use base::{ChannelBase, ChannelEvent};
pub use invalid::InvalidChannel;
pub use local::LocalChannel;
pub use remote::RemoteChannel;

/// Shared reference to a channel of any variant
pub type ChannelRef = Arc<dyn Channel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Remote,
    Local,
    Invalid,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Remote => write!(f, "remote"),
            ChannelKind::Local => write!(f, "local"),
            ChannelKind::Invalid => write!(f, "invalid"),
        }
    }
}

/// Outcome of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutValueResult {
    Success,
    /// No acknowledgement in time, or the channel is not connected
    Timeout,
    Rejected(String),
    ChannelInvalid(String),
    /// Unexpected transport failure, also reported as an anomaly
    Failed(String),
}

impl PutValueResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for PutValueResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::ChannelInvalid(reason) => write!(f, "channel invalid: {}", reason),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Why a one-shot read produced no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhyGetValueFailed {
    TimeoutOnThisQuery,
    ChannelIsInvalid(String),
    ChannelNotConnected,
    ServerError(String),
}

impl fmt::Display for WhyGetValueFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeoutOnThisQuery => write!(f, "timeout on this query"),
            Self::ChannelIsInvalid(reason) => write!(f, "channel is invalid: {}", reason),
            Self::ChannelNotConnected => write!(f, "channel not connected"),
            Self::ServerError(reason) => write!(f, "server error: {}", reason),
        }
    }
}

/// Contract shared by every channel variant
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn base(&self) -> &ChannelBase;

    fn kind(&self) -> ChannelKind;

    fn id(&self) -> u64 {
        self.base().id()
    }

    fn identity(&self) -> &ChannelIdentity {
        self.base().identity()
    }

    fn name(&self) -> &str {
        self.identity().name()
    }

    fn access_mode(&self) -> AccessMode {
        self.identity().access_mode()
    }

    fn snapshot(&self) -> Arc<ChannelState> {
        self.base().snapshot()
    }

    fn states(&self) -> (Arc<ChannelState>, Option<Arc<ChannelState>>) {
        self.base().states()
    }

    /// Non-blocking point read
    fn has_connected_and_acquired_value(&self) -> bool {
        self.snapshot().is_connected_with_value()
    }

    /// Fire-and-forget write; failures surface as anomalies
    fn put_value(&self, value: ChannelValue);

    /// Write and wait for the send acknowledgement
    async fn put_value_async(&self, value: ChannelValue, timeout: Duration) -> PutValueResult;

    /// Write and wait for a value update confirming the write took effect
    async fn put_value_ack_async(&self, value: ChannelValue, timeout: Duration)
        -> PutValueResult;

    /// One-shot read independent of the subscription
    async fn get_value_async(&self, timeout: Duration) -> Result<ValueInfo, WhyGetValueFailed>;

    /// Resolve true once the channel is connected with a value, false on timeout
    async fn connect_and_wait_async(&self, timeout: Duration) -> bool {
        if !self.snapshot().is_valid() {
            return false;
        }
        self.base()
            .wait_until(timeout, |state| state.is_connected_with_value())
            .await
    }

    fn as_local(&self) -> Option<&LocalChannel> {
        None
    }

    /// Final transition and release of transport resources
    fn teardown(&self);
}

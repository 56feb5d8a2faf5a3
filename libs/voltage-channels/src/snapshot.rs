//! Immutable channel state snapshots
//!
//! A channel's state is replaced as a whole on every transition; readers hold an
//! `Arc<ChannelState>` that never changes underneath them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptors::{FieldInfo, ValueInfo};
use crate::identity::ChannelIdentity;
use crate::notification::StateChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ValidityStatus {
    Valid,
    Invalid(String),
}

impl ValidityStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Invalid(reason) => Some(reason),
        }
    }
}

/// Point-in-time view of one channel
///
/// `field_info` is set on the first connect and kept forever after. `value_info`
/// stays `None` until the first value and survives disconnects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub channel_id: u64,
    pub identity: ChannelIdentity,
    /// Starts at 1 for the created state, +1 per transition
    pub sequence_number: u64,
    pub connection: ConnectionStatus,
    pub validity: ValidityStatus,
    pub field_info: Option<FieldInfo>,
    pub value_info: Option<ValueInfo>,
    /// Number of value updates applied so far
    pub value_generation: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChannelState {
    /// Initial state of a freshly created channel
    pub fn initial(channel_id: u64, identity: ChannelIdentity, validity: ValidityStatus) -> Self {
        Self {
            channel_id,
            identity,
            sequence_number: 1,
            connection: ConnectionStatus::Disconnected,
            validity,
            field_info: None,
            value_info: None,
            value_generation: 0,
            timestamp: Utc::now(),
        }
    }

    /// Copy-forward successor carrying the next sequence number
    pub(crate) fn successor(&self) -> Self {
        Self {
            sequence_number: self.sequence_number + 1,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_valid(&self) -> bool {
        self.validity.is_valid()
    }

    pub fn has_value(&self) -> bool {
        self.value_info.is_some()
    }

    pub fn is_connected_with_value(&self) -> bool {
        self.is_connected() && self.has_value()
    }

    pub fn has_ever_connected(&self) -> bool {
        self.field_info.is_some()
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ch{} {} #{} {}",
            self.channel_id, self.identity, self.sequence_number, self.connection
        )?;
        if let ValidityStatus::Invalid(reason) = &self.validity {
            write!(f, " invalid: {}", reason)?;
        }
        if let Some(value) = &self.value_info {
            write!(f, " = {}", value)?;
        }
        Ok(())
    }
}

/// The triple published for every transition
#[derive(Debug, Clone)]
pub struct ChannelStatesSnapshot {
    pub change: StateChange,
    pub current: Arc<ChannelState>,
    pub previous: Option<Arc<ChannelState>>,
}

impl ChannelStatesSnapshot {
    pub fn identity(&self) -> &ChannelIdentity {
        &self.current.identity
    }
}

impl fmt::Display for ChannelStatesSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.change, self.current)
    }
}

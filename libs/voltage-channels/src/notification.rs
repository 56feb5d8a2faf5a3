//! Notification model
//!
//! `StateChange` describes exactly one channel transition. `Notification` is what
//! travels on the bus: either progress (state changes, teardown) or an anomaly.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptors::{FieldInfo, FieldType, ValueInfo};
use crate::identity::ChannelIdentity;
use crate::snapshot::ChannelStatesSnapshot;

// ============================================================================
// StateChange
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StateChangeKind {
    ChannelCreated,
    ChannelCreatedAsInvalid { reason: String },
    ConnectionEstablished(FieldInfo),
    ConnectionLost,
    ConnectionRestored,
    ValueAcquired(ValueInfo),
    ValueChangeNotified(ValueInfo),
    ChannelDisconnecting,
}

impl StateChangeKind {
    /// Changes routed to connection callbacks
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::ConnectionEstablished(_) | Self::ConnectionLost | Self::ConnectionRestored
        )
    }

    /// Changes routed to value callbacks
    pub fn is_value_class(&self) -> bool {
        matches!(self, Self::ValueAcquired(_) | Self::ValueChangeNotified(_))
    }

    pub fn value(&self) -> Option<&ValueInfo> {
        match self {
            Self::ValueAcquired(v) | Self::ValueChangeNotified(v) => Some(v),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChannelCreated => "ChannelCreated",
            Self::ChannelCreatedAsInvalid { .. } => "ChannelCreatedAsInvalid",
            Self::ConnectionEstablished(_) => "ConnectionEstablished",
            Self::ConnectionLost => "ConnectionLost",
            Self::ConnectionRestored => "ConnectionRestored",
            Self::ValueAcquired(_) => "ValueAcquired",
            Self::ValueChangeNotified(_) => "ValueChangeNotified",
            Self::ChannelDisconnecting => "ChannelDisconnecting",
        }
    }
}

/// One transition of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub channel: ChannelIdentity,
    pub created_at: DateTime<Utc>,
    pub kind: StateChangeKind,
}

impl StateChange {
    pub fn new(channel: ChannelIdentity, kind: StateChangeKind) -> Self {
        Self {
            channel,
            created_at: Utc::now(),
            kind,
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.channel, self.kind.name())?;
        match &self.kind {
            StateChangeKind::ChannelCreatedAsInvalid { reason } => write!(f, " ({})", reason),
            StateChangeKind::ConnectionEstablished(field) => write!(f, " ({})", field),
            StateChangeKind::ValueAcquired(v) | StateChangeKind::ValueChangeNotified(v) => {
                write!(f, " = {}", v)
            },
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Filtering family of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NotificationFamily {
    Progress,
    Anomaly,
}

#[derive(Debug, Clone)]
pub enum Progress {
    StateChanged(ChannelStatesSnapshot),
    /// Channel removed from the registry after its last handle was released
    ChannelTornDown { channel_id: u64 },
    Message(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// A fault surfaced from the transport or an invariant check
    UnexpectedError { context: String, error: String },
    UsageError { error: String },
    /// A bus recipient failed while handling a notification
    RecipientFault {
        recipient: String,
        notification: String,
        error: String,
    },
    /// A group-handler callback failed
    CallbackFault { handler: String, error: String },
    FieldTypeChanged {
        previous: FieldType,
        reported: FieldType,
    },
    ValueWhileDisconnected,
    PutFailed { error: String },
}

#[derive(Debug, Clone)]
pub enum NotificationKind {
    Progress(Progress),
    Anomaly(Anomaly),
}

/// A message travelling on the notification bus
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Option<ChannelIdentity>,
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn state_changed(snapshot: ChannelStatesSnapshot) -> Self {
        Self {
            channel: Some(snapshot.identity().clone()),
            timestamp: snapshot.change.created_at,
            kind: NotificationKind::Progress(Progress::StateChanged(snapshot)),
        }
    }

    pub fn progress(channel: Option<ChannelIdentity>, progress: Progress) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            kind: NotificationKind::Progress(progress),
        }
    }

    pub fn anomaly(channel: Option<ChannelIdentity>, anomaly: Anomaly) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            kind: NotificationKind::Anomaly(anomaly),
        }
    }

    pub fn family(&self) -> NotificationFamily {
        match self.kind {
            NotificationKind::Progress(_) => NotificationFamily::Progress,
            NotificationKind::Anomaly(_) => NotificationFamily::Anomaly,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        self.family() == NotificationFamily::Anomaly
    }

    /// The transition triple, for state-change notifications
    pub fn states(&self) -> Option<&ChannelStatesSnapshot> {
        match &self.kind {
            NotificationKind::Progress(Progress::StateChanged(s)) => Some(s),
            _ => None,
        }
    }

    pub fn state_change(&self) -> Option<&StateChange> {
        self.states().map(|s| &s.change)
    }

    pub fn anomaly_detail(&self) -> Option<&Anomaly> {
        match &self.kind {
            NotificationKind::Anomaly(a) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::UnexpectedError { context, error } => {
                write!(f, "unexpected error in {}: {}", context, error)
            },
            Anomaly::UsageError { error } => write!(f, "usage error: {}", error),
            Anomaly::RecipientFault {
                recipient,
                notification,
                error,
            } => write!(
                f,
                "recipient '{}' failed on [{}]: {}",
                recipient, notification, error
            ),
            Anomaly::CallbackFault { handler, error } => {
                write!(f, "callback of handler '{}' failed: {}", handler, error)
            },
            Anomaly::FieldTypeChanged { previous, reported } => write!(
                f,
                "field type changed from {} to {} on reconnect",
                previous, reported
            ),
            Anomaly::ValueWhileDisconnected => write!(f, "value update while disconnected"),
            Anomaly::PutFailed { error } => write!(f, "put failed: {}", error),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NotificationKind::Progress(Progress::StateChanged(s)) => write!(f, "{}", s),
            NotificationKind::Progress(Progress::ChannelTornDown { channel_id }) => {
                match &self.channel {
                    Some(ch) => write!(f, "Ch{} {} torn down", channel_id, ch),
                    None => write!(f, "Ch{} torn down", channel_id),
                }
            },
            NotificationKind::Progress(Progress::Message(msg)) => f.write_str(msg),
            NotificationKind::Anomaly(a) => match &self.channel {
                Some(ch) => write!(f, "ANOMALY {}: {}", ch, a),
                None => write!(f, "ANOMALY {}", a),
            },
        }
    }
}

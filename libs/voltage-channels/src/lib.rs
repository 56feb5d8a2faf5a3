//! VoltageEMS Channel Access Runtime
//!
//! Client-side lifecycle and state synchronization for named process-control
//! channels: identity-keyed deduplication, reference-counted handles, a
//! per-channel state machine publishing immutable snapshots, and a
//! notification bus with group handlers on top.
//!
//! # Key Components
//!
//! - **ChannelsRegistry**: get-or-create by identity, reference counting, teardown
//! - **Channel**: remote, local (simulated) and invalid variants sharing one contract
//! - **NotificationBus**: isolated fan-out of state changes and anomalies
//! - **ChannelsHandler**: consumer-owned batch of channels with callbacks
//! - **ChannelTransport**: network seam, with `MemoryTransport` for in-process use

pub mod identity;

pub mod descriptors;

pub mod snapshot;

pub mod notification;

pub mod diagnostics;

pub mod bus;

pub mod transport;

pub mod channel;

pub mod config;

pub mod registry;

pub mod handle;

pub mod handler;

pub mod runtime;

// Re-exports
pub use errors::{ChannelError, Result};

pub use identity::{AccessMode, ChannelIdentity, ChannelName, InvalidNameReason};

pub use descriptors::{
    AlarmSeverity, ChannelValue, ControlInfo, FieldInfo, FieldType, LocalChannelDescriptor,
    ValueInfo,
};

pub use snapshot::{ChannelState, ChannelStatesSnapshot, ConnectionStatus, ValidityStatus};

pub use notification::{
    Anomaly, Notification, NotificationFamily, NotificationKind, Progress, StateChange,
    StateChangeKind,
};

pub use diagnostics::{DiagnosticEntry, Diagnostics, WarningMessage};

pub use bus::{
    DeliveryStrategy, FnRecipient, InlineDelivery, NotificationBus, NotificationRecipient,
    SpawnedDelivery,
};

pub use transport::{
    ChannelTransport, MemoryTransport, MemoryTransportStats, Subscription, TransportError,
    TransportEvents, WriteAck,
};

pub use channel::{
    Channel, ChannelKind, ChannelRef, InvalidChannel, LocalChannel, PutValueResult,
    RemoteChannel, WhyGetValueFailed,
};

pub use config::ChannelsConfig;

pub use registry::{ChannelsRegistry, RegistryStats};

pub use handle::ChannelHandle;

pub use handler::{ChannelCallbacks, ChannelsHandler, HandlerOptions};

pub use runtime::ChannelRuntime;

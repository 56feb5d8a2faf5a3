//! Channels registry
//!
//! Identity to channel map with reference counting. Every caller receives its
//! own `ChannelHandle`; the channel is torn down when the last handle is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use errors::{ChannelError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn, Level};

use crate::bus::NotificationBus;
use crate::channel::{Channel, ChannelRef, InvalidChannel, LocalChannel, RemoteChannel};
use crate::config::ChannelsConfig;
use crate::descriptors::LocalChannelDescriptor;
use crate::handle::ChannelHandle;
use crate::identity::{AccessMode, ChannelIdentity};
use crate::notification::{Anomaly, Notification, Progress};
use crate::transport::ChannelTransport;

/// Registry entry: the channel and its handle count
pub(crate) struct Registration {
    pub(crate) channel: ChannelRef,
    refs: AtomicUsize,
    /// Identity mapping already removed (or never present)
    removed: AtomicBool,
    torn_down: AtomicBool,
}

impl Registration {
    fn new(channel: ChannelRef, registered: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            refs: AtomicUsize::new(1),
            removed: AtomicBool::new(!registered),
            torn_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub total_created: u64,
    pub connected: usize,
    pub with_value: usize,
}

pub(crate) struct RegistryInner {
    channels: Mutex<HashMap<ChannelIdentity, Arc<Registration>>>,
    /// Guards only the counter
    next_id: Mutex<u64>,
    total_created: AtomicU64,
    transport: Arc<dyn ChannelTransport>,
    bus: Arc<NotificationBus>,
    config: ChannelsConfig,
}

impl RegistryInner {
    pub(crate) fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub(crate) fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    fn allocate_identifier(&self) -> u64 {
        let mut next = self.next_id.lock();
        *next += 1;
        *next
    }

    fn insert_locked(
        &self,
        channels: &mut HashMap<ChannelIdentity, Arc<Registration>>,
        channel: ChannelRef,
    ) -> Arc<Registration> {
        let registration = Registration::new(channel, true);
        channels.insert(
            registration.channel.identity().clone(),
            registration.clone(),
        );
        self.total_created.fetch_add(1, Ordering::Relaxed);
        info!(
            "Ch{} {} created ({})",
            registration.channel.id(),
            registration.channel.identity(),
            registration.channel.kind()
        );
        registration
    }

    /// Remove the identity mapping; a missing or stale entry is a contract violation
    fn deregister_locked(
        &self,
        channels: &mut HashMap<ChannelIdentity, Arc<Registration>>,
        channel: &dyn Channel,
    ) {
        let registration = match channels.get(channel.identity()) {
            Some(reg) if reg.channel.id() == channel.id() => reg.clone(),
            _ => panic!(
                "Ch{} deregistered: {}",
                channel.id(),
                ChannelError::not_registered(channel.identity().to_string())
            ),
        };
        let already = registration.removed.swap(true, Ordering::SeqCst);
        assert!(
            !already,
            "Ch{} {} deregistered twice",
            channel.id(),
            channel.identity()
        );
        channels.remove(channel.identity());
        debug!("Ch{} {} deregistered", channel.id(), channel.identity());
    }

    /// Drop the creator's handle of an entry whose connect attempt failed
    ///
    /// Returns whether other handles were taken in the meantime.
    fn withdraw(&self, registration: &Arc<Registration>) -> bool {
        let mut channels = self.channels.lock();
        let identity = registration.channel.identity();
        if channels
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, registration))
        {
            channels.remove(identity);
        }
        registration.removed.store(true, Ordering::SeqCst);
        registration.refs.fetch_sub(1, Ordering::SeqCst) > 1
    }

    /// Count another handle for an entry
    pub(crate) fn acquire(&self, registration: &Arc<Registration>) {
        let _channels = self.channels.lock();
        registration.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one handle; the call that takes the count to zero tears down
    pub(crate) fn release(&self, registration: &Arc<Registration>) {
        let last = {
            let mut channels = self.channels.lock();
            let previous = registration.refs.fetch_sub(1, Ordering::SeqCst);
            if previous == 1 {
                if !registration.removed.load(Ordering::SeqCst) {
                    self.deregister_locked(&mut channels, registration.channel.as_ref());
                }
                true
            } else {
                debug!(
                    "Ch{} released (refs={})",
                    registration.channel.id(),
                    previous - 1
                );
                false
            }
        };
        if last {
            self.teardown(registration);
        }
    }

    fn teardown(&self, registration: &Registration) {
        if registration.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = &registration.channel;
        channel.teardown();
        info!("Ch{} {} torn down", channel.id(), channel.identity());
        self.bus.publish(Notification::progress(
            Some(channel.identity().clone()),
            Progress::ChannelTornDown {
                channel_id: channel.id(),
            },
        ));
    }

    /// Log `error` at its level and keep it in the diagnostics error list
    fn record_error(&self, channel_id: u64, error: &ChannelError) {
        match error.log_level() {
            Level::ERROR => error!("Ch{} {}", channel_id, error),
            Level::WARN => warn!("Ch{} {}", channel_id, error),
            _ => info!("Ch{} {}", channel_id, error),
        }
        if let Some(diagnostics) = self.bus.diagnostics() {
            diagnostics.record_error(error);
        }
    }

    pub(crate) fn report_usage_error(&self, channel: &dyn Channel, error: &ChannelError) {
        self.record_error(channel.id(), error);
        self.bus.publish(Notification::anomaly(
            Some(channel.identity().clone()),
            Anomaly::UsageError {
                error: error.to_string(),
            },
        ));
    }
}

/// Identity-keyed, reference-counted channel registry
#[derive(Clone)]
pub struct ChannelsRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelsRegistry {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        bus: Arc<NotificationBus>,
        config: ChannelsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
                total_created: AtomicU64::new(0),
                transport,
                bus,
                config,
            }),
        }
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.inner.transport
    }

    /// Process-unique channel number
    pub fn allocate_identifier(&self) -> u64 {
        self.inner.allocate_identifier()
    }

    fn handle(&self, registration: Arc<Registration>) -> ChannelHandle {
        ChannelHandle::new(registration, self.inner.clone())
    }

    /// Existing channel with one more handle, or a new remote channel
    ///
    /// Never fails: a malformed name or a refused connection attempt yields an
    /// invalid channel whose operations report the reason.
    pub fn get_or_create(&self, identity: impl Into<ChannelIdentity>) -> ChannelHandle {
        let identity = identity.into();
        let inner = &self.inner;
        let mut channels = inner.channels.lock();

        if let Some(registration) = channels.get(&identity) {
            let refs = registration.refs.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                "Ch{} {} reused (refs={})",
                registration.channel.id(),
                identity,
                refs
            );
            let registration = registration.clone();
            drop(channels);
            return self.handle(registration);
        }

        let id = inner.allocate_identifier();

        if let Err(reason) = identity.parse_name() {
            let channel: ChannelRef =
                InvalidChannel::new(id, identity.clone(), reason.to_string(), inner.bus.clone());
            let registration = inner.insert_locked(&mut channels, channel.clone());
            drop(channels);
            channel.base().publish_created();
            return self.handle(registration);
        }

        let remote = RemoteChannel::new(
            id,
            identity.clone(),
            inner.bus.clone(),
            inner.transport.clone(),
        );
        // Transport events wait until ChannelCreated is queued
        let transitions = remote.base().lock_transitions();
        remote.base().queue_created(&transitions);
        let channel: ChannelRef = remote.clone();
        let registration = inner.insert_locked(&mut channels, channel);
        drop(channels);

        match inner.transport.attempt_connect(&identity, remote.events()) {
            Ok(subscription) => {
                remote.attach(subscription);
                drop(transitions);
                remote.base().flush();
                self.handle(registration)
            },
            Err(e) => {
                let error = format!("{:#}", e);
                inner.record_error(
                    id,
                    &ChannelError::transport(format!("connect {}: {}", identity, error)),
                );
                let shared = inner.withdraw(&registration);
                if shared {
                    // Handles taken meanwhile keep a channel that never connects
                    drop(transitions);
                    remote.base().flush();
                } else {
                    remote.base().discard_queued(&transitions);
                    registration.torn_down.store(true, Ordering::SeqCst);
                    drop(transitions);
                }

                let invalid = InvalidChannel::new(
                    id,
                    identity,
                    format!("connection attempt failed: {}", error),
                    inner.bus.clone(),
                );
                invalid.base().publish_anomaly(Anomaly::UnexpectedError {
                    context: "attempt_connect".to_string(),
                    error,
                });
                invalid.base().publish_created();
                self.handle(Registration::new(invalid, false))
            },
        }
    }

    /// Shorthand for `get_or_create` with an explicit access mode
    pub fn get_or_create_with_mode(&self, name: &str, access_mode: AccessMode) -> ChannelHandle {
        self.get_or_create(ChannelIdentity::new(name, access_mode))
    }

    /// Non-creating lookup; a hit counts as a new handle
    pub fn try_get(&self, identity: &ChannelIdentity) -> Option<ChannelHandle> {
        let registration = {
            let channels = self.inner.channels.lock();
            let registration = channels.get(identity)?.clone();
            registration.refs.fetch_add(1, Ordering::SeqCst);
            registration
        };
        Some(self.handle(registration))
    }

    /// Create a local channel; fails if the identity is already registered
    pub fn create_local(
        &self,
        descriptor: LocalChannelDescriptor,
        initially_connected: bool,
    ) -> Result<ChannelHandle> {
        self.local(descriptor, initially_connected, false)
    }

    /// Reuse a registered local channel of that name, or create it
    pub fn get_or_create_local(
        &self,
        descriptor: LocalChannelDescriptor,
        initially_connected: bool,
    ) -> Result<ChannelHandle> {
        self.local(descriptor, initially_connected, true)
    }

    fn local(
        &self,
        descriptor: LocalChannelDescriptor,
        initially_connected: bool,
        reuse: bool,
    ) -> Result<ChannelHandle> {
        let identity = ChannelIdentity::new(descriptor.name.clone(), AccessMode::Value);
        if let Err(reason) = identity.parse_name() {
            return Err(ChannelError::invalid_name(identity.name(), reason));
        }

        let inner = &self.inner;
        let mut channels = inner.channels.lock();
        if let Some(registration) = channels.get(&identity) {
            if !reuse || registration.channel.as_local().is_none() {
                return Err(ChannelError::already_exists(identity.to_string()));
            }
            registration.refs.fetch_add(1, Ordering::SeqCst);
            let registration = registration.clone();
            drop(channels);
            return Ok(self.handle(registration));
        }

        let id = inner.allocate_identifier();
        let local = LocalChannel::new(id, descriptor, inner.bus.clone());
        let transitions = local.base().lock_transitions();
        let channel: ChannelRef = local.clone();
        let registration = inner.insert_locked(&mut channels, channel);
        drop(channels);

        local.base().queue_created(&transitions);
        if initially_connected {
            local.set_connection_status(true);
        }
        drop(transitions);
        local.base().flush();
        Ok(self.handle(registration))
    }

    /// Remove a channel's identity mapping without tearing it down
    ///
    /// # Panics
    ///
    /// If the channel is not registered (or was already deregistered).
    pub fn deregister(&self, channel: &dyn Channel) {
        let mut channels = self.inner.channels.lock();
        self.inner.deregister_locked(&mut channels, channel);
    }

    /// Copy of every registered channel
    pub fn snapshot(&self) -> Vec<ChannelRef> {
        let channels = self.inner.channels.lock();
        channels.values().map(|r| r.channel.clone()).collect()
    }

    /// Recall a registered channel by number
    pub fn find_by_id(&self, id: u64) -> Option<ChannelRef> {
        self.snapshot().into_iter().find(|c| c.id() == id)
    }

    /// All registered channels with this name, across access modes
    pub fn find_by_name(&self, name: &str) -> Vec<ChannelRef> {
        let mut found: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.name() == name)
            .collect();
        found.sort_by_key(|c| c.id());
        found
    }

    /// Handle count of a registered identity, 0 when absent
    pub fn reference_count(&self, identity: &ChannelIdentity) -> usize {
        self.inner
            .channels
            .lock()
            .get(identity)
            .map(|r| r.refs())
            .unwrap_or(0)
    }

    pub fn contains(&self, identity: &ChannelIdentity) -> bool {
        self.inner.channels.lock().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let channels = self.snapshot();
        let states: Vec<_> = channels.iter().map(|c| c.snapshot()).collect();
        RegistryStats {
            registered: channels.len(),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            connected: states.iter().filter(|s| s.is_connected()).count(),
            with_value: states.iter().filter(|s| s.has_value()).count(),
        }
    }

    /// Tear down every registered channel regardless of outstanding handles
    ///
    /// Outstanding handles stay usable for `release`, which then only updates counts.
    pub fn teardown_all(&self) -> usize {
        let registrations: Vec<_> = {
            let mut channels = self.inner.channels.lock();
            channels
                .drain()
                .map(|(_, registration)| {
                    registration.removed.store(true, Ordering::SeqCst);
                    registration
                })
                .collect()
        };
        for registration in &registrations {
            self.inner.teardown(registration);
        }
        if !registrations.is_empty() {
            info!("Registry: {} channels torn down", registrations.len());
        }
        registrations.len()
    }
}

impl std::fmt::Debug for ChannelsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelsRegistry")
            .field("channels", &self.len())
            .field("transport", &self.inner.transport.name())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::descriptors::{FieldInfo, FieldType, ValueInfo};
    use crate::diagnostics::Diagnostics;
    use crate::transport::MemoryTransport;

    fn setup() -> (ChannelsRegistry, MemoryTransport, Arc<Diagnostics>) {
        let transport = MemoryTransport::new();
        let diag = Arc::new(Diagnostics::unbounded());
        let bus = Arc::new(NotificationBus::with_diagnostics(diag.clone()));
        let registry = ChannelsRegistry::new(
            Arc::new(transport.clone()),
            bus,
            ChannelsConfig::default(),
        );
        (registry, transport, diag)
    }

    #[tokio::test]
    async fn test_same_identity_shares_channel() {
        let (registry, _, _) = setup();
        let a = registry.get_or_create("tank:level");
        let b = registry.get_or_create("tank:level");
        let c = registry.get_or_create_with_mode("tank:level", AccessMode::ValueWithControl);

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.reference_count(a.identity()), 2);
        assert_eq!(registry.find_by_name("tank:level").len(), 2);
        assert_eq!(registry.find_by_id(c.id()).unwrap().identity(), c.identity());
    }

    #[tokio::test]
    async fn test_last_release_tears_down() {
        let (registry, transport, _) = setup();
        let a = registry.get_or_create("pump:speed");
        let b = registry.try_get(a.identity()).unwrap();
        assert_eq!(transport.subscriber_count(), 1);

        a.release().unwrap();
        assert!(registry.contains(b.identity()));
        b.release().unwrap();
        assert!(!registry.contains(b.identity()));
        assert!(registry.try_get(b.identity()).is_none());
        assert_eq!(transport.subscriber_count(), 0);
        assert!(b.channel().base().is_disposed());
    }

    #[tokio::test]
    async fn test_invalid_name_gets_registered_invalid_channel() {
        let (registry, _, diag) = setup();
        let handle = registry.get_or_create("pump:speed.val");

        assert_eq!(handle.kind(), ChannelKind::Invalid);
        assert!(registry.contains(handle.identity()));
        assert!(diag.entries()[0].text.contains("ChannelCreatedAsInvalid"));
        handle.release().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_refused_connection_yields_unregistered_invalid_channel() {
        let (registry, transport, diag) = setup();
        transport.refuse_connections(true);
        let handle = registry.get_or_create("pump:speed");

        assert_eq!(handle.kind(), ChannelKind::Invalid);
        assert!(!registry.contains(handle.identity()));
        assert_eq!(diag.anomalies().len(), 1);
        assert!(handle
            .snapshot()
            .validity
            .reason()
            .unwrap()
            .contains("connection refused"));

        // Next attempt goes to the transport again
        transport.refuse_connections(false);
        let retry = registry.get_or_create("pump:speed");
        assert_eq!(retry.kind(), ChannelKind::Remote);
        assert_ne!(retry.id(), handle.id());
        handle.release().unwrap();
        assert_eq!(registry.len(), 1);
    }

    /// Reads the registry from inside `attempt_connect`
    struct InspectingTransport {
        inner: MemoryTransport,
        registry: std::sync::OnceLock<ChannelsRegistry>,
        seen: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl ChannelTransport for InspectingTransport {
        fn name(&self) -> &str {
            "inspecting"
        }

        fn attempt_connect(
            &self,
            identity: &ChannelIdentity,
            events: Arc<dyn crate::transport::TransportEvents>,
        ) -> anyhow::Result<Box<dyn crate::transport::Subscription>> {
            if let Some(registry) = self.registry.get() {
                let refs = registry.reference_count(identity);
                self.seen.lock().push((identity.to_string(), refs));
            }
            self.inner.attempt_connect(identity, events)
        }

        async fn write(
            &self,
            identity: &ChannelIdentity,
            value: crate::descriptors::ChannelValue,
        ) -> std::result::Result<crate::transport::WriteAck, crate::transport::TransportError>
        {
            self.inner.write(identity, value).await
        }

        async fn query_once(
            &self,
            identity: &ChannelIdentity,
        ) -> std::result::Result<ValueInfo, crate::transport::TransportError> {
            self.inner.query_once(identity).await
        }
    }

    #[tokio::test]
    async fn test_connect_attempt_runs_outside_registry_lock() {
        let memory = MemoryTransport::new();
        let transport = Arc::new(InspectingTransport {
            inner: memory.clone(),
            registry: std::sync::OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let diag = Arc::new(Diagnostics::unbounded());
        let registry = ChannelsRegistry::new(
            transport.clone(),
            Arc::new(NotificationBus::with_diagnostics(diag.clone())),
            ChannelsConfig::default(),
        );
        assert!(transport.registry.set(registry.clone()).is_ok());

        let handle = registry.get_or_create("a:x");
        assert_eq!(handle.kind(), ChannelKind::Remote);
        assert_eq!(*transport.seen.lock(), vec![("a:x".to_string(), 1)]);
        assert!(diag.entries()[0].text.contains("ChannelCreated"));

        // A failed attempt withdraws the entry without announcing the remote channel
        memory.refuse_connections(true);
        let failed = registry.get_or_create("b:x");
        assert_eq!(failed.kind(), ChannelKind::Invalid);
        assert!(!registry.contains(failed.identity()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().total_created, 2);
        let created: Vec<_> = diag
            .entries()
            .into_iter()
            .filter(|e| e.text.contains("b:x") && e.text.contains("ChannelCreated"))
            .collect();
        assert_eq!(created.len(), 1);
        assert!(created[0].text.contains("ChannelCreatedAsInvalid"));
    }

    #[tokio::test]
    async fn test_local_channels() {
        let (registry, _, _) = setup();
        let descriptor: LocalChannelDescriptor = "sim:temp double 20.5".parse().unwrap();
        let a = registry.create_local(descriptor.clone(), true).unwrap();
        assert!(a.has_connected_and_acquired_value());

        let err = registry.create_local(descriptor.clone(), true).unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");

        let b = registry.get_or_create_local(descriptor, false).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(registry.reference_count(a.identity()), 2);

        let bad = LocalChannelDescriptor::new("bad name", FieldInfo::scalar(FieldType::Long));
        assert_eq!(
            registry.create_local(bad, true).unwrap_err().error_code(),
            "INVALID_NAME"
        );
    }

    #[tokio::test]
    async fn test_remote_identity_blocks_local() {
        let (registry, _, _) = setup();
        let _remote = registry.get_or_create("sim:temp");
        let descriptor =
            LocalChannelDescriptor::new("sim:temp", FieldInfo::scalar(FieldType::Double));
        assert!(registry.get_or_create_local(descriptor, true).is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "not registered")]
    async fn test_double_deregister_panics() {
        let (registry, _, _) = setup();
        let handle = registry.get_or_create("a:b");
        registry.deregister(handle.channel().as_ref());
        registry.deregister(handle.channel().as_ref());
    }

    #[tokio::test]
    #[should_panic(expected = "not registered")]
    async fn test_deregister_foreign_channel_panics() {
        let (registry, _, _) = setup();
        let (other, _, _) = setup();
        let _ours = registry.get_or_create("a:b");
        let theirs = other.get_or_create("a:b");
        registry.deregister(theirs.channel().as_ref());
    }

    #[tokio::test]
    async fn test_stats_and_teardown_all() {
        let (registry, transport, _) = setup();
        transport.serve(
            "tank:level",
            FieldInfo::scalar(FieldType::Double),
            Some(ValueInfo::new(3.0)),
        );
        let level = registry.get_or_create("tank:level");
        let _other = registry.get_or_create("tank:temp");
        assert!(level.connect_and_wait_async(std::time::Duration::from_secs(1)).await);

        let stats = registry.stats();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.with_value, 1);
        assert_eq!(stats.total_created, 2);

        assert_eq!(registry.teardown_all(), 2);
        assert!(registry.is_empty());
        assert!(level.channel().base().is_disposed());
        // Late release only updates counts
        level.release().unwrap();
    }

    #[test]
    fn test_identifiers_increase() {
        let (registry, _, _) = setup();
        let a = registry.allocate_identifier();
        let b = registry.allocate_identifier();
        assert!(b > a);
    }
}

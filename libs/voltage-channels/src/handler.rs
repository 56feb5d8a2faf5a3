//! Channel group handler
//!
//! A consumer hands its channel handles to a `ChannelsHandler` together with
//! per-channel callbacks. The handler listens on the notification bus, routes
//! state changes of its channels to those callbacks and releases every owned
//! handle on `dispose`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{ChannelError, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{
    guarded, DeliveryStrategy, InlineDelivery, NotificationBus, NotificationRecipient,
};
use crate::config::ChannelsConfig;
use crate::descriptors::ValueInfo;
use crate::handle::ChannelHandle;
use crate::identity::ChannelIdentity;
use crate::notification::{Anomaly, Notification};
use crate::snapshot::ChannelState;

pub type ConnectionCallback =
    Arc<dyn Fn(&ChannelState, bool) -> anyhow::Result<()> + Send + Sync>;
pub type ValueCallback =
    Arc<dyn Fn(&ChannelState, &ValueInfo) -> anyhow::Result<()> + Send + Sync>;

/// Callbacks installed for one channel
#[derive(Clone, Default)]
pub struct ChannelCallbacks {
    on_connection: Option<ConnectionCallback>,
    on_value: Option<ValueCallback>,
}

impl ChannelCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelState, bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_value<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelState, &ValueInfo) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_value = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_connection.is_none() && self.on_value.is_none()
    }
}

impl std::fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_value", &self.on_value.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct HandlerOptions {
    /// Label used in logs and callback fault reports
    pub name: String,
    /// Replay the current state to the callbacks of each newly installed channel
    pub auto_raise_synthetic_events: bool,
    /// Per-channel wait of `wait_until_ready_async`
    pub ready_timeout: Duration,
    pub delivery: Arc<dyn DeliveryStrategy>,
}

impl HandlerOptions {
    pub fn from_config(config: &ChannelsConfig) -> Self {
        Self {
            name: "channels-handler".to_string(),
            auto_raise_synthetic_events: config.auto_raise_synthetic_events,
            ready_timeout: config.connect_timeout(),
            delivery: Arc::new(InlineDelivery),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_auto_raise(mut self, enabled: bool) -> Self {
        self.auto_raise_synthetic_events = enabled;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn DeliveryStrategy>) -> Self {
        self.delivery = delivery;
        self
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::from_config(&ChannelsConfig::default())
    }
}

impl std::fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("name", &self.name)
            .field("auto_raise_synthetic_events", &self.auto_raise_synthetic_events)
            .field("ready_timeout", &self.ready_timeout)
            .finish()
    }
}

/// Installed handles and merged callbacks of one underlying channel
struct InstalledChannel {
    handles: Vec<ChannelHandle>,
    callbacks: Vec<ChannelCallbacks>,
}

impl InstalledChannel {
    fn primary(&self) -> Option<&ChannelHandle> {
        self.handles.first()
    }
}

/// What a dispatch needs, cloned out of the entry lock
struct DispatchTarget {
    identity: ChannelIdentity,
    state: Arc<ChannelState>,
    callbacks: Vec<ChannelCallbacks>,
}

struct HandlerShared {
    name: String,
    bus: Arc<NotificationBus>,
    delivery: Arc<dyn DeliveryStrategy>,
    /// Keyed by underlying channel id
    entries: Mutex<HashMap<u64, InstalledChannel>>,
}

impl HandlerShared {
    fn callbacks_for(&self, channel_id: u64) -> Vec<ChannelCallbacks> {
        self.entries
            .lock()
            .get(&channel_id)
            .map(|entry| entry.callbacks.clone())
            .unwrap_or_default()
    }

    /// Run one callback through the delivery strategy inside a fault boundary
    fn dispatch<F>(&self, identity: &ChannelIdentity, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let bus = self.bus.clone();
        let handler = self.name.clone();
        let identity = identity.clone();
        self.delivery.deliver(Box::new(move || {
            if let Err(error) = guarded(job) {
                warn!("{} callback for {} failed: {}", handler, identity, error);
                bus.publish(Notification::anomaly(
                    Some(identity),
                    Anomaly::CallbackFault { handler, error },
                ));
            }
        }));
    }

    fn dispatch_connection(&self, target: &DispatchTarget, connected: bool) {
        for callbacks in &target.callbacks {
            if let Some(cb) = callbacks.on_connection.clone() {
                let state = target.state.clone();
                self.dispatch(&target.identity, move || cb(&state, connected));
            }
        }
    }

    fn dispatch_value(&self, target: &DispatchTarget, value: &ValueInfo) {
        for callbacks in &target.callbacks {
            if let Some(cb) = callbacks.on_value.clone() {
                let state = target.state.clone();
                let value = value.clone();
                self.dispatch(&target.identity, move || cb(&state, &value));
            }
        }
    }

    /// Replay the current snapshot as if the transitions had just happened
    ///
    /// With `only`, the replay goes to that callback set alone instead of every
    /// set merged into the channel's entry.
    fn raise_synthetic(&self, channel_id: u64, only: Option<ChannelCallbacks>) {
        let target = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(&channel_id) else {
                return;
            };
            let Some(handle) = entry.primary() else {
                return;
            };
            DispatchTarget {
                identity: handle.identity().clone(),
                state: handle.snapshot(),
                callbacks: match only {
                    Some(callbacks) => vec![callbacks],
                    None => entry.callbacks.clone(),
                },
            }
        };
        debug!(
            "{} synthetic events for Ch{} {}",
            self.name, channel_id, target.identity
        );
        self.dispatch_connection(&target, target.state.is_connected());
        if let Some(value) = target.state.value_info.clone() {
            self.dispatch_value(&target, &value);
        }
    }
}

impl NotificationRecipient for HandlerShared {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        let Some(states) = notification.states() else {
            return Ok(());
        };
        let kind = &states.change.kind;
        if !kind.is_connection_class() && !kind.is_value_class() {
            return Ok(());
        }
        let callbacks = self.callbacks_for(states.current.channel_id);
        if callbacks.is_empty() {
            return Ok(());
        }
        let target = DispatchTarget {
            identity: states.identity().clone(),
            state: states.current.clone(),
            callbacks,
        };
        if let Some(value) = kind.value() {
            self.dispatch_value(&target, value);
        } else {
            self.dispatch_connection(&target, target.state.is_connected());
        }
        Ok(())
    }
}

/// Owner of a batch of channels and their callbacks
pub struct ChannelsHandler {
    shared: Arc<HandlerShared>,
    recipient: Arc<dyn NotificationRecipient>,
    auto_raise: bool,
    ready_timeout: Duration,
    disposed: AtomicBool,
}

impl ChannelsHandler {
    /// Create a handler and subscribe it to `bus`
    pub fn new(bus: Arc<NotificationBus>, options: HandlerOptions) -> Self {
        let shared = Arc::new(HandlerShared {
            name: options.name,
            bus: bus.clone(),
            delivery: options.delivery,
            entries: Mutex::new(HashMap::new()),
        });
        let recipient: Arc<dyn NotificationRecipient> = shared.clone();
        bus.register(recipient.clone());
        debug!("{} subscribed", shared.name);

        Self {
            shared,
            recipient,
            auto_raise: options.auto_raise_synthetic_events,
            ready_timeout: options.ready_timeout,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Take ownership of `handle` and attach `callbacks` to its channel
    ///
    /// Installing a second handle of the same underlying channel merges the
    /// callbacks into the existing entry. Both handles are released on dispose.
    pub fn install(&self, handle: ChannelHandle, callbacks: ChannelCallbacks) -> Result<()> {
        if self.is_disposed() {
            let error = ChannelError::usage(format!(
                "install of {} on disposed handler {}",
                handle.identity(),
                self.shared.name
            ));
            let _ = handle.release();
            return Err(error);
        }

        let channel_id = handle.id();
        let replay = (self.auto_raise && !callbacks.is_empty()).then(|| callbacks.clone());
        {
            let mut entries = self.shared.entries.lock();
            let entry = entries
                .entry(channel_id)
                .or_insert_with(|| InstalledChannel {
                    handles: Vec::new(),
                    callbacks: Vec::new(),
                });
            debug!(
                "{} install Ch{} {} ({} handles)",
                self.shared.name,
                channel_id,
                handle.identity(),
                entry.handles.len() + 1
            );
            entry.handles.push(handle);
            if !callbacks.is_empty() {
                entry.callbacks.push(callbacks);
            }
        }

        if let Some(callbacks) = replay {
            self.shared.raise_synthetic(channel_id, Some(callbacks));
        }
        Ok(())
    }

    /// Replay the current state of every installed channel
    pub fn raise_synthetic_events(&self) {
        let mut ids: Vec<u64> = self.shared.entries.lock().keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.shared.raise_synthetic(id, None);
        }
    }

    /// Replay the current state of one installed channel
    ///
    /// Returns false when no installed channel has this identity.
    pub fn raise_synthetic_events_on(&self, identity: &ChannelIdentity) -> bool {
        let channel_id = self
            .shared
            .entries
            .lock()
            .iter()
            .find(|(_, entry)| entry.primary().is_some_and(|h| h.identity() == identity))
            .map(|(id, _)| *id);
        match channel_id {
            Some(id) => {
                self.shared.raise_synthetic(id, None);
                true
            }
            None => false,
        }
    }

    /// Wait for every installed channel to connect and acquire a value
    ///
    /// All channels are awaited concurrently, each with the full ready timeout.
    /// `on_failed` is called once per channel that did not become ready.
    pub async fn wait_until_ready_async<F>(&self, mut on_failed: F) -> bool
    where
        F: FnMut(&ChannelIdentity),
    {
        let channels: Vec<_> = {
            let entries = self.shared.entries.lock();
            let mut channels: Vec<_> = entries
                .values()
                .filter_map(|entry| entry.primary().map(|h| h.channel().clone()))
                .collect();
            channels.sort_by_key(|c| c.id());
            channels
        };

        let timeout = self.ready_timeout;
        let results = join_all(
            channels
                .iter()
                .map(|channel| channel.connect_and_wait_async(timeout)),
        )
        .await;

        let mut all_ready = true;
        for (channel, ready) in channels.iter().zip(results) {
            if !ready {
                all_ready = false;
                warn!(
                    "{} Ch{} {} not ready after {:?}",
                    self.shared.name,
                    channel.id(),
                    channel.identity(),
                    timeout
                );
                on_failed(channel.identity());
            }
        }
        all_ready
    }

    pub async fn wait_until_ready(&self) -> bool {
        self.wait_until_ready_async(|_| {}).await
    }

    /// Unsubscribe, release every owned handle and forget all entries
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.bus.unregister(&self.recipient);

        let entries: Vec<InstalledChannel> = {
            let mut map = self.shared.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        let mut released = 0;
        for entry in entries {
            for handle in entry.handles {
                match handle.release() {
                    Ok(()) => released += 1,
                    Err(e) => warn!("{} release of {}: {}", self.shared.name, handle.identity(), e),
                }
            }
        }
        info!("{} disposed, {} handles released", self.shared.name, released);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Number of distinct underlying channels installed
    pub fn installed_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Identities of the installed channels, ordered by channel id
    pub fn channels(&self) -> Vec<ChannelIdentity> {
        let entries = self.shared.entries.lock();
        let mut installed: Vec<_> = entries
            .iter()
            .filter_map(|(id, entry)| entry.primary().map(|h| (*id, h.identity().clone())))
            .collect();
        installed.sort_by_key(|(id, _)| *id);
        installed.into_iter().map(|(_, identity)| identity).collect()
    }
}

impl Drop for ChannelsHandler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ChannelsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelsHandler")
            .field("name", &self.shared.name)
            .field("installed", &self.installed_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

//! In-memory transport
//!
//! Simulated server backed by DashMap. Used by tests and local simulations, and
//! as the default transport of the process-wide runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ChannelTransport, Subscription, TransportError, TransportEvents, WriteAck};
use crate::descriptors::{ChannelValue, FieldInfo, LocalChannelDescriptor, ValueInfo};
use crate::identity::{ChannelIdentity, ChannelName};

/// One simulated process variable
#[derive(Debug, Clone)]
struct ServedPv {
    field_info: FieldInfo,
    value: Option<ValueInfo>,
    online: bool,
}

struct Subscriber {
    key: String,
    identity: ChannelIdentity,
    events: Arc<dyn TransportEvents>,
}

#[derive(Default)]
struct MemoryState {
    pvs: DashMap<String, ServedPv>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscription: AtomicU64,
    refuse_connections: AtomicBool,
    shut_down: AtomicBool,
    latency: Mutex<Duration>,
    writes: AtomicU64,
    queries: AtomicU64,
}

/// Statistics about the simulated server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTransportStats {
    pub served: usize,
    pub online: usize,
    pub subscriptions: usize,
    pub writes: u64,
    pub queries: u64,
}

/// Resolve a channel name to the served PV key
fn pv_key(name: &str) -> String {
    ChannelName::parse(name)
        .map(|n| n.canonical())
        .unwrap_or_else(|_| name.to_string())
}

/// Shape a served value for the subscriber's access mode
fn shaped(identity: &ChannelIdentity, value: &ValueInfo) -> ValueInfo {
    let mut value = value.clone();
    if !identity.access_mode().wants_control() {
        value.control = None;
    }
    value
}

/// In-process channel server
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a PV, connecting any subscriber already waiting for it
    pub fn serve(&self, name: &str, field_info: FieldInfo, initial: Option<ValueInfo>) {
        let key = pv_key(name);
        self.state.pvs.insert(
            key.clone(),
            ServedPv {
                field_info,
                value: initial,
                online: true,
            },
        );
        debug!("Memory: serving {}", key);
        self.announce(&key);
    }

    pub fn serve_descriptor(&self, descriptor: &LocalChannelDescriptor) {
        self.serve(
            &descriptor.name,
            descriptor.field_info.clone(),
            descriptor.initial_value.clone().map(ValueInfo::new),
        );
    }

    /// Stop serving a PV; subscribers see a disconnect
    pub fn unserve(&self, name: &str) -> bool {
        let key = pv_key(name);
        let removed = self.state.pvs.remove(&key).is_some();
        if removed {
            for events in self.subscribers_of(&key) {
                events.1.disconnected();
            }
        }
        removed
    }

    /// Publish a new value to the PV and its subscribers
    pub fn post_value(&self, name: &str, value: impl Into<ChannelValue>) -> bool {
        self.post_value_info(name, ValueInfo::new(value))
    }

    pub fn post_value_info(&self, name: &str, value: ValueInfo) -> bool {
        let key = pv_key(name);
        let online = match self.state.pvs.get_mut(&key) {
            Some(mut pv) => {
                pv.value = Some(value.clone());
                pv.online
            },
            None => return false,
        };
        if online {
            for (identity, events) in self.subscribers_of(&key) {
                events.value_update(shaped(&identity, &value));
            }
        }
        true
    }

    /// Simulate a server outage for one PV
    pub fn take_offline(&self, name: &str) -> bool {
        let key = pv_key(name);
        let changed = match self.state.pvs.get_mut(&key) {
            Some(mut pv) => std::mem::replace(&mut pv.online, false),
            None => false,
        };
        if changed {
            for (_, events) in self.subscribers_of(&key) {
                events.disconnected();
            }
        }
        changed
    }

    pub fn bring_online(&self, name: &str) -> bool {
        let key = pv_key(name);
        let changed = match self.state.pvs.get_mut(&key) {
            Some(mut pv) => !std::mem::replace(&mut pv.online, true),
            None => false,
        };
        if changed {
            self.announce(&key);
        }
        changed
    }

    /// Change the advertised field info, seen by subscribers on their next connect
    pub fn set_field_info(&self, name: &str, field_info: FieldInfo) -> bool {
        match self.state.pvs.get_mut(&pv_key(name)) {
            Some(mut pv) => {
                pv.field_info = field_info;
                true
            },
            None => false,
        }
    }

    pub fn current_value(&self, name: &str) -> Option<ValueInfo> {
        self.state
            .pvs
            .get(&pv_key(name))
            .and_then(|pv| pv.value.clone())
    }

    /// Make `attempt_connect` fail outright
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Delay applied before connects, writes and queries complete
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.len()
    }

    pub fn stats(&self) -> MemoryTransportStats {
        MemoryTransportStats {
            served: self.state.pvs.len(),
            online: self.state.pvs.iter().filter(|pv| pv.online).count(),
            subscriptions: self.state.subscribers.len(),
            writes: self.state.writes.load(Ordering::Relaxed),
            queries: self.state.queries.load(Ordering::Relaxed),
        }
    }

    fn latency(&self) -> Duration {
        *self.state.latency.lock()
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Event sinks subscribed to `key`, collected without holding map refs
    fn subscribers_of(&self, key: &str) -> Vec<(ChannelIdentity, Arc<dyn TransportEvents>)> {
        self.state
            .subscribers
            .iter()
            .filter(|s| s.key == key)
            .map(|s| (s.identity.clone(), s.events.clone()))
            .collect()
    }

    /// Send connected + current value to every subscriber of an online PV
    fn announce(&self, key: &str) {
        let Some(pv) = self.state.pvs.get(key).map(|pv| pv.clone()) else {
            return;
        };
        if !pv.online {
            return;
        }
        for (identity, events) in self.subscribers_of(key) {
            events.connected(pv.field_info.clone());
            if let Some(value) = &pv.value {
                events.value_update(shaped(&identity, value));
            }
        }
    }

    fn online_pv(&self, identity: &ChannelIdentity) -> Result<ServedPv, TransportError> {
        match self.state.pvs.get(&pv_key(identity.name())) {
            Some(pv) if pv.online => Ok(pv.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

struct MemorySubscription {
    id: u64,
    state: Arc<MemoryState>,
}

impl Subscription for MemorySubscription {
    fn cancel(&self) {
        if self.state.subscribers.remove(&self.id).is_some() {
            trace!("Memory: subscription {} cancelled", self.id);
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn attempt_connect(
        &self,
        identity: &ChannelIdentity,
        events: Arc<dyn TransportEvents>,
    ) -> anyhow::Result<Box<dyn Subscription>> {
        if self.state.shut_down.load(Ordering::SeqCst) {
            anyhow::bail!("memory transport is shut down");
        }
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused for {}", identity);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| anyhow::anyhow!("memory transport requires a tokio runtime"))?;

        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        let key = pv_key(identity.name());
        self.state.subscribers.insert(
            id,
            Subscriber {
                key: key.clone(),
                identity: identity.clone(),
                events: events.clone(),
            },
        );
        debug!("Memory: subscription {} for {}", id, identity);

        let transport = self.clone();
        let identity = identity.clone();
        runtime.spawn(async move {
            transport.simulate_latency().await;
            if !transport.state.subscribers.contains_key(&id) {
                return;
            }
            let Ok(pv) = transport.online_pv(&identity) else {
                return;
            };
            events.connected(pv.field_info.clone());
            if let Some(value) = &pv.value {
                events.value_update(shaped(&identity, value));
            }
        });

        Ok(Box::new(MemorySubscription {
            id,
            state: self.state.clone(),
        }))
    }

    async fn write(
        &self,
        identity: &ChannelIdentity,
        value: ChannelValue,
    ) -> Result<WriteAck, TransportError> {
        self.simulate_latency().await;
        if self.state.shut_down.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("transport is shut down".to_string()));
        }
        let pv = self.online_pv(identity)?;
        self.state.writes.fetch_add(1, Ordering::Relaxed);

        if !pv.field_info.writable {
            return Ok(WriteAck::Rejected("channel is read-only".to_string()));
        }
        if !pv.field_info.accepts(&value) {
            return Ok(WriteAck::Rejected(format!(
                "value {} does not fit field {}",
                value, pv.field_info
            )));
        }

        // Keep the control metadata of the previous value
        let mut info = ValueInfo::new(value);
        info.control = pv.value.and_then(|v| v.control);
        self.post_value_info(identity.name(), info);
        Ok(WriteAck::Accepted)
    }

    async fn query_once(&self, identity: &ChannelIdentity) -> Result<ValueInfo, TransportError> {
        self.simulate_latency().await;
        self.state.queries.fetch_add(1, Ordering::Relaxed);
        let pv = self.online_pv(identity)?;
        pv.value
            .map(|v| shaped(identity, &v))
            .ok_or_else(|| TransportError::Failed("no value available".to_string()))
    }

    fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
        self.state.subscribers.clear();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("stats", &self.stats())
            .finish()
    }
}

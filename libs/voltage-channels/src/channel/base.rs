//! Per-channel state machine
//!
//! `ChannelBase` owns the current/previous snapshot pair of one channel. Every
//! transition runs under the channel's transition lock: the new snapshot is
//! computed, swapped in, and queued on the channel's outbox. The outbox is
//! drained onto the bus after the lock is released, one drainer at a time, so
//! notifications of one channel reach the bus in sequence order while
//! recipient callbacks never run under the transition lock.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::NotificationBus;
use crate::descriptors::{FieldInfo, ValueInfo};
use crate::identity::ChannelIdentity;
use crate::notification::{Anomaly, Notification, StateChange, StateChangeKind};
use crate::snapshot::{ChannelState, ChannelStatesSnapshot, ConnectionStatus, ValidityStatus};

/// Input to the transition function
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected(FieldInfo),
    Disconnected,
    Value(ValueInfo),
    Disposing,
}

pub(crate) struct StatePair {
    current: Arc<ChannelState>,
    previous: Option<Arc<ChannelState>>,
    disposed: bool,
}

/// Notifications waiting for delivery, in sequence order
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Notification>,
    draining: bool,
}

pub(crate) type TransitionGuard<'a> = ReentrantMutexGuard<'a, RefCell<StatePair>>;

/// Result of computing a transition, published after the borrow ends
struct Outcome {
    anomaly: Option<Anomaly>,
    snapshot: Option<ChannelStatesSnapshot>,
}

impl Outcome {
    fn none() -> Self {
        Self {
            anomaly: None,
            snapshot: None,
        }
    }
}

pub struct ChannelBase {
    id: u64,
    identity: ChannelIdentity,
    bus: Arc<NotificationBus>,
    transitions: ReentrantMutex<RefCell<StatePair>>,
    outbox: Mutex<Outbox>,
    state_tx: watch::Sender<Arc<ChannelState>>,
}

impl ChannelBase {
    pub(crate) fn new(
        id: u64,
        identity: ChannelIdentity,
        validity: ValidityStatus,
        bus: Arc<NotificationBus>,
    ) -> Self {
        let initial = Arc::new(ChannelState::initial(id, identity.clone(), validity));
        let (state_tx, _) = watch::channel(initial.clone());
        Self {
            id,
            identity,
            bus,
            transitions: ReentrantMutex::new(RefCell::new(StatePair {
                current: initial,
                previous: None,
                disposed: false,
            })),
            outbox: Mutex::new(Outbox::default()),
            state_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ChannelState> {
        self.state_tx.borrow().clone()
    }

    /// Current and previous snapshots, read together
    pub fn states(&self) -> (Arc<ChannelState>, Option<Arc<ChannelState>>) {
        let guard = self.transitions.lock();
        let pair = guard.borrow();
        (pair.current.clone(), pair.previous.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.transitions.lock().borrow().disposed
    }

    /// Hold off transitions, e.g. while the creation notification is pending
    pub(crate) fn lock_transitions(&self) -> TransitionGuard<'_> {
        self.transitions.lock()
    }

    /// Publish the initial `ChannelCreated`/`ChannelCreatedAsInvalid` snapshot
    pub(crate) fn publish_created(&self) {
        let guard = self.transitions.lock();
        self.queue_created(&guard);
        drop(guard);
        self.flush();
    }

    /// Queue the creation notification ahead of any transition
    ///
    /// Delivered by the next `flush` once the caller releases `_guard`.
    pub(crate) fn queue_created(&self, _guard: &TransitionGuard<'_>) {
        let current = self.snapshot();
        let kind = match &current.validity {
            ValidityStatus::Valid => StateChangeKind::ChannelCreated,
            ValidityStatus::Invalid(reason) => StateChangeKind::ChannelCreatedAsInvalid {
                reason: reason.clone(),
            },
        };
        debug!("Ch{} {} created", self.id, self.identity);
        self.enqueue(Notification::state_changed(ChannelStatesSnapshot {
            change: StateChange::new(self.identity.clone(), kind),
            current,
            previous: None,
        }));
    }

    pub(crate) fn publish_anomaly(&self, anomaly: Anomaly) {
        {
            let _guard = self.transitions.lock();
            self.queue_anomaly(anomaly);
        }
        self.flush();
    }

    fn queue_anomaly(&self, anomaly: Anomaly) {
        warn!("Ch{} {}: {}", self.id, self.identity, anomaly);
        self.enqueue(Notification::anomaly(Some(self.identity.clone()), anomaly));
    }

    /// Drop undelivered notifications of a channel nobody will see
    pub(crate) fn discard_queued(&self, _guard: &TransitionGuard<'_>) {
        let dropped = std::mem::take(&mut self.outbox.lock().queue);
        debug!("Ch{} discarded {} queued notifications", self.id, dropped.len());
    }

    fn enqueue(&self, notification: Notification) {
        self.outbox.lock().queue.push_back(notification);
    }

    /// Deliver queued notifications unless another drainer is active
    ///
    /// Returns without delivering while the current thread still holds the
    /// transition lock; the outermost holder flushes after releasing it.
    pub(crate) fn flush(&self) {
        if self.transitions.is_owned_by_current_thread() {
            return;
        }
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(notification) => notification,
                    None => {
                        outbox.draining = false;
                        return;
                    },
                }
            };
            self.bus.publish(next);
        }
    }

    /// Apply one event; returns the published triple, or `None` for a no-op
    pub fn apply(&self, event: ChannelEvent) -> Option<ChannelStatesSnapshot> {
        let guard = self.transitions.lock();
        let outcome = {
            let mut pair = guard.borrow_mut();
            let outcome = self.transition(&pair, event);
            if let Some(snapshot) = &outcome.snapshot {
                if matches!(snapshot.change.kind, StateChangeKind::ChannelDisconnecting) {
                    pair.disposed = true;
                }
                let old = std::mem::replace(&mut pair.current, snapshot.current.clone());
                pair.previous = Some(old);
                self.state_tx.send_replace(snapshot.current.clone());
            }
            outcome
        };

        // Queue under the lock so the outbox holds this channel's sequence order
        if let Some(anomaly) = outcome.anomaly {
            self.queue_anomaly(anomaly);
        }
        if let Some(snapshot) = &outcome.snapshot {
            debug!("Ch{} {}", self.id, snapshot);
            self.enqueue(Notification::state_changed(snapshot.clone()));
        }
        drop(guard);
        self.flush();
        outcome.snapshot
    }

    fn transition(&self, pair: &StatePair, event: ChannelEvent) -> Outcome {
        let prev = &pair.current;
        if pair.disposed {
            debug!("Ch{} disposed, ignoring {:?}", self.id, event);
            return Outcome::none();
        }
        if !prev.is_valid() && !matches!(event, ChannelEvent::Disposing) {
            debug!("Ch{} invalid, ignoring {:?}", self.id, event);
            return Outcome::none();
        }

        let mut next = prev.successor();
        let mut anomaly = None;
        let kind = match event {
            ChannelEvent::Connected(field_info) => {
                if prev.is_connected() {
                    debug!("Ch{} already connected", self.id);
                    return Outcome::none();
                }
                next.connection = ConnectionStatus::Connected;
                match &prev.field_info {
                    None => {
                        next.field_info = Some(field_info.clone());
                        StateChangeKind::ConnectionEstablished(field_info)
                    },
                    Some(known) => {
                        if known.field_type != field_info.field_type
                            || known.element_count != field_info.element_count
                        {
                            anomaly = Some(Anomaly::FieldTypeChanged {
                                previous: known.field_type,
                                reported: field_info.field_type,
                            });
                        }
                        StateChangeKind::ConnectionRestored
                    },
                }
            },
            ChannelEvent::Disconnected => {
                if !prev.is_connected() {
                    debug!("Ch{} already disconnected", self.id);
                    return Outcome::none();
                }
                next.connection = ConnectionStatus::Disconnected;
                StateChangeKind::ConnectionLost
            },
            ChannelEvent::Value(value) => {
                if !prev.is_connected() {
                    return Outcome {
                        anomaly: Some(Anomaly::ValueWhileDisconnected),
                        snapshot: None,
                    };
                }
                next.value_generation += 1;
                next.value_info = Some(value.clone());
                if prev.has_value() {
                    StateChangeKind::ValueChangeNotified(value)
                } else {
                    StateChangeKind::ValueAcquired(value)
                }
            },
            ChannelEvent::Disposing => {
                next.connection = ConnectionStatus::Disconnected;
                StateChangeKind::ChannelDisconnecting
            },
        };

        Outcome {
            anomaly,
            snapshot: Some(ChannelStatesSnapshot {
                change: StateChange::new(self.identity.clone(), kind),
                current: Arc::new(next),
                previous: Some(prev.clone()),
            }),
        }
    }

    /// Wait until `predicate` holds for the current snapshot or `timeout` elapses
    ///
    /// Checks the current snapshot first, then wakes on every transition.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&ChannelState) -> bool + Send,
    {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| predicate(state)).await.is_ok()
        })
        .await;
        matches!(waited, Ok(true))
    }
}

impl std::fmt::Debug for ChannelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBase")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("sequence", &self.snapshot().sequence_number)
            .finish()
    }
}

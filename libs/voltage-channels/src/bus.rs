//! Notification bus
//!
//! Synchronous publish/subscribe. Every recipient gets every notification in
//! registration order on the publishing thread. A failing recipient is isolated:
//! its fault becomes an anomaly and delivery to the others continues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::diagnostics::Diagnostics;
use crate::notification::{Anomaly, Notification};

/// A consumer of bus notifications
pub trait NotificationRecipient: Send + Sync {
    /// Label used in fault reports
    fn name(&self) -> &str {
        "recipient"
    }

    fn on_notification(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Closure adapter for ad-hoc recipients
pub struct FnRecipient<F> {
    name: String,
    f: F,
}

impl<F> FnRecipient<F>
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> NotificationRecipient for FnRecipient<F>
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        (self.f)(notification)
    }
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

/// Run `f` inside its own fault boundary
pub(crate) fn guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn same_recipient(a: &Arc<dyn NotificationRecipient>, b: &Arc<dyn NotificationRecipient>) -> bool {
    // Compare data pointers only; vtables may differ across codegen units
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Publish/subscribe hub for channel notifications
pub struct NotificationBus {
    recipients: RwLock<Vec<Arc<dyn NotificationRecipient>>>,
    sink: Option<Arc<Diagnostics>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            recipients: RwLock::new(Vec::new()),
            sink: None,
        }
    }

    /// Bus that also records every notification into `diagnostics`
    pub fn with_diagnostics(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            recipients: RwLock::new(Vec::new()),
            sink: Some(diagnostics),
        }
    }

    pub fn diagnostics(&self) -> Option<&Arc<Diagnostics>> {
        self.sink.as_ref()
    }

    /// Register a recipient; returns false if that same instance is already registered
    pub fn register(&self, recipient: Arc<dyn NotificationRecipient>) -> bool {
        let mut recipients = self.recipients.write();
        if recipients.iter().any(|r| same_recipient(r, &recipient)) {
            return false;
        }
        recipients.push(recipient);
        true
    }

    /// Remove a recipient; unknown recipients are ignored
    pub fn unregister(&self, recipient: &Arc<dyn NotificationRecipient>) -> bool {
        let mut recipients = self.recipients.write();
        let before = recipients.len();
        recipients.retain(|r| !same_recipient(r, recipient));
        recipients.len() != before
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.read().len()
    }

    /// Deliver `notification` to every registered recipient
    pub fn publish(&self, notification: Notification) {
        if let Some(sink) = &self.sink {
            sink.record(&notification);
        }

        // Recipients may register/unregister from inside a callback
        let recipients: Vec<_> = self.recipients.read().clone();

        let mut faults = Vec::new();
        for recipient in &recipients {
            if let Err(e) = guarded(|| recipient.on_notification(&notification)) {
                error!("Recipient '{}' failed: {}", recipient.name(), e);
                faults.push((recipient.name().to_string(), e));
            }
        }

        for (recipient, error) in faults {
            if notification.is_anomaly() {
                // A fault while handling an anomaly is recorded, not re-published
                if let Some(sink) = &self.sink {
                    sink.warn(format!(
                        "recipient '{}' failed on anomaly [{}]: {}",
                        recipient, notification, error
                    ));
                } else {
                    warn!("Recipient '{}' failed on anomaly: {}", recipient, error);
                }
                continue;
            }
            self.publish(Notification::anomaly(
                notification.channel.clone(),
                Anomaly::RecipientFault {
                    recipient,
                    notification: notification.to_string(),
                    error,
                },
            ));
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("recipients", &self.recipient_count())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

// ============================================================================
// Delivery strategy
// ============================================================================

/// How a consumer-facing callback is executed
///
/// The bus itself always delivers inline; group handlers route their callbacks
/// through a strategy so an embedding application can move them elsewhere.
pub trait DeliveryStrategy: Send + Sync {
    fn deliver(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Run on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDelivery;

impl DeliveryStrategy for InlineDelivery {
    fn deliver(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job();
    }
}

/// Post each callback as a task on a tokio runtime
#[derive(Debug, Clone)]
pub struct SpawnedDelivery {
    handle: tokio::runtime::Handle,
}

impl SpawnedDelivery {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl DeliveryStrategy for SpawnedDelivery {
    fn deliver(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.handle.spawn(async move { job() });
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::notification::{NotificationKind, Progress};
    use parking_lot::Mutex;

    fn message(text: &str) -> Notification {
        Notification::progress(Some("pump:speed".into()), Progress::Message(text.to_string()))
    }

    fn collector(name: &str, seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn NotificationRecipient> {
        let label = name.to_string();
        Arc::new(FnRecipient::new(name, move |n: &Notification| {
            seen.lock().push(format!("{}:{}", label, n));
            Ok(())
        }))
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(collector("a", seen.clone()));
        bus.register(collector("b", seen.clone()));

        bus.publish(message("hello"));
        assert_eq!(*seen.lock(), vec!["a:hello", "b:hello"]);
    }

    #[test]
    fn test_register_is_identity_based() {
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = collector("a", seen.clone());
        let twin = collector("a", seen.clone());

        assert!(bus.register(a.clone()));
        assert!(!bus.register(a.clone()));
        assert!(bus.register(twin.clone()));
        assert_eq!(bus.recipient_count(), 2);

        assert!(bus.unregister(&a));
        assert!(!bus.unregister(&a));
        assert_eq!(bus.recipient_count(), 1);

        bus.publish(message("x"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_faulty_recipient_is_isolated() {
        let diag = Arc::new(Diagnostics::unbounded());
        let bus = NotificationBus::with_diagnostics(diag.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.register(Arc::new(FnRecipient::new("broken", |n: &Notification| {
            if n.is_anomaly() {
                return Ok(());
            }
            anyhow::bail!("cannot handle {}", n)
        })));
        bus.register(Arc::new(FnRecipient::new("panicky", |n: &Notification| {
            if !n.is_anomaly() {
                panic!("boom");
            }
            Ok(())
        })));
        bus.register(collector("ok", seen.clone()));

        bus.publish(message("hello"));

        let seen = seen.lock();
        assert_eq!(seen[0], "ok:hello");
        // Both faults reached the healthy recipient as anomalies
        assert_eq!(seen.len(), 3);
        let anomalies = diag.anomalies();
        assert_eq!(anomalies.len(), 2);
        assert!(anomalies[0].text.contains("recipient 'broken'"));
        assert!(anomalies[1].text.contains("panic: boom"));
    }

    #[test]
    fn test_fault_on_anomaly_does_not_recurse() {
        let diag = Arc::new(Diagnostics::unbounded());
        let bus = NotificationBus::with_diagnostics(diag.clone());
        bus.register(Arc::new(FnRecipient::new("always-fails", |_: &Notification| {
            anyhow::bail!("nope")
        })));

        bus.publish(message("hello"));

        // One anomaly for the original failure, the failure on that anomaly is a warning
        assert_eq!(diag.anomalies().len(), 1);
        assert_eq!(diag.warnings().len(), 1);
        assert_eq!(diag.entries().len(), 2);
    }

    #[test]
    fn test_recipient_can_unregister_itself() {
        let bus = Arc::new(NotificationBus::new());
        let slot: Arc<Mutex<Option<Arc<dyn NotificationRecipient>>>> = Arc::new(Mutex::new(None));
        let bus_ref = bus.clone();
        let slot_ref = slot.clone();
        let once: Arc<dyn NotificationRecipient> =
            Arc::new(FnRecipient::new("once", move |_: &Notification| {
                if let Some(me) = slot_ref.lock().take() {
                    bus_ref.unregister(&me);
                }
                Ok(())
            }));
        *slot.lock() = Some(once.clone());
        bus.register(once);

        bus.publish(message("1"));
        bus.publish(message("2"));
        assert_eq!(bus.recipient_count(), 0);
    }

    #[tokio::test]
    async fn test_spawned_delivery() {
        let delivery = SpawnedDelivery::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        delivery.deliver(Box::new(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        }));
        assert!(rx.await.is_ok());

        let hit = Arc::new(Mutex::new(false));
        let flag = hit.clone();
        InlineDelivery.deliver(Box::new(move || *flag.lock() = true));
        assert!(*hit.lock());
        assert!(matches!(
            message("x").kind,
            NotificationKind::Progress(Progress::Message(_))
        ));
    }
}

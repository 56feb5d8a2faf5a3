//! Diagnostics sink
//!
//! Rolling log of every published notification plus a separate warning stream.
//! Both live outside the bus delivery order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use errors::{ChannelError, ErrorInfo};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::notification::{Notification, NotificationFamily};

const WARNING_STREAM_CAPACITY: usize = 64;

/// One rendered notification in the rolling log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEntry {
    pub timestamp: DateTime<Utc>,
    pub family: NotificationFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub text: String,
}

impl DiagnosticEntry {
    fn from_notification(notification: &Notification) -> Self {
        Self {
            timestamp: notification.timestamp,
            family: notification.family(),
            channel: notification.channel.as_ref().map(|c| c.to_string()),
            text: notification.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarningMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Queryable notification log and warning stream
pub struct Diagnostics {
    /// `None` keeps everything
    capacity: Option<usize>,
    log: Mutex<VecDeque<DiagnosticEntry>>,
    warnings_capacity: usize,
    warnings: Mutex<VecDeque<WarningMessage>>,
    warning_tx: broadcast::Sender<WarningMessage>,
    /// Contract violations reported through handles, shares `warnings_capacity`
    errors: Mutex<VecDeque<ErrorInfo>>,
    progress_count: AtomicU64,
    anomaly_count: AtomicU64,
}

impl Diagnostics {
    pub fn new(capacity: Option<usize>, warnings_capacity: usize) -> Self {
        let (warning_tx, _) = broadcast::channel(WARNING_STREAM_CAPACITY);
        Self {
            capacity,
            log: Mutex::new(VecDeque::new()),
            warnings_capacity: warnings_capacity.max(1),
            warnings: Mutex::new(VecDeque::new()),
            warning_tx,
            errors: Mutex::new(VecDeque::new()),
            progress_count: AtomicU64::new(0),
            anomaly_count: AtomicU64::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, 200)
    }

    /// Append a notification to the rolling log
    pub fn record(&self, notification: &Notification) {
        match notification.family() {
            NotificationFamily::Progress => self.progress_count.fetch_add(1, Ordering::Relaxed),
            NotificationFamily::Anomaly => self.anomaly_count.fetch_add(1, Ordering::Relaxed),
        };

        let entry = DiagnosticEntry::from_notification(notification);
        let mut log = self.log.lock();
        if let Some(cap) = self.capacity {
            if cap == 0 {
                return;
            }
            while log.len() >= cap {
                log.pop_front();
            }
        }
        log.push_back(entry);
    }

    /// Push a message onto the warning stream
    pub fn warn(&self, message: impl Into<String>) {
        let warning = WarningMessage {
            timestamp: Utc::now(),
            message: message.into(),
        };
        warn!("{}", warning.message);
        {
            let mut warnings = self.warnings.lock();
            while warnings.len() >= self.warnings_capacity {
                warnings.pop_front();
            }
            warnings.push_back(warning.clone());
        }
        // No subscribers is fine
        let _ = self.warning_tx.send(warning);
    }

    /// Last `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<DiagnosticEntry> {
        let log = self.log.lock();
        let skip = log.len().saturating_sub(n);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.log.lock().iter().cloned().collect()
    }

    pub fn anomalies(&self) -> Vec<DiagnosticEntry> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.family == NotificationFamily::Anomaly)
            .cloned()
            .collect()
    }

    pub fn warnings(&self) -> Vec<WarningMessage> {
        self.warnings.lock().iter().cloned().collect()
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<WarningMessage> {
        self.warning_tx.subscribe()
    }

    pub fn progress_count(&self) -> u64 {
        self.progress_count.load(Ordering::Relaxed)
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count.load(Ordering::Relaxed)
    }

    /// Keep the rendered form of a contract violation for dumps
    pub fn record_error(&self, error: &ChannelError) {
        let mut errors = self.errors.lock();
        while errors.len() >= self.warnings_capacity {
            errors.pop_front();
        }
        errors.push_back(error.to_error_info());
    }

    pub fn errors(&self) -> Vec<ErrorInfo> {
        self.errors.lock().iter().cloned().collect()
    }

    /// Drop logged entries, warnings and errors; counters are kept
    pub fn clear(&self) {
        self.log.lock().clear();
        self.warnings.lock().clear();
        self.errors.lock().clear();
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "progress_count": self.progress_count(),
            "anomaly_count": self.anomaly_count(),
            "entries": serde_json::to_value(self.entries()).unwrap_or_default(),
            "warnings": serde_json::to_value(self.warnings()).unwrap_or_default(),
            "errors": serde_json::to_value(self.errors()).unwrap_or_default(),
        })
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Some(1000), 200)
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("capacity", &self.capacity)
            .field("len", &self.log.lock().len())
            .field("progress_count", &self.progress_count())
            .field("anomaly_count", &self.anomaly_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::notification::{Anomaly, Progress};

    fn message(text: &str) -> Notification {
        Notification::progress(None, Progress::Message(text.to_string()))
    }

    #[test]
    fn test_bounded_log_rolls() {
        let diag = Diagnostics::new(Some(3), 10);
        for i in 0..5 {
            diag.record(&message(&format!("m{}", i)));
        }
        let texts: Vec<_> = diag.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(diag.progress_count(), 5);

        let last: Vec<_> = diag.recent(2).into_iter().map(|e| e.text).collect();
        assert_eq!(last, vec!["m3", "m4"]);
        assert_eq!(diag.recent(10).len(), 3);
    }

    #[test]
    fn test_unbounded_log_and_anomalies() {
        let diag = Diagnostics::unbounded();
        for i in 0..1500 {
            diag.record(&message(&format!("m{}", i)));
        }
        diag.record(&Notification::anomaly(
            Some("x:y".into()),
            Anomaly::UsageError {
                error: "released twice".to_string(),
            },
        ));
        assert_eq!(diag.entries().len(), 1501);
        let anomalies = diag.anomalies();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].channel.as_deref(), Some("x:y"));
        assert_eq!(diag.anomaly_count(), 1);

        diag.clear();
        assert!(diag.entries().is_empty());
        assert_eq!(diag.anomaly_count(), 1);
    }

    #[tokio::test]
    async fn test_warning_stream() {
        let diag = Diagnostics::new(Some(10), 2);
        let mut rx = diag.subscribe_warnings();
        diag.warn("first");
        diag.warn("second");
        diag.warn("third");

        assert_eq!(rx.recv().await.unwrap().message, "first");
        let kept: Vec<_> = diag.warnings().into_iter().map(|w| w.message).collect();
        assert_eq!(kept, vec!["second", "third"]);
        // Warnings do not enter the notification log
        assert!(diag.entries().is_empty());
    }

    #[test]
    fn test_to_json() {
        let diag = Diagnostics::default();
        diag.record(&message("hello"));
        diag.warn("careful");
        diag.record_error(&ChannelError::already_released("pump:speed"));
        let dump = diag.to_json();
        assert_eq!(dump["progress_count"], 1);
        assert_eq!(dump["entries"][0]["text"], "hello");
        assert_eq!(dump["entries"][0]["family"], "Progress");
        assert_eq!(dump["warnings"][0]["message"], "careful");
        assert_eq!(dump["errors"][0]["code"], "ALREADY_RELEASED");
        assert!(dump["errors"][0].get("details").is_none());
    }
}

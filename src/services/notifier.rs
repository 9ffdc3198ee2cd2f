//! Notification capability. Transport (SMTP, webhook) lives outside the
//! core; the default implementation records the dispatch in the log.

use async_trait::async_trait;

use crate::utils::EngineResult;

#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct NotificationReceipt {
    pub provider_response: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name recorded on the alert ("email", "log", ...).
    fn channel(&self) -> &'static str;

    async fn send(&self, message: &NotificationMessage) -> EngineResult<NotificationReceipt>;
}

/// Default channel when no transport is wired: the alert is fully recorded,
/// delivery is a log line.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &NotificationMessage) -> EngineResult<NotificationReceipt> {
        tracing::warn!(
            "ALERT NOTIFICATION to={:?} subject={:?}: {}",
            message.to,
            message.subject,
            message.body
        );
        Ok(NotificationReceipt { provider_response: "logged".to_string() })
    }
}

#[cfg(test)]
pub struct MockNotifier {
    pub sent: std::sync::Mutex<Vec<NotificationMessage>>,
    failures: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockNotifier {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
            failures: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for MockNotifier {
    fn channel(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, message: &NotificationMessage) -> EngineResult<NotificationReceipt> {
        use std::sync::atomic::Ordering;
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            return Err(crate::utils::EngineError::internal("mock notifier refused"));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(NotificationReceipt { provider_response: "accepted".to_string() })
    }
}

//! Alert sinks and combinators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::alerts::{Alert, Notifier, Severity};
use crate::clock::{span, Clock};
use crate::observability::metrics;

/// Writes alerts to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        match alert.severity {
            Severity::Critical => tracing::error!(
                title = %alert.title,
                condition = %alert.condition,
                context = ?alert.context,
                "ALERT: {}", alert.message
            ),
            Severity::Warning => tracing::warn!(
                title = %alert.title,
                condition = %alert.condition,
                context = ?alert.context,
                "ALERT: {}", alert.message
            ),
            Severity::Info => tracing::info!(
                title = %alert.title,
                condition = %alert.condition,
                context = ?alert.context,
                "ALERT: {}", alert.message
            ),
        }
        true
    }
}

/// Why a webhook sink could not be built.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("webhook client: {0}")]
    Client(#[from] reqwest::Error),
}

/// POSTs the alert as JSON to a chat/incident webhook.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, WebhookError> {
        let url = Url::parse(url)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        match self.client.post(self.url.clone()).json(alert).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "Alert webhook rejected alert");
                false
            }
            Err(e) => {
                tracing::warn!(timeout = e.is_timeout(), "Alert webhook unreachable");
                false
            }
        }
    }
}

/// Sends to every sink; succeeds if any sink did.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        let mut any = false;
        for sink in &self.sinks {
            any |= sink.notify(alert).await;
        }
        any
    }
}

/// Suppresses repeats of the same condition inside the window.
pub struct DedupNotifier {
    inner: Arc<dyn Notifier>,
    window: Duration,
    clock: Arc<dyn Clock>,
    last_sent: DashMap<String, DateTime<Utc>>,
}

impl DedupNotifier {
    pub fn new(inner: Arc<dyn Notifier>, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            window,
            clock,
            last_sent: DashMap::new(),
        }
    }

    /// Claim the condition's slot. `false` if it was sent within the window.
    fn claim(&self, condition: &str, now: DateTime<Utc>) -> bool {
        match self.last_sent.entry(condition.to_string()) {
            Entry::Occupied(mut e) => {
                if now - *e.get() < span(self.window) {
                    false
                } else {
                    e.insert(now);
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }
}

#[async_trait]
impl Notifier for DedupNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        let now = self.clock.now();
        if !self.claim(&alert.condition, now) {
            tracing::debug!(condition = %alert.condition, "Duplicate alert suppressed");
            metrics::record_alert(alert.severity.as_str(), "suppressed");
            return false;
        }

        let sent = self.inner.notify(alert).await;
        if !sent {
            // Let the next occurrence try again.
            self.last_sent.remove_if(&alert.condition, |_, at| *at == now);
        }
        metrics::record_alert(alert.severity.as_str(), if sent { "sent" } else { "failed" });
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Notifier for Counting {
        async fn notify(&self, _alert: &Alert) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            !self.fail.load(Ordering::SeqCst)
        }
    }

    fn alert(condition: &str) -> Alert {
        Alert::new(Severity::Critical, condition, "Breaker open", "square is failing")
    }

    #[tokio::test]
    async fn test_dedup_window() {
        let sink = Arc::new(Counting::default());
        let clock = Arc::new(ManualClock::starting_now());
        let dedup = DedupNotifier::new(sink.clone(), Duration::from_secs(15 * 60), clock.clone());

        assert!(dedup.notify(&alert("breaker_open:square")).await);
        assert!(!dedup.notify(&alert("breaker_open:square")).await);
        assert!(dedup.notify(&alert("breaker_open:toast")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        clock.advance(chrono::Duration::minutes(15));
        assert!(dedup.notify(&alert("breaker_open:square")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let sink = Arc::new(Counting::default());
        sink.fail.store(true, Ordering::SeqCst);
        let dedup = DedupNotifier::new(sink.clone(), Duration::from_secs(900), Arc::new(ManualClock::starting_now()));

        assert!(!dedup.notify(&alert("c")).await);
        sink.fail.store(false, Ordering::SeqCst);
        assert!(dedup.notify(&alert("c")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fanout_any_success() {
        let ok = Arc::new(Counting::default());
        let bad = Arc::new(Counting::default());
        bad.fail.store(true, Ordering::SeqCst);
        let fanout = FanoutNotifier::new(vec![bad.clone(), ok.clone()]);
        assert!(fanout.notify(&alert("c")).await);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_webhook_rejects_bad_url() {
        let err = WebhookNotifier::new("not a url", Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, WebhookError::InvalidUrl(_)));
        assert!(WebhookNotifier::new("https://hooks.example.com/alerts", Duration::from_secs(5)).is_ok());
    }
}

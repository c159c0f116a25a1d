//! Alerting subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator / HeartbeatMonitor
//!     → DedupNotifier (same condition within the window → suppressed)
//!     → FanoutNotifier
//!         → LogNotifier     (always)
//!         → WebhookNotifier (when configured)
//! ```
//!
//! # Design Decisions
//! - `notify` reports whether the alert was sent; delivery failures never
//!   fail the attempt that raised them
//! - Alert payloads carry masked hints and error classes only

pub mod heartbeat;
pub mod sinks;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::AlertConfig;

pub use heartbeat::HeartbeatMonitor;
pub use sinks::{DedupNotifier, FanoutNotifier, LogNotifier, WebhookError, WebhookNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// `notify(severity, title, message, context)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
    /// Identifies "the same condition" for duplicate suppression.
    pub condition: String,
}

impl Alert {
    pub fn new(severity: Severity, condition: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            context: BTreeMap::new(),
            condition: condition.into(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns `true` if the alert was delivered.
    async fn notify(&self, alert: &Alert) -> bool;
}

/// Log sink, plus the webhook when one is configured, behind the dedup window.
pub fn build_notifier(config: &AlertConfig, clock: Arc<dyn Clock>) -> Arc<dyn Notifier> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.webhook_url {
        match WebhookNotifier::new(url, Duration::from_secs(config.webhook_timeout_secs)) {
            Ok(webhook) => sinks.push(Arc::new(webhook)),
            Err(e) => tracing::error!(error = %e, "Alert webhook disabled"),
        }
    }
    Arc::new(DedupNotifier::new(
        Arc::new(FanoutNotifier::new(sinks)),
        Duration::from_secs(config.dedup_window_secs),
        clock,
    ))
}

//! Store change feed.
//!
//! Every mutation the store commits is published as a [`StoreEvent`] on a
//! `tokio::sync::broadcast` channel. Emission is fire-and-forget; a slow
//! subscriber sees [`StoreEvent::Lagged`] and should treat everything it
//! derived from the store as stale.
//!
//! Teardown is explicit: [`Subscription::unsubscribe`] and
//! [`DebounceHandle::unsubscribe`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::store::types::{BreakerScope, CredentialKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    CredentialChanged(CredentialKey),
    SyncStatusChanged(CredentialKey),
    BreakerChanged(BreakerScope),
    SettingsChanged { location: String },
    /// The subscriber fell behind and missed this many events.
    Lagged { missed: u64 },
}

/// Publisher side of the feed.
pub struct StoreEvents {
    sender: broadcast::Sender<StoreEvent>,
}

impl StoreEvents {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: StoreEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StoreEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for StoreEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEvents")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving side of the feed.
pub struct Subscription {
    receiver: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    /// Next event, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Store subscription lagged");
                Some(StoreEvent::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Stop receiving.
    pub fn unsubscribe(self) {
        drop(self.receiver);
    }
}

/// Handle for a running [`debounce`] task.
#[must_use = "the debounce task runs until unsubscribe() is called"]
pub struct DebounceHandle {
    task: JoinHandle<()>,
}

impl DebounceHandle {
    /// Stop the task and release its subscription.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Coalesce bursts of events: after the first event, keep collecting until
/// `window` has passed, then hand the batch to `on_batch`.
pub fn debounce<F, Fut>(mut subscription: Subscription, window: Duration, on_batch: F) -> DebounceHandle
where
    F: Fn(Vec<StoreEvent>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(first) = subscription.recv().await {
            let mut batch = vec![first];
            let deadline = Instant::now() + window;
            let mut closed = false;
            loop {
                match tokio::time::timeout_at(deadline, subscription.recv()).await {
                    Ok(Some(event)) => batch.push(event),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            on_batch(batch).await;
            if closed {
                break;
            }
        }
    });
    DebounceHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key() -> CredentialKey {
        CredentialKey::new("loc-1", "square")
    }

    #[tokio::test]
    async fn test_subscription_receives_events() {
        let events = StoreEvents::default();
        let mut sub = events.subscribe();
        events.publish(StoreEvent::CredentialChanged(key()));
        assert_eq!(sub.recv().await, Some(StoreEvent::CredentialChanged(key())));

        sub.unsubscribe();
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lag_is_reported() {
        let events = StoreEvents::new(2);
        let mut sub = events.subscribe();
        for _ in 0..5 {
            events.publish(StoreEvent::SyncStatusChanged(key()));
        }
        assert!(matches!(sub.recv().await, Some(StoreEvent::Lagged { .. })));
    }

    #[tokio::test]
    async fn test_debounce_coalesces_burst() {
        let events = StoreEvents::default();
        let batches = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let handle = {
            let batches = batches.clone();
            let seen = seen.clone();
            debounce(events.subscribe(), Duration::from_millis(50), move |batch| {
                let batches = batches.clone();
                let seen = seen.clone();
                async move {
                    batches.fetch_add(1, Ordering::SeqCst);
                    seen.fetch_add(batch.len(), Ordering::SeqCst);
                }
            })
        };

        for i in 0..10 {
            events.publish(StoreEvent::SettingsChanged {
                location: format!("loc-{i}"),
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(events.subscriber_count(), 0);
    }
}

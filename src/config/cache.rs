//! Per-location settings cache.
//!
//! Process-wide, TTL-bounded, refresh-on-miss. Entries are dropped in bulk
//! when the store reports a settings change (debounced), or individually on
//! expiry. Nothing correctness-critical is read from here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{span, Clock};
use crate::store::{debounce, CredentialStore, DebounceHandle, LocationSettings, StoreEvent, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    settings: LocationSettings,
    fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SettingsCache {
    entries: Arc<DashMap<String, Entry>>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            store,
            clock,
            ttl,
        }
    }

    /// Cached settings for a location, fetched from the store on miss or
    /// expiry. Locations with no row get the defaults.
    pub async fn get(&self, location: &str) -> StoreResult<LocationSettings> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(location) {
            if now - entry.fetched_at < span(self.ttl) {
                return Ok(entry.settings.clone());
            }
        }

        let settings = self
            .store
            .load_location_settings(location)
            .await?
            .unwrap_or_default();
        self.entries.insert(
            location.to_string(),
            Entry {
                settings: settings.clone(),
                fetched_at: now,
            },
        );
        Ok(settings)
    }

    pub fn invalidate(&self, location: &str) {
        self.entries.remove(location);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop affected entries whenever the store reports settings changes.
    /// The returned handle must be unsubscribed on teardown.
    pub fn watch(&self, window: Duration) -> DebounceHandle {
        let entries = self.entries.clone();
        debounce(self.store.subscribe(), window, move |batch| {
            let entries = entries.clone();
            async move {
                for event in batch {
                    match event {
                        StoreEvent::SettingsChanged { location } => {
                            entries.remove(&location);
                        }
                        StoreEvent::Lagged { .. } => entries.clear(),
                        _ => {}
                    }
                }
            }
        })
    }
}

//! Time-limited access grants (pre-signed URLs) and their per-key store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use zarr_common::Result;

use crate::object_store::ObjectStoreClient;

/// A URL granting read access to one object until `expires_at`.
///
/// Grants are never extended: once expired, a new one is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    key: String,
    url: Url,
    expires_at: DateTime<Utc>,
}

impl AccessGrant {
    /// Create a grant for `key` valid for `ttl` from now.
    pub fn new(key: impl Into<String>, url: Url, ttl: Duration) -> Self {
        Self::with_expiry(key, url, Utc::now() + to_chrono(ttl))
    }

    pub fn with_expiry(key: impl Into<String>, url: Url, expires_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            url,
            expires_at,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the grant expires within `margin` from now (or already has).
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + to_chrono(margin) >= self.expires_at
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

type GrantSlot = Arc<Mutex<Option<AccessGrant>>>;

/// Per-key cache of access grants with proactive, single-flight refresh.
///
/// A grant is reissued once its remaining lifetime drops below the refresh
/// margin. Callers asking for the same key while a reissue is running wait
/// on that key's slot and observe the new grant; other keys are unaffected.
pub struct GrantStore {
    client: Arc<dyn ObjectStoreClient>,
    ttl: Duration,
    refresh_margin: Duration,
    slots: DashMap<String, GrantSlot>,
    issued: AtomicU64,
}

impl GrantStore {
    /// Create a grant store.
    ///
    /// `refresh_margin` is capped at half the TTL so a fresh grant is always
    /// reusable for a while.
    pub fn new(client: Arc<dyn ObjectStoreClient>, ttl: Duration, refresh_margin: Duration) -> Self {
        Self {
            client,
            ttl,
            refresh_margin: refresh_margin.min(ttl / 2),
            slots: DashMap::new(),
            issued: AtomicU64::new(0),
        }
    }

    /// A grant for `key` that is valid for at least the refresh margin.
    pub async fn grant(&self, key: &str) -> Result<AccessGrant> {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut current = slot.lock().await;
        if let Some(grant) = current.as_ref() {
            if !grant.expires_within(self.refresh_margin) {
                return Ok(grant.clone());
            }
        }

        let fresh = self.client.sign(key, self.ttl).await?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(key, expires_at = %fresh.expires_at(), "Issued access grant");

        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Number of grants issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop cached grants that have already expired.
    ///
    /// A slot some caller has already picked up stays, so that caller and
    /// later ones keep sharing a single reissue. `retain` holds the shard
    /// lock, so no new handle can be taken while a slot is inspected.
    pub fn purge_expired(&self) {
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(grant) => grant.as_ref().is_some_and(|g| !g.is_expired()),
                Err(_) => true,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

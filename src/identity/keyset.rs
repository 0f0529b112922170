//! Key-set cache with whole-snapshot replacement.
//!
//! Readers clone an `Arc<KeySnapshot>` under a short read lock and never see
//! a half-updated set. A refresh builds a complete snapshot off-lock and swaps
//! it in; concurrent refreshes are idempotent and the last writer wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use tracing::debug;

use super::{IdentityError, Provider};

/// Keys returned by one fetch.
#[derive(Clone, Default)]
pub struct FetchedKeys {
    /// Decoding keys by `kid`.
    pub keys: HashMap<String, DecodingKey>,
    /// How long the set may be cached; `None` means until restart.
    pub max_age: Option<Duration>,
}

/// Where a provider's keys come from.
#[async_trait]
pub trait KeySetSource: Send + Sync + 'static {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<FetchedKeys, IdentityError>;
}

/// An immutable generation of a provider's key set.
pub struct KeySnapshot {
    keys: HashMap<String, DecodingKey>,
    generation: u64,
    expires_at: Option<Instant>,
}

impl KeySnapshot {
    /// Key for `kid`.
    #[must_use]
    pub fn key(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    /// Monotonic generation, starting at 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Cached key set for one provider.
pub struct KeySetCache {
    provider: Provider,
    source: Arc<dyn KeySetSource>,
    current: RwLock<Option<Arc<KeySnapshot>>>,
}

impl KeySetCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(provider: Provider, source: Arc<dyn KeySetSource>) -> Self {
        Self {
            provider,
            source,
            current: RwLock::new(None),
        }
    }

    /// Current snapshot, fetching first if there is none or it is stale.
    pub async fn get(&self) -> Result<Arc<KeySnapshot>, IdentityError> {
        let cached = self.current.read().clone();
        match cached {
            Some(snapshot) if !snapshot.is_stale(Instant::now()) => Ok(snapshot),
            _ => self.refresh().await,
        }
    }

    /// Fetch and install a new snapshot.
    pub async fn refresh(&self) -> Result<Arc<KeySnapshot>, IdentityError> {
        let fetched = self.source.fetch().await?;
        let expires_at = fetched.max_age.map(|age| Instant::now() + age);

        let mut current = self.current.write();
        let generation = current.as_ref().map_or(1, |s| s.generation + 1);
        let snapshot = Arc::new(KeySnapshot {
            keys: fetched.keys,
            generation,
            expires_at,
        });
        *current = Some(Arc::clone(&snapshot));
        drop(current);

        debug!(
            provider = %self.provider,
            generation,
            keys = snapshot.len(),
            "Key set installed"
        );
        Ok(snapshot)
    }

    /// Snapshot currently installed, without fetching.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<KeySnapshot>> {
        self.current.read().clone()
    }
}

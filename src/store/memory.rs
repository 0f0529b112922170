//! In-process [`SessionBackend`] with the same semantics as the Redis scripts.
//!
//! Expiry uses `tokio::time::Instant`, so tests can drive TTLs with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::session_config::{REQUEST_INTERVAL_FIELD, SessionConfig};
use super::{
    ClaimOutcome, ConfigOutcome, RateCount, RotateOutcome, SessionBackend, StoreError,
    config_key, session_key, ttl_secs,
};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Redis `TTL`: -2 missing, -1 no expiry, else seconds rounded to nearest.
    fn ttl(&mut self, key: &str, now: Instant) -> i64 {
        match self.live(key, now) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let ms = at.saturating_duration_since(now).as_millis();
                i64::try_from((ms + 500) / 1000).unwrap_or(i64::MAX)
            }
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration, now: Instant) {
        if let Some(entry) = self.live(key, now) {
            entry.expires_at = Some(now + Duration::from_secs(ttl_secs(ttl)));
        }
    }
}

/// Session backend held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    keyspace: Mutex<Keyspace>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string key without expiry. Lets tests model keys that a
    /// foreign writer created without a TTL.
    pub fn insert_persistent(&self, key: &str, value: &str) {
        self.keyspace.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
    }

    /// Current string value at `key`, if live.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        let mut ks = self.keyspace.lock();
        match ks.live(key, Instant::now()) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    /// Redis-style TTL of `key`.
    #[must_use]
    pub fn ttl(&self, key: &str) -> i64 {
        self.keyspace.lock().ttl(key, Instant::now())
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn claim_session(
        &self,
        session_id: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Instant::now();
        let key = session_key(session_id);
        let mut ks = self.keyspace.lock();
        if ks.ttl(&key, now) != -2 {
            return Ok(ClaimOutcome::Taken);
        }
        ks.entries.insert(
            key,
            Entry {
                value: Value::Str(refresh_token.to_string()),
                expires_at: Some(now + Duration::from_secs(ttl_secs(ttl))),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn rotate_refresh_token(
        &self,
        session_id: &str,
        old: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<RotateOutcome, StoreError> {
        let now = Instant::now();
        let key = session_key(session_id);
        let mut ks = self.keyspace.lock();
        let Some(entry) = ks.live(&key, now) else {
            return Ok(RotateOutcome::Missing);
        };
        match &entry.value {
            Value::Str(current) if current == old => {}
            Value::Str(_) => return Ok(RotateOutcome::Mismatch),
            _ => {
                return Err(StoreError::UnexpectedReply(
                    "session key holds a non-string value".to_string(),
                ));
            }
        }
        entry.value = Value::Str(new.to_string());
        entry.expires_at = Some(now + Duration::from_secs(ttl_secs(ttl)));
        ks.expire(&config_key(session_id), ttl, now);
        Ok(RotateOutcome::Rotated)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut ks = self.keyspace.lock();
        Ok(ks.live(&session_key(session_id), Instant::now()).is_some())
    }

    async fn increment_rate(
        &self,
        session_id: &str,
        key: &str,
        default_interval: Duration,
    ) -> Result<RateCount, StoreError> {
        let now = Instant::now();
        let mut ks = self.keyspace.lock();

        let count = match ks.live(key, now) {
            Some(Entry {
                value: Value::Int(n),
                ..
            }) => {
                *n += 1;
                *n
            }
            Some(_) => {
                return Err(StoreError::UnexpectedReply(
                    "rate counter holds a non-integer value".to_string(),
                ));
            }
            None => {
                ks.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Int(1),
                        expires_at: None,
                    },
                );
                1
            }
        };

        if count <= 1 {
            let interval = match ks.live(&config_key(session_id), now) {
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => fields
                    .get(REQUEST_INTERVAL_FIELD)
                    .and_then(|v| v.parse::<u64>().ok())
                    .map_or(default_interval, Duration::from_secs),
                _ => default_interval,
            };
            ks.expire(key, interval, now);
        }

        let ttl = ks.ttl(key, now);
        Ok(RateCount { count, ttl })
    }

    async fn decrement_rate(&self, key: &str) -> Result<i64, StoreError> {
        let mut ks = self.keyspace.lock();
        match ks.live(key, Instant::now()) {
            Some(Entry {
                value: Value::Int(n),
                ..
            }) => {
                *n -= 1;
                Ok(*n)
            }
            Some(_) => Err(StoreError::UnexpectedReply(
                "rate counter holds a non-integer value".to_string(),
            )),
            None => Ok(0),
        }
    }

    async fn set_config(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> Result<ConfigOutcome, StoreError> {
        let now = Instant::now();
        let mut ks = self.keyspace.lock();
        let Some(session_expiry) = ks
            .live(&session_key(session_id), now)
            .and_then(|session| session.expires_at)
        else {
            return Ok(ConfigOutcome::Missing);
        };

        let key = config_key(session_id);
        ks.live(&key, now);
        let entry = ks.entries.entry(key).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(fields) = &mut entry.value else {
            return Err(StoreError::UnexpectedReply(
                "config key holds a non-hash value".to_string(),
            ));
        };
        for (field, value) in config.to_fields() {
            fields.insert(field.to_string(), value);
        }
        entry.expires_at = Some(session_expiry);
        Ok(ConfigOutcome::Stored)
    }

    async fn get_config(&self, session_id: &str) -> Result<Option<SessionConfig>, StoreError> {
        let mut ks = self.keyspace.lock();
        match ks.live(&config_key(session_id), Instant::now()) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(SessionConfig::from_fields(fields)),
            _ => Ok(None),
        }
    }
}

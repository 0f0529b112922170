//! Redis-backed [`SessionBackend`].
//!
//! Each primitive is a Lua script so check-then-act sequences run atomically
//! on the server. Scripts are loaded lazily by `EVALSHA` with `EVAL` fallback.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::session_config::{REQUEST_INTERVAL_FIELD, SessionConfig};
use super::{
    ClaimOutcome, ConfigOutcome, RateCount, RotateOutcome, SessionBackend, StoreError,
    config_key, session_key, ttl_secs,
};

/// Claim when the key is absent. `TTL` answers -2 for a missing key and -1
/// for a key without expiry; only -2 is free.
const CLAIM_SCRIPT: &str = r"
if redis.call('TTL', KEYS[1]) == -2 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
  return 1
end
return 0
";

const ROTATE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[3])
return 1
";

const RATE_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count <= 1 then
  local interval = redis.call('HGET', KEYS[2], ARGV[2])
  if not interval then
    interval = ARGV[1]
  end
  redis.call('EXPIRE', KEYS[1], interval)
end
return {count, redis.call('TTL', KEYS[1])}
";

/// Config inherits the session's remaining lifetime. A missing session, or
/// one without expiry, gets no config.
const CONFIG_SCRIPT: &str = r"
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  return -1
end
redis.call('HSET', KEYS[2], unpack(ARGV))
redis.call('PEXPIRE', KEYS[2], ttl)
return 1
";

const REVERSE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('DECR', KEYS[1])
end
return 0
";

/// Session backend over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    claim: Script,
    rotate: Script,
    rate: Script,
    reverse: Script,
    config: Script,
}

impl RedisBackend {
    /// Connect to `uri` (`redis://` or `rediss://`).
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(uri)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected to Redis session store");
        Ok(Self {
            conn,
            claim: Script::new(CLAIM_SCRIPT),
            rotate: Script::new(ROTATE_SCRIPT),
            rate: Script::new(RATE_SCRIPT),
            reverse: Script::new(REVERSE_SCRIPT),
            config: Script::new(CONFIG_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn claim_session(
        &self,
        session_id: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn();
        let reply: i64 = self
            .claim
            .key(session_key(session_id))
            .arg(refresh_token)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        ClaimOutcome::try_from(reply)
    }

    async fn rotate_refresh_token(
        &self,
        session_id: &str,
        old: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<RotateOutcome, StoreError> {
        let mut conn = self.conn();
        let reply: i64 = self
            .rotate
            .key(session_key(session_id))
            .key(config_key(session_id))
            .arg(old)
            .arg(new)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        RotateOutcome::try_from(reply)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(session_key(session_id)).await?;
        Ok(exists)
    }

    async fn increment_rate(
        &self,
        session_id: &str,
        key: &str,
        default_interval: Duration,
    ) -> Result<RateCount, StoreError> {
        let mut conn = self.conn();
        let reply: Vec<i64> = self
            .rate
            .key(key)
            .key(config_key(session_id))
            .arg(ttl_secs(default_interval))
            .arg(REQUEST_INTERVAL_FIELD)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_slice() {
            [count, ttl] => Ok(RateCount {
                count: *count,
                ttl: *ttl,
            }),
            other => Err(StoreError::UnexpectedReply(format!(
                "rate script returned {other:?}"
            ))),
        }
    }

    async fn decrement_rate(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let reply: i64 = self.reverse.key(key).invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn set_config(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> Result<ConfigOutcome, StoreError> {
        let mut conn = self.conn();
        let mut invocation = self.config.prepare_invoke();
        invocation.key(session_key(session_id)).key(config_key(session_id));
        for (field, value) in config.to_fields() {
            invocation.arg(field).arg(value);
        }
        let reply: i64 = invocation.invoke_async(&mut conn).await?;
        ConfigOutcome::try_from(reply)
    }

    async fn get_config(&self, session_id: &str) -> Result<Option<SessionConfig>, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(config_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(SessionConfig::from_fields(&fields))
    }
}

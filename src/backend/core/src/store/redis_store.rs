//! Redis projection store.
//!
//! A [`Transaction`] is serialized to JSON and evaluated by a single Lua
//! script. Redis never interleaves another command with a running script, so
//! the precondition checks and the writes form one atomic unit. Operation key
//! types are validated before the first write because Redis does not roll
//! back a script that fails part of the way through.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::transaction::{CommitOutcome, Transaction};
use super::ProjectionStore;
use crate::error::{ErrorCode, Result, TallyError};

const COMMIT_SCRIPT: &str = r#"
local tx = cjson.decode(ARGV[1])

for _, c in ipairs(tx.checks) do
    local ok
    if c.kind == 'key_exists' then
        ok = redis.call('EXISTS', c.key) == 1
    elseif c.kind == 'key_absent' then
        ok = redis.call('EXISTS', c.key) == 0
    elseif c.kind == 'hash_field_equals' then
        ok = redis.call('HGET', c.key, c.field) == c.value
    elseif c.kind == 'hash_field_absent' then
        ok = redis.call('HEXISTS', c.key, c.field) == 0
    elseif c.kind == 'set_contains' then
        ok = redis.call('SISMEMBER', c.key, c.member) == 1
    elseif c.kind == 'set_not_contains' then
        ok = redis.call('SISMEMBER', c.key, c.member) == 0
    else
        return redis.error_reply('ERR unknown check ' .. tostring(c.kind))
    end
    if not ok then
        return 0
    end
end

local expected = {
    hash_increment = 'hash', hash_set = 'hash', hash_delete = 'hash',
    set_add = 'set', set_remove = 'set',
}
for _, op in ipairs(tx.ops) do
    local want = expected[op.kind]
    if want then
        local actual = redis.call('TYPE', op.key)['ok']
        if actual ~= 'none' and actual ~= want then
            return redis.error_reply('WRONGTYPE ' .. op.key .. ' holds ' .. actual .. ', expected ' .. want)
        end
    end
    if op.kind == 'hash_increment' then
        local current = redis.call('HGET', op.key, op.field)
        if current and not tonumber(current) then
            return redis.error_reply('ERR non-numeric counter ' .. op.key .. ' ' .. op.field)
        end
    end
end

for _, op in ipairs(tx.ops) do
    if op.kind == 'hash_increment' then
        redis.call('HINCRBY', op.key, op.field, op.delta)
    elseif op.kind == 'hash_set' then
        redis.call('HSET', op.key, op.field, op.value)
    elseif op.kind == 'hash_delete' then
        redis.call('HDEL', op.key, op.field)
    elseif op.kind == 'set_add' then
        redis.call('SADD', op.key, op.member)
    elseif op.kind == 'set_remove' then
        redis.call('SREM', op.key, op.member)
    elseif op.kind == 'string_set' then
        redis.call('SET', op.key, op.value)
    elseif op.kind == 'expire' then
        redis.call('EXPIRE', op.key, op.seconds)
    elseif op.kind == 'inherit_expiry' then
        local ms = redis.call('PTTL', op.source)
        if ms > 0 then
            redis.call('PEXPIRE', op.key, ms)
        end
    end
end

return 1
"#;

/// Connection settings for the Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Timeout for the initial connection and ping
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a managed connection and verify it with `PING`.
pub async fn connect(config: &RedisStoreConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.url.as_str()).map_err(|e| {
        TallyError::with_internal(
            ErrorCode::StoreConnectionFailed,
            "Failed to create Redis client",
            e.to_string(),
        )
    })?;

    let mut conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            TallyError::new(ErrorCode::StoreConnectionFailed, "Timed out connecting to Redis")
        })??;

    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(url = %crate::config::redact_url(&config.url), "Connected to Redis");
    Ok(conn)
}

/// Projection store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    commit_script: redis::Script,
}

impl RedisStore {
    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            commit_script: redis::Script::new(COMMIT_SCRIPT),
        }
    }

    /// Connect using `config`.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        Ok(Self::new(connect(config).await?))
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl ProjectionStore for RedisStore {
    #[instrument(skip_all, fields(checks = tx.preconditions.len(), ops = tx.ops.len()))]
    async fn commit(&self, tx: Transaction) -> Result<CommitOutcome> {
        if tx.is_empty() && tx.preconditions.is_empty() {
            return Ok(CommitOutcome::Committed);
        }

        let payload = serde_json::to_string(&tx)?;
        let mut invocation = self.commit_script.prepare_invoke();
        for key in tx.keys() {
            invocation.key(key);
        }
        invocation.arg(payload);

        let mut conn = self.conn();
        let committed: i64 = invocation.invoke_async(&mut conn).await?;

        let outcome = if committed == 1 {
            CommitOutcome::Committed
        } else {
            CommitOutcome::PreconditionFailed
        };
        debug!(?outcome, "Transaction evaluated");
        Ok(outcome)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.sismember(key, member).await?)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_script_handles_every_kind() {
        let tx = Transaction::new()
            .require_exists("a")
            .require_absent("a")
            .require_field_eq("a", "f", "v")
            .require_field_absent("a", "f")
            .require_member("a", "m")
            .require_not_member("a", "m")
            .hincr("a", "f", 1)
            .hset("a", "f", "v")
            .hdel("a", "f")
            .sadd("a", "m")
            .srem("a", "m")
            .set("a", "v")
            .expire("a", Duration::from_secs(1))
            .inherit_expiry("a", "b");

        let json = serde_json::to_value(&tx).unwrap();
        let kinds = json["checks"]
            .as_array()
            .unwrap()
            .iter()
            .chain(json["ops"].as_array().unwrap())
            .map(|v| v["kind"].as_str().unwrap().to_string());
        for kind in kinds {
            assert!(COMMIT_SCRIPT.contains(&format!("'{kind}'")), "script misses {kind}");
        }
    }
}

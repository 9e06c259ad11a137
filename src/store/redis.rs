//! Redis-backed implementation of [`AtomicStore`].
//!
//! The sliding window and the compare-and-swap run as Lua scripts so they
//! execute without interleaving from other clients.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::backend::{
    ttl_millis, AtomicStore, StoreError, StoreResult, Swap, WindowOutcome, WindowRequest,
};

/// Keys scanned per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Purge, count and conditionally insert into the client's ordered set.
/// Returns `{allowed, remaining, reset_at_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local count = redis.call('ZCARD', key)

local oldest = nil
if count > 0 then
    local oldest_entries = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if #oldest_entries > 0 then
        oldest = tonumber(oldest_entries[2])
    end
end

local reset_at = (oldest or now) + window

if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    return {1, limit - count - 1, reset_at}
end

return {0, 0, reset_at}
"#;

/// Replace or delete a key only if it still holds the expected value.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
    return 0
end

if ARGV[2] == 'set' then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
    redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Redis store adapter.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    sliding_window: Script,
    compare_and_swap: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn backend_error(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("Redis connection error: {}", e)))?;

        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis connection manager error: {}", e)))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(backend_error)?;

        info!("Connected to Redis");

        Ok(Self {
            conn,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(count > 0)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: missing key, -1: no expiry
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sliding_window(&self, request: &WindowRequest<'_>) -> StoreResult<WindowOutcome> {
        let mut conn = self.conn.clone();
        let result: Vec<i64> = self
            .sliding_window
            .key(request.key)
            .arg(request.limit)
            .arg(request.window_ms)
            .arg(request.now_ms)
            .arg(request.member)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        match result.as_slice() {
            [allowed, remaining, reset_at_ms] => Ok(WindowOutcome {
                allowed: *allowed == 1,
                remaining: (*remaining).max(0) as u64,
                reset_at_ms: *reset_at_ms,
            }),
            other => Err(StoreError::Backend(format!(
                "sliding window script returned {} values, expected 3",
                other.len()
            ))),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        replacement: Swap<'_>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.compare_and_swap.key(key);
        invocation.arg(expected);
        match replacement {
            Swap::Set { value, ttl } => {
                invocation.arg("set").arg(value).arg(ttl_millis(ttl));
            }
            Swap::Delete => {
                invocation.arg("del");
            }
        }

        let swapped: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        debug!(key = %key, swapped = swapped == 1, "Compare-and-swap executed");
        Ok(swapped == 1)
    }
}

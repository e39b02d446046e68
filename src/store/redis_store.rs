//! Redis-backed store.
//!
//! Commands go through a [`ConnectionManager`] which reconnects on its own.
//! Unguarded transactions run as MULTI/EXEC pipelines. Guarded transactions
//! run as a Lua script so the guard check and the queued writes happen in
//! one atomic step on the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, Script};

use super::{Guard, Op, Store, StoreConnector, Transaction};
use crate::error::StoreError;

/// Checks the guard, then applies the JSON-encoded ops only if it held.
/// `list` and `zset` guards hold when exactly one element was removed.
static GUARDED_EXEC: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local matched
if ARGV[1] == 'list' then
  matched = redis.call('LREM', KEYS[1], 1, ARGV[2]) == 1
elseif ARGV[1] == 'zset' then
  matched = redis.call('ZREM', KEYS[1], ARGV[2]) == 1
elseif ARGV[1] == 'empty' then
  matched = redis.call('LLEN', KEYS[1]) == 0
else
  matched = redis.call('HGET', KEYS[1], ARGV[2]) == ARGV[4]
end
if not matched then
  return 0
end
local ops = cjson.decode(ARGV[3])
for _, op in ipairs(ops) do
  redis.call(unpack(op))
end
return 1
",
    )
});

static POP_MIN_TO_LIST: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if popped[1] then
  redis.call('LPUSH', KEYS[2], popped[1])
  return popped[1]
end
return false
",
    )
});

fn queue_op(pipe: &mut Pipeline, op: &Op) {
    match op {
        Op::LPush { key, value } => pipe.lpush(key, value).ignore(),
        Op::RPush { key, value } => pipe.rpush(key, value).ignore(),
        Op::LRem { key, count, value } => pipe.lrem(key, *count as isize, value).ignore(),
        Op::ZAdd { key, score, member } => pipe.zadd(key, member, *score).ignore(),
        Op::ZRem { key, member } => pipe.zrem(key, member).ignore(),
        Op::HSet { key, field, value } => pipe.hset(key, field, value).ignore(),
        Op::HDel { key, field } => pipe.hdel(key, field).ignore(),
        Op::SAdd { key, member } => pipe.sadd(key, member).ignore(),
        Op::SRem { key, member } => pipe.srem(key, member).ignore(),
        Op::Del { key } => pipe.del(key).ignore(),
    };
}

/// Store talking to a Redis server.
pub struct RedisStore {
    redis: ConnectionManager,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis))
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            closed: AtomicBool::new(false),
        }
    }

    fn conn(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.redis.clone())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.llen(key).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.lindex(key, index as isize).await?)
    }

    async fn move_tail_to_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.rpoplpush(src, dst).await?)
    }

    async fn pop_min_to_list(&self, zset: &str, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        let popped: Option<String> = POP_MIN_TO_LIST
            .key(zset)
            .key(list)
            .invoke_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.zcard(key).await?)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.zrange(key, start as isize, stop as isize).await?)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.zrangebyscore_withscores(key, min, max).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        Ok(conn.hdel(key, fields).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exec(&self, tx: Transaction) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;

        let Some(guard) = tx.guard() else {
            if tx.ops().is_empty() {
                return Ok(true);
            }
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in tx.ops() {
                queue_op(&mut pipe, op);
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
            return Ok(true);
        };

        let ops: Vec<Vec<String>> = tx.ops().iter().map(Op::to_args).collect();
        let encoded = serde_json::to_string(&ops)?;
        let (kind, key, element, expected) = match guard {
            Guard::ListRemove { key, value } => ("list", key, value.as_str(), ""),
            Guard::ZRemove { key, member } => ("zset", key, member.as_str(), ""),
            Guard::ListEmpty { key } => ("empty", key, "", ""),
            Guard::HashFieldEquals { key, field, value } => {
                ("hfield", key, field.as_str(), value.as_str())
            }
        };

        let applied: i64 = GUARDED_EXEC
            .key(key)
            .arg(kind)
            .arg(element)
            .arg(encoded)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn quit(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens one [`RedisStore`] per participant.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    redis_url: String,
}

impl RedisConnector {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>, StoreError> {
        let store = RedisStore::connect(&self.redis_url).await?;
        Ok(Arc::new(store))
    }
}

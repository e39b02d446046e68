//! Key-value store adapter.
//!
//! The broker only needs a small set of list, sorted-set, hash and set
//! primitives plus atomic multi-command transactions. [`Store`] captures
//! those; [`RedisStore`] talks to a Redis server and [`MemoryStore`] keeps
//! an in-process keyspace with the same semantics.

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisConnector, RedisStore};
use crate::error::StoreError;

/// A single write queued in a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    LPush { key: String, value: String },
    RPush { key: String, value: String },
    /// Removes up to `count` occurrences of `value` (0 removes all).
    LRem { key: String, count: i64, value: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Del { key: String },
}

impl Op {
    /// Command name followed by its arguments.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Op::LPush { key, value } => vec!["LPUSH".into(), key.clone(), value.clone()],
            Op::RPush { key, value } => vec!["RPUSH".into(), key.clone(), value.clone()],
            Op::LRem { key, count, value } => vec![
                "LREM".into(),
                key.clone(),
                count.to_string(),
                value.clone(),
            ],
            Op::ZAdd { key, score, member } => vec![
                "ZADD".into(),
                key.clone(),
                score.to_string(),
                member.clone(),
            ],
            Op::ZRem { key, member } => vec!["ZREM".into(), key.clone(), member.clone()],
            Op::HSet { key, field, value } => {
                vec!["HSET".into(), key.clone(), field.clone(), value.clone()]
            }
            Op::HDel { key, field } => vec!["HDEL".into(), key.clone(), field.clone()],
            Op::SAdd { key, member } => vec!["SADD".into(), key.clone(), member.clone()],
            Op::SRem { key, member } => vec!["SREM".into(), key.clone(), member.clone()],
            Op::Del { key } => vec!["DEL".into(), key.clone()],
        }
    }
}

/// Precondition of a guarded transaction, checked atomically with the
/// queued ops. The ops only apply when it holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Remove one occurrence of `value` from the list at `key`.
    ListRemove { key: String, value: String },
    /// Remove `member` from the sorted set at `key`.
    ZRemove { key: String, member: String },
    /// The list at `key` is empty or missing.
    ListEmpty { key: String },
    /// Hash field `field` at `key` still holds exactly `value`.
    HashFieldEquals {
        key: String,
        field: String,
        value: String,
    },
}

/// Ordered writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    guard: Option<Guard>,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction that only applies if `value` is removed from list `key`.
    pub fn guarded_list(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            guard: Some(Guard::ListRemove {
                key: key.into(),
                value: value.into(),
            }),
            ops: Vec::new(),
        }
    }

    /// A transaction that only applies if `member` is removed from sorted set `key`.
    pub fn guarded_zset(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            guard: Some(Guard::ZRemove {
                key: key.into(),
                member: member.into(),
            }),
            ops: Vec::new(),
        }
    }

    /// A transaction that only applies while list `key` is empty.
    pub fn guarded_empty_list(key: impl Into<String>) -> Self {
        Self {
            guard: Some(Guard::ListEmpty { key: key.into() }),
            ops: Vec::new(),
        }
    }

    /// A transaction that only applies while `field` of hash `key` equals `value`.
    pub fn guarded_hash_field(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            guard: Some(Guard::HashFieldEquals {
                key: key.into(),
                field: field.into(),
                value: value.into(),
            }),
            ops: Vec::new(),
        }
    }

    pub fn guard(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_none() && self.ops.is_empty()
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn lpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Op::LPush {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn rpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Op::RPush {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn lrem(
        &mut self,
        key: impl Into<String>,
        count: i64,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(Op::LRem {
            key: key.into(),
            count,
            value: value.into(),
        })
    }

    pub fn zadd(
        &mut self,
        key: impl Into<String>,
        score: f64,
        member: impl Into<String>,
    ) -> &mut Self {
        self.push(Op::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::ZRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(Op::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Op::HDel {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::SAdd {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::SRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Op::Del { key: key.into() })
    }
}

/// Primitives the broker needs from a key-value store.
///
/// Lists are pushed at the head (`lpush`) and consumed from the tail, so a
/// plain list behaves as a FIFO queue. Ranges use Redis index semantics:
/// `stop` is inclusive and negative indexes count from the end.
#[async_trait]
pub trait Store: Send + Sync {
    // Lists
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError>;
    /// Atomically pops the tail of `src` and pushes it to the head of `dst`.
    async fn move_tail_to_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError>;
    /// Atomically pops the lowest-score member of `zset` and pushes it to the head of `list`.
    async fn pop_min_to_list(&self, zset: &str, list: &str) -> Result<Option<String>, StoreError>;

    // Sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    // Hashes
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Applies a transaction atomically. Returns false when its guard did
    /// not match, in which case nothing was written.
    async fn exec(&self, tx: Transaction) -> Result<bool, StoreError>;

    /// Releases the connection. Further calls may fail with `StoreError::Closed`.
    async fn quit(&self) -> Result<(), StoreError>;
}

/// Opens a dedicated store connection for one participant.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Store>, StoreError>;
}

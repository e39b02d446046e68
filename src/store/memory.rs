//! In-process store with Redis semantics.
//!
//! Every handle created through [`StoreConnector::connect`] shares the same
//! keyspace but has its own open/closed state, mirroring one connection per
//! participant against a shared server.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Guard, Op, Store, StoreConnector, Transaction};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Keyspace {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Keyspace {
    fn lpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn rpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    fn lrem(&mut self, key: &str, count: i64, value: &str) -> u64 {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        if list.is_empty() {
            self.lists.remove(key);
        }
        removed as u64
    }

    fn pop_tail(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    /// Members ordered by score, then lexicographically.
    fn zsorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hdel(&mut self, key: &str, field: &str) -> u64 {
        let Some(hash) = self.hashes.get_mut(key) else {
            return 0;
        };
        let removed = u64::from(hash.remove(field).is_some());
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn del(&mut self, key: &str) {
        self.lists.remove(key);
        self.zsets.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::LPush { key, value } => self.lpush(key, value),
            Op::RPush { key, value } => self.rpush(key, value),
            Op::LRem { key, count, value } => {
                self.lrem(key, *count, value);
            }
            Op::ZAdd { key, score, member } => self.zadd(key, *score, member),
            Op::ZRem { key, member } => {
                self.zrem(key, member);
            }
            Op::HSet { key, field, value } => self.hset(key, field, value),
            Op::HDel { key, field } => {
                self.hdel(key, field);
            }
            Op::SAdd { key, member } => self.sadd(key, member),
            Op::SRem { key, member } => self.srem(key, member),
            Op::Del { key } => self.del(key),
        }
    }
}

/// Resolves Redis-style inclusive `start..=stop` indexes against `len`.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn Store>, StoreError> {
        Ok(Arc::new(MemoryStore {
            keyspace: Arc::clone(&self.keyspace),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.lpush(key, value);
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        let Some(list) = keyspace.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        let Some(list) = keyspace.lists.get(key) else {
            return Ok(None);
        };
        let index = if index < 0 {
            list.len() as i64 + index
        } else {
            index
        };
        if index < 0 {
            return Ok(None);
        }
        Ok(list.get(index as usize).cloned())
    }

    async fn move_tail_to_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock().await;
        let value = keyspace.pop_tail(src);
        if let Some(value) = &value {
            keyspace.lpush(dst, value);
        }
        Ok(value)
    }

    async fn pop_min_to_list(&self, zset: &str, list: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock().await;
        let Some((member, _)) = keyspace.zsorted(zset).into_iter().next() else {
            return Ok(None);
        };
        keyspace.zrem(zset, &member);
        keyspace.lpush(list, &member);
        Ok(Some(member))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.zadd(key, score, member);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.keyspace.lock().await.zrem(key, member))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let sorted = self.keyspace.lock().await.zsorted(key);
        Ok(match resolve_range(sorted.len(), start, stop) {
            Some((from, to)) => sorted[from..=to].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.ensure_open()?;
        let sorted = self.keyspace.lock().await.zsorted(key);
        Ok(sorted
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.hset(key, field, value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock().await;
        Ok(fields.iter().map(|f| keyspace.hdel(key, f)).sum())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.sadd(key, member);
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.srem(key, member);
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.keyspace.lock().await.del(key);
        Ok(())
    }

    async fn exec(&self, tx: Transaction) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock().await;
        let matched = match tx.guard() {
            None => true,
            Some(Guard::ListRemove { key, value }) => keyspace.lrem(key, 1, value) == 1,
            Some(Guard::ZRemove { key, member }) => keyspace.zrem(key, member),
            Some(Guard::ListEmpty { key }) => {
                keyspace.lists.get(key).map_or(true, |l| l.is_empty())
            }
            Some(Guard::HashFieldEquals { key, field, value }) => {
                keyspace.hashes.get(key).and_then(|h| h.get(field)) == Some(value)
            }
        };
        if !matched {
            return Ok(false);
        }
        for op in tx.ops() {
            keyspace.apply(op);
        }
        Ok(true)
    }

    async fn quit(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_fifo_discipline() {
        let store = MemoryStore::new();
        store.lpush("q", "a").await.unwrap();
        store.lpush("q", "b").await.unwrap();
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["b", "a"]);

        let moved = store.move_tail_to_head("q", "p").await.unwrap();
        assert_eq!(moved.as_deref(), Some("a"));
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.lindex("p", 0).await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.lindex("q", -1).await.unwrap().as_deref(), Some("b"));
        assert!(store.move_tail_to_head("empty", "p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_min_to_list() {
        let store = MemoryStore::new();
        store.zadd("z", 4.0, "normal").await.unwrap();
        store.zadd("z", 0.0, "highest").await.unwrap();
        store.zadd("z", 7.0, "lowest").await.unwrap();

        let popped = store.pop_min_to_list("z", "p").await.unwrap();
        assert_eq!(popped.as_deref(), Some("highest"));
        assert_eq!(store.zcard("z").await.unwrap(), 2);
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["normal", "lowest"]);
    }

    #[tokio::test]
    async fn test_zrange_by_score() {
        let store = MemoryStore::new();
        store.zadd("s", 100.0, "a").await.unwrap();
        store.zadd("s", 200.0, "b").await.unwrap();
        store.zadd("s", 300.0, "c").await.unwrap();

        let due = store.zrange_by_score("s", 0.0, 200.0).await.unwrap();
        assert_eq!(due, vec![("a".to_string(), 100.0), ("b".to_string(), 200.0)]);
    }

    #[tokio::test]
    async fn test_guarded_transaction_applies_once() {
        let store = MemoryStore::new();
        store.lpush("processing", "m").await.unwrap();

        let mut tx = Transaction::guarded_list("processing", "m");
        tx.lpush("pending", "m");
        assert!(store.exec(tx.clone()).await.unwrap());
        // The guard no longer matches, so the second run writes nothing.
        assert!(!store.exec(tx).await.unwrap());

        assert_eq!(store.llen("processing").await.unwrap(), 0);
        assert_eq!(store.llen("pending").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_guarded_zset_transaction() {
        let store = MemoryStore::new();
        store.zadd("scheduled", 1.0, "m").await.unwrap();

        let mut tx = Transaction::guarded_zset("scheduled", "m");
        tx.lpush("pending", "m");
        assert!(store.exec(tx).await.unwrap());
        assert_eq!(store.zcard("scheduled").await.unwrap(), 0);

        let mut tx = Transaction::guarded_zset("scheduled", "missing");
        tx.lpush("pending", "other");
        assert!(!store.exec(tx).await.unwrap());
        assert_eq!(store.llen("pending").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_guarded_empty_list_transaction() {
        let store = MemoryStore::new();
        store.lpush("processing", "m").await.unwrap();
        store.sadd("registry", "processing").await.unwrap();

        let mut tx = Transaction::guarded_empty_list("processing");
        tx.del("processing").srem("registry", "processing");
        assert!(!store.exec(tx.clone()).await.unwrap());
        assert_eq!(store.llen("processing").await.unwrap(), 1);
        assert_eq!(store.smembers("registry").await.unwrap(), vec!["processing"]);

        let mut drain = Transaction::guarded_list("processing", "m");
        drain.lpush("pending", "m");
        assert!(store.exec(drain).await.unwrap());
        assert!(store.exec(tx).await.unwrap());
        assert!(store.smembers("registry").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guarded_hash_field_transaction() {
        let store = MemoryStore::new();
        store.hset("beats", "consumer:a", "old").await.unwrap();

        let mut tx = Transaction::guarded_hash_field("beats", "consumer:a", "old");
        tx.hdel("beats", "consumer:a");

        // A refresh between read and delete keeps the record.
        store.hset("beats", "consumer:a", "new").await.unwrap();
        assert!(!store.exec(tx.clone()).await.unwrap());
        assert_eq!(
            store.hget("beats", "consumer:a").await.unwrap().as_deref(),
            Some("new")
        );

        store.hset("beats", "consumer:a", "old").await.unwrap();
        assert!(store.exec(tx.clone()).await.unwrap());
        assert!(store.hget("beats", "consumer:a").await.unwrap().is_none());
        assert!(!store.exec(tx).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_and_set_ops() {
        let store = MemoryStore::new();
        store.hset("h", "f1", "v1").await.unwrap();
        store.hset("h", "f2", "v2").await.unwrap();
        assert_eq!(store.hget("h", "f1").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
        let removed = store
            .hdel("h", &["f1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        store.sadd("s", "b").await.unwrap();
        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
        store.srem("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_connections_share_keyspace() {
        let server = MemoryStore::new();
        let a = server.connect().await.unwrap();
        let b = server.connect().await.unwrap();

        a.lpush("q", "x").await.unwrap();
        assert_eq!(b.llen("q").await.unwrap(), 1);

        a.quit().await.unwrap();
        assert!(matches!(a.llen("q").await, Err(StoreError::Closed)));
        assert_eq!(b.llen("q").await.unwrap(), 1);
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 1, 2), Some((1, 2)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(5, 6, 10), None);
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
    }
}

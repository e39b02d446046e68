//! Liveness records.
//!
//! Every running producer and consumer refreshes a record in the global
//! heartbeat hash on a fixed tick. A record is online while its timestamp
//! is within the freshness window; the GC sweep treats everything else as
//! dead and recovers its in-flight messages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::keys::{instance_key, InstanceKind, KeySchema};
use crate::message::now_millis;
use crate::store::{Store, Transaction};
use crate::ticker::{TaskGroup, TickTask};

/// Resource snapshot attached to each heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub pid: u32,
    pub hostname: String,
    pub cpus: usize,
    /// Resident set size in bytes, where the platform exposes it.
    pub rss_bytes: Option<u64>,
}

impl ResourceUsage {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            rss_bytes: resident_set_size(),
        }
    }
}

fn resident_set_size() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

/// Value stored under an instance key in the heartbeat hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Epoch milliseconds of the last beat.
    pub timestamp: i64,
    pub usage: ResourceUsage,
}

impl HeartbeatRecord {
    pub fn is_fresh(&self, now: i64, freshness: Duration) -> bool {
        now.saturating_sub(self.timestamp) <= freshness.as_millis() as i64
    }
}

/// One entry of the heartbeat hash as seen at some instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub instance_key: String,
    pub online: bool,
    /// `None` when the stored record does not decode.
    pub record: Option<HeartbeatRecord>,
}

/// Read side of the heartbeat hash.
#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: Arc<dyn Store>,
    keys: KeySchema,
    freshness: Duration,
}

/// Instance keys split by the freshness predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    pub online: HashSet<String>,
    /// Offline instance keys with the raw record read for each.
    pub offline: HashMap<String, String>,
}

impl HeartbeatRegistry {
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, freshness: Duration) -> Self {
        Self {
            store,
            keys,
            freshness,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Loads every record and partitions the instance keys.
    ///
    /// Records that fail to decode count as offline.
    pub async fn partition(&self, now: i64) -> Result<Liveness, BrokerError> {
        let records = self.store.hgetall(&self.keys.heartbeat_index()).await?;
        let mut liveness = Liveness::default();
        for (key, raw) in records {
            let fresh = serde_json::from_str::<HeartbeatRecord>(&raw)
                .map(|r| r.is_fresh(now, self.freshness))
                .unwrap_or(false);
            if fresh {
                liveness.online.insert(key);
            } else {
                liveness.offline.insert(key, raw);
            }
        }
        Ok(liveness)
    }

    /// Every record with its liveness, ordered by instance key.
    pub async fn instances(&self, now: i64) -> Result<Vec<InstanceStatus>, BrokerError> {
        let records = self.store.hgetall(&self.keys.heartbeat_index()).await?;
        let mut instances: Vec<InstanceStatus> = records
            .into_iter()
            .map(|(instance_key, raw)| {
                let record = serde_json::from_str::<HeartbeatRecord>(&raw).ok();
                let online = record
                    .as_ref()
                    .is_some_and(|r| r.is_fresh(now, self.freshness));
                InstanceStatus {
                    instance_key,
                    online,
                    record,
                }
            })
            .collect();
        instances.sort_by(|a, b| a.instance_key.cmp(&b.instance_key));
        Ok(instances)
    }

    pub async fn query_online(&self, now: i64) -> Result<Vec<String>, BrokerError> {
        let mut online: Vec<String> = self.partition(now).await?.online.into_iter().collect();
        online.sort();
        Ok(online)
    }

    pub async fn query_offline(&self, now: i64) -> Result<Vec<String>, BrokerError> {
        let mut offline: Vec<String> = self.partition(now).await?.offline.into_keys().collect();
        offline.sort();
        Ok(offline)
    }

    /// Record of one instance, if present and decodable.
    pub async fn record(
        &self,
        kind: InstanceKind,
        id: &str,
    ) -> Result<Option<HeartbeatRecord>, BrokerError> {
        let raw = self
            .store
            .hget(&self.keys.heartbeat_index(), &instance_key(kind, id))
            .await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn is_alive(
        &self,
        kind: InstanceKind,
        id: &str,
        now: i64,
    ) -> Result<bool, BrokerError> {
        Ok(self
            .record(kind, id)
            .await?
            .is_some_and(|r| r.is_fresh(now, self.freshness)))
    }

    /// Deletes each record that still holds the value it was read with.
    ///
    /// An instance that beat again since `stale` was read keeps its record.
    pub async fn remove_stale(
        &self,
        stale: &HashMap<String, String>,
    ) -> Result<u64, BrokerError> {
        let index = self.keys.heartbeat_index();
        let mut removed = 0;
        for (instance_key, raw) in stale {
            let mut tx =
                Transaction::guarded_hash_field(index.as_str(), instance_key.as_str(), raw.as_str());
            tx.hdel(index.as_str(), instance_key.as_str());
            if self.store.exec(tx).await? {
                removed += 1;
            } else {
                debug!(instance = %instance_key, "Heartbeat refreshed before removal");
            }
        }
        Ok(removed)
    }
}

struct Beat {
    store: Arc<dyn Store>,
    index_key: String,
    instance_key: String,
}

impl Beat {
    async fn write(&self) -> Result<(), BrokerError> {
        let record = HeartbeatRecord {
            timestamp: now_millis(),
            usage: ResourceUsage::current(),
        };
        let payload = serde_json::to_string(&record).map_err(crate::error::StoreError::from)?;
        self.store
            .hset(&self.index_key, &self.instance_key, &payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TickTask for Beat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn tick(&self) -> Result<(), BrokerError> {
        self.write().await
    }
}

/// Write side: keeps one instance's record fresh while running.
pub struct Heartbeat {
    beat: Arc<Beat>,
    interval: Duration,
    tasks: TaskGroup,
}

impl Heartbeat {
    /// Writes the first beat, then keeps beating every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the first beat cannot be written.
    pub async fn start(
        store: Arc<dyn Store>,
        keys: &KeySchema,
        kind: InstanceKind,
        id: &str,
        interval: Duration,
    ) -> Result<Self, BrokerError> {
        let beat = Arc::new(Beat {
            store,
            index_key: keys.heartbeat_index(),
            instance_key: instance_key(kind, id),
        });
        beat.write().await?;

        let mut tasks = TaskGroup::new();
        tasks.spawn_ticker(beat.clone(), interval);
        info!(instance = %beat.instance_key, "Heartbeat started");

        Ok(Self {
            beat,
            interval,
            tasks,
        })
    }

    pub fn instance_key(&self) -> &str {
        &self.beat.instance_key
    }

    /// Stops beating and deletes the record.
    pub async fn stop(mut self) -> Result<(), BrokerError> {
        if let Err(e) = self.tasks.shutdown(self.interval * 2).await {
            warn!(instance = %self.beat.instance_key, error = %e, "Heartbeat task did not stop cleanly");
        }
        self.beat
            .store
            .hdel(&self.beat.index_key, &[self.beat.instance_key.clone()])
            .await?;
        debug!(instance = %self.beat.instance_key, "Heartbeat stopped");
        Ok(())
    }
}

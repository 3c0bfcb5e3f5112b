// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-partition high-water marks for idempotent replay.
//!
//! A mark records the highest offset durably handled for a `(topic,
//! partition, logical key)` triple. Marks live in the shared store (one
//! sorted set per partition, members are logical keys, scores are offsets)
//! so that whichever worker owns a partition after a rebalance sees the
//! progress of the previous owner; a local write-through cache keeps the
//! hot-path reads off the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::message::TopicPartition;
use crate::store::SharedStore;

/// The fixed logical key recording a partition's overall durable progress,
/// as opposed to any single session's.
pub const PARTITION_GLOBAL_KEY: &str = "$partition_global";

/// Sentinel for "no mark known", cached so that repeated lookups of an
/// unmarked key do not repeatedly miss to the shared store.
const NO_MARK: i64 = i64::MIN;

pub struct HighWaterMarker {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    cache: Mutex<HashMap<TopicPartition, HashMap<String, i64>>>,
}

impl HighWaterMarker {
    /// Creates a marker namespaced under `key_prefix` in the shared store.
    /// Independent concerns (session flushing vs. replay-event publishing)
    /// use independent instances with distinct prefixes.
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: String) -> Self {
        HighWaterMarker {
            store,
            key_prefix,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn set_key(&self, tp: &TopicPartition) -> String {
        format!("{}/{}/{}", self.key_prefix, tp.topic, tp.partition)
    }

    fn cached(&self, tp: &TopicPartition, key: &str) -> Option<i64> {
        self.cache
            .lock()
            .unwrap()
            .get(tp)
            .and_then(|marks| marks.get(key))
            .copied()
    }

    /// Returns true iff the stored mark for `key` is at or above `offset`,
    /// i.e. the event at `offset` was already handled and must be dropped
    /// before any side effect.
    pub async fn is_below(&self, tp: &TopicPartition, key: &str, offset: i64) -> Result<bool> {
        if let Some(mark) = self.cached(tp, key) {
            return Ok(mark >= offset);
        }
        let mark = self
            .store
            .zscore(&self.set_key(tp), key)
            .await?
            .unwrap_or(NO_MARK);
        self.cache
            .lock()
            .unwrap()
            .entry(tp.clone())
            .or_default()
            .insert(key.to_owned(), mark);
        Ok(mark >= offset)
    }

    /// Monotonically raises the mark for `key` to `offset`. Concurrent adds
    /// race safely; the surviving mark is at least every completed call's
    /// argument.
    pub async fn add(&self, tp: &TopicPartition, key: &str, offset: i64) -> Result<()> {
        self.store.zadd_gt(&self.set_key(tp), key, offset).await?;
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(tp.clone())
            .or_default()
            .entry(key.to_owned())
            .or_insert(NO_MARK);
        if offset > *entry {
            *entry = offset;
        }
        Ok(())
    }

    /// Discards marks at or below `up_to_offset`, locally and in the shared
    /// store, reclaiming memory once the partition-global mark has moved
    /// past them.
    pub async fn clear(&self, tp: &TopicPartition, up_to_offset: i64) -> Result<u64> {
        let removed = self
            .store
            .zrem_below(&self.set_key(tp), up_to_offset)
            .await?;
        if let Some(marks) = self.cache.lock().unwrap().get_mut(tp) {
            marks.retain(|_, mark| *mark > up_to_offset);
        }
        Ok(removed)
    }

    /// Forgets all local state for a revoked partition. The shared store is
    /// left intact for the next owner.
    pub fn revoke(&self, tp: &TopicPartition) {
        self.cache.lock().unwrap().remove(tp);
    }
}

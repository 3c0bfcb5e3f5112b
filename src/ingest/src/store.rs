// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The shared key-value store behind the high-water marker, the partition
//! locker, and the realtime cache.
//!
//! One trait covers the three concerns so that a single Redis connection
//! (or the in-memory double in tests) backs them all. All writes other than
//! lease acquisition are monotone or idempotent; safety never depends on a
//! read-modify-write round trip.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;

/// Async interface to the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Raises `member`'s score in the sorted set `set` to `score` if, and
    /// only if, it is higher than the stored score. Concurrent calls are
    /// race-safe: the surviving value is the maximum of all completed calls.
    async fn zadd_gt(&self, set: &str, member: &str, score: i64) -> Result<()>;

    /// Reads `member`'s score in `set`, if any.
    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>>;

    /// Removes every member of `set` whose score is at or below
    /// `max_score`. Returns the number removed.
    async fn zrem_below(&self, set: &str, max_score: i64) -> Result<u64>;

    /// Appends `items` to the list at `key`, trims it to the most recent
    /// `max_len` entries, and refreshes its TTL.
    async fn list_append(
        &self,
        key: &str,
        items: Vec<Vec<u8>>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<()>;

    /// Publishes `payload` on the pub/sub `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Acquires or extends a lease on `key` for `owner`. Returns whether the
    /// lease is held by `owner` after the call.
    async fn try_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases `owner`'s lease on `key`, if still held. Best-effort: a
    /// racing expiry or takeover is not an error.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<()>;
}

/// [`SharedStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn zadd_gt(&self, set: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        // GT makes the write monotone server-side, so concurrent advances
        // from multiple workers cannot regress the mark.
        redis::cmd("ZADD")
            .arg(set)
            .arg("GT")
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn.zscore(set, member).await?;
        Ok(score.map(|s| s as i64))
    }

    async fn zrem_below(&self, set: &str, max_score: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .zrembyscore(set, "-inf", max_score)
            .await?;
        Ok(removed)
    }

    async fn list_append(
        &self,
        key: &str,
        items: Vec<Vec<u8>>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .rpush(key, items)
            .ignore()
            .ltrim(key, -(max_len as isize), -1)
            .ignore()
            .pexpire(key, ttl.as_millis() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn try_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            return Ok(true);
        }
        let holder: Option<String> = conn.get(key).await?;
        if holder.as_deref() == Some(owner) {
            let _: bool = conn.pexpire(key, ttl.as_millis() as i64).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(key).await?;
        if holder.as_deref() == Some(owner) {
            let _: u64 = conn.del(key).await?;
        }
        Ok(())
    }
}

/// In-memory [`SharedStore`] for tests and local development.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    zsets: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, Vec<Vec<u8>>>,
    leases: HashMap<String, (String, Instant)>,
    published: Vec<(String, Vec<u8>)>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Test helper: everything published so far, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Test helper: the current contents of a list key.
    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Test helper: the owner of the live lease on `key`, if any.
    pub fn lease_holder(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .leases
            .get(key)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(holder, _)| holder.clone())
    }

    /// Test helper: whether a live lease on `key` is held by `owner`.
    pub fn lease_held_by(&self, key: &str, owner: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .leases
            .get(key)
            .map(|(holder, expiry)| holder == owner && *expiry > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SharedStore for MemStore {
    async fn zadd_gt(&self, set: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .zsets
            .entry(set.to_owned())
            .or_default()
            .entry(member.to_owned())
            .or_insert(i64::MIN);
        if score > *entry {
            *entry = score;
        }
        Ok(())
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state.zsets.get(set).and_then(|m| m.get(member)).copied())
    }

    async fn zrem_below(&self, set: &str, max_score: i64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        if let Some(members) = state.zsets.get_mut(set) {
            members.retain(|_, score| {
                if *score <= max_score {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok(removed)
    }

    async fn list_append(
        &self,
        key: &str,
        items: Vec<Vec<u8>>,
        max_len: usize,
        _ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.entry(key.to_owned()).or_default();
        list.extend(items);
        if list.len() > max_len {
            let excess = list.len() - max_len;
            list.drain(..excess);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.published.push((channel.to_owned(), payload));
        Ok(())
    }

    async fn try_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match state.leases.get(key) {
            Some((holder, expiry)) if *expiry > now && holder != owner => Ok(false),
            _ => {
                state
                    .leases
                    .insert(key.to_owned(), (owner.to_owned(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((holder, _)) = state.leases.get(key) {
            if holder == owner {
                state.leases.remove(key);
            }
        }
        Ok(())
    }
}

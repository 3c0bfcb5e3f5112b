// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The coordinator: routes parsed batches to session managers, computes
//! safe commit points, and reacts to partition assignment changes.
//!
//! This type is deliberately ignorant of the broker client. The Kafka
//! wrapper in [`crate::consumer`] feeds it raw batches and rebalance
//! events; commits leave through the [`OffsetCommitter`] seam. That split
//! keeps every coordination rule exercisable in tests with in-memory
//! doubles.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{error, info, warn};

use crate::blob::Blob;
use crate::buffer::SessionBuffer;
use crate::config::IngestConfig;
use crate::error::Result;
use crate::highwater::{HighWaterMarker, PARTITION_GLOBAL_KEY};
use crate::locker::PartitionLocker;
use crate::message::{parse_message, DropCause, RawMessage, SessionKey, TopicPartition};
use crate::metrics::IngestMetrics;
use crate::realtime::RealtimeCache;
use crate::replay_events::{ReplayEventSink, ReplayEventsIngester};
use crate::session::{FlushReason, SessionLimits, SessionManager};
use crate::store::SharedStore;
use crate::teams::TeamResolver;

/// Hard ceiling on one round of age-based flushing. Overruns are reported
/// but do not abort the process.
const FLUSH_ALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Sink for consumer-group offset commits. Commits carry the next offset to
/// read, the standard log-consumer convention.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<()>;
}

/// [`OffsetCommitter`] that records commits in memory, for tests.
#[derive(Default)]
pub struct MemCommitter {
    commits: Mutex<Vec<(TopicPartition, i64)>>,
}

impl MemCommitter {
    pub fn new() -> Self {
        MemCommitter::default()
    }

    /// Every commit issued, in order.
    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.commits.lock().unwrap().clone()
    }

    /// The latest committed offset for `tp`, if any.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(committed_tp, _)| committed_tp == tp)
            .map(|(_, offset)| *offset)
    }
}

#[async_trait]
impl OffsetCommitter for MemCommitter {
    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<()> {
        self.commits.lock().unwrap().push((tp.clone(), next_offset));
        Ok(())
    }
}

/// Book-keeping for one owned partition.
#[derive(Debug, Default)]
struct PartitionState {
    /// Highest offset seen on this partition, valid or not.
    last_offset: Option<i64>,
    /// Newest broker timestamp seen on this partition. The reference clock
    /// for age-based flushing, so quiet partitions cannot stall commits.
    last_timestamp_ms: Option<i64>,
    /// Last offset committed for this partition.
    last_committed: Option<i64>,
}

pub struct Ingester {
    config: IngestConfig,
    limits: SessionLimits,
    managers: HashMap<SessionKey, SessionManager>,
    partitions: HashMap<TopicPartition, PartitionState>,
    marker: Arc<HighWaterMarker>,
    replay_marker: Arc<HighWaterMarker>,
    replay: ReplayEventsIngester,
    locker: Option<PartitionLocker>,
    realtime: Arc<RealtimeCache>,
    blob: Arc<dyn Blob>,
    committer: Arc<dyn OffsetCommitter>,
    teams: TeamResolver,
    metrics: IngestMetrics,
}

impl Ingester {
    pub fn new(
        config: IngestConfig,
        store: Arc<dyn SharedStore>,
        blob: Arc<dyn Blob>,
        committer: Arc<dyn OffsetCommitter>,
        replay_sink: Arc<dyn ReplayEventSink>,
        teams: TeamResolver,
        metrics: IngestMetrics,
    ) -> Result<Self> {
        // The buffer directory is exclusively ours; anything in it is
        // leftover from a previous process and already covered by the
        // high-water marks.
        let _ = fs::remove_dir_all(&config.local_directory);
        fs::create_dir_all(&config.local_directory)?;

        let marker = Arc::new(HighWaterMarker::new(
            Arc::clone(&store),
            format!("{}/high-water-marks", config.redis_prefix),
        ));
        let replay_marker = Arc::new(HighWaterMarker::new(
            Arc::clone(&store),
            format!("{}/replay-events-high-water-marks", config.redis_prefix),
        ));
        let replay = ReplayEventsIngester::new(replay_sink, Arc::clone(&replay_marker));
        let locker = config.partition_revoke_optimization.then(|| {
            PartitionLocker::new(
                Arc::clone(&store),
                config.redis_prefix.clone(),
                config.partition_lock_ttl,
            )
        });
        let realtime = Arc::new(RealtimeCache::new(
            store,
            config.redis_prefix.clone(),
            config.realtime_tail_events,
            config.realtime_ttl,
        ));
        let limits = SessionLimits {
            max_buffer_bytes: config.session_max_buffer_bytes,
            max_buffer_age_ms: config.session_max_buffer_age.as_millis() as i64,
        };
        Ok(Ingester {
            config,
            limits,
            managers: HashMap::new(),
            partitions: HashMap::new(),
            marker,
            replay_marker,
            replay,
            locker,
            realtime,
            blob,
            committer,
            teams,
            metrics,
        })
    }

    /// The number of live session managers. Test and metrics surface.
    pub fn session_count(&self) -> usize {
        self.managers.len()
    }

    /// Whether a manager currently exists for `key`.
    pub fn session_is_live(&self, key: &SessionKey) -> bool {
        self.managers.contains_key(key)
    }

    /// The partitions this worker currently owns.
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    /// The newest broker timestamp seen on `tp`, used by the lag gauges.
    pub fn last_timestamp(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).and_then(|s| s.last_timestamp_ms)
    }

    /// The highest offset consumed from `tp`, used by the lag gauges.
    pub fn last_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).and_then(|s| s.last_offset)
    }

    /// Instruments shared with the consumer wrapper.
    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Reacts to an `assign` rebalance: initialize partition state and
    /// claim leases. Offsets re-read from the committed position arrive
    /// through normal batches.
    pub async fn handle_assign(&mut self, assigned: Vec<TopicPartition>) {
        info!(partitions = ?assigned, "partitions assigned");
        if let Some(locker) = &self.locker {
            locker.claim(assigned.iter()).await;
        }
        for tp in assigned {
            self.partitions.entry(tp).or_default();
        }
    }

    /// Reacts to a `revoke` rebalance: flush revoked sessions when the
    /// handoff optimization is on, then destroy them and drop all partition
    /// state. The next owner resumes from the committed offset and skips
    /// already-flushed work through the shared marks.
    pub async fn handle_revoke(&mut self, revoked: Vec<TopicPartition>) {
        info!(partitions = ?revoked, "partitions revoked");
        let revoked_set: HashSet<&TopicPartition> = revoked.iter().collect();
        let revoked_keys: Vec<SessionKey> = self
            .managers
            .iter()
            .filter(|(_, manager)| revoked_set.contains(manager.partition()))
            .map(|(key, _)| key.clone())
            .collect();

        let mut torn_down: Vec<SessionManager> = revoked_keys
            .into_iter()
            .filter_map(|key| self.managers.remove(&key))
            .collect();
        self.metrics.sessions_revoked.set(torn_down.len() as i64);

        if self.locker.is_some() {
            // Oldest buffered data first: if the lease TTL runs out before
            // we finish, the sessions most at risk of duplication have
            // already made it out.
            torn_down.sort_by_key(|manager| manager.oldest_timestamp().unwrap_or(i64::MAX));
            for manager in &mut torn_down {
                if let Err(e) = manager.flush(FlushReason::PartitionShutdown).await {
                    warn!(
                        session = %manager.key(),
                        error = %e,
                        "revoke-time flush failed; new owner will re-ingest"
                    );
                }
            }
        }
        for manager in torn_down {
            manager.destroy();
        }

        for tp in &revoked {
            self.marker.revoke(tp);
            self.replay_marker.revoke(tp);
            self.partitions.remove(tp);
            let partition = tp.partition.to_string();
            let _ = self
                .metrics
                .lag_messages
                .remove_label_values(&[&partition]);
            let _ = self.metrics.lag_millis.remove_label_values(&[&partition]);
            let _ = self
                .metrics
                .last_committed_offset
                .remove_label_values(&[&partition]);
        }
        if let Some(locker) = &self.locker {
            locker.release(revoked.iter()).await;
        }
        self.metrics.sessions_handled.set(self.managers.len() as i64);
    }

    /// Processes one batch end to end: claim leases, parse and filter,
    /// route to managers, commit the safe offsets, feed the replay-events
    /// sink, and run the age-based flush pass.
    pub async fn process_batch(&mut self, batch: Vec<RawMessage>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.metrics.batch_size.observe(batch.len() as f64);

        let mut batch_highest: HashMap<TopicPartition, i64> = HashMap::new();
        for raw in &batch {
            let tp = raw.metadata.topic_partition();
            let highest = batch_highest.entry(tp).or_insert(i64::MIN);
            *highest = (*highest).max(raw.metadata.offset);
        }

        if let Some(locker) = &self.locker {
            locker.claim(batch_highest.keys()).await;
        }

        let team_table = self.teams.table().await;
        let mut parsed = Vec::with_capacity(batch.len());
        for raw in &batch {
            let tp = raw.metadata.topic_partition();
            self.metrics
                .messages_received
                .with_label_values(&[&tp.partition.to_string()])
                .inc();
            let state = self.partitions.entry(tp.clone()).or_default();
            state.last_offset = Some(state.last_offset.map_or(raw.metadata.offset, |o| {
                o.max(raw.metadata.offset)
            }));
            if let Some(ts) = raw.metadata.timestamp_ms {
                state.last_timestamp_ms =
                    Some(state.last_timestamp_ms.map_or(ts, |t| t.max(ts)));
            }

            let msg = match parse_message(raw, |token| team_table.get(token).copied()) {
                Ok(msg) => msg,
                Err(cause) => {
                    self.drop_message(cause);
                    continue;
                }
            };
            // Either mark suppresses the message: the session mark after a
            // self-heal flush, the partition-global mark when a replayed
            // range was fully handled by a previous owner.
            if self
                .marker
                .is_below(&tp, &msg.session_id, msg.metadata.offset)
                .await?
                || self
                    .marker
                    .is_below(&tp, PARTITION_GLOBAL_KEY, msg.metadata.offset)
                    .await?
            {
                self.drop_message(DropCause::HighWaterMark);
                continue;
            }
            parsed.push(msg);
        }

        let mut realtime_sessions = HashSet::new();
        for msg in &parsed {
            let key = msg.session_key();
            let tp = msg.metadata.topic_partition();
            if let Some(manager) = self.managers.get(&key) {
                if manager.partition() != &tp {
                    // The key is still bound to another partition; it only
                    // becomes a new session instance once that manager is
                    // destroyed on revoke.
                    warn!(session = %key, partition = %tp, "session bound to a different partition");
                    self.drop_message(DropCause::PartitionMismatch);
                    continue;
                }
            }
            let manager = match self.managers.entry(key.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let buffer = SessionBuffer::new(
                        &self.config.local_directory,
                        key.team_id,
                        &key.session_id,
                        self.config.realtime_tail_events,
                    )?;
                    entry.insert(SessionManager::new(
                        key.clone(),
                        tp,
                        buffer,
                        self.limits,
                        self.config.object_prefix.clone(),
                        Arc::clone(&self.blob),
                        Arc::clone(&self.marker),
                        Arc::clone(&self.realtime),
                        self.metrics.clone(),
                    ))
                }
            };
            realtime_sessions.insert(key.clone());
            if let Err(e) = manager.add(msg).await {
                // Fatal for the session: drop the manager without moving
                // any mark and let re-delivery rebuild it.
                error!(session = %key, error = %e, "session failed to consume; destroying manager");
                if let Some(manager) = self.managers.remove(&key) {
                    manager.destroy();
                }
            }
        }
        self.metrics
            .sessions_realtime
            .set(realtime_sessions.len() as i64);

        self.commit_partitions(&batch_highest).await;

        self.replay.consume_batch(&parsed).await?;

        self.flush_all_ready_sessions().await;

        self.metrics.sessions_handled.set(self.managers.len() as i64);
        self.update_time_lag();
        Ok(())
    }

    fn drop_message(&self, cause: DropCause) {
        self.metrics
            .events_dropped
            .with_label_values(&[cause.as_label()])
            .inc();
    }

    /// Commits, per partition touched by the batch, one past the highest
    /// offset known durably handled: just below the lowest un-flushed
    /// buffer, or the whole batch when nothing is buffered.
    async fn commit_partitions(&mut self, batch_highest: &HashMap<TopicPartition, i64>) {
        for (tp, highest) in batch_highest {
            let min_buffered: Option<i64> = self
                .managers
                .values()
                .filter(|m| m.partition() == tp)
                .filter_map(|m| m.lowest_offset())
                .min();
            let safe = match min_buffered {
                Some(lowest) => lowest - 1,
                None => *highest,
            };
            let next_offset = safe + 1;

            let state = self.partitions.entry(tp.clone()).or_default();
            if state.last_committed.map_or(false, |c| next_offset <= c) {
                continue;
            }
            match self.committer.commit(tp, next_offset).await {
                Ok(()) => {
                    state.last_committed = Some(next_offset);
                    self.metrics
                        .last_committed_offset
                        .with_label_values(&[&tp.partition.to_string()])
                        .set(next_offset);
                    // Marks strictly below the durable point can never
                    // matter again on this partition; reclaim them. The
                    // marks at `safe` itself stay: they are what suppresses
                    // a replay of the batch that was just handled.
                    if let Err(e) = self.marker.clear(tp, safe - 1).await {
                        warn!(partition = %tp, error = %e, "failed to clear high-water marks");
                    }
                }
                Err(e) => {
                    self.metrics
                        .commit_failures
                        .with_label_values(&[&tp.partition.to_string()])
                        .inc();
                    warn!(partition = %tp, error = %e, "offset commit failed");
                }
            }
        }
    }

    /// Runs the age/size flush pass over every manager, with each
    /// partition's newest broker timestamp as the reference clock. Flushes
    /// run concurrently; a failing session neither blocks the others nor
    /// fails the batch. Managers left empty are destroyed.
    async fn flush_all_ready_sessions(&mut self) {
        let references: HashMap<TopicPartition, i64> = self
            .partitions
            .iter()
            .filter_map(|(tp, state)| state.last_timestamp_ms.map(|ts| (tp.clone(), ts)))
            .collect();

        let flushes: FuturesUnordered<_> = self
            .managers
            .values_mut()
            .filter_map(|manager| {
                let reference = *references.get(manager.partition())?;
                let key = manager.key().clone();
                Some(async move { (key, manager.flush_if_old(reference).await) })
            })
            .collect();
        let results = tokio::time::timeout(FLUSH_ALL_TIMEOUT, flushes.collect::<Vec<_>>()).await;
        match results {
            Ok(results) => {
                for (key, result) in results {
                    if let Err(e) = result {
                        warn!(session = %key, error = %e, "session flush failed; will retry next tick");
                    }
                }
            }
            Err(_) => {
                error!(
                    timeout_s = FLUSH_ALL_TIMEOUT.as_secs(),
                    "flush pass exceeded its deadline; remaining sessions retry next tick"
                );
            }
        }

        let empty: Vec<SessionKey> = self
            .managers
            .iter()
            .filter(|(_, m)| m.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        for key in empty {
            if let Some(manager) = self.managers.remove(&key) {
                manager.destroy();
            }
        }
    }

    fn update_time_lag(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for (tp, state) in &self.partitions {
            if let Some(ts) = state.last_timestamp_ms {
                self.metrics
                    .lag_millis
                    .with_label_values(&[&tp.partition.to_string()])
                    .set((now_ms - ts).max(0));
            }
        }
    }

    /// Stops ingestion: flush and destroy every manager as if all
    /// partitions were revoked, then release all leases. The caller has
    /// already halted fetching.
    pub async fn stop(&mut self) {
        info!(sessions = self.managers.len(), "stopping ingester");
        let mut managers: Vec<SessionManager> = self.managers.drain().map(|(_, m)| m).collect();
        managers.sort_by_key(|manager| manager.oldest_timestamp().unwrap_or(i64::MAX));
        for manager in &mut managers {
            if let Err(e) = manager.flush(FlushReason::ProcessStop).await {
                warn!(session = %manager.key(), error = %e, "flush on stop failed");
            }
        }
        for manager in managers {
            manager.destroy();
        }
        let owned: Vec<TopicPartition> = self.partitions.keys().cloned().collect();
        if let Some(locker) = &self.locker {
            locker.release(owned.iter()).await;
        }
        for tp in &owned {
            self.marker.revoke(tp);
            self.replay_marker.revoke(tp);
        }
        self.partitions.clear();
        self.metrics.sessions_handled.set(0);
    }
}

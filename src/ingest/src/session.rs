// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-session manager: owns one [`SessionBuffer`], decides when to
//! flush, and performs the flush protocol against the object store and the
//! high-water marker.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::blob::{self, Blob, BlobMetadata};
use crate::buffer::SessionBuffer;
use crate::error::{IngestError, Result};
use crate::highwater::{HighWaterMarker, PARTITION_GLOBAL_KEY};
use crate::message::{IncomingMessage, SessionKey, TopicPartition};
use crate::metrics::IngestMetrics;
use crate::realtime::RealtimeCache;

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    BufferSize,
    BufferAge,
    PartitionShutdown,
    ProcessStop,
}

impl FlushReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            FlushReason::BufferSize => "buffer_size",
            FlushReason::BufferAge => "buffer_age",
            FlushReason::PartitionShutdown => "partition_shutdown",
            FlushReason::ProcessStop => "process_stop",
        }
    }
}

/// Flush thresholds, shared by every manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_buffer_bytes: u64,
    pub max_buffer_age_ms: i64,
}

/// The record written per snapshot event, one JSON line each.
#[derive(Debug, Serialize)]
struct SnapshotRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    window_id: Option<&'a str>,
    data: &'a serde_json::Value,
}

/// Owns the buffered state of one session on one partition.
///
/// Managers are created lazily by the consumer on the first message for
/// their key and driven only from the consumer task, so a manager is never
/// flushed concurrently with itself: the single-flight requirement of the
/// flush protocol holds by construction.
pub struct SessionManager {
    key: SessionKey,
    partition: TopicPartition,
    buffer: SessionBuffer,
    limits: SessionLimits,
    object_prefix: String,
    blob: Arc<dyn Blob>,
    marker: Arc<HighWaterMarker>,
    realtime: Arc<RealtimeCache>,
    metrics: IngestMetrics,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SessionKey,
        partition: TopicPartition,
        buffer: SessionBuffer,
        limits: SessionLimits,
        object_prefix: String,
        blob: Arc<dyn Blob>,
        marker: Arc<HighWaterMarker>,
        realtime: Arc<RealtimeCache>,
        metrics: IngestMetrics,
    ) -> Self {
        SessionManager {
            key,
            partition,
            buffer,
            limits,
            object_prefix,
            blob,
            marker,
            realtime,
            metrics,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// The partition this manager is bound to for its lifetime.
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The lowest un-flushed offset held by this session, if any. The
    /// consumer's safe commit point may never advance past this.
    pub fn lowest_offset(&self) -> Option<i64> {
        self.buffer.lowest_offset()
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.buffer.oldest_timestamp()
    }

    /// Appends a parsed snapshot batch to the buffer, mirrors the fragments
    /// to the realtime tail, and flushes if the size limit is now exceeded.
    ///
    /// A failure here is fatal for the session: the caller destroys the
    /// manager without advancing any mark and lets re-delivery repopulate
    /// it.
    pub async fn add(&mut self, msg: &IncomingMessage) -> Result<()> {
        let offset = msg.metadata.offset;
        let timestamp_ms = msg
            .metadata
            .timestamp_ms
            .expect("parser rejects messages without timestamps");

        let mut fragments = Vec::with_capacity(msg.events.len());
        for event in &msg.events {
            let record = SnapshotRecord {
                window_id: msg.window_id.as_deref(),
                data: event,
            };
            let line = serde_json::to_vec(&record).map_err(|e| IngestError::SessionConsume {
                session: self.key.clone(),
                reason: e.to_string(),
            })?;
            self.buffer
                .append(&line, offset, timestamp_ms)
                .map_err(|e| IngestError::SessionConsume {
                    session: self.key.clone(),
                    reason: e.to_string(),
                })?;
            fragments.push(line);
        }

        self.realtime
            .push(self.key.team_id, &self.key.session_id, fragments)
            .await;

        if self.buffer.size() >= self.limits.max_buffer_bytes {
            self.flush(FlushReason::BufferSize).await?;
        }
        Ok(())
    }

    /// Flushes if the buffer has aged past the limit, measured against the
    /// newest broker timestamp seen on this partition rather than the wall
    /// clock, or if it has grown past the size limit. Returns whether a
    /// flush ran.
    pub async fn flush_if_old(&mut self, reference_time_ms: i64) -> Result<bool> {
        let Some(oldest) = self.buffer.oldest_timestamp() else {
            return Ok(false);
        };
        if reference_time_ms - oldest >= self.limits.max_buffer_age_ms {
            self.flush(FlushReason::BufferAge).await?;
            return Ok(true);
        }
        if self.buffer.size() >= self.limits.max_buffer_bytes {
            self.flush(FlushReason::BufferSize).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The flush protocol: finalize the buffer, upload the compressed blob
    /// under its deterministic key, advance the high-water marks (session
    /// first, then partition-global), then reset the buffer.
    ///
    /// On any failure the buffer is left intact and no mark moves; the next
    /// flush tick retries.
    pub async fn flush(&mut self, reason: FlushReason) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let finalized = self.buffer.finalize()?;
        let body = blob::compress_file(&finalized.path)?;
        let body_len = body.len();

        let key = blob::object_key(
            &self.object_prefix,
            self.key.team_id,
            &self.key.session_id,
            self.partition.partition,
            finalized.lowest_offset,
            finalized.highest_offset,
            finalized.created_at_ms,
        );
        let metadata = BlobMetadata {
            team_id: self.key.team_id,
            session_id: self.key.session_id.clone(),
            lowest_offset: finalized.lowest_offset,
            highest_offset: finalized.highest_offset,
            event_count: finalized.event_count,
        };
        self.blob.set(&key, body, &metadata).await?;

        // Session mark first, partition-global second: if we crash between
        // the two, replay re-reads the batch and the session mark suppresses
        // the duplicate, whereas the reverse order could skip unflushed
        // sessions entirely.
        self.marker
            .add(&self.partition, &self.key.session_id, finalized.highest_offset)
            .await?;
        self.marker
            .add(&self.partition, PARTITION_GLOBAL_KEY, finalized.highest_offset)
            .await?;

        self.buffer.reset()?;

        self.metrics.flushes.with_label_values(&[reason.as_label()]).inc();
        self.metrics
            .flush_duration_seconds
            .observe(start.elapsed().as_secs_f64());
        self.metrics.flushed_bytes.observe(body_len as f64);
        info!(
            session = %self.key,
            partition = %self.partition,
            reason = reason.as_label(),
            events = finalized.event_count,
            bytes = body_len,
            lowest_offset = finalized.lowest_offset,
            highest_offset = finalized.highest_offset,
            "flushed session buffer"
        );
        Ok(())
    }

    /// Tears the manager down, unlinking its temp file. Pending work was
    /// either flushed by the caller or is intentionally abandoned to
    /// re-delivery.
    pub fn destroy(self) {
        debug!(session = %self.key, partition = %self.partition, "destroying session manager");
        // Dropping the buffer removes its file.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::highwater::HighWaterMarker;
    use crate::message::MessageMetadata;
    use crate::realtime::RealtimeCache;
    use crate::store::{MemStore, SharedStore};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemStore>,
        blob: Arc<crate::blob::MemBlob>,
        manager: SessionManager,
    }

    fn harness(max_buffer_bytes: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let shared = Arc::clone(&store) as Arc<dyn SharedStore>;
        let blob = Arc::new(crate::blob::MemBlob::new());
        let marker = Arc::new(HighWaterMarker::new(
            Arc::clone(&shared),
            "t/high-water-marks".into(),
        ));
        let realtime = Arc::new(RealtimeCache::new(
            shared,
            "t".into(),
            10,
            std::time::Duration::from_secs(300),
        ));
        let key = SessionKey {
            team_id: 7,
            session_id: "a".into(),
        };
        let partition = TopicPartition::new("snap", 0);
        let buffer = SessionBuffer::new(dir.path(), 7, "a", 10).unwrap();
        let manager = SessionManager::new(
            key,
            partition,
            buffer,
            SessionLimits {
                max_buffer_bytes,
                max_buffer_age_ms: 60_000,
            },
            "session_recordings".into(),
            Arc::clone(&blob) as Arc<dyn Blob>,
            marker,
            realtime,
            IngestMetrics::for_tests(),
        );
        Harness {
            _dir: dir,
            store,
            blob,
            manager,
        }
    }

    fn message(offset: i64, timestamp_ms: i64, payload_bytes: usize) -> IncomingMessage {
        IncomingMessage {
            metadata: MessageMetadata {
                topic: "snap".into(),
                partition: 0,
                offset,
                timestamp_ms: Some(timestamp_ms),
            },
            team_id: 7,
            distinct_id: "d".into(),
            session_id: "a".into(),
            window_id: Some("w1".into()),
            events: vec![serde_json::json!({"type": 3, "pad": "x".repeat(payload_bytes)})],
        }
    }

    #[tokio::test]
    async fn size_limit_triggers_flush_inside_add() {
        let mut h = harness(100);
        h.manager.add(&message(10, 1_000, 20)).await.unwrap();
        h.manager.add(&message(11, 1_100, 20)).await.unwrap();
        assert!(h.blob.is_empty());

        h.manager.add(&message(12, 1_200, 20)).await.unwrap();
        let keys = h.blob.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("session_recordings/team_id=7/session_id=a/partition=0/10-12-"));
        assert!(keys[0].ends_with(".jsonl.gz"));

        // Both marks advanced to the highest flushed offset.
        assert_eq!(
            h.store
                .zscore("t/high-water-marks/snap/0", "a")
                .await
                .unwrap(),
            Some(12)
        );
        assert_eq!(
            h.store
                .zscore("t/high-water-marks/snap/0", PARTITION_GLOBAL_KEY)
                .await
                .unwrap(),
            Some(12)
        );
        assert!(h.manager.is_empty());
        assert_eq!(h.manager.lowest_offset(), None);
    }

    #[tokio::test]
    async fn flushed_object_contains_every_event_line() {
        let mut h = harness(u64::MAX);
        h.manager.add(&message(10, 1_000, 4)).await.unwrap();
        h.manager.add(&message(11, 1_100, 4)).await.unwrap();
        h.manager.flush(FlushReason::ProcessStop).await.unwrap();

        let key = h.blob.keys().remove(0);
        let (body, metadata) = h.blob.get(&key).unwrap();
        let lines = crate::blob::decompress(&body).unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&lines)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(record["window_id"], "w1");
            assert_eq!(record["data"]["type"], 3);
        }
        assert_eq!(metadata.event_count, 2);
        assert_eq!(metadata.lowest_offset, 10);
        assert_eq!(metadata.highest_offset, 11);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_no_op() {
        let mut h = harness(100);
        h.manager.flush(FlushReason::BufferAge).await.unwrap();
        assert!(h.blob.is_empty());
    }

    #[tokio::test]
    async fn failed_upload_leaves_buffer_intact_for_retry() {
        let mut h = harness(u64::MAX);
        h.manager.add(&message(10, 1_000, 4)).await.unwrap();

        h.blob.fail_next_set();
        assert!(h.manager.flush(FlushReason::BufferAge).await.is_err());
        // Nothing advanced, nothing lost.
        assert_eq!(h.manager.lowest_offset(), Some(10));
        assert_eq!(
            h.store
                .zscore("t/high-water-marks/snap/0", "a")
                .await
                .unwrap(),
            None
        );

        h.manager.flush(FlushReason::BufferAge).await.unwrap();
        assert_eq!(h.blob.len(), 1);
        assert!(h.manager.is_empty());
    }

    #[tokio::test]
    async fn flush_if_old_uses_the_reference_clock() {
        let mut h = harness(u64::MAX);
        h.manager.add(&message(10, 1_000, 4)).await.unwrap();

        assert!(!h.manager.flush_if_old(50_000).await.unwrap());
        assert!(h.blob.is_empty());

        // 61s past the oldest buffered timestamp.
        assert!(h.manager.flush_if_old(62_000).await.unwrap());
        assert_eq!(h.blob.len(), 1);
    }

    #[tokio::test]
    async fn add_mirrors_fragments_to_the_realtime_tail() {
        let mut h = harness(u64::MAX);
        h.manager.add(&message(10, 1_000, 4)).await.unwrap();
        assert_eq!(h.store.list("t/snapshots/team-7/session-a").len(), 1);
        let published = h.store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t/realtime-subscriptions");
    }
}

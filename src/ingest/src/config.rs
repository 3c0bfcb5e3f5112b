// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration for the blob ingester.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a blob ingester instance.
///
/// The binary assembles this from command-line flags and environment
/// variables; tests construct it directly.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    // === Kafka options. ===
    /// Brokers to bootstrap from, `host:port` comma-separated.
    pub kafka_brokers: String,
    /// The topic carrying snapshot batches.
    pub topic: String,
    /// Consumer group to join.
    pub consumer_group: String,
    /// Total fetch size cap across all partitions, in bytes.
    pub consumption_max_bytes: usize,
    /// Fetch size cap for any single partition, in bytes.
    pub consumption_max_bytes_per_partition: usize,
    /// Minimum number of messages the client buffers per partition.
    pub kafka_queue_size: usize,
    /// Long-poll timeout for fetches.
    pub consumption_max_wait: Duration,
    /// Upper bound on messages gathered into one processing batch.
    pub batch_size: usize,
    /// How long to wait for a batch to fill before processing what arrived.
    pub batching_timeout: Duration,

    // === Session flush options. ===
    /// Flush a session once its buffer exceeds this many bytes.
    pub session_max_buffer_bytes: u64,
    /// Flush a session once its oldest buffered event is this much older
    /// than the newest broker timestamp seen on the partition.
    pub session_max_buffer_age: Duration,
    /// How many recent serialized events each session retains for the
    /// realtime tail.
    pub realtime_tail_events: usize,
    /// TTL on the realtime list in the shared store.
    pub realtime_ttl: Duration,

    // === Local state. ===
    /// Root directory for session buffer temp files. Purged on startup.
    pub local_directory: PathBuf,

    // === Shared store. ===
    /// Key namespace inside the shared store.
    pub redis_prefix: String,
    /// Enables the partition locker and revoke-time flushing.
    pub partition_revoke_optimization: bool,
    /// TTL on partition lease keys.
    pub partition_lock_ttl: Duration,

    // === Object store. ===
    /// Bucket receiving flushed session blobs.
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub object_prefix: String,

    // === Downstream. ===
    /// Topic receiving derived replay-event records.
    pub replay_events_topic: String,

    // === Team resolution. ===
    /// Path to the JSON `token -> team_id` table.
    pub team_token_map_path: Option<PathBuf>,
    /// Refresh interval for the team table and broker high offsets.
    pub refresh_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            kafka_brokers: "localhost:9092".into(),
            topic: "session_recording_snapshot_item_events".into(),
            consumer_group: "session-recordings-blob".into(),
            consumption_max_bytes: 1024 * 1024 * 100,
            consumption_max_bytes_per_partition: 1024 * 1024 * 20,
            kafka_queue_size: 1500,
            consumption_max_wait: Duration::from_millis(50),
            batch_size: 500,
            batching_timeout: Duration::from_millis(750),
            session_max_buffer_bytes: 1024 * 1024 * 10,
            session_max_buffer_age: Duration::from_secs(60 * 10),
            realtime_tail_events: 300,
            realtime_ttl: Duration::from_secs(60 * 5),
            local_directory: PathBuf::from("/tmp/session-recording-buffers"),
            redis_prefix: "@session/replay".into(),
            partition_revoke_optimization: false,
            partition_lock_ttl: Duration::from_secs(30),
            bucket: "session-recordings".into(),
            object_prefix: "session_recordings".into(),
            replay_events_topic: "clickhouse_session_replay_events".into(),
            team_token_map_path: None,
            refresh_interval: Duration::from_secs(60 * 5),
        }
    }
}

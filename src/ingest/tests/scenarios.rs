// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end coordinator scenarios against in-memory doubles: flush
//! triggers, commit safety, replay idempotence, and rebalance teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rv_ingest::blob::{Blob, MemBlob};
use rv_ingest::config::IngestConfig;
use rv_ingest::highwater::PARTITION_GLOBAL_KEY;
use rv_ingest::ingester::{Ingester, MemCommitter, OffsetCommitter};
use rv_ingest::message::{MessageMetadata, RawMessage, SessionKey, TopicPartition};
use rv_ingest::metrics::IngestMetrics;
use rv_ingest::replay_events::{MemReplayEventSink, ReplayEventSink};
use rv_ingest::store::{MemStore, SharedStore};
use rv_ingest::teams::TeamResolver;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MemStore>,
    blob: Arc<MemBlob>,
    committer: Arc<MemCommitter>,
    sink: Arc<MemReplayEventSink>,
    metrics: IngestMetrics,
    ingester: Ingester,
}

fn harness(tune: impl FnOnce(&mut IngestConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = IngestConfig {
        local_directory: dir.path().join("buffers"),
        redis_prefix: "t".into(),
        object_prefix: "session_recordings".into(),
        session_max_buffer_bytes: 1024 * 1024,
        session_max_buffer_age: Duration::from_secs(60),
        ..IngestConfig::default()
    };
    tune(&mut config);

    let store = Arc::new(MemStore::new());
    let blob = Arc::new(MemBlob::new());
    let committer = Arc::new(MemCommitter::new());
    let sink = Arc::new(MemReplayEventSink::new());
    let metrics = IngestMetrics::for_tests();
    let teams = TeamResolver::fixed(HashMap::from([("phc_abc".to_owned(), 7)]));

    let ingester = Ingester::new(
        config,
        Arc::clone(&store) as Arc<dyn SharedStore>,
        Arc::clone(&blob) as Arc<dyn Blob>,
        Arc::clone(&committer) as Arc<dyn OffsetCommitter>,
        Arc::clone(&sink) as Arc<dyn ReplayEventSink>,
        teams,
        metrics.clone(),
    )
    .unwrap();

    Harness {
        _dir: dir,
        store,
        blob,
        committer,
        sink,
        metrics,
        ingester,
    }
}

/// The serialized length of one buffer line produced by [`snapshot_raw`],
/// plus its newline. Lets tests pick byte thresholds that trip on an exact
/// message count.
fn line_len() -> u64 {
    let record = serde_json::json!({
        "window_id": "w1",
        "data": event_payload(),
    });
    serde_json::to_vec(&record).unwrap().len() as u64 + 1
}

fn event_payload() -> serde_json::Value {
    serde_json::json!({"type": 3, "timestamp": 1_000, "pad": "x".repeat(16)})
}

fn snapshot_raw(session: &str, partition: i32, offset: i64, timestamp_ms: i64) -> RawMessage {
    let data = serde_json::json!({
        "event": "$snapshot_items",
        "properties": {
            "$session_id": session,
            "$window_id": "w1",
            "$snapshot_items": [event_payload()],
        },
    })
    .to_string();
    let payload = serde_json::json!({
        "team_id": 7,
        "distinct_id": "d",
        "data": data,
    })
    .to_string();
    RawMessage {
        metadata: MessageMetadata {
            topic: "snap".into(),
            partition,
            offset,
            timestamp_ms: Some(timestamp_ms),
        },
        payload: Some(Bytes::from(payload)),
    }
}

fn invalid_raw(partition: i32, offset: i64) -> RawMessage {
    RawMessage {
        metadata: MessageMetadata {
            topic: "snap".into(),
            partition,
            offset,
            timestamp_ms: Some(1_000),
        },
        payload: Some(Bytes::from_static(b"not json")),
    }
}

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new("snap", partition)
}

fn session_key(session: &str) -> SessionKey {
    SessionKey {
        team_id: 7,
        session_id: session.into(),
    }
}

async fn mark(store: &MemStore, partition: i32, member: &str) -> Option<i64> {
    store
        .zscore(&format!("t/high-water-marks/snap/{}", partition), member)
        .await
        .unwrap()
}

// S1: three messages cross the size threshold; the flush lands one object
// covering offsets 10..=12, both marks advance, and the commit moves to 13.
#[tokio::test]
async fn s1_basic_flush_by_size() {
    let threshold = 2 * line_len() + 1;
    let mut h = harness(|c| c.session_max_buffer_bytes = threshold);
    h.ingester.handle_assign(vec![tp(0)]).await;

    h.ingester
        .process_batch(vec![
            snapshot_raw("a", 0, 10, 1_000),
            snapshot_raw("a", 0, 11, 1_100),
            snapshot_raw("a", 0, 12, 1_200),
        ])
        .await
        .unwrap();

    let keys = h.blob.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("session_recordings/team_id=7/session_id=a/partition=0/10-12-"));
    assert!(keys[0].ends_with(".jsonl.gz"));

    assert!(mark(&h.store, 0, "a").await.unwrap() >= 12);
    assert!(mark(&h.store, 0, PARTITION_GLOBAL_KEY).await.unwrap() >= 12);
    assert_eq!(h.committer.committed(&tp(0)), Some(13));
    // The emptied manager was destroyed.
    assert!(!h.ingester.session_is_live(&session_key("a")));
}

// S2: the age trigger runs against each partition's own newest broker
// timestamp, so traffic on partition 0 cannot flush partition 1.
#[tokio::test]
async fn s2_flush_by_age_is_per_partition() {
    let t0 = 1_000_000;
    let mut h = harness(|c| c.session_max_buffer_age = Duration::from_secs(60));
    h.ingester.handle_assign(vec![tp(0), tp(1)]).await;

    h.ingester
        .process_batch(vec![
            snapshot_raw("a", 0, 1, t0),
            snapshot_raw("b", 1, 1, t0),
        ])
        .await
        .unwrap();
    assert!(h.blob.is_empty());
    let p1_commit = h.committer.committed(&tp(1));

    h.ingester
        .process_batch(vec![snapshot_raw("a", 0, 2, t0 + 61_000)])
        .await
        .unwrap();

    let keys = h.blob.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].contains("session_id=a"));
    assert!(h.ingester.session_is_live(&session_key("b")));
    // The partition-1 commit did not advance.
    assert_eq!(h.committer.committed(&tp(1)), p1_commit);
}

// S3: offsets at or below a pre-populated mark drop before any side
// effect, no manager is created, and the commit skips past them.
#[tokio::test]
async fn s3_dedupe_on_replay() {
    let mut h = harness(|_| ());
    h.ingester.handle_assign(vec![tp(0)]).await;
    h.store
        .zadd_gt("t/high-water-marks/snap/0", "b", 50)
        .await
        .unwrap();

    h.ingester
        .process_batch(vec![
            snapshot_raw("b", 0, 48, 1_000),
            snapshot_raw("b", 0, 49, 1_100),
            snapshot_raw("b", 0, 50, 1_200),
        ])
        .await
        .unwrap();

    assert_eq!(
        h.metrics
            .events_dropped
            .with_label_values(&["high_water_mark"])
            .get(),
        3
    );
    assert_eq!(h.ingester.session_count(), 0);
    assert!(h.blob.is_empty());
    assert!(h.sink.records().is_empty());
    assert_eq!(h.committer.committed(&tp(0)), Some(51));
}

// S4: with the handoff optimization on, a revoke flushes the partition's
// sessions with reason partition_shutdown, destroys them, and releases the
// lease.
#[tokio::test]
async fn s4_revoke_flushes_and_tears_down() {
    let mut h = harness(|c| c.partition_revoke_optimization = true);
    h.ingester.handle_assign(vec![tp(2)]).await;

    let batch = (0..5)
        .map(|i| snapshot_raw("c", 2, 100 + i, 1_000 + i))
        .collect();
    h.ingester.process_batch(batch).await.unwrap();
    assert!(h.blob.is_empty());
    assert!(h.store.lease_holder("t/locks/snap/2").is_some());

    h.ingester.handle_revoke(vec![tp(2)]).await;

    let keys = h.blob.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].contains("session_id=c/partition=2/100-104-"));
    assert_eq!(h.ingester.session_count(), 0);
    assert!(h.ingester.assigned_partitions().is_empty());
    assert_eq!(h.store.lease_holder("t/locks/snap/2"), None);
    // Property: every flushed session's mark covers its highest offset.
    assert!(mark(&h.store, 2, "c").await.unwrap() >= 104);
    assert_eq!(
        h.metrics
            .flushes
            .with_label_values(&["partition_shutdown"])
            .get(),
        1
    );
}

// S5: a straggler session pins the commit at its lowest buffered offset
// even when another session on the partition has flushed far past it.
#[tokio::test]
async fn s5_commit_safety_under_straggler() {
    let threshold = 5 * line_len();
    let mut h = harness(|c| c.session_max_buffer_bytes = threshold);
    h.ingester.handle_assign(vec![tp(0)]).await;

    let mut batch = vec![snapshot_raw("d", 0, 100, 1_000)];
    batch.push(snapshot_raw("e", 0, 101, 1_000));
    batch.push(snapshot_raw("e", 0, 102, 1_000));
    batch.push(snapshot_raw("d", 0, 103, 1_000));
    for offset in 104..=110 {
        batch.push(snapshot_raw("e", 0, offset, 1_000));
    }
    h.ingester.process_batch(batch).await.unwrap();

    // "e" crossed the size threshold and flushed at least once; "d" did
    // not.
    assert!(!h.blob.is_empty());
    assert!(h.blob.keys().iter().all(|k| k.contains("session_id=e")));
    assert!(h.ingester.session_is_live(&session_key("d")));
    // 100 is not advanced past.
    assert_eq!(h.committer.committed(&tp(0)), Some(100));
}

// S6: a failing team-table reload leaves the previous mapping in effect.
#[tokio::test]
async fn s6_team_refresh_is_stale_on_error() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, r#"{{"phc_abc": 7}}"#).unwrap();
    drop(file);

    let resolver = TeamResolver::from_file(path.clone(), Duration::from_secs(300));
    assert_eq!(resolver.table().await.get("phc_abc"), Some(&7));

    // The next reload fails; the last-known mapping keeps resolving.
    std::fs::remove_file(&path).unwrap();
    resolver.refresh_now().await;
    assert_eq!(resolver.table().await.get("phc_abc"), Some(&7));
}

// Re-delivering a fully handled batch produces no new objects, no new
// commits, no realtime pushes, and no replay-event records.
#[tokio::test]
async fn replayed_batch_is_idempotent() {
    let threshold = 2 * line_len() + 1;
    let mut h = harness(|c| c.session_max_buffer_bytes = threshold);
    h.ingester.handle_assign(vec![tp(0)]).await;

    let batch: Vec<RawMessage> = (10..=12)
        .map(|offset| snapshot_raw("a", 0, offset, 1_000 + offset))
        .collect();
    h.ingester.process_batch(batch.clone()).await.unwrap();

    let objects = h.blob.len();
    let commits = h.committer.commits().len();
    let replay_records = h.sink.records().len();
    let realtime = h.store.list("t/snapshots/team-7/session-a").len();

    h.ingester.process_batch(batch).await.unwrap();

    assert_eq!(h.blob.len(), objects);
    assert_eq!(h.committer.commits().len(), commits);
    assert_eq!(h.sink.records().len(), replay_records);
    assert_eq!(h.store.list("t/snapshots/team-7/session-a").len(), realtime);
}

// Boundary: an empty batch changes nothing and commits nothing.
#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let mut h = harness(|_| ());
    h.ingester.handle_assign(vec![tp(0)]).await;
    h.ingester.process_batch(vec![]).await.unwrap();
    assert!(h.committer.commits().is_empty());
    assert_eq!(h.ingester.session_count(), 0);
}

// Boundary: a batch of nothing but invalid envelopes still advances the
// commit to one past the batch's highest offset.
#[tokio::test]
async fn invalid_only_batch_advances_commit() {
    let mut h = harness(|_| ());
    h.ingester.handle_assign(vec![tp(0)]).await;

    h.ingester
        .process_batch(vec![invalid_raw(0, 5), invalid_raw(0, 6), invalid_raw(0, 7)])
        .await
        .unwrap();

    assert_eq!(
        h.metrics
            .events_dropped
            .with_label_values(&["invalid_json"])
            .get(),
        3
    );
    assert_eq!(h.committer.committed(&tp(0)), Some(8));
    assert_eq!(h.ingester.session_count(), 0);
}

// Tokens resolve through the table; unknown tokens drop and never create
// managers, but do not hold back the commit.
#[tokio::test]
async fn unknown_tokens_drop_and_commit_advances() {
    let mut h = harness(|_| ());
    h.ingester.handle_assign(vec![tp(0)]).await;

    let mut by_token = snapshot_raw("a", 0, 20, 1_000);
    let payload = serde_json::json!({
        "token": "phc_abc",
        "distinct_id": "d",
        "data": serde_json::json!({
            "event": "$snapshot_items",
            "properties": {
                "$session_id": "a",
                "$window_id": "w1",
                "$snapshot_items": [event_payload()],
            },
        })
        .to_string(),
    })
    .to_string();
    by_token.payload = Some(Bytes::from(payload));

    let mut unknown = by_token.clone();
    unknown.metadata.offset = 21;
    let payload = serde_json::json!({
        "token": "phc_missing",
        "distinct_id": "d",
        "data": "{}",
    })
    .to_string();
    unknown.payload = Some(Bytes::from(payload));

    h.ingester
        .process_batch(vec![by_token, unknown])
        .await
        .unwrap();

    assert!(h.ingester.session_is_live(&session_key("a")));
    assert_eq!(
        h.metrics
            .events_dropped
            .with_label_values(&["unknown_team"])
            .get(),
        1
    );
    // The straggling valid message pins the commit at its own offset.
    assert_eq!(h.committer.committed(&tp(0)), Some(20));
}

// A failing replay-events publish fails the batch after commit but before
// any marks advance for the sink, so re-processing publishes exactly once.
#[tokio::test]
async fn replay_sink_failure_fails_batch_and_recovers() {
    let mut h = harness(|_| ());
    h.ingester.handle_assign(vec![tp(0)]).await;

    h.sink.fail_next_publish();
    let batch = vec![snapshot_raw("a", 0, 10, 1_000)];
    assert!(h.ingester.process_batch(batch.clone()).await.is_err());
    assert!(h.sink.records().is_empty());

    h.ingester.process_batch(batch).await.unwrap();
    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, "a");
    assert_eq!(records[0].team_id, 7);
}

// Stop behaves like a revoke of everything: flush with reason
// process_stop, destroy all managers, release all state.
#[tokio::test]
async fn stop_flushes_and_destroys_everything() {
    let mut h = harness(|c| c.partition_revoke_optimization = true);
    h.ingester.handle_assign(vec![tp(0), tp(1)]).await;

    h.ingester
        .process_batch(vec![
            snapshot_raw("a", 0, 10, 1_000),
            snapshot_raw("b", 1, 20, 2_000),
        ])
        .await
        .unwrap();
    assert_eq!(h.ingester.session_count(), 2);

    h.ingester.stop().await;

    assert_eq!(h.ingester.session_count(), 0);
    assert!(h.ingester.assigned_partitions().is_empty());
    assert_eq!(h.blob.len(), 2);
    assert_eq!(
        h.metrics.flushes.with_label_values(&["process_stop"]).get(),
        2
    );
    assert_eq!(h.store.lease_holder("t/locks/snap/0"), None);
    assert_eq!(h.store.lease_holder("t/locks/snap/1"), None);
}

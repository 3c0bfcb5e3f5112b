// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The secondary sink: one compact replay-event record per snapshot batch,
//! published to a downstream topic for the analytical store.
//!
//! Gated by its own high-water marker namespace so its progress is
//! acknowledged independently of session flushing: a batch can be fully
//! flushed to blob storage yet still owe its replay events, and vice versa.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::highwater::HighWaterMarker;
use crate::message::IncomingMessage;

/// The derived record for one snapshot batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayEventRecord {
    pub team_id: i64,
    pub session_id: String,
    pub distinct_id: String,
    pub window_id: Option<String>,
    pub first_timestamp_ms: i64,
    pub last_timestamp_ms: i64,
    pub event_count: u64,
}

/// Where derived replay events go.
#[async_trait]
pub trait ReplayEventSink: Send + Sync {
    /// Publishes the records, all or nothing: a partial failure fails the
    /// call and the caller re-processes the batch.
    async fn publish(&self, records: Vec<ReplayEventRecord>) -> Result<()>;
}

/// [`ReplayEventSink`] producing to a Kafka topic, keyed by session so a
/// session's records stay ordered downstream.
pub struct KafkaReplayEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaReplayEventSink {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        KafkaReplayEventSink { producer, topic }
    }
}

#[async_trait]
impl ReplayEventSink for KafkaReplayEventSink {
    async fn publish(&self, records: Vec<ReplayEventRecord>) -> Result<()> {
        for record in &records {
            let payload =
                serde_json::to_vec(record).map_err(|e| IngestError::ReplayPublish(e.to_string()))?;
            let mut attempts = 0;
            loop {
                let send = self.producer.send(
                    FutureRecord::to(&self.topic)
                        .key(&record.session_id)
                        .payload(&payload),
                    Duration::from_secs(5),
                );
                match send.await {
                    Ok(_) => break,
                    Err((e, _)) if attempts == 0 => {
                        debug!(error = %e, "replay event produce failed, retrying once");
                        attempts += 1;
                    }
                    Err((e, _)) => {
                        return Err(IngestError::ReplayPublish(e.to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`ReplayEventSink`] for tests.
#[derive(Default)]
pub struct MemReplayEventSink {
    records: Mutex<Vec<ReplayEventRecord>>,
    fail_next: Mutex<bool>,
}

impl MemReplayEventSink {
    pub fn new() -> Self {
        MemReplayEventSink::default()
    }

    pub fn records(&self) -> Vec<ReplayEventRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn fail_next_publish(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl ReplayEventSink for MemReplayEventSink {
    async fn publish(&self, records: Vec<ReplayEventRecord>) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(IngestError::ReplayPublish("injected failure".into()));
        }
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

pub struct ReplayEventsIngester {
    sink: Arc<dyn ReplayEventSink>,
    /// A marker instance with its own key namespace, distinct from the
    /// session-flush marker.
    marker: Arc<HighWaterMarker>,
}

impl ReplayEventsIngester {
    pub fn new(sink: Arc<dyn ReplayEventSink>, marker: Arc<HighWaterMarker>) -> Self {
        ReplayEventsIngester { sink, marker }
    }

    /// Derives and publishes replay events for every message in the batch
    /// not already covered by the marker. An unavailable downstream fails
    /// the whole batch; re-processing is idempotent through the marker.
    pub async fn consume_batch(&self, msgs: &[IncomingMessage]) -> Result<()> {
        let mut pending = Vec::new();
        for msg in msgs {
            let tp = msg.metadata.topic_partition();
            if self
                .marker
                .is_below(&tp, &msg.session_id, msg.metadata.offset)
                .await?
            {
                continue;
            }
            pending.push(msg);
        }
        if pending.is_empty() {
            return Ok(());
        }

        let records = pending.iter().map(|msg| derive_record(msg)).collect();
        self.sink.publish(records).await?;

        for msg in pending {
            self.marker
                .add(
                    &msg.metadata.topic_partition(),
                    &msg.session_id,
                    msg.metadata.offset,
                )
                .await?;
        }
        Ok(())
    }
}

/// Condenses one snapshot batch into its replay-event record. Event
/// timestamps come from the items themselves when present, else from the
/// broker timestamp.
fn derive_record(msg: &IncomingMessage) -> ReplayEventRecord {
    let broker_ts = msg.metadata.timestamp_ms.unwrap_or(0);
    let mut first = i64::MAX;
    let mut last = i64::MIN;
    for event in &msg.events {
        if let Some(ts) = event.get("timestamp").and_then(|t| t.as_i64()) {
            first = first.min(ts);
            last = last.max(ts);
        }
    }
    if first == i64::MAX {
        first = broker_ts;
        last = broker_ts;
    }
    ReplayEventRecord {
        team_id: msg.team_id,
        session_id: msg.session_id.clone(),
        distinct_id: msg.distinct_id.clone(),
        window_id: msg.window_id.clone(),
        first_timestamp_ms: first,
        last_timestamp_ms: last,
        event_count: msg.events.len() as u64,
    }
}

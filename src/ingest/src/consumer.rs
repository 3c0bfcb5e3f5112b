// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Kafka-facing shell around the [`Ingester`]: consumer construction,
//! batch gathering, rebalance plumbing, offset commits, and the lag signal.
//!
//! Rebalance callbacks fire on librdkafka's poll path, so they only forward
//! assign/revoke events over a channel; the consumer loop applies them
//! between batches, which serializes them with normal processing and keeps
//! a revoke from interleaving with an in-flight batch of the revoked
//! partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::ingester::{Ingester, OffsetCommitter};
use crate::message::{MessageMetadata, RawMessage, TopicPartition};
use crate::refresher::BackgroundRefresher;

/// Batches taking longer than this to process are logged; processing
/// continues.
const BATCH_SOFT_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive failed fetches before the connection is treated as
/// permanently dropped.
const MAX_FETCH_FAILURES: u32 = 5;

/// A rebalance callback, replayed into the consumer loop.
#[derive(Debug)]
enum RebalanceEvent {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
}

/// Consumer context that forwards rebalances to the loop.
struct IngestConsumerContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for IngestConsumerContext {}

impl ConsumerContext for IngestConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assign(partitions_of(tpl)),
            Rebalance::Revoke(tpl) => RebalanceEvent::Revoke(partitions_of(tpl)),
            Rebalance::Error(e) => {
                // Ingestion continues; the group coordinator will retry.
                error!(error = %e, "rebalance error");
                return;
            }
        };
        // The receiver only disappears at shutdown, when events no longer
        // matter.
        let _ = self.events.send(event);
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

type IngestStreamConsumer = StreamConsumer<IngestConsumerContext>;

/// [`OffsetCommitter`] writing to the consumer group, `enable.auto.commit`
/// off.
pub struct KafkaOffsetCommitter {
    consumer: Arc<IngestStreamConsumer>,
}

#[async_trait]
impl OffsetCommitter for KafkaOffsetCommitter {
    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}

/// Owns the Kafka consumer and drives the [`Ingester`].
pub struct KafkaConsumer {
    consumer: Arc<IngestStreamConsumer>,
    ingester: Ingester,
    rebalance_events: mpsc::UnboundedReceiver<RebalanceEvent>,
    shutdown: CancellationToken,
    batch_size: usize,
    batching_timeout: Duration,
    broker_offsets: BackgroundRefresher<HashMap<TopicPartition, i64>>,
}

impl KafkaConsumer {
    /// Creates the consumer, subscribes to the snapshot topic, and returns
    /// both the wrapper and the committer the ingester should be built
    /// with.
    ///
    /// Construction is two-phase because the committer needs the consumer
    /// handle while the ingester needs the committer: call
    /// [`KafkaConsumer::connect`], build the [`Ingester`] with the returned
    /// committer, then [`ConnectedConsumer::start`].
    pub fn connect(config: &IngestConfig) -> Result<(ConnectedConsumer, Arc<KafkaOffsetCommitter>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer: IngestStreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.consumer_group)
            // Commits are manual, issued only once durability is
            // guaranteed.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("fetch.max.bytes", config.consumption_max_bytes.to_string())
            .set(
                "max.partition.fetch.bytes",
                config.consumption_max_bytes_per_partition.to_string(),
            )
            .set("queued.min.messages", config.kafka_queue_size.to_string())
            .set(
                "fetch.wait.max.ms",
                config.consumption_max_wait.as_millis().to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky")
            .create_with_context(IngestConsumerContext { events: events_tx })?;
        consumer.subscribe(&[config.topic.as_str()])?;
        let consumer = Arc::new(consumer);

        let committer = Arc::new(KafkaOffsetCommitter {
            consumer: Arc::clone(&consumer),
        });
        Ok((
            ConnectedConsumer {
                consumer,
                rebalance_events: events_rx,
                batch_size: config.batch_size,
                batching_timeout: config.batching_timeout,
                refresh_interval: config.refresh_interval,
                topic: config.topic.clone(),
            },
            committer,
        ))
    }
}

/// Intermediate handle produced by [`KafkaConsumer::connect`].
pub struct ConnectedConsumer {
    consumer: Arc<IngestStreamConsumer>,
    rebalance_events: mpsc::UnboundedReceiver<RebalanceEvent>,
    batch_size: usize,
    batching_timeout: Duration,
    refresh_interval: Duration,
    topic: String,
}

impl ConnectedConsumer {
    /// Attaches the ingester and produces the runnable consumer.
    pub fn start(self, ingester: Ingester) -> KafkaConsumer {
        let broker_offsets = {
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            BackgroundRefresher::new("broker-high-offsets", self.refresh_interval, move || {
                let consumer = Arc::clone(&consumer);
                let topic = topic.clone();
                async move {
                    spawn_blocking(move || fetch_high_offsets(&consumer, &topic))
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?
                }
            })
        };
        KafkaConsumer {
            consumer: self.consumer,
            ingester,
            rebalance_events: self.rebalance_events,
            shutdown: CancellationToken::new(),
            batch_size: self.batch_size,
            batching_timeout: self.batching_timeout,
            broker_offsets,
        }
    }
}

/// Reads the broker-side high watermark for every currently assigned
/// partition. Blocking librdkafka calls, run on the blocking pool.
fn fetch_high_offsets(
    consumer: &IngestStreamConsumer,
    topic: &str,
) -> anyhow::Result<HashMap<TopicPartition, i64>> {
    let assignment = consumer.assignment()?;
    let mut offsets = HashMap::new();
    for element in assignment.elements_for_topic(topic) {
        let (_, hi) =
            consumer.fetch_watermarks(topic, element.partition(), Duration::from_secs(5))?;
        offsets.insert(TopicPartition::new(topic, element.partition()), hi);
    }
    Ok(offsets)
}

impl KafkaConsumer {
    /// Token that interrupts [`KafkaConsumer::run`]; hand it to the signal
    /// handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The main loop: gather a bounded batch, process it, apply any
    /// rebalance events, repeat. Returns once the shutdown token fires and
    /// the final flush completes.
    pub async fn run(mut self) -> Result<()> {
        info!("starting consumption");
        let mut fatal = None;
        let mut fetch_failures = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.apply_rebalances().await;

            let batch = match self.gather_batch().await {
                Ok(batch) => {
                    fetch_failures = 0;
                    batch
                }
                Err(e) => {
                    fetch_failures += 1;
                    if fetch_failures >= MAX_FETCH_FAILURES {
                        // Give up as permanently disconnected, but still
                        // run the stop path below so buffered sessions
                        // flush before we exit.
                        error!(error = %e, "consumer fetch failed fatally");
                        fatal = Some(e);
                        break;
                    }
                    warn!(error = %e, attempt = fetch_failures, "fetch failed; retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            if !batch.is_empty() {
                let started = Instant::now();
                if let Err(e) = self.ingester.process_batch(batch).await {
                    // The batch stays uncommitted wherever it failed; the
                    // high-water marks make the re-delivery idempotent.
                    error!(error = %e, "batch processing failed; messages will re-deliver");
                }
                let elapsed = started.elapsed();
                if elapsed > BATCH_SOFT_TIMEOUT {
                    warn!(elapsed_s = elapsed.as_secs(), "batch processing exceeded soft timeout");
                }
            }
            self.update_lag().await;
        }

        info!("stopping consumption");
        // Halt fetching before tearing down session state, then treat every
        // owned partition as revoked.
        self.consumer.unsubscribe();
        self.ingester.stop().await;
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_rebalances(&mut self) {
        while let Ok(event) = self.rebalance_events.try_recv() {
            match event {
                RebalanceEvent::Assign(partitions) => {
                    self.ingester.handle_assign(partitions).await;
                }
                RebalanceEvent::Revoke(partitions) => {
                    self.ingester.handle_revoke(partitions).await;
                }
            }
        }
    }

    /// Collects up to `batch_size` messages, waiting at most
    /// `batching_timeout` past the first arrival. A rebalance or shutdown
    /// ends the batch early so the loop can react.
    async fn gather_batch(&mut self) -> Result<Vec<RawMessage>> {
        let mut batch = Vec::new();
        let deadline = tokio::time::sleep(self.batching_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut deadline => break,
                result = self.consumer.recv() => {
                    match result {
                        Ok(msg) => {
                            batch.push(to_raw_message(&msg));
                            if batch.len() >= self.batch_size {
                                break;
                            }
                        }
                        Err(e) => {
                            if batch.is_empty() {
                                return Err(IngestError::Kafka(e));
                            }
                            // Process what we have; the error resurfaces on
                            // the next fetch if it persists.
                            warn!(error = %e, "fetch error mid-batch");
                            break;
                        }
                    }
                }
            }
        }
        Ok(batch)
    }

    async fn update_lag(&self) {
        let offsets = match self.broker_offsets.get().await {
            Ok(offsets) => offsets,
            Err(e) => {
                warn!(error = %e, "broker high offsets unavailable");
                return;
            }
        };
        for tp in self.ingester.assigned_partitions() {
            let Some(&hi) = offsets.get(&tp) else { continue };
            let consumed = self.ingester.last_offset(&tp).unwrap_or(-1);
            self.ingester
                .metrics()
                .lag_messages
                .with_label_values(&[&tp.partition.to_string()])
                .set((hi - (consumed + 1)).max(0));
        }
    }
}

fn to_raw_message(msg: &rdkafka::message::BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        metadata: MessageMetadata {
            topic: msg.topic().to_owned(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp_ms: msg.timestamp().to_millis(),
        },
        payload: msg.payload().map(Bytes::copy_from_slice),
    }
}

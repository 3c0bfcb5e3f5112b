// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! rv-ingestd: the session-recording blob ingester server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing;
use clap::Parser;
use prometheus::{Encoder, Registry};
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use rv_ingest::blob::{Blob, S3Blob};
use rv_ingest::config::IngestConfig;
use rv_ingest::consumer::KafkaConsumer;
use rv_ingest::ingester::{Ingester, OffsetCommitter};
use rv_ingest::metrics::IngestMetrics;
use rv_ingest::replay_events::{KafkaReplayEventSink, ReplayEventSink};
use rv_ingest::store::{RedisStore, SharedStore};
use rv_ingest::teams::TeamResolver;

/// Ingests session-recording snapshot batches into object storage.
#[derive(Parser, Debug)]
#[clap(name = "rv-ingestd")]
struct Args {
    // === Kafka options. ===
    /// Kafka brokers to bootstrap from.
    #[clap(long, env = "KAFKA_BROKERS", value_name = "HOST:PORT,...", default_value = "localhost:9092")]
    kafka_brokers: String,
    /// Topic carrying snapshot batches.
    #[clap(
        long,
        env = "SESSION_RECORDING_KAFKA_TOPIC",
        default_value = "session_recording_snapshot_item_events"
    )]
    topic: String,
    /// Consumer group to join.
    #[clap(
        long,
        env = "SESSION_RECORDING_CONSUMER_GROUP",
        default_value = "session-recordings-blob"
    )]
    consumer_group: String,
    /// Total fetch size cap, in bytes.
    #[clap(long, env = "KAFKA_CONSUMPTION_MAX_BYTES", default_value = "104857600")]
    consumption_max_bytes: usize,
    /// Per-partition fetch size cap, in bytes.
    #[clap(
        long,
        env = "KAFKA_CONSUMPTION_MAX_BYTES_PER_PARTITION",
        default_value = "20971520"
    )]
    consumption_max_bytes_per_partition: usize,
    /// Minimum messages the client buffers per partition.
    #[clap(long, env = "SESSION_RECORDING_KAFKA_QUEUE_SIZE", default_value = "1500")]
    kafka_queue_size: usize,
    /// Fetch long-poll timeout, in milliseconds.
    #[clap(long, env = "KAFKA_CONSUMPTION_MAX_WAIT_MS", default_value = "50")]
    consumption_max_wait_ms: u64,
    /// Upper bound on messages per processing batch.
    #[clap(long, env = "SESSION_RECORDING_KAFKA_BATCH_SIZE", default_value = "500")]
    batch_size: usize,
    /// How long to let a batch fill before processing, in milliseconds.
    #[clap(long, env = "KAFKA_CONSUMPTION_BATCHING_TIMEOUT_MS", default_value = "750")]
    batching_timeout_ms: u64,

    // === Session flush options. ===
    /// Flush a session once its buffer exceeds this size, in kilobytes.
    #[clap(long, env = "SESSION_RECORDING_MAX_BUFFER_SIZE_KB", default_value = "10240")]
    max_buffer_size_kb: u64,
    /// Flush a session once its buffer is older than this, in seconds.
    #[clap(long, env = "SESSION_RECORDING_MAX_BUFFER_AGE_SECONDS", default_value = "600")]
    max_buffer_age_seconds: u64,

    // === Local state. ===
    /// Root directory for session buffer files. Purged on startup.
    #[clap(
        long,
        env = "SESSION_RECORDING_LOCAL_DIRECTORY",
        value_name = "PATH",
        default_value = "/tmp/session-recording-buffers"
    )]
    local_directory: PathBuf,

    // === Shared store options. ===
    /// Redis connection URL.
    #[clap(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    /// Key namespace in the shared store.
    #[clap(long, env = "SESSION_RECORDING_REDIS_PREFIX", default_value = "@session/replay")]
    redis_prefix: String,
    /// Enables partition leases and revoke-time flushing.
    #[clap(long, env = "SESSION_RECORDING_PARTITION_REVOKE_OPTIMIZATION")]
    partition_revoke_optimization: bool,

    // === Object store options. ===
    /// Bucket receiving session blobs.
    #[clap(long, env = "OBJECT_STORAGE_BUCKET", default_value = "session-recordings")]
    bucket: String,
    /// Key prefix inside the bucket.
    #[clap(
        long,
        env = "OBJECT_STORAGE_SESSION_RECORDING_FOLDER",
        default_value = "session_recordings"
    )]
    object_prefix: String,

    // === Downstream options. ===
    /// Topic receiving derived replay-event records.
    #[clap(
        long,
        env = "SESSION_RECORDING_REPLAY_EVENTS_TOPIC",
        default_value = "clickhouse_session_replay_events"
    )]
    replay_events_topic: String,

    // === Team resolution options. ===
    /// Path to the JSON token-to-team table.
    #[clap(long, env = "TEAM_TOKEN_MAP_PATH", value_name = "PATH")]
    team_token_map_path: Option<PathBuf>,
    /// Refresh interval for the team table and broker offsets, in seconds.
    #[clap(long, env = "SESSION_RECORDING_REFRESH_INTERVAL_SECONDS", default_value = "300")]
    refresh_interval_seconds: u64,

    // === Observability options. ===
    /// Address of the internal HTTP server (metrics, liveness).
    #[clap(
        long,
        env = "INTERNAL_HTTP_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "0.0.0.0:6791"
    )]
    internal_http_listen_addr: SocketAddr,
    /// Emit logs as JSON instead of text.
    #[clap(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            kafka_brokers: self.kafka_brokers.clone(),
            topic: self.topic.clone(),
            consumer_group: self.consumer_group.clone(),
            consumption_max_bytes: self.consumption_max_bytes,
            consumption_max_bytes_per_partition: self.consumption_max_bytes_per_partition,
            kafka_queue_size: self.kafka_queue_size,
            consumption_max_wait: Duration::from_millis(self.consumption_max_wait_ms),
            batch_size: self.batch_size,
            batching_timeout: Duration::from_millis(self.batching_timeout_ms),
            session_max_buffer_bytes: self.max_buffer_size_kb * 1024,
            session_max_buffer_age: Duration::from_secs(self.max_buffer_age_seconds),
            local_directory: self.local_directory.clone(),
            redis_prefix: self.redis_prefix.clone(),
            partition_revoke_optimization: self.partition_revoke_optimization,
            bucket: self.bucket.clone(),
            object_prefix: self.object_prefix.clone(),
            replay_events_topic: self.replay_events_topic.clone(),
            team_token_map_path: self.team_token_map_path.clone(),
            refresh_interval: Duration::from_secs(self.refresh_interval_seconds),
            ..IngestConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(err) = run(args).await {
        error!("rv-ingestd: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let config = args.ingest_config();
    let registry = Registry::new();
    let metrics = IngestMetrics::register(&registry);

    let store = Arc::new(
        RedisStore::connect(&args.redis_url)
            .await
            .context("connecting to the shared store")?,
    ) as Arc<dyn SharedStore>;
    let blob = Arc::new(S3Blob::open(config.bucket.clone()).await) as Arc<dyn Blob>;

    let producer: rdkafka::producer::FutureProducer = rdkafka::ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("message.timeout.ms", "30000")
        .create()
        .context("creating the replay-events producer")?;
    let replay_sink = Arc::new(KafkaReplayEventSink::new(
        producer,
        config.replay_events_topic.clone(),
    )) as Arc<dyn ReplayEventSink>;

    let teams = match &config.team_token_map_path {
        Some(path) => TeamResolver::from_file(path.clone(), config.refresh_interval),
        None => TeamResolver::fixed(Default::default()),
    };

    let (connected, committer) =
        KafkaConsumer::connect(&config).context("creating the consumer")?;
    let ingester = Ingester::new(
        config,
        store,
        blob,
        committer as Arc<dyn OffsetCommitter>,
        replay_sink,
        teams,
        metrics,
    )
    .context("initializing the ingester")?;
    let consumer = connected.start(ingester);

    let shutdown = consumer.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    tokio::spawn({
        let addr = args.internal_http_listen_addr;
        info!("serving internal HTTP server on {}", addr);
        let app = axum::Router::new()
            .route("/api/livez", routing::get(|| async { "ok" }))
            .route(
                "/metrics",
                routing::get(move || {
                    let registry = registry.clone();
                    async move { render_metrics(&registry) }
                }),
            );
        async move {
            if let Err(e) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
                error!(error = %e, "internal HTTP server failed");
            }
        }
    });

    consumer.run().await?;
    info!("rv-ingestd stopped cleanly");
    Ok(())
}

fn render_metrics(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

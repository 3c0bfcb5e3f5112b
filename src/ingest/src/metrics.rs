// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Telemetry for the blob ingester.

use prometheus::{
    histogram_opts, register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Histogram,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

/// Every instrument the ingester exports. Cloning shares the underlying
/// collectors.
#[derive(Clone)]
pub struct IngestMetrics {
    /// Messages received, by partition.
    pub messages_received: IntCounterVec,
    /// Events dropped before ingestion, by cause.
    pub events_dropped: IntCounterVec,
    /// Sessions currently owned by this worker.
    pub sessions_handled: IntGauge,
    /// Sessions flushed and destroyed by the last partition revoke.
    pub sessions_revoked: IntGauge,
    /// Sessions that pushed to the realtime tail in the last batch.
    pub sessions_realtime: IntGauge,
    /// Broker high offset minus last consumed offset, by partition. The
    /// primary autoscaling signal.
    pub lag_messages: IntGaugeVec,
    /// Milliseconds between now and the newest consumed broker timestamp,
    /// by partition.
    pub lag_millis: IntGaugeVec,
    /// Last committed offset, by partition.
    pub last_committed_offset: IntGaugeVec,
    /// Commit attempts that failed, by partition.
    pub commit_failures: IntCounterVec,
    /// Messages per processed batch.
    pub batch_size: Histogram,
    /// Wall-clock seconds per session flush.
    pub flush_duration_seconds: Histogram,
    /// Compressed bytes uploaded per flush.
    pub flushed_bytes: Histogram,
    /// Completed flushes, by reason.
    pub flushes: IntCounterVec,
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> Self {
        IngestMetrics {
            messages_received: register_int_counter_vec_with_registry!(
                "recording_ingester_messages_received_total",
                "Messages received from the snapshot topic.",
                &["partition"],
                registry
            )
            .unwrap(),
            events_dropped: register_int_counter_vec_with_registry!(
                "recording_ingester_events_dropped_total",
                "Messages dropped before ingestion.",
                &["cause"],
                registry
            )
            .unwrap(),
            sessions_handled: register_int_gauge_with_registry!(
                "recording_ingester_sessions_handled",
                "Sessions currently owned by this worker.",
                registry
            )
            .unwrap(),
            sessions_revoked: register_int_gauge_with_registry!(
                "recording_ingester_sessions_revoked",
                "Sessions torn down by the most recent partition revoke.",
                registry
            )
            .unwrap(),
            sessions_realtime: register_int_gauge_with_registry!(
                "recording_ingester_sessions_realtime",
                "Sessions mirrored to the realtime tail in the last batch.",
                registry
            )
            .unwrap(),
            lag_messages: register_int_gauge_vec_with_registry!(
                "recording_ingester_lag_messages",
                "Broker high offset minus last consumed offset.",
                &["partition"],
                registry
            )
            .unwrap(),
            lag_millis: register_int_gauge_vec_with_registry!(
                "recording_ingester_lag_milliseconds",
                "Age of the newest consumed broker timestamp.",
                &["partition"],
                registry
            )
            .unwrap(),
            last_committed_offset: register_int_gauge_vec_with_registry!(
                "recording_ingester_last_committed_offset",
                "Last offset committed to the consumer group.",
                &["partition"],
                registry
            )
            .unwrap(),
            commit_failures: register_int_counter_vec_with_registry!(
                "recording_ingester_commit_failures_total",
                "Offset commit attempts that failed.",
                &["partition"],
                registry
            )
            .unwrap(),
            batch_size: register_histogram_with_registry!(
                histogram_opts!(
                    "recording_ingester_batch_size",
                    "Messages per processed batch.",
                    prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()
                ),
                registry
            )
            .unwrap(),
            flush_duration_seconds: register_histogram_with_registry!(
                histogram_opts!(
                    "recording_ingester_flush_duration_seconds",
                    "Wall-clock time per session flush.",
                    prometheus::exponential_buckets(0.005, 2.0, 12).unwrap()
                ),
                registry
            )
            .unwrap(),
            flushed_bytes: register_histogram_with_registry!(
                histogram_opts!(
                    "recording_ingester_flushed_bytes",
                    "Compressed bytes uploaded per flush.",
                    prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap()
                ),
                registry
            )
            .unwrap(),
            flushes: register_int_counter_vec_with_registry!(
                "recording_ingester_flushes_total",
                "Completed session flushes.",
                &["reason"],
                registry
            )
            .unwrap(),
        }
    }

    /// A registry-of-convenience for tests.
    pub fn for_tests() -> Self {
        IngestMetrics::register(&Registry::new())
    }
}

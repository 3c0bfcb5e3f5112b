// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A streaming session-recording blob ingester.
//!
//! The ingester consumes session-replay snapshot batches from a partitioned
//! topic, groups them by `(team, session)` into temp-file-backed buffers,
//! periodically flushes compressed buffers to object storage, and advances
//! committed consumer offsets only once durability is guaranteed. A
//! secondary path mirrors the tail of every active session into the shared
//! cache so that live viewers can stream a recording in progress.
//!
//! Delivery is at-least-once; downstream idempotence comes from
//! per-partition high-water marks shared across workers.

pub mod blob;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod highwater;
pub mod ingester;
pub mod locker;
pub mod message;
pub mod metrics;
pub mod realtime;
pub mod refresher;
pub mod replay_events;
pub mod session;
pub mod store;
pub mod teams;

pub use crate::config::IngestConfig;
pub use crate::consumer::KafkaConsumer;
pub use crate::error::IngestError;
pub use crate::ingester::Ingester;

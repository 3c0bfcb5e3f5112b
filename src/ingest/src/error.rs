// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error types for the ingester.

use crate::message::SessionKey;

/// The fault domains of the ingester.
///
/// Per-message problems are not errors (see
/// [`DropCause`](crate::message::DropCause)); these variants cover the
/// transient and fatal failures of the surrounding machinery.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("shared store: {0}")]
    Store(String),

    #[error("object store: {0}")]
    Blob(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("session {session} failed to consume: {reason}")]
    SessionConsume { session: SessionKey, reason: String },

    #[error("replay events publish failed: {0}")]
    ReplayPublish(String),
}

impl From<redis::RedisError> for IngestError {
    fn from(e: redis::RedisError) -> Self {
        IngestError::Store(e.to_string())
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

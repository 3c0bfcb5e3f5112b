// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The object-store seam: durable, write-only storage for flushed session
//! blobs.
//!
//! Keys are derived deterministically from the session's identity and the
//! offset range they cover, which makes re-uploads after a retry or a
//! replayed batch naturally idempotent.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::read::GzEncoder;
use flate2::Compression;

use crate::error::{IngestError, Result};

/// Metadata attached to every uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub team_id: i64,
    pub session_id: String,
    pub lowest_offset: i64,
    pub highest_offset: i64,
    pub event_count: u64,
}

/// An abstraction for writing blobs to durable object storage.
#[async_trait]
pub trait Blob: Send + Sync {
    /// Writes `value` under `key`. Keys are never overwritten with
    /// different contents: the deterministic key derivation means a repeat
    /// write carries an identical body.
    async fn set(&self, key: &str, value: Vec<u8>, metadata: &BlobMetadata) -> Result<()>;
}

/// Derives the object key for one flushed buffer.
pub fn object_key(
    prefix: &str,
    team_id: i64,
    session_id: &str,
    partition: i32,
    lowest_offset: i64,
    highest_offset: i64,
    created_at_ms: u64,
) -> String {
    format!(
        "{}/team_id={}/session_id={}/partition={}/{}-{}-{}.jsonl.gz",
        prefix, team_id, session_id, partition, lowest_offset, highest_offset, created_at_ms
    )
}

/// Reads the finalized buffer file and gzip-compresses it into the object
/// body.
pub fn compress_file(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    let mut body = Vec::new();
    encoder.read_to_end(&mut body)?;
    Ok(body)
}

/// [`Blob`] backed by S3.
pub struct S3Blob {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Blob {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        S3Blob { client, bucket }
    }

    /// Connects using the ambient AWS configuration (environment, profile,
    /// instance metadata).
    pub async fn open(bucket: String) -> Self {
        let config = aws_config::load_from_env().await;
        S3Blob::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

#[async_trait]
impl Blob for S3Blob {
    async fn set(&self, key: &str, value: Vec<u8>, metadata: &BlobMetadata) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/jsonl")
            .content_encoding("gzip")
            .metadata("team_id", metadata.team_id.to_string())
            .metadata("session_id", &metadata.session_id)
            .metadata("lowest_offset", metadata.lowest_offset.to_string())
            .metadata("highest_offset", metadata.highest_offset.to_string())
            .metadata("event_count", metadata.event_count.to_string())
            .body(aws_sdk_s3::primitives::ByteStream::from(value))
            .send()
            .await
            .map_err(|e| IngestError::Blob(e.to_string()))?;
        Ok(())
    }
}

/// In-memory [`Blob`] for tests.
#[derive(Default)]
pub struct MemBlob {
    objects: Mutex<BTreeMap<String, (Vec<u8>, BlobMetadata)>>,
    fail_next: Mutex<bool>,
}

impl MemBlob {
    pub fn new() -> Self {
        MemBlob::default()
    }

    /// Test helper: keys written so far, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Test helper: the stored body and metadata for `key`.
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, BlobMetadata)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test helper: makes the next `set` fail with a transient error.
    pub fn fail_next_set(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl Blob for MemBlob {
    async fn set(&self, key: &str, value: Vec<u8>, metadata: &BlobMetadata) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(IngestError::Blob("injected failure".into()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, metadata.clone()));
        Ok(())
    }
}

/// Decompresses an object body back into lines, for tests that assert on
/// flushed contents.
pub fn decompress(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

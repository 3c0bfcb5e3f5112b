// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-session append buffer: newline-delimited serialized events in a
//! temp file, with in-memory offset, timestamp, and size bookkeeping.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::Result;

/// Snapshot of a buffer taken by [`SessionBuffer::finalize`], everything a
/// flush needs to build the object and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBuffer {
    pub path: PathBuf,
    pub lowest_offset: i64,
    pub highest_offset: i64,
    pub oldest_timestamp_ms: i64,
    pub newest_timestamp_ms: i64,
    pub event_count: u64,
    pub byte_size: u64,
    pub created_at_ms: u64,
}

/// Append-only storage for one session between flushes.
///
/// Appends go through a buffered writer into a uniquely named temp file;
/// the metadata needed for flush decisions (offsets, broker timestamps,
/// size, age) stays in memory. The realtime tail, a bounded ring of the
/// most recent serialized events, survives resets so a viewer joining
/// mid-session still has context.
pub struct SessionBuffer {
    dir: PathBuf,
    team_id: i64,
    session_id: String,
    path: PathBuf,
    writer: BufWriter<File>,
    lowest_offset: Option<i64>,
    highest_offset: Option<i64>,
    oldest_timestamp_ms: Option<i64>,
    newest_timestamp_ms: Option<i64>,
    event_count: u64,
    byte_size: u64,
    created_at: SystemTime,
    realtime_tail: VecDeque<Vec<u8>>,
    tail_capacity: usize,
}

impl SessionBuffer {
    pub fn new(dir: &Path, team_id: i64, session_id: &str, tail_capacity: usize) -> Result<Self> {
        let path = buffer_path(dir, team_id, session_id);
        let writer = BufWriter::new(File::create(&path)?);
        Ok(SessionBuffer {
            dir: dir.to_owned(),
            team_id,
            session_id: session_id.to_owned(),
            path,
            writer,
            lowest_offset: None,
            highest_offset: None,
            oldest_timestamp_ms: None,
            newest_timestamp_ms: None,
            event_count: 0,
            byte_size: 0,
            created_at: SystemTime::now(),
            realtime_tail: VecDeque::with_capacity(tail_capacity),
            tail_capacity,
        })
    }

    /// Appends one serialized event, attributing it to the given source
    /// offset and broker timestamp.
    pub fn append(&mut self, serialized: &[u8], offset: i64, timestamp_ms: i64) -> Result<()> {
        self.writer.write_all(serialized)?;
        self.writer.write_all(b"\n")?;

        self.lowest_offset = Some(self.lowest_offset.map_or(offset, |o| o.min(offset)));
        self.highest_offset = Some(self.highest_offset.map_or(offset, |o| o.max(offset)));
        self.oldest_timestamp_ms =
            Some(self.oldest_timestamp_ms.map_or(timestamp_ms, |t| t.min(timestamp_ms)));
        self.newest_timestamp_ms =
            Some(self.newest_timestamp_ms.map_or(timestamp_ms, |t| t.max(timestamp_ms)));
        self.event_count += 1;
        self.byte_size += serialized.len() as u64 + 1;

        if self.tail_capacity > 0 {
            if self.realtime_tail.len() == self.tail_capacity {
                self.realtime_tail.pop_front();
            }
            self.realtime_tail.push_back(serialized.to_owned());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn size(&self) -> u64 {
        self.byte_size
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn lowest_offset(&self) -> Option<i64> {
        self.lowest_offset
    }

    pub fn highest_offset(&self) -> Option<i64> {
        self.highest_offset
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.oldest_timestamp_ms
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.newest_timestamp_ms
    }

    pub fn realtime_tail(&self) -> impl Iterator<Item = &[u8]> {
        self.realtime_tail.iter().map(|e| e.as_slice())
    }

    /// Flushes OS buffers and returns the file path plus the metadata
    /// snapshot for upload. The buffer itself stays intact until [`reset`]:
    /// a failed upload must leave everything in place for the retry.
    ///
    /// [`reset`]: SessionBuffer::reset
    pub fn finalize(&mut self) -> Result<FinalizedBuffer> {
        assert!(!self.is_empty(), "finalize requires a non-empty buffer");
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(FinalizedBuffer {
            path: self.path.clone(),
            lowest_offset: self.lowest_offset.expect("non-empty buffer has offsets"),
            highest_offset: self.highest_offset.expect("non-empty buffer has offsets"),
            oldest_timestamp_ms: self
                .oldest_timestamp_ms
                .expect("non-empty buffer has timestamps"),
            newest_timestamp_ms: self
                .newest_timestamp_ms
                .expect("non-empty buffer has timestamps"),
            event_count: self.event_count,
            byte_size: self.byte_size,
            created_at_ms: system_time_ms(self.created_at),
        })
    }

    /// Starts a fresh buffer after a successful flush: the old file is
    /// unlinked, counters reset, the realtime tail kept.
    pub fn reset(&mut self) -> Result<()> {
        let _ = fs::remove_file(&self.path);
        self.path = buffer_path(&self.dir, self.team_id, &self.session_id);
        self.writer = BufWriter::new(File::create(&self.path)?);
        self.lowest_offset = None;
        self.highest_offset = None;
        self.oldest_timestamp_ms = None;
        self.newest_timestamp_ms = None;
        self.event_count = 0;
        self.byte_size = 0;
        self.created_at = SystemTime::now();
        Ok(())
    }
}

impl Drop for SessionBuffer {
    fn drop(&mut self) {
        // The containing directory is purged on startup regardless; this
        // just keeps long-running workers tidy.
        let _ = fs::remove_file(&self.path);
    }
}

fn buffer_path(dir: &Path, team_id: i64, session_id: &str) -> PathBuf {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.{}.{}.jsonl", team_id, sanitized, Uuid::new_v4()))
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

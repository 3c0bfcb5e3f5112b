// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The inbound message model: raw broker records, the snapshot-batch
//! envelope, and the parsing that turns one into the other.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

/// A `(topic, partition)` pair, the unit of assignment, commit, and
/// high-water-mark scoping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new<T: Into<String>>(topic: T, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// The process-wide identity of a recording session.
///
/// A session is pinned to one partition for its lifetime, but the partition
/// is deliberately not part of the key: a key maps to at most one live
/// `SessionManager` at a time, whichever partition that manager is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub team_id: i64,
    pub session_id: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.team_id, self.session_id)
    }
}

/// Broker-side coordinates of one consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
}

impl MessageMetadata {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// One record as it came off the broker, before any interpretation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub metadata: MessageMetadata,
    pub payload: Option<Bytes>,
}

/// One successfully parsed snapshot batch.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub metadata: MessageMetadata,
    pub team_id: i64,
    pub distinct_id: String,
    pub session_id: String,
    pub window_id: Option<String>,
    pub events: Vec<serde_json::Value>,
}

impl IncomingMessage {
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            team_id: self.team_id,
            session_id: self.session_id.clone(),
        }
    }
}

/// Why a record was dropped instead of ingested.
///
/// Drops are data, not errors: each cause increments a labelled counter and
/// processing continues with the next record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    EmptyPayload,
    MissingTimestamp,
    InvalidJson,
    MissingTeam,
    UnknownTeam,
    NotSnapshotBatch,
    MissingSessionId,
    EmptySnapshotItems,
    HighWaterMark,
    PartitionMismatch,
}

impl DropCause {
    /// The label under which this cause is counted.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropCause::EmptyPayload => "empty_payload",
            DropCause::MissingTimestamp => "missing_timestamp",
            DropCause::InvalidJson => "invalid_json",
            DropCause::MissingTeam => "missing_team",
            DropCause::UnknownTeam => "unknown_team",
            DropCause::NotSnapshotBatch => "not_snapshot_batch",
            DropCause::MissingSessionId => "missing_session_id",
            DropCause::EmptySnapshotItems => "empty_snapshot_items",
            DropCause::HighWaterMark => "high_water_mark",
            DropCause::PartitionMismatch => "partition_mismatch",
        }
    }
}

/// The outer wire envelope. Producers send either a resolved `team_id` or an
/// opaque `token` that the team table maps to one.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub token: Option<String>,
    pub distinct_id: String,
    /// The inner pipeline event, double-encoded as a JSON string.
    pub data: String,
}

#[derive(Debug, Deserialize)]
struct PipelineEvent {
    event: String,
    properties: SnapshotProperties,
}

#[derive(Debug, Deserialize)]
struct SnapshotProperties {
    #[serde(rename = "$session_id", default)]
    session_id: Option<String>,
    #[serde(rename = "$window_id", default)]
    window_id: Option<String>,
    #[serde(rename = "$snapshot_items", default)]
    snapshot_items: Vec<serde_json::Value>,
}

pub const SNAPSHOT_EVENT_NAME: &str = "$snapshot_items";

/// Parses a raw record into an [`IncomingMessage`], resolving the team
/// through the provided lookup. Every deviation from the expected shape maps
/// to the [`DropCause`] it is counted under.
pub fn parse_message<F>(raw: &RawMessage, resolve_token: F) -> Result<IncomingMessage, DropCause>
where
    F: Fn(&str) -> Option<i64>,
{
    let payload = match &raw.payload {
        Some(payload) if !payload.is_empty() => payload,
        _ => return Err(DropCause::EmptyPayload),
    };
    if raw.metadata.timestamp_ms.is_none() {
        return Err(DropCause::MissingTimestamp);
    }

    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|_| DropCause::InvalidJson)?;

    let team_id = match (envelope.team_id, envelope.token.as_deref()) {
        (Some(team_id), _) => team_id,
        (None, Some(token)) => resolve_token(token).ok_or(DropCause::UnknownTeam)?,
        (None, None) => return Err(DropCause::MissingTeam),
    };

    let event: PipelineEvent =
        serde_json::from_str(&envelope.data).map_err(|_| DropCause::InvalidJson)?;
    if event.event != SNAPSHOT_EVENT_NAME {
        return Err(DropCause::NotSnapshotBatch);
    }

    let session_id = match event.properties.session_id {
        Some(session_id) if !session_id.is_empty() => session_id,
        _ => return Err(DropCause::MissingSessionId),
    };
    if event.properties.snapshot_items.is_empty() {
        return Err(DropCause::EmptySnapshotItems);
    }

    Ok(IncomingMessage {
        metadata: raw.metadata.clone(),
        team_id,
        distinct_id: envelope.distinct_id,
        session_id,
        window_id: event.properties.window_id,
        events: event.properties.snapshot_items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload: &str) -> RawMessage {
        RawMessage {
            metadata: MessageMetadata {
                topic: "snap".into(),
                partition: 0,
                offset: 1,
                timestamp_ms: Some(1_000),
            },
            payload: Some(Bytes::copy_from_slice(payload.as_bytes())),
        }
    }

    fn snapshot_data(session_id: &str) -> String {
        serde_json::json!({
            "event": "$snapshot_items",
            "properties": {
                "$session_id": session_id,
                "$window_id": "w1",
                "$snapshot_items": [{"type": 3}, {"type": 2}],
            },
        })
        .to_string()
    }

    #[test]
    fn parses_team_id_envelope() {
        let payload = serde_json::json!({
            "team_id": 7,
            "distinct_id": "d",
            "data": snapshot_data("a"),
        })
        .to_string();
        let msg = parse_message(&raw(&payload), |_| None).unwrap();
        assert_eq!(msg.team_id, 7);
        assert_eq!(msg.session_id, "a");
        assert_eq!(msg.window_id.as_deref(), Some("w1"));
        assert_eq!(msg.events.len(), 2);
    }

    #[test]
    fn resolves_token_through_lookup() {
        let payload = serde_json::json!({
            "token": "phc_abc",
            "distinct_id": "d",
            "data": snapshot_data("a"),
        })
        .to_string();
        let msg =
            parse_message(&raw(&payload), |t| (t == "phc_abc").then_some(42)).unwrap();
        assert_eq!(msg.team_id, 42);

        let err = parse_message(&raw(&payload), |_| None).unwrap_err();
        assert_eq!(err, DropCause::UnknownTeam);
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert_eq!(
            parse_message(&raw("not json"), |_| None).unwrap_err(),
            DropCause::InvalidJson
        );

        let no_team = serde_json::json!({
            "distinct_id": "d",
            "data": snapshot_data("a"),
        })
        .to_string();
        assert_eq!(
            parse_message(&raw(&no_team), |_| None).unwrap_err(),
            DropCause::MissingTeam
        );

        let wrong_event = serde_json::json!({
            "team_id": 1,
            "distinct_id": "d",
            "data": serde_json::json!({
                "event": "$pageview",
                "properties": {},
            })
            .to_string(),
        })
        .to_string();
        assert_eq!(
            parse_message(&raw(&wrong_event), |_| None).unwrap_err(),
            DropCause::NotSnapshotBatch
        );
    }

    #[test]
    fn rejects_missing_session_and_empty_items() {
        let no_session = serde_json::json!({
            "team_id": 1,
            "distinct_id": "d",
            "data": serde_json::json!({
                "event": "$snapshot_items",
                "properties": {"$snapshot_items": [{"type": 3}]},
            })
            .to_string(),
        })
        .to_string();
        assert_eq!(
            parse_message(&raw(&no_session), |_| None).unwrap_err(),
            DropCause::MissingSessionId
        );

        let empty_items = serde_json::json!({
            "team_id": 1,
            "distinct_id": "d",
            "data": serde_json::json!({
                "event": "$snapshot_items",
                "properties": {"$session_id": "a", "$snapshot_items": []},
            })
            .to_string(),
        })
        .to_string();
        assert_eq!(
            parse_message(&raw(&empty_items), |_| None).unwrap_err(),
            DropCause::EmptySnapshotItems
        );
    }

    #[test]
    fn rejects_missing_payload_and_timestamp() {
        let mut msg = raw("{}");
        msg.payload = None;
        assert_eq!(
            parse_message(&msg, |_| None).unwrap_err(),
            DropCause::EmptyPayload
        );

        let payload = serde_json::json!({
            "team_id": 1,
            "distinct_id": "d",
            "data": snapshot_data("a"),
        })
        .to_string();
        let mut msg = raw(&payload);
        msg.metadata.timestamp_ms = None;
        assert_eq!(
            parse_message(&msg, |_| None).unwrap_err(),
            DropCause::MissingTimestamp
        );
    }
}

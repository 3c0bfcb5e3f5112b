// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The realtime tail: the most recent fragments of each live session,
//! mirrored into the shared store for viewers streaming a recording in
//! progress.
//!
//! The tail is an accelerant, not a source of truth. Writes are
//! fire-and-forget with a short timeout, lists are bounded, and the TTL
//! reaps a session's tail once it goes quiet; nothing here may hold up
//! ingestion.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::store::SharedStore;

/// Announcement published on the subscription channel whenever a live
/// session receives data.
#[derive(Debug, Serialize)]
struct SessionActivity<'a> {
    team_id: i64,
    session_id: &'a str,
    event_count: usize,
}

pub struct RealtimeCache {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    max_entries: usize,
    ttl: Duration,
    write_timeout: Duration,
}

impl RealtimeCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        key_prefix: String,
        max_entries: usize,
        ttl: Duration,
    ) -> Self {
        RealtimeCache {
            store,
            key_prefix,
            max_entries,
            ttl,
            write_timeout: Duration::from_secs(2),
        }
    }

    fn session_key(&self, team_id: i64, session_id: &str) -> String {
        format!(
            "{}/snapshots/team-{}/session-{}",
            self.key_prefix, team_id, session_id
        )
    }

    fn subscription_channel(&self) -> String {
        format!("{}/realtime-subscriptions", self.key_prefix)
    }

    /// Appends serialized fragments to the session's bounded list,
    /// refreshing its TTL, and announces the activity. Failures and
    /// timeouts are logged and swallowed.
    pub async fn push(&self, team_id: i64, session_id: &str, fragments: Vec<Vec<u8>>) {
        if fragments.is_empty() {
            return;
        }
        let event_count = fragments.len();
        let key = self.session_key(team_id, session_id);
        let append = self
            .store
            .list_append(&key, fragments, self.max_entries, self.ttl);
        match tokio::time::timeout(self.write_timeout, append).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(team_id, session_id, error = %e, "realtime tail write failed");
                return;
            }
            Err(_) => {
                warn!(team_id, session_id, "realtime tail write timed out");
                return;
            }
        }

        let activity = SessionActivity {
            team_id,
            session_id,
            event_count,
        };
        let payload = match serde_json::to_vec(&activity) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(team_id, session_id, error = %e, "failed to serialize session activity");
                return;
            }
        };
        let channel = self.subscription_channel();
        let publish = self.store.publish(&channel, payload);
        match tokio::time::timeout(self.write_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(team_id, session_id, error = %e, "realtime activity publish failed");
            }
            Err(_) => {
                warn!(team_id, session_id, "realtime activity publish timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn cache(store: &Arc<MemStore>, max_entries: usize) -> RealtimeCache {
        RealtimeCache::new(
            Arc::clone(store) as Arc<dyn SharedStore>,
            "t".into(),
            max_entries,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn push_appends_and_announces() {
        let store = Arc::new(MemStore::new());
        let cache = cache(&store, 10);
        cache
            .push(7, "a", vec![b"one".to_vec(), b"two".to_vec()])
            .await;

        assert_eq!(
            store.list("t/snapshots/team-7/session-a"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t/realtime-subscriptions");
        let activity: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(activity["team_id"], 7);
        assert_eq!(activity["session_id"], "a");
        assert_eq!(activity["event_count"], 2);
    }

    #[tokio::test]
    async fn list_stays_bounded() {
        let store = Arc::new(MemStore::new());
        let cache = cache(&store, 3);
        for i in 0..5u8 {
            cache.push(7, "a", vec![vec![i]]).await;
        }
        assert_eq!(
            store.list("t/snapshots/team-7/session-a"),
            vec![vec![2], vec![3], vec![4]]
        );
    }

    #[tokio::test]
    async fn empty_push_is_a_no_op() {
        let store = Arc::new(MemStore::new());
        let cache = cache(&store, 3);
        cache.push(7, "a", vec![]).await;
        assert!(store.published().is_empty());
    }
}

// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Best-effort partition leases in the shared store.
//!
//! A lease marks which worker currently intends to write for a partition so
//! that a formerly-owning worker can flush cleanly on revoke before the new
//! owner starts. Losing or failing to claim a lease never blocks ingestion;
//! correctness rests on the high-water marker, not on the lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::message::TopicPartition;
use crate::store::SharedStore;

pub struct PartitionLocker {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    /// This worker's identity in lease values.
    owner: String,
    ttl: Duration,
}

impl PartitionLocker {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: String, ttl: Duration) -> Self {
        PartitionLocker {
            store,
            key_prefix,
            owner: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    fn lease_key(&self, tp: &TopicPartition) -> String {
        format!("{}/locks/{}/{}", self.key_prefix, tp.topic, tp.partition)
    }

    /// Acquires or extends leases on the given partitions. A partition whose
    /// lease is held elsewhere, or whose claim errors, is logged and
    /// skipped.
    pub async fn claim<'a>(&self, partitions: impl IntoIterator<Item = &'a TopicPartition>) {
        for tp in partitions {
            match self
                .store
                .try_lease(&self.lease_key(tp), &self.owner, self.ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(partition = %tp, "partition lease held by another worker");
                }
                Err(e) => {
                    warn!(partition = %tp, error = %e, "failed to claim partition lease");
                }
            }
        }
    }

    /// Releases any leases this worker holds on the given partitions.
    pub async fn release<'a>(&self, partitions: impl IntoIterator<Item = &'a TopicPartition>) {
        for tp in partitions {
            if let Err(e) = self
                .store
                .release_lease(&self.lease_key(tp), &self.owner)
                .await
            {
                warn!(partition = %tp, error = %e, "failed to release partition lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn locker(store: &Arc<MemStore>) -> PartitionLocker {
        PartitionLocker::new(
            Arc::clone(store) as Arc<dyn SharedStore>,
            "t".into(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn claim_and_release_round_trip() {
        let store = Arc::new(MemStore::new());
        let locker = locker(&store);
        let tp = TopicPartition::new("snap", 2);

        locker.claim([&tp]).await;
        assert!(store.lease_held_by("t/locks/snap/2", &locker.owner));

        // Claiming again extends rather than conflicts.
        locker.claim([&tp]).await;
        assert!(store.lease_held_by("t/locks/snap/2", &locker.owner));

        locker.release([&tp]).await;
        assert!(!store.lease_held_by("t/locks/snap/2", &locker.owner));
    }

    #[tokio::test]
    async fn foreign_lease_does_not_block() {
        let store = Arc::new(MemStore::new());
        let theirs = locker(&store);
        let ours = locker(&store);
        let tp = TopicPartition::new("snap", 0);

        theirs.claim([&tp]).await;
        // Our claim is refused but returns normally; ingestion would go on.
        ours.claim([&tp]).await;
        assert!(store.lease_held_by("t/locks/snap/0", &theirs.owner));
        assert!(!store.lease_held_by("t/locks/snap/0", &ours.owner));

        // Releasing a lease we do not hold leaves theirs in place.
        ours.release([&tp]).await;
        assert!(store.lease_held_by("t/locks/snap/0", &theirs.owner));
    }
}

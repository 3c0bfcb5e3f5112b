// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Resolution of ingestion tokens to team ids.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::refresher::BackgroundRefresher;

/// The `token -> team_id` table.
pub type TeamTable = HashMap<String, i64>;

/// Serves the current team table, refreshing it in the background and
/// falling back to the last good table when a reload fails.
pub struct TeamResolver {
    refresher: BackgroundRefresher<TeamTable>,
}

impl TeamResolver {
    /// A resolver reloading the table from a JSON object file
    /// (`{"<token>": <team_id>, ...}`).
    pub fn from_file(path: PathBuf, interval: Duration) -> Self {
        let refresher = BackgroundRefresher::new("team-token-table", interval, move || {
            let path = path.clone();
            async move {
                let raw = tokio::fs::read(&path).await?;
                let table: TeamTable = serde_json::from_slice(&raw)?;
                Ok(table)
            }
        });
        TeamResolver { refresher }
    }

    /// A resolver serving a fixed table. Also covers deployments with no
    /// table configured, where only envelopes carrying a literal `team_id`
    /// resolve.
    pub fn fixed(table: TeamTable) -> Self {
        let refresher =
            BackgroundRefresher::new("team-token-table", Duration::from_secs(3600), move || {
                let table = table.clone();
                async move { Ok(table) }
            });
        TeamResolver { refresher }
    }

    /// Forces one reload attempt. A failure keeps the previous table.
    pub async fn refresh_now(&self) {
        self.refresher.refresh_now().await;
    }

    /// The table to resolve the current batch against. If the table has
    /// never loaded, every token is unknown; the refresher retries on its
    /// own cadence.
    pub async fn table(&self) -> Arc<TeamTable> {
        match self.refresher.get().await {
            Ok(table) => table,
            Err(e) => {
                debug!(error = %e, "team table unavailable; treating all tokens as unknown");
                Arc::new(TeamTable::new())
            }
        }
    }
}

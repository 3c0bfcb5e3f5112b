// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A TTL cache over an async loader, with single-flight refresh and
//! stale-on-error fallback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

type Loader<T> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>> + Send + Sync>;

struct Slot<T> {
    value: Arc<T>,
    /// When the last load attempt finished, successful or not. Failures
    /// advance this too, which throttles both retries and their warnings to
    /// once per interval.
    attempted_at: Instant,
}

/// Holds a `T` produced by an async loader and refreshed at most once per
/// interval.
///
/// The first `get` waits for the loader; later `get`s return the last
/// successful value immediately, kicking off a background refresh when the
/// value has aged past the interval. Only one load is ever in flight. A
/// failed refresh keeps the previous value.
pub struct BackgroundRefresher<T> {
    name: String,
    interval: Duration,
    loader: Loader<T>,
    slot: Arc<RwLock<Option<Slot<T>>>>,
    in_flight: Arc<Mutex<()>>,
}

impl<T: Send + Sync + 'static> BackgroundRefresher<T> {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        BackgroundRefresher {
            name: name.into(),
            interval,
            loader: Arc::new(move || Box::pin(loader())),
            slot: Arc::new(RwLock::new(None)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the current value, loading it if this is the first call.
    ///
    /// Errors only when no value has ever loaded successfully.
    pub async fn get(&self) -> anyhow::Result<Arc<T>> {
        if let Some(slot) = &*self.slot.read().await {
            if slot.attempted_at.elapsed() >= self.interval {
                self.spawn_refresh();
            }
            return Ok(Arc::clone(&slot.value));
        }

        // First load: all callers queue on the in-flight lock and the winner
        // populates the slot for the rest.
        let _guard = self.in_flight.lock().await;
        if let Some(slot) = &*self.slot.read().await {
            return Ok(Arc::clone(&slot.value));
        }
        let value = Arc::new((self.loader)().await?);
        *self.slot.write().await = Some(Slot {
            value: Arc::clone(&value),
            attempted_at: Instant::now(),
        });
        Ok(value)
    }

    /// Runs one refresh attempt to completion, unless another attempt is
    /// already in flight. A failure logs and leaves the stale value.
    pub async fn refresh_now(&self) {
        Self::refresh(
            self.name.clone(),
            Arc::clone(&self.loader),
            Arc::clone(&self.slot),
            Arc::clone(&self.in_flight),
        )
        .await;
    }

    fn spawn_refresh(&self) {
        let name = self.name.clone();
        let loader = Arc::clone(&self.loader);
        let slot = Arc::clone(&self.slot);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(Self::refresh(name, loader, slot, in_flight));
    }

    async fn refresh(
        name: String,
        loader: Loader<T>,
        slot: Arc<RwLock<Option<Slot<T>>>>,
        in_flight: Arc<Mutex<()>>,
    ) {
        let Ok(_guard) = in_flight.try_lock() else {
            return;
        };
        let result = loader().await;
        let mut slot = slot.write().await;
        match result {
            Ok(value) => {
                *slot = Some(Slot {
                    value: Arc::new(value),
                    attempted_at: Instant::now(),
                });
            }
            Err(e) => {
                warn!(refresher = %name, error = %e, "refresh failed; serving stale value");
                if let Some(slot) = slot.as_mut() {
                    slot.attempted_at = Instant::now();
                }
            }
        }
    }
}

// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of per-machine runtime details.
//!
//! Every source (monitored machine) has a machine uid (`muid`) and a set of
//! runtime details. The registry maps muid to details so the enricher can
//! annotate records as they stream through. Reads vastly outnumber writes:
//! a read happens per record, a write batch happens once per refresh.
//!
//! A refresh replaces the entry for every uid present in the response;
//! uids absent from the response keep their previous entry, so a partial
//! upstream response cannot blank out details mid-stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ApiError, EventsApi};

/// How often the background refresher polls the source list.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runtime metadata for one monitored machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_instance_id: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub forwarder: String,
}

/// One source as returned by the API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Source {
    pub uid: String,
    pub runtime_details: RuntimeDetails,
}

/// Concurrent muid → [`RuntimeDetails`] map.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    inner: RwLock<HashMap<String, RuntimeDetails>>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the details for a machine uid.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<RuntimeDetails> {
        match self.inner.read() {
            Ok(map) => map.get(uid).cloned(),
            Err(_) => None,
        }
    }

    /// Stores details for every source with a non-empty uid. Existing
    /// entries not mentioned in `sources` are left in place.
    pub fn insert_all(&self, sources: Vec<Source>) {
        let Ok(mut map) = self.inner.write() else {
            return;
        };
        for source in sources {
            if !source.uid.is_empty() {
                map.insert(source.uid, source.runtime_details);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetches the source list once and merges it into the registry.
pub async fn refresh(api: &EventsApi, registry: &SourceRegistry) -> Result<usize, ApiError> {
    let sources = api.fetch_sources().await?;
    let count = sources.len();
    registry.insert_all(sources);
    Ok(count)
}

/// Periodically refreshes the registry until cancelled. Failures are
/// logged and retried on the next tick; this task never aborts the
/// process.
pub async fn run_refresher(
    api: Arc<EventsApi>,
    registry: Arc<SourceRegistry>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    // The first tick fires immediately; startup already refreshed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match refresh(&api, &registry).await {
            Ok(count) => info!(sources = count, "refreshed sources"),
            Err(e) => warn!(error = %e, "error refreshing sources"),
        }
    }
}

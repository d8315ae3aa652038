// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Record enrichment.
//!
//! Records are opaque JSON objects and may be large; re-serializing them
//! just to add one field would dominate the pipeline's CPU cost. Instead
//! the enricher splices a `runtime_details` member in front of the closing
//! brace by byte surgery. The input buffer is never modified (callers may
//! hold slices borrowed from a shared read buffer) and the result is a
//! fresh allocation.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::sources::{RuntimeDetails, SourceRegistry};

const KEY: &[u8] = b",\"runtime_details\":";

#[derive(Deserialize)]
struct MuidProbe<'a> {
    #[serde(default, borrow)]
    muid: Option<Cow<'a, str>>,
}

/// Annotates records with runtime details from the source registry.
#[derive(Debug, Clone)]
pub struct Enricher {
    registry: Arc<SourceRegistry>,
    user_agent: String,
}

impl Enricher {
    #[must_use]
    pub fn new(registry: Arc<SourceRegistry>, user_agent: String) -> Self {
        Enricher {
            registry,
            user_agent,
        }
    }

    /// Returns a copy of `record` with `runtime_details` appended as the
    /// final member. Unknown muids get empty details; the forwarder tag is
    /// always set. Records too short to be an object come back unchanged.
    #[must_use]
    pub fn augment(&self, record: &[u8]) -> Vec<u8> {
        if record.len() < 2 {
            return record.to_vec();
        }

        let muid = serde_json::from_slice::<MuidProbe<'_>>(record)
            .ok()
            .and_then(|p| p.muid);

        let mut details = muid
            .and_then(|muid| self.registry.get(&muid))
            .unwrap_or_default();
        details.forwarder = self.user_agent.clone();

        let Ok(details_json) = serde_json::to_vec(&details) else {
            return record.to_vec();
        };

        // {..record..} -> {..record..,"runtime_details":{..}}
        let mut out = Vec::with_capacity(record.len() + KEY.len() + details_json.len());
        out.extend_from_slice(&record[..record.len() - 1]);
        out.extend_from_slice(KEY);
        out.extend_from_slice(&details_json);
        out.push(b'}');
        out
    }
}

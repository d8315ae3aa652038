// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal parsing of event records.
//!
//! Event records are opaque NDJSON objects. The pipeline only ever reads
//! four fields: `id`, `time`, `version`, and (elsewhere) `muid`. This module
//! extracts the first three with a single serde pass that ignores every
//! other field, so no value tree for the full record is ever built.

use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;

/// Event timestamp: fractional seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct RecordTime(pub f64);

impl RecordTime {
    /// Converts to a [`SystemTime`]. Returns `None` for non-finite or
    /// negative timestamps.
    #[must_use]
    pub fn system_time(self) -> Option<SystemTime> {
        if !self.0.is_finite() || self.0 < 0.0 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::from_secs_f64(self.0))
    }

    /// Whole seconds elapsed between this timestamp and `now`, saturating
    /// at zero when the record is in the future.
    #[must_use]
    pub fn age(self, now: SystemTime) -> Duration {
        match self.system_time() {
            Some(t) => now.duration_since(t).unwrap_or_default(),
            None => Duration::ZERO,
        }
    }
}

/// The identity and timestamp of one event record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    /// De-duplication identity: `id`, or `id:version` when a version is
    /// present (ids alone are not guaranteed unique across revisions).
    pub dedup_id: String,
    /// Event time; zero when the record carries no `time` field.
    pub time: RecordTime,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record does not contain an ID")]
    MissingId,
    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct Probe<'a> {
    #[serde(default, borrow)]
    id: Option<Cow<'a, str>>,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default, borrow)]
    version: Option<Cow<'a, str>>,
}

/// Extracts the dedup identity and timestamp from a raw NDJSON record.
///
/// A record without an `id` is invalid. A missing `time` decodes as zero,
/// matching the upstream contract where `time` is best-effort for ordering
/// diagnostics only.
pub fn summary_from_json(data: &[u8]) -> Result<RecordSummary, RecordError> {
    let probe: Probe<'_> = serde_json::from_slice(data)?;

    let id = match probe.id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(RecordError::MissingId),
    };

    let dedup_id = match probe.version {
        Some(version) => format!("{id}:{version}"),
        None => id.into_owned(),
    };

    Ok(RecordSummary {
        dedup_id,
        time: RecordTime(probe.time.unwrap_or_default()),
    })
}

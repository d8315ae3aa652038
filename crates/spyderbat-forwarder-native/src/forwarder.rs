// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingest loop: poll → dedupe → enrich → filter → emit.
//!
//! One task drives the whole pipeline. Each iteration fetches a page of
//! events anchored on the persisted iterator, persists the new iterator
//! before processing the page, and pushes each surviving record through
//! the dedup cache, filter, enricher, sinks, and webhook in arrival order.
//!
//! The iterator is persisted before the page is processed, so a crash
//! mid-page re-emits at most one page (at-least-once delivery); the dedup
//! cache suppresses the replayed records on the next run.
//!
//! Transient fetch failures are retried silently; only the fifth
//! consecutive failure starts logging, which keeps brief upstream blips
//! out of the operational log. An iterator persist failure is fatal:
//! continuing would replay unboundedly after a restart.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::EventsApi;
use crate::checkpoint::IteratorCheckpoint;
use crate::dedup::DedupCache;
use crate::enrich::Enricher;
use crate::filter::FilterEngine;
use crate::record::{self, RecordTime};
use crate::sinks::EventSinks;
use crate::webhook::WebhookHandle;

/// Page size requested from the upstream.
pub const RECORDS_PER_REQUEST: usize = 10_000;
/// Delay between polls when the upstream is drained or failing.
pub const REQUEST_DELAY: Duration = Duration::from_secs(30);

// Short first delay so the initial fetch is prompt; also used between
// polls while full pages keep arriving.
const PROMPT_DELAY: Duration = Duration::from_secs(1);
// Consecutive fetch failures before the loop starts logging them.
const ERROR_LOG_THRESHOLD: u32 = 5;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("failed to persist iterator: {0}")]
    PersistIterator(std::io::Error),
}

#[derive(Debug, Default)]
struct IterationStats {
    retrieved: u64,
    new: u64,
    invalid: u64,
    filtered: u64,
    logged: u64,
}

/// Everything the ingest loop needs, built during startup.
pub struct ForwarderConfig {
    pub api: Arc<EventsApi>,
    pub cache: DedupCache,
    pub enricher: Enricher,
    pub filter: FilterEngine,
    pub sinks: EventSinks,
    pub checkpoint: IteratorCheckpoint,
    pub webhook: WebhookHandle,
}

/// The ingest loop.
pub struct Forwarder {
    api: Arc<EventsApi>,
    cache: DedupCache,
    enricher: Enricher,
    filter: FilterEngine,
    sinks: EventSinks,
    checkpoint: IteratorCheckpoint,
    webhook: WebhookHandle,
    last_time: RecordTime,
}

impl Forwarder {
    #[must_use]
    pub fn new(config: ForwarderConfig) -> Self {
        Forwarder {
            api: config.api,
            cache: config.cache,
            enricher: config.enricher,
            filter: config.filter,
            sinks: config.sinks,
            checkpoint: config.checkpoint,
            webhook: config.webhook,
            last_time: RecordTime::default(),
        }
    }

    /// Runs the poll loop until `cancel` fires. Only an iterator persist
    /// failure terminates the loop early.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ForwarderError> {
        let mut iterator = self.checkpoint.load();
        let mut delay = PROMPT_DELAY;
        let mut consecutive_errors: u32 = 0;
        let mut buf: Vec<u8> = Vec::new();

        info!(iterator = %iterator, "starting event poll loop");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            buf.clear();
            let (records, next_iterator) = match self
                .api
                .load_events(&iterator, RECORDS_PER_REQUEST, &mut buf)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    delay = REQUEST_DELAY;
                    consecutive_errors += 1;
                    if consecutive_errors >= ERROR_LOG_THRESHOLD {
                        warn!(
                            error = %e,
                            consecutive_errors,
                            "error loading events"
                        );
                    }
                    continue;
                }
            };
            consecutive_errors = 0;

            iterator = next_iterator;
            self.checkpoint
                .store(&iterator)
                .map_err(ForwarderError::PersistIterator)?;

            let mut stats = IterationStats::default();
            for line in buf.split(|&b| b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                self.process_record(line, &mut stats).await;
                if cancel.is_cancelled() {
                    break;
                }
            }

            // A full page means more events are likely waiting.
            delay = if records >= RECORDS_PER_REQUEST {
                PROMPT_DELAY
            } else {
                REQUEST_DELAY
            };

            info!(
                retrieved = stats.retrieved,
                new = stats.new,
                invalid = stats.invalid,
                filtered = stats.filtered,
                logged = stats.logged,
                most_recent_age_s = self.last_time.age(SystemTime::now()).as_secs(),
                "records processed"
            );

            if cancel.is_cancelled() {
                break;
            }
        }

        if let Err(e) = self.cache.close() {
            warn!(error = %e, "error closing dedup journal");
        }
        Ok(())
    }

    async fn process_record(&mut self, line: &[u8], stats: &mut IterationStats) {
        stats.retrieved += 1;

        let summary = match record::summary_from_json(line) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    error = %e,
                    record = %String::from_utf8_lossy(line),
                    "error decoding record"
                );
                stats.invalid += 1;
                return;
            }
        };

        if self.cache.exists(&summary.dedup_id) {
            return;
        }
        stats.new += 1;
        if let Err(e) = self.cache.add(&summary.dedup_id) {
            // Delivery continues; only restart-time dedup degrades.
            warn!(error = %e, "failed to journal record id");
        }

        if summary.time > self.last_time {
            self.last_time = summary.time;
        }

        if !self.filter.emit(line) {
            stats.filtered += 1;
            return;
        }

        stats.logged += 1;
        let enriched = self.enricher.augment(line);
        self.sinks.write_line(&enriched);
        if let Err(e) = self.webhook.send(enriched).await {
            warn!(error = %e, "error sending webhook");
        }
    }
}

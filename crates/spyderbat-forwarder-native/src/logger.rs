// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON process-log formatting.
//!
//! The forwarder's own operational log is machine-readable: one JSON
//! object per line carrying a schema tag, a per-process monotonic sequence
//! id, and a fractional-seconds timestamp, alongside the event's level,
//! message, and structured fields. Downstream collectors ingest the
//! process log with the same tooling as the event log.
//!
//! Frame fields:
//! - `schema`: `"event_forwarder:meta:1.0.0"`
//! - `id`: `"event_meta:{run}:{seq}"` where `run` is unique per process
//!   start and `seq` increases by one per line
//! - `time`: seconds since the Unix epoch, fractional

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Schema tag attached to every process-log line.
pub const LOG_SCHEMA: &str = "event_forwarder:meta:1.0.0";

/// Environment variable selecting the log level filter.
pub const LOG_ENV_VAR: &str = "SEF_LOG";

const RUN_ID_LENGTH: usize = 11;
const RUN_ID_CORPUS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Formats tracing events as schema-tagged JSON lines.
pub struct JsonFormatter {
    run_id: String,
    sequence: AtomicI64,
}

impl JsonFormatter {
    #[must_use]
    pub fn new() -> Self {
        JsonFormatter {
            run_id: run_id(),
            sequence: AtomicI64::new(0),
        }
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Map::new();
        event.record(&mut JsonVisitor {
            fields: &mut fields,
        });

        let mut line = Map::new();
        line.insert(
            "level".to_string(),
            Value::from(event.metadata().level().as_str().to_lowercase()),
        );
        if let Some(message) = fields.remove("message") {
            line.insert("message".to_string(), message);
        }
        line.append(&mut fields);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        line.insert("schema".to_string(), Value::from(LOG_SCHEMA));
        line.insert(
            "id".to_string(),
            Value::from(format!("event_meta:{}:{}", self.run_id, sequence)),
        );
        line.insert("time".to_string(), Value::from(unix_seconds()));

        writeln!(writer, "{}", Value::Object(line))
    }
}

struct JsonVisitor<'a> {
    fields: &'a mut Map<String, Value>,
}

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// Unique-per-process-start id for correlating log lines. Derived from the
// start time and pid; no global randomness source needed.
fn run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();

    digest
        .iter()
        .take(RUN_ID_LENGTH)
        .map(|b| RUN_ID_CORPUS[usize::from(*b) % RUN_ID_CORPUS.len()] as char)
        .collect()
}

/// Installs the global JSON subscriber. The level filter comes from
/// `SEF_LOG` (default `info`).
pub fn init() -> Result<(), String> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .event_format(JsonFormatter::new())
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| e.to_string())
}

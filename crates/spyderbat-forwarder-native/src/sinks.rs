// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Local sinks for enriched records.
//!
//! Every emitted record is written as one line to a self-rotating file in
//! the log directory, and optionally to stdout and the local syslog. Sink
//! writes are best-effort: failures are logged and the pipeline moves on,
//! because the webhook path must not stall behind a full disk or a dead
//! syslog socket.

use std::io::Write;

use syslog::{Facility, Formatter3164, LoggerBackend};
use thiserror::Error;
use tracing::warn;
use tracing_rolling_file::RollingFileAppenderBase;

use crate::config::Config;

/// Event log file name inside the log directory.
pub const EVENT_LOG_FILE: &str = "spyderbat_events.log";

/// Rotate the event log after 10 MiB.
const MAX_LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// Number of rotated backups to retain.
const MAX_LOG_BACKUPS: usize = 5;

const SYSLOG_TAG: &str = "spyderbat-event";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open event log: {0}")]
    EventLog(String),
}

/// Fan-out writer for enriched records.
pub struct EventSinks {
    file: RollingFileAppenderBase,
    stdout: bool,
    syslog: Option<syslog::Logger<LoggerBackend, Formatter3164>>,
}

impl EventSinks {
    /// Opens the sinks selected by `config`. The rotating file sink is
    /// mandatory and its failure is fatal; a syslog connection failure is
    /// reported and the sink skipped.
    pub fn open(config: &Config) -> Result<Self, SinkError> {
        let path = config.log_path.join(EVENT_LOG_FILE);
        let file = RollingFileAppenderBase::builder()
            .filename(path.display().to_string())
            .max_filecount(MAX_LOG_BACKUPS)
            .condition_max_file_size(MAX_LOG_FILE_BYTES)
            .build()
            .map_err(|e| SinkError::EventLog(e.to_string()))?;

        let syslog = if config.local_syslog_forwarding {
            let formatter = Formatter3164 {
                facility: Facility::LOG_USER,
                hostname: None,
                process: SYSLOG_TAG.to_string(),
                pid: std::process::id(),
            };
            match syslog::unix(formatter) {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!(error = %e, "syslog forwarding requested, but failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(EventSinks {
            file,
            stdout: config.stdout,
            syslog,
        })
    }

    /// Writes one record line to every configured sink. Best-effort.
    pub fn write_line(&mut self, record: &[u8]) {
        let write_file = (|| -> std::io::Result<()> {
            self.file.write_all(record)?;
            self.file.write_all(b"\n")?;
            self.file.flush()
        })();
        if let Err(e) = write_file {
            warn!(error = %e, "failed to write event log");
        }

        if self.stdout {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(record);
            let _ = out.write_all(b"\n");
        }

        if let Some(logger) = self.syslog.as_mut() {
            let line = String::from_utf8_lossy(record);
            if let Err(e) = logger.alert(line.as_ref()) {
                warn!(error = %e, "failed to write syslog");
            }
        }
    }
}

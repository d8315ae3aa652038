// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Iterator checkpoint persistence.
//!
//! The poll loop's position in the upstream event stream is an opaque
//! server-issued cursor. It is persisted before each page is processed so
//! a restart resumes where the previous run left off. Writes go through a
//! temporary file followed by a rename, so the checkpoint at rest is
//! always either absent or a complete cursor, never a partial write.

use std::io;
use std::path::{Path, PathBuf};

/// Cursor value that asks the server for the oldest retained events.
pub const INITIAL_ITERATOR: &str = "OLDEST";

const FILE_NAME: &str = "iterator";
const TMP_NAME: &str = "iterator.tmp";

/// Persistent cursor into the upstream event stream.
#[derive(Debug, Clone)]
pub struct IteratorCheckpoint {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl IteratorCheckpoint {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        IteratorCheckpoint {
            path: dir.join(FILE_NAME),
            tmp_path: dir.join(TMP_NAME),
        }
    }

    /// Reads the stored cursor. A missing, unreadable, or empty file
    /// yields [`INITIAL_ITERATOR`].
    #[must_use]
    pub fn load(&self) -> String {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let cursor = contents.trim();
                if cursor.is_empty() {
                    INITIAL_ITERATOR.to_string()
                } else {
                    cursor.to_string()
                }
            }
            Err(_) => INITIAL_ITERATOR.to_string(),
        }
    }

    /// Atomically replaces the stored cursor.
    pub fn store(&self, iterator: &str) -> io::Result<()> {
        std::fs::write(&self.tmp_path, iterator)?;
        std::fs::rename(&self.tmp_path, &self.path)
    }
}

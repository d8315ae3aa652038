// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Journaling LRU cache for duplicate suppression.
//!
//! The backend re-serves events across overlapping requests, so every
//! record's identity is checked against this cache before emission. The
//! cache is a value-less, capacity-bounded LRU over 64-bit identity hashes,
//! backed by an append-only [`journal`] so that a restarted process picks
//! up where it left off. Eviction from the LRU never touches the journal:
//! the journal is the durable truth, and replaying it (oldest entries
//! first) leaves the LRU holding the most recent `capacity` identities.

pub mod journal;

use std::io;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use sha2::{Digest, Sha256};

use self::journal::Journal;

/// Default number of identities held in memory.
pub const DEFAULT_CAPACITY: usize = 655_360;

// The journal retains ten times the in-memory capacity before rotating.
const JOURNAL_FACTOR: usize = 10;

/// Identity hash: first 8 bytes of the SHA-256 digest, little-endian.
/// The digest must be stable across runs so persisted journal entries
/// rehydrate the same cache state.
pub(crate) fn hash_id(raw_id: &str) -> u64 {
    let digest = Sha256::digest(raw_id.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Membership cache over record identities, durable across restarts.
pub struct DedupCache {
    lru: LruCache<u64, ()>,
    journal: Journal,
}

impl DedupCache {
    /// Opens the cache, replaying any journal files found in `dir`.
    pub fn new(dir: &Path, capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut lru = LruCache::new(capacity);
        let journal = Journal::open(dir, capacity.get() * JOURNAL_FACTOR, |id| {
            lru.put(id, ());
        })?;
        Ok(DedupCache { lru, journal })
    }

    /// Returns whether `raw_id` has been seen, refreshing its recency.
    pub fn exists(&mut self, raw_id: &str) -> bool {
        self.lru.get(&hash_id(raw_id)).is_some()
    }

    /// Records `raw_id` as seen, in memory and in the journal.
    pub fn add(&mut self, raw_id: &str) -> io::Result<()> {
        let id = hash_id(raw_id);
        self.lru.put(id, ());
        self.journal.add(id)
    }

    /// Flushes and closes the journal. Subsequent [`DedupCache::add`]
    /// calls are a programming error.
    pub fn close(&mut self) -> io::Result<()> {
        self.journal.close()
    }
}

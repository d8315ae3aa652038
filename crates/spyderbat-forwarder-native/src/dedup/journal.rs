// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-durable journal of de-duplication identities.
//!
//! The journal is a directory containing at most two files holding a flat
//! sequence of 64-bit little-endian identities: `id_journal` (current) and
//! `id_journal.1` (predecessor). When the current file reaches the entry
//! cap it is rotated: the predecessor is replaced by the current file and a
//! fresh current file is created. This bounds disk usage to
//! `2 × cap × 8` bytes while always retaining a replay window of at least
//! `cap` entries.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "id_journal";
const ENTRY_BYTES: usize = 8;

/// Append-only identity journal with two-file rotation.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    file: Option<File>,
    entries: usize,
    max_entries: usize,
}

impl Journal {
    fn current_path(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    fn backup_path(dir: &Path) -> PathBuf {
        dir.join(format!("{FILE_NAME}.1"))
    }

    /// Opens an existing journal or creates a new one in `dir`.
    ///
    /// Both journal files are replayed oldest-first (predecessor, then
    /// current), invoking `rehydrate` for every entry. Missing files are
    /// treated as empty; any other I/O error is returned.
    pub fn open(
        dir: &Path,
        max_entries: usize,
        mut rehydrate: impl FnMut(u64),
    ) -> io::Result<Self> {
        replay(&Self::backup_path(dir), &mut rehydrate)?;

        let mut entries = 0;
        replay(&Self::current_path(dir), &mut |id| {
            entries += 1;
            rehydrate(id);
        })?;

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(Self::current_path(dir))?;

        Ok(Journal {
            dir: dir.to_path_buf(),
            file: Some(file),
            entries,
            max_entries,
        })
    }

    /// Appends one identity, rotating first if the current file is full.
    pub fn add(&mut self, id: u64) -> io::Result<()> {
        if self.entries >= self.max_entries {
            self.rotate()?;
        }

        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.write_all(&id.to_le_bytes())?;
        self.entries += 1;
        Ok(())
    }

    // Close current, current -> predecessor (replacing it), open fresh current.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.take();
        std::fs::rename(
            Self::current_path(&self.dir),
            Self::backup_path(&self.dir),
        )?;
        self.file = Some(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(Self::current_path(&self.dir))?,
        );
        self.entries = 0;
        Ok(())
    }

    /// Closes the journal. Calling [`Journal::add`] afterwards is a
    /// programming error and returns an error.
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::other("journal is closed")
}

// Replays one journal file, invoking `rehydrate` per entry. A missing file
// is empty. A torn trailing entry (partial 8-byte write) is an error, the
// same as any other corruption.
fn replay(path: &Path, rehydrate: &mut impl FnMut(u64)) -> io::Result<()> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut buf = [0u8; ENTRY_BYTES];
    loop {
        let mut filled = 0;
        while filled < ENTRY_BYTES {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => return Ok(()),
            ENTRY_BYTES => rehydrate(u64::from_le_bytes(buf)),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated journal entry",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_for(i: usize) -> u64 {
        crate::dedup::hash_id(&format!("id-{i}"))
    }

    #[test]
    fn test_new_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        let j = Journal::open(dir.path(), 10, |id| seen.push(id)).unwrap();
        assert!(seen.is_empty());
        assert_eq!(j.entries, 0);
    }

    #[test]
    fn test_rotation_bounds_replay_window() {
        let dir = tempfile::tempdir().unwrap();

        let mut j = Journal::open(dir.path(), 10, |_| {}).unwrap();
        for i in 0..100 {
            j.add(id_for(i)).unwrap();
        }
        j.close().unwrap();

        // 100 adds at cap 10: the backup holds entries 80..90 and the
        // current file holds 90..100.
        let mut restored = Vec::new();
        let _j = Journal::open(dir.path(), 10, |id| restored.push(id)).unwrap();
        assert_eq!(restored.len(), 20);
        for i in 80..100 {
            assert!(restored.contains(&id_for(i)), "missing id-{i}");
        }
        for i in 0..80 {
            assert!(!restored.contains(&id_for(i)), "unexpected id-{i}");
        }
    }

    #[test]
    fn test_replay_preserves_order() {
        let dir = tempfile::tempdir().unwrap();

        let mut j = Journal::open(dir.path(), 100, |_| {}).unwrap();
        for i in 0..50 {
            j.add(id_for(i)).unwrap();
        }
        j.close().unwrap();

        let mut restored = Vec::new();
        let _j = Journal::open(dir.path(), 100, |id| restored.push(id)).unwrap();
        let expected: Vec<u64> = (0..50).map(id_for).collect();
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_add_after_close_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::open(dir.path(), 10, |_| {}).unwrap();
        j.close().unwrap();
        assert!(j.add(1).is_err());
    }

    #[test]
    fn test_truncated_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), [1u8, 2, 3]).unwrap();
        assert!(Journal::open(dir.path(), 10, |_| {}).is_err());
    }

    #[test]
    fn test_counter_restored_from_current_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut j = Journal::open(dir.path(), 10, |_| {}).unwrap();
        for i in 0..7 {
            j.add(id_for(i)).unwrap();
        }
        j.close().unwrap();

        let mut j = Journal::open(dir.path(), 10, |_| {}).unwrap();
        assert_eq!(j.entries, 7);

        // Three more adds fill the file; the next one rotates.
        for i in 7..10 {
            j.add(id_for(i)).unwrap();
        }
        j.add(id_for(10)).unwrap();
        assert_eq!(j.entries, 1);
        assert!(Journal::backup_path(dir.path()).exists());
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL mutation journal with group commit.
//!
//! Each entry is a single line of JSON: `{"seq":N,"op":{...}}\n`. Appends go
//! to an in-memory buffer; `flush()` writes the batch with one fsync. A
//! corrupt tail found at open is rotated to `.bak` with the valid prefix
//! preserved, so a torn write during crash never blocks recovery.

use crate::snapshot::rotate_bak_path;
use crate::state::Op;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Flush interval for group commit.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum buffered entries before a flush is forced.
const FLUSH_THRESHOLD: usize = 100;

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization helper for writing entries without cloning the op.
#[derive(Serialize)]
struct RecordRef<'a> {
    seq: u64,
    op: &'a Op,
}

#[derive(Deserialize)]
struct Record {
    seq: u64,
    op: Op,
}

/// A journaled mutation with its sequence number.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: u64,
    pub op: Op,
}

/// Append-only JSONL op log.
pub struct Journal {
    file: File,
    path: PathBuf,
    /// Highest sequence number assigned so far.
    write_seq: u64,
    /// Buffered JSON lines waiting to be flushed (without trailing newline).
    write_buffer: Vec<Vec<u8>>,
    last_flush: Instant,
}

impl Journal {
    /// Open or create a journal at the given path.
    ///
    /// Scans existing entries to find the highest sequence number. A corrupt
    /// tail rotates the file to `.bak`, keeping the parseable prefix.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (mut write_seq, corrupt) = Self::scan(&file)?;

        if corrupt {
            let valid_lines = Self::read_valid_lines(&file)?;
            drop(file);

            let bak_path = rotate_bak_path(path);
            warn!(
                path = %path.display(),
                bak = %bak_path.display(),
                valid_entries = valid_lines.len(),
                "Corrupt journal detected, rotating to .bak and preserving valid entries",
            );
            std::fs::rename(path, &bak_path)?;

            {
                let mut new_file = File::create(path)?;
                for line in &valid_lines {
                    new_file.write_all(line.as_bytes())?;
                    new_file.write_all(b"\n")?;
                }
                new_file.sync_all()?;
            }

            file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)?;
            write_seq = Self::scan(&file)?.0;
        }

        Ok(Self {
            file,
            path: path.to_owned(),
            write_seq,
            write_buffer: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    /// Scan for the maximum sequence number; reports whether a corrupt
    /// (unparseable) entry was hit before EOF.
    fn scan(file: &File) -> Result<(u64, bool), JournalError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut max_seq = 0u64;
        let mut corrupt = false;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    corrupt = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Record>(trimmed) {
                Ok(record) => max_seq = max_seq.max(record.seq),
                Err(_) => {
                    corrupt = true;
                    break;
                }
            }
        }

        Ok((max_seq, corrupt))
    }

    /// Read parseable lines from the start, stopping at the first corrupt one.
    fn read_valid_lines(file: &File) -> Result<Vec<String>, JournalError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut valid = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if serde_json::from_str::<Record>(trimmed).is_err() {
                break;
            }
            valid.push(trimmed.to_string());
        }

        Ok(valid)
    }

    /// Append an op to the write buffer and return its sequence number.
    ///
    /// Not durable until `flush()`.
    pub fn append(&mut self, op: &Op) -> Result<u64, JournalError> {
        self.write_seq += 1;
        let seq = self.write_seq;
        let record = RecordRef { seq, op };
        self.write_buffer.push(serde_json::to_vec(&record)?);
        Ok(seq)
    }

    /// Whether the group-commit window has elapsed or the buffer is full.
    pub fn needs_flush(&self) -> bool {
        !self.write_buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL
                || self.write_buffer.len() >= FLUSH_THRESHOLD)
    }

    /// Flush all buffered entries with a single fsync.
    pub fn flush(&mut self) -> Result<(), JournalError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        for mut json_bytes in self.write_buffer.drain(..) {
            json_bytes.push(b'\n');
            self.file.write_all(&json_bytes)?;
        }

        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Highest assigned sequence number.
    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// All entries with `seq > after`, for replay on recovery.
    ///
    /// Stops at a corrupt entry (everything before it is returned).
    pub fn entries_after(&mut self, after: u64) -> Result<Vec<JournalEntry>, JournalError> {
        self.flush()?;

        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let record: Record = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Corrupt journal entry during replay, stopping at corruption point");
                    break;
                }
            };

            if record.seq > after {
                entries.push(JournalEntry {
                    seq: record.seq,
                    op: record.op,
                });
            }
        }

        Ok(entries)
    }

    /// Drop entries with `seq < before`, called after a durable snapshot.
    ///
    /// Rewrites to a temp file and atomically renames over the journal.
    pub fn truncate_before(&mut self, before: u64) -> Result<(), JournalError> {
        self.flush()?;

        let kept: Vec<JournalEntry> = self.entries_after(before.saturating_sub(1))?;
        let tmp_path = self.path.with_extension("tmp");

        {
            let mut tmp_file = File::create(&tmp_path)?;
            for entry in &kept {
                let record = RecordRef {
                    seq: entry.seq,
                    op: &entry.op,
                };
                let mut json_bytes = serde_json::to_vec(&record)?;
                json_bytes.push(b'\n');
                tmp_file.write_all(&json_bytes)?;
            }
            tmp_file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        Ok(())
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;

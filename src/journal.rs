use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Interrupted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalEntry {
    pub timestamp: String,
    pub transfer_id: Uuid,
    pub subject: String,
    pub path: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub bytes: u64,
    pub chunks: u64,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn now(
        transfer_id: Uuid,
        subject: &str,
        path: &str,
        direction: Direction,
        status: TransferStatus,
    ) -> Self {
        JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id,
            subject: subject.to_string(),
            path: path.to_string(),
            direction,
            status,
            bytes: 0,
            chunks: 0,
            error: None,
        }
    }
}

/// Append-only JSON-lines record of finished transfers.
pub struct TransferJournal {
    path: PathBuf,
}

impl TransferJournal {
    pub fn new(path: &Path) -> Self {
        TransferJournal { path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_entry(&self, entry: &JournalEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = TransferJournal::new(&tmp.path().join("transfers.jsonl"));
        assert!(journal.read_entries().unwrap().is_empty());

        let mut first = JournalEntry::now(Uuid::new_v4(), "alice", "/a.bin", Direction::Push, TransferStatus::Completed);
        first.bytes = 4000;
        first.chunks = 3;
        journal.add_entry(&first).unwrap();

        let mut second = JournalEntry::now(Uuid::new_v4(), "bob", "/b.bin", Direction::Pull, TransferStatus::Failed);
        second.error = Some("disk full".to_string());
        journal.add_entry(&second).unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].transfer_id, first.transfer_id);
        assert_eq!(entries[0].bytes, 4000);
        assert_eq!(entries[1].status, TransferStatus::Failed);
        assert_eq!(entries[1].error.as_deref(), Some("disk full"));
    }
}

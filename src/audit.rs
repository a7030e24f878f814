//! Append-only audit trail.
//!
//! Records every operation that touches key material or ciphertext, plus
//! every detected integrity failure. Records never contain plaintext or keys.
//! Supports pluggable sinks for forwarding records to files, databases, etc.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Destination for a copy of every audit record (file, database, collector).
pub trait AuditSink: Send {
    /// Append a record. Called for every audited operation.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Encrypt,
    Decrypt,
    Reencrypt,
    Rewrap,
    Delete,
    IntegrityFailure,
    Rotate,
    RetireVersion,
}

/// A permanent record of one vault operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation: AuditOperation,
    /// The file affected. `None` for key-store operations.
    pub file_id: Option<String>,
    /// The master key version involved (new version for rotate and rewrap).
    pub master_key_version: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn file(operation: AuditOperation, file_id: &str, version: u32) -> Self {
        Self {
            operation,
            file_id: Some(file_id.to_string()),
            master_key_version: Some(version),
            timestamp: Utc::now(),
        }
    }

    pub fn key(operation: AuditOperation, version: u32) -> Self {
        Self {
            operation,
            file_id: None,
            master_key_version: Some(version),
            timestamp: Utc::now(),
        }
    }
}

/// An append-only log of vault operations.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record, without replacing the
    /// in-memory log.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Record `record` and hand a copy to every sink.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.clone()
    }
}

/// Appends one JSON object per line to a file, creating it and its parent
/// directory on first use.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let written = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                writeln!(self.file, "{line}")?;
                self.file.flush()
            });
        if let Err(e) = written {
            tracing::warn!("failed to write audit record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("log.jsonl");

        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(FileAuditSink::new(&path).unwrap()));
        log.append(AuditRecord::file(AuditOperation::Encrypt, "notes.txt", 0));
        log.append(AuditRecord::key(AuditOperation::Rotate, 1));

        assert_eq!(log.len(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.operation, AuditOperation::Encrypt);
        assert_eq!(first.file_id.as_deref(), Some("notes.txt"));
        assert!(lines[1].contains("\"rotate\""));
    }
}

//! Append-only usage log
//!
//! One JSON object per line. The writer only ever appends; totals are
//! rebuilt by replaying the file at startup.

use chrono::{DateTime, Utc};
use pageforge_core::{Completion, UsageRecord};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Usage log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogConfig {
    /// File the entries are appended to
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Flush after this many entries
    #[serde(default = "default_flush_interval")]
    pub flush_interval: usize,

    /// Entries kept in memory for `/api/usage-stats`
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

fn default_path() -> PathBuf {
    PathBuf::from("./usage_stats.jsonl")
}

fn default_flush_interval() -> usize {
    1
}

fn default_recent_limit() -> usize {
    100
}

impl Default for UsageLogConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            flush_interval: default_flush_interval(),
            recent_limit: default_recent_limit(),
        }
    }
}

/// One finished request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Total tokens
    pub tokens: u64,
    /// Estimated cost in dollars
    pub cost: f64,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default)]
    pub partial: bool,
}

impl UsageEntry {
    pub fn new(session_id: Uuid, provider: impl Into<String>, model: impl Into<String>, usage: &UsageRecord) -> Self {
        Self {
            id: format!("use_{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            session_id,
            provider: provider.into(),
            model: model.into(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            tokens: usage.total_tokens,
            cost: usage.total_cost,
            processing_time: usage.processing_time,
            strategy: None,
            partial: false,
        }
    }

    /// Entry for a completed generation
    pub fn from_completion(session_id: Uuid, provider: impl Into<String>, completion: &Completion) -> Self {
        let mut entry = Self::new(session_id, provider, completion.model.clone(), &completion.usage);
        entry.strategy = Some(completion.strategy.as_str().to_string());
        entry.partial = completion.partial;
        entry
    }
}

/// Buffered JSONL appender
pub struct UsageWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_interval: usize,
    pending: usize,
}

impl UsageWriter {
    pub fn open(config: &UsageLogConfig) -> io::Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;

        debug!(path = ?config.path, "Opened usage log");

        Ok(Self {
            path: config.path.clone(),
            writer: BufWriter::new(file),
            flush_interval: config.flush_interval.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &UsageEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.writer, "{}", line)?;
        self.pending += 1;

        if self.pending >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for UsageWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read every entry in the log. A missing file is an empty log; malformed
/// lines are skipped with a warning.
pub fn read_entries(path: &Path) -> io::Result<Vec<UsageEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UsageEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = ?path, line = index + 1, error = %e, "Skipping malformed usage entry"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn usage(total: u64) -> UsageRecord {
        UsageRecord {
            input_tokens: total / 2,
            output_tokens: total - total / 2,
            total_tokens: total,
            processing_time: 1.5,
            total_cost: total as f64 * 3.0 / 1_000_000.0,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let config = UsageLogConfig {
            path: dir.path().join("logs/usage.jsonl"),
            ..Default::default()
        };

        let mut writer = UsageWriter::open(&config).unwrap();
        writer
            .append(&UsageEntry::new(Uuid::new_v4(), "gemini", "gemini-2.5-pro", &usage(40)))
            .unwrap();
        writer
            .append(&UsageEntry::new(Uuid::new_v4(), "anthropic", "claude", &usage(60)))
            .unwrap();
        drop(writer);

        let entries = read_entries(&config.path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tokens, 40);
        assert_eq!(entries[1].provider, "anthropic");
        assert!(entries[0].id.starts_with("use_"));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let config = UsageLogConfig {
            path: dir.path().join("usage.jsonl"),
            ..Default::default()
        };

        for _ in 0..2 {
            let mut writer = UsageWriter::open(&config).unwrap();
            writer
                .append(&UsageEntry::new(Uuid::new_v4(), "mock", "mock-model", &usage(10)))
                .unwrap();
        }

        assert_eq!(read_entries(&config.path).unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");
        let good = serde_json::to_string(&UsageEntry::new(Uuid::new_v4(), "mock", "m", &usage(8))).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n{}\n", good, good)).unwrap();

        assert_eq!(read_entries(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_entries(&dir.path().join("absent.jsonl")).unwrap().is_empty());
    }
}

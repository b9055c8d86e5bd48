//! Usage accounting service
//!
//! Callers record finished requests without touching the file: entries go
//! over an unbounded channel to a background writer thread, while the
//! running totals live in atomics and the most recent entries in a ring.

use crate::usage_log::{read_entries, UsageEntry, UsageLogConfig, UsageWriter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Usage service handle
pub struct UsageService {
    sender: mpsc::UnboundedSender<UsageCommand>,
    totals: UsageTotals,
    recent: Mutex<VecDeque<RecentRequest>>,
    recent_limit: usize,
}

/// Commands sent to the background writer
enum UsageCommand {
    Record(Box<UsageEntry>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct UsageTotals {
    requests: AtomicU64,
    tokens: AtomicU64,
    /// f64 bit pattern
    cost_bits: AtomicU64,
}

impl UsageTotals {
    fn add(&self, tokens: u64, cost: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        // fetch_update only fails when the closure returns None
        let _ = self
            .cost_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + cost).to_bits())
            });
    }

    fn cost(&self) -> f64 {
        f64::from_bits(self.cost_bits.load(Ordering::Acquire))
    }
}

/// Entry as listed by `/api/usage-stats`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentRequest {
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
    pub cost: f64,
    pub model: String,
}

impl From<&UsageEntry> for RecentRequest {
    fn from(entry: &UsageEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            tokens: entry.tokens,
            cost: entry.cost,
            model: entry.model.clone(),
        }
    }
}

/// Running totals plus the most recent requests, oldest first
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_requests: u64,
    pub requests: Vec<RecentRequest>,
}

impl UsageService {
    /// Start the service, replaying any existing log into the totals
    pub fn new(config: UsageLogConfig) -> std::io::Result<Self> {
        let existing = read_entries(&config.path)?;
        let writer = UsageWriter::open(&config)?;

        let totals = UsageTotals::default();
        let recent_limit = config.recent_limit.max(1);
        let mut recent = VecDeque::with_capacity(recent_limit);
        for entry in &existing {
            totals.add(entry.tokens, entry.cost);
            push_bounded(&mut recent, RecentRequest::from(entry), recent_limit);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pageforge-usage-writer".to_string())
            .spawn(move || run_writer(writer, receiver))?;

        info!(
            path = ?config.path,
            replayed = existing.len(),
            "Usage service started"
        );

        Ok(Self {
            sender,
            totals,
            recent: Mutex::new(recent),
            recent_limit,
        })
    }

    /// Count the entry and queue it for the log
    pub fn record(&self, entry: UsageEntry) {
        self.totals.add(entry.tokens, entry.cost);
        ::metrics::counter!("pageforge_tokens_total", "provider" => entry.provider.clone())
            .increment(entry.tokens);

        push_bounded(&mut self.recent.lock(), RecentRequest::from(&entry), self.recent_limit);

        if let Err(e) = self.sender.send(UsageCommand::Record(Box::new(entry))) {
            warn!("Failed to queue usage entry: {}", e);
        }
    }

    /// Wait until every entry recorded so far is on disk
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(UsageCommand::Flush(ack)).is_err() {
            warn!("Usage writer is gone, nothing to flush");
            return;
        }
        let _ = done.await;
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            total_tokens: self.totals.tokens.load(Ordering::Relaxed),
            total_cost: self.totals.cost(),
            total_requests: self.totals.requests.load(Ordering::Relaxed),
            requests: self.recent.lock().iter().cloned().collect(),
        }
    }
}

impl Drop for UsageService {
    fn drop(&mut self) {
        let _ = self.sender.send(UsageCommand::Shutdown);
    }
}

fn push_bounded(ring: &mut VecDeque<RecentRequest>, item: RecentRequest, limit: usize) {
    if ring.len() == limit {
        ring.pop_front();
    }
    ring.push_back(item);
}

/// Background writer loop
fn run_writer(mut writer: UsageWriter, mut receiver: mpsc::UnboundedReceiver<UsageCommand>) {
    while let Some(cmd) = receiver.blocking_recv() {
        match cmd {
            UsageCommand::Record(entry) => {
                if let Err(e) = writer.append(entry.as_ref()) {
                    error!(path = ?writer.path(), "Failed to append usage entry: {}", e);
                }
            }
            UsageCommand::Flush(ack) => {
                if let Err(e) = writer.flush() {
                    error!(path = ?writer.path(), "Failed to flush usage log: {}", e);
                }
                let _ = ack.send(());
            }
            UsageCommand::Shutdown => {
                debug!("Usage writer shutting down");
                break;
            }
        }
    }
    let _ = writer.flush();
}

//! Finished-session cache
//!
//! Keeps the result of each generation for a while so a client that lost its
//! connection can fetch it by session id. Entries expire after a TTL; the
//! map never grows past its configured size.

use chrono::{DateTime, Utc};
use pageforge_core::{client_error, Completion, Error, Strategy, UsageRecord};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::SessionConfig;

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Complete,
    Failed,
}

/// What a reconnecting client gets back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub provider: String,
    pub status: SessionStatus,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl SessionRecord {
    pub fn completed(session_id: Uuid, provider: impl Into<String>, completion: &Completion) -> Self {
        Self {
            session_id,
            provider: provider.into(),
            status: SessionStatus::Complete,
            finished_at: Utc::now(),
            html: Some(completion.html.clone()),
            model: Some(completion.model.clone()),
            usage: Some(completion.usage),
            strategy: Some(completion.strategy),
            partial: completion.partial,
            warning: completion.warning.clone(),
            error: None,
            details: None,
        }
    }

    pub fn failed(session_id: Uuid, provider: impl Into<String>, err: &Error) -> Self {
        let (error, details) = client_error(err);
        Self {
            session_id,
            provider: provider.into(),
            status: SessionStatus::Failed,
            finished_at: Utc::now(),
            html: None,
            model: None,
            usage: None,
            strategy: None,
            partial: false,
            warning: None,
            error: Some(error),
            details,
        }
    }
}

struct CachedSession {
    record: SessionRecord,
    inserted: Instant,
}

/// TTL-bounded map of finished sessions
#[derive(Clone)]
pub struct SessionStore {
    entries: Arc<RwLock<HashMap<Uuid, CachedSession>>>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
        }
    }

    pub fn insert(&self, record: SessionRecord) {
        let now = Instant::now();
        let mut entries = self.entries.write();

        if entries.len() >= self.max_entries && !entries.contains_key(&record.session_id) {
            entries.retain(|_, cached| now.duration_since(cached.inserted) < self.ttl);
        }
        while entries.len() >= self.max_entries && !entries.contains_key(&record.session_id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.inserted)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    entries.remove(&id);
                }
                None => break,
            }
        }

        entries.insert(
            record.session_id,
            CachedSession {
                record,
                inserted: now,
            },
        );
    }

    /// The record, unless it has expired
    pub fn get(&self, session_id: &Uuid) -> Option<SessionRecord> {
        let entries = self.entries.read();
        entries
            .get(session_id)
            .filter(|cached| cached.inserted.elapsed() < self.ttl)
            .map(|cached| cached.record.clone())
    }

    /// Drop expired entries, returning how many went
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| cached.inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = store.len(), "Evicted expired sessions");
                        }
                    }
                }
            }
        })
    }
}

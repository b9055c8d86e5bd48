//! Stream processing utilities

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::{EventPayload, StreamEvent};
use crate::{Error, Result};

/// Collects text fragments and releases them in batches
///
/// A batch is released once `max_fragments` are pending or `interval` has
/// passed since the previous release.
#[derive(Debug)]
pub struct FragmentBatcher {
    /// Fragments waiting to be released
    pending: Vec<String>,

    /// Fragment count that forces a release
    max_fragments: usize,

    /// Time after the last release that forces the next one
    interval: Duration,

    last_flush: Instant,
}

impl FragmentBatcher {
    /// Create a new batcher
    ///
    /// # Arguments
    /// * `max_fragments` - Pending fragment count that triggers a release
    /// * `interval` - Maximum time a fragment waits before release
    pub fn new(max_fragments: usize, interval: Duration) -> Self {
        Self {
            pending: Vec::with_capacity(max_fragments.max(1)),
            max_fragments: max_fragments.max(1),
            interval,
            last_flush: Instant::now(),
        }
    }

    /// Add a fragment, returning a batch if one is due
    pub fn push(&mut self, fragment: String) -> Option<String> {
        self.pending.push(fragment);
        if self.pending.len() >= self.max_fragments || self.last_flush.elapsed() >= self.interval {
            self.flush()
        } else {
            None
        }
    }

    /// Release everything pending
    pub fn flush(&mut self) -> Option<String> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.drain(..).collect())
    }

    /// When the pending batch must go out even if no new fragment arrives
    pub fn flush_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.last_flush + self.interval)
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outbound event channel for one session
///
/// A send to a dropped receiver means the client went away and surfaces as
/// [`Error::Cancelled`].
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    session_id: Uuid,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, session_id: Uuid) -> Self {
        Self { tx, session_id }
    }

    /// Bounded channel plus the sink that feeds it
    pub fn channel(session_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, session_id), rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn emit(&self, payload: EventPayload) -> Result<()> {
        self.tx
            .send(StreamEvent::new(self.session_id, payload))
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Resolves once the receiving side is gone
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

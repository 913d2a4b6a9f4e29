//! Per-user write traffic
//!
//! NIST 800-53: AU-12 (Audit Generation), SI-4 (System Monitoring)
//! Implementation: The write path only pushes onto an unbounded channel; a
//! background task folds events into per-user totals.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver of successful-write notifications.
///
/// Called on the write path, so implementations must return immediately.
pub trait WriteEventSink: Send + Sync {
    fn on_write(&self, username: &str, bytes: u64);
}

/// Accumulated write traffic for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub username: String,
    pub bytes_written: u64,
    pub writes: u64,
    pub last_write: DateTime<Utc>,
}

enum TrafficMessage {
    Write { username: String, bytes: u64 },
    Flush(oneshot::Sender<()>),
}

/// Channel-backed `WriteEventSink` with per-user aggregation
#[derive(Debug, Clone)]
pub struct TrafficRecorder {
    tx: mpsc::UnboundedSender<TrafficMessage>,
    totals: Arc<DashMap<String, TrafficStats>>,
}

impl TrafficRecorder {
    /// Start the aggregator task. Must be called inside a tokio runtime.
    ///
    /// The task ends once every clone of the recorder has been dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let totals: Arc<DashMap<String, TrafficStats>> = Arc::new(DashMap::new());
        let aggregate = totals.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    TrafficMessage::Write { username, bytes } => {
                        let now = Utc::now();
                        let mut entry =
                            aggregate
                                .entry(username.clone())
                                .or_insert_with(|| TrafficStats {
                                    username,
                                    bytes_written: 0,
                                    writes: 0,
                                    last_write: now,
                                });
                        entry.bytes_written = entry.bytes_written.saturating_add(bytes);
                        entry.writes += 1;
                        entry.last_write = now;
                    }
                    TrafficMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Traffic aggregator stopped");
        });

        (Self { tx, totals }, handle)
    }

    /// Wait until every event sent before this call has been aggregated
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(TrafficMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self, username: &str) -> Option<TrafficStats> {
        self.totals.get(username).map(|s| s.value().clone())
    }

    pub fn snapshot(&self) -> Vec<TrafficStats> {
        let mut all: Vec<TrafficStats> = self.totals.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    pub fn total_bytes(&self) -> u64 {
        self.totals.iter().map(|s| s.bytes_written).sum()
    }
}

impl WriteEventSink for TrafficRecorder {
    fn on_write(&self, username: &str, bytes: u64) {
        let message = TrafficMessage::Write {
            username: username.to_string(),
            bytes,
        };
        if self.tx.send(message).is_err() {
            warn!(username, bytes, "Traffic aggregator is gone; write event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregates_per_user() {
        let (recorder, _task) = TrafficRecorder::spawn();
        recorder.on_write("alice", 100);
        recorder.on_write("alice", 50);
        recorder.on_write("bob", 7);
        recorder.flush().await;

        let alice = recorder.stats("alice").unwrap();
        assert_eq!(alice.bytes_written, 150);
        assert_eq!(alice.writes, 2);
        assert_eq!(recorder.stats("bob").unwrap().bytes_written, 7);
        assert_eq!(recorder.total_bytes(), 157);
        assert_eq!(recorder.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_on_write_never_blocks() {
        let (recorder, _task) = TrafficRecorder::spawn();
        for _ in 0..10_000 {
            recorder.on_write("bulk", 1);
        }
        recorder.flush().await;
        assert_eq!(recorder.stats("bulk").unwrap().writes, 10_000);
    }

    #[tokio::test]
    async fn test_task_ends_when_dropped() {
        let (recorder, task) = TrafficRecorder::spawn();
        drop(recorder);
        task.await.unwrap();
    }
}

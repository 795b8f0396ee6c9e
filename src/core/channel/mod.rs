// src/core/channel/mod.rs

//! The channel/log registry: named append-only event streams.
//!
//! Each channel is backed by an in-memory [`EventLog`] that retains every
//! appended event and feeds live subscribers through a broadcast channel.
//! Durable storage engines live behind the same surface and are out of scope
//! here.

pub mod durable;

pub use durable::DurableRegistry;

use crate::core::errors::LogBusError;
use crate::core::protocol::Document;
use async_stream::stream;
use dashmap::DashMap;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use tracing::{debug, warn};

/// The capacity of each channel's live broadcast feed.
const LIVE_FEED_CAPACITY: usize = 128;

/// One persisted event: sequence number, append timestamp (millis since the
/// epoch) and the event document itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub timestamp: i64,
    pub body: Document,
}

/// An append-only event log for a single channel.
#[derive(Debug)]
pub struct EventLog {
    name: String,
    retained: RwLock<Vec<Arc<Event>>>,
    live_tx: Sender<Arc<Event>>,
}

impl EventLog {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            retained: RwLock::new(Vec::new()),
            live_tx: broadcast::channel(LIVE_FEED_CAPACITY).0,
        }
    }

    /// Appends an event, assigning the next sequence number. The live feed is
    /// notified under the retention lock so subscribers never observe a gap
    /// between backlog and live delivery.
    pub fn append(&self, body: Document) -> u64 {
        let mut retained = self.retained.write();
        let event = Arc::new(Event {
            seq: retained.len() as u64,
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        });
        let seq = event.seq;
        retained.push(event.clone());
        // No live subscribers is fine.
        let _ = self.live_tx.send(event);
        seq
    }

    /// The sequence number the next appended event will get.
    pub fn next_seq(&self) -> u64 {
        self.retained.read().len() as u64
    }

    /// Returns the backlog from `start_seq` onward together with a live
    /// receiver created under the same lock, so every event is observed
    /// exactly once across the two.
    pub fn subscribe_from(&self, start_seq: u64) -> (Vec<Arc<Event>>, Receiver<Arc<Event>>) {
        let retained = self.retained.read();
        let rx = self.live_tx.subscribe();
        let start = (start_seq as usize).min(retained.len());
        (retained[start..].to_vec(), rx)
    }

    /// The sequence number of the first event at or after `timestamp`.
    /// Timestamps are non-decreasing in append order.
    pub fn first_seq_at_or_after(&self, timestamp: i64) -> u64 {
        let retained = self.retained.read();
        retained.partition_point(|ev| ev.timestamp < timestamp) as u64
    }

    /// A gap-free, unbounded stream of events starting at `start_seq`:
    /// backlog replay followed by the live feed. A subscriber that lags the
    /// live feed's buffer is resynced from the retained log rather than
    /// dropping events.
    pub fn stream_from(self: Arc<Self>, start_seq: u64) -> BoxStream<'static, Arc<Event>> {
        Box::pin(stream! {
            let mut next_seq = start_seq;
            'resync: loop {
                let (backlog, mut rx) = self.subscribe_from(next_seq);
                for event in backlog {
                    next_seq = event.seq + 1;
                    yield event;
                }
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            // Anything below next_seq was already replayed.
                            if event.seq < next_seq {
                                continue;
                            }
                            next_seq = event.seq + 1;
                            yield event;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                "Subscriber lagged {missed} events on channel '{}'; resyncing from the log",
                                self.name
                            );
                            continue 'resync;
                        }
                        Err(RecvError::Closed) => break 'resync,
                    }
                }
            }
        })
    }
}

/// The registry of channels, shared across all connections.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<EventLog>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resolves a channel name to its log handle, or `None` if the channel
    /// does not exist.
    pub fn get_log(&self, name: &str) -> Option<Arc<EventLog>> {
        self.channels.get(name).map(|entry| entry.value().clone())
    }

    /// Creates the channel if absent. Returns `true` if it was created,
    /// `false` if it already existed.
    pub async fn create_channel(&self, name: &str) -> Result<bool, LogBusError> {
        let mut created = false;
        self.channels.entry(name.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(EventLog::new(name))
        });
        if created {
            debug!("Created channel '{name}'");
        }
        Ok(created)
    }

    pub fn list_channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Appends an event to a resolved log, returning its sequence number.
    pub async fn publish(&self, log: &EventLog, event: Document) -> Result<u64, LogBusError> {
        Ok(log.append(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::DocumentExt;

    fn doc(n: i64) -> Document {
        let mut d = Document::new();
        d.insert("n".into(), n.into());
        d
    }

    #[tokio::test]
    async fn create_is_idempotent_and_reports_existence() {
        let registry = ChannelRegistry::new();
        assert!(registry.create_channel("orders").await.unwrap());
        assert!(!registry.create_channel("orders").await.unwrap());
        assert!(registry.get_log("orders").is_some());
        assert!(registry.get_log("payments").is_none());
    }

    #[tokio::test]
    async fn append_assigns_sequential_seqs() {
        let log = EventLog::new("orders");
        assert_eq!(log.append(doc(0)), 0);
        assert_eq!(log.append(doc(1)), 1);
        assert_eq!(log.next_seq(), 2);
    }

    #[tokio::test]
    async fn stream_from_crosses_from_backlog_into_live_delivery() {
        use futures::StreamExt;

        let log = Arc::new(EventLog::new("orders"));
        log.append(doc(0));
        log.append(doc(1));

        let mut events = log.clone().stream_from(0);
        assert_eq!(events.next().await.unwrap().seq, 0);
        assert_eq!(events.next().await.unwrap().seq, 1);

        log.append(doc(2));
        let live = events.next().await.unwrap();
        assert_eq!(live.seq, 2);
        assert_eq!(live.body.get_i64("n"), Some(2));
    }

    #[tokio::test]
    async fn subscribe_from_is_gap_free_across_backlog_and_live() {
        let log = EventLog::new("orders");
        log.append(doc(0));
        log.append(doc(1));

        let (backlog, mut rx) = log.subscribe_from(1);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].seq, 1);

        log.append(doc(2));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.seq, 2);
        assert_eq!(live.body.get_i64("n"), Some(2));
    }
}

// src/core/channel/durable.rs

//! Durable subscription registrations: a durable id maps to the channel it
//! follows and the last sequence number the client acknowledged, so a
//! reconnecting subscriber resumes where it left off.

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct DurableEntry {
    channel: String,
    last_acked_seq: Option<u64>,
}

#[derive(Debug, Default)]
pub struct DurableRegistry {
    entries: DashMap<String, DurableEntry>,
}

impl DurableRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers the durable id if new, or returns the resume position (one
    /// past the last acknowledged event) for an existing registration on the
    /// same channel. A registration reused against a different channel starts
    /// fresh on the new channel.
    pub fn resume_or_register(&self, durable_id: &str, channel: &str) -> Option<u64> {
        let mut resume = None;
        self.entries
            .entry(durable_id.to_string())
            .and_modify(|entry| {
                if entry.channel == channel {
                    resume = entry.last_acked_seq.map(|seq| seq + 1);
                } else {
                    entry.channel = channel.to_string();
                    entry.last_acked_seq = None;
                }
            })
            .or_insert_with(|| DurableEntry {
                channel: channel.to_string(),
                last_acked_seq: None,
            });
        resume
    }

    /// Records the latest client-confirmed delivery point for a durable id.
    pub fn record_ack(&self, durable_id: &str, seq: u64) {
        if let Some(mut entry) = self.entries.get_mut(durable_id) {
            entry.last_acked_seq = Some(entry.last_acked_seq.map_or(seq, |prev| prev.max(seq)));
        }
    }

    /// Drops the registration so a future subscribe with the same durable id
    /// starts fresh.
    pub fn remove(&self, durable_id: &str) {
        self.entries.remove(durable_id);
    }

    pub fn contains(&self, durable_id: &str) -> bool {
        self.entries.contains_key(durable_id)
    }
}

// src/connection/subscription.rs

//! One live or durable channel subscription.
//!
//! A subscription binds a channel's event stream to a connection-scoped
//! delivery window. The delivery pump runs as its own task but never touches
//! connection state: every frame it produces is queued onto the connection's
//! mailbox, and all it shares with the connection is the ack window.

use crate::connection::handler::ConnEvent;
use crate::core::channel::EventLog;
use crate::core::flow::AckWindow;
use crate::core::protocol::{Document, Frame, FrameType, fields, matches_document};
use crate::core::state::ServerState;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The client-supplied shape of a subscribe request.
#[derive(Debug, Clone, Default)]
pub struct SubDescriptor {
    pub channel: String,
    pub start_pos: Option<u64>,
    pub start_timestamp: Option<i64>,
    pub durable_id: Option<String>,
    pub matcher: Option<Document>,
}

/// A live subscription owned by its connection and referenced by id.
pub struct Subscription {
    id: u32,
    durable_id: Option<String>,
    state: Arc<ServerState>,
    window: Arc<AckWindow>,
    pump: JoinHandle<()>,
    closed: bool,
}

impl Subscription {
    /// Creates the subscription and starts its delivery pump.
    ///
    /// Start position precedence: durable resume point, then explicit start
    /// sequence, then start timestamp, then "now" (the next appended event).
    pub(crate) fn spawn(
        state: Arc<ServerState>,
        id: u32,
        descriptor: SubDescriptor,
        log: Arc<EventLog>,
        outbound: mpsc::UnboundedSender<ConnEvent>,
    ) -> Self {
        let window = Arc::new(AckWindow::new(state.config.max_unacked_bytes));
        let resume = descriptor
            .durable_id
            .as_deref()
            .and_then(|durable| state.durables.resume_or_register(durable, &descriptor.channel));
        let start_seq = resume
            .or(descriptor.start_pos)
            .or_else(|| {
                descriptor
                    .start_timestamp
                    .map(|ts| log.first_seq_at_or_after(ts))
            })
            .unwrap_or_else(|| log.next_seq());

        debug!(
            "Subscription {id} on channel '{}' starting at seq {start_seq}",
            descriptor.channel
        );
        let pump = tokio::spawn(run_pump(
            log,
            start_seq,
            id,
            descriptor.matcher.clone(),
            window.clone(),
            outbound,
        ));

        Self {
            id,
            durable_id: descriptor.durable_id,
            state,
            window,
            pump,
            closed: false,
        }
    }

    /// Advances the acknowledgment state: shrinks the unacknowledged-byte
    /// window and records `pos` as the last client-confirmed delivery point
    /// for durable registrations.
    pub fn handle_ack_ev(&self, pos: u64, bytes: u64) {
        self.window.ack(bytes);
        if let Some(durable) = &self.durable_id {
            self.state.durables.record_ack(durable, pos);
        }
    }

    /// Stops future delivery pushes. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.pump.abort();
        self.closed = true;
        debug!("Subscription {} closed", self.id);
    }

    /// Closes and additionally releases the durable registration, so a
    /// future subscribe with the same durable id starts fresh.
    pub fn unsubscribe(&mut self) {
        self.close();
        if let Some(durable) = self.durable_id.take() {
            self.state.durables.remove(&durable);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Bulk teardown drops subscriptions without calling close().
        if !self.closed {
            self.pump.abort();
        }
    }
}

/// The delivery pump: replays backlog, follows the live feed, applies the
/// matcher, and pauses whenever the ack window is full.
async fn run_pump(
    log: Arc<EventLog>,
    start_seq: u64,
    sub_id: u32,
    matcher: Option<Document>,
    window: Arc<AckWindow>,
    outbound: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut events = log.stream_from(start_seq);
    while let Some(event) = events.next().await {
        if let Some(matcher) = &matcher
            && !matches_document(matcher, &event.body)
        {
            continue;
        }

        let mut body = Document::new();
        body.insert(fields::SUB_ID.into(), sub_id.into());
        body.insert(fields::POS.into(), event.seq.into());
        body.insert(fields::TIMESTAMP.into(), event.timestamp.into());
        body.insert(fields::EVENT.into(), Value::Object(event.body.clone()));
        let frame = Frame::new(FrameType::Recv, body);

        let size = match frame.encode_to_vec() {
            Ok(bytes) => bytes.len() as u64,
            Err(e) => {
                warn!("Failed to encode delivery for subscription {sub_id}: {e}");
                break;
            }
        };

        // Never push past the ceiling; the ack handler wakes us.
        window.wait_capacity().await;
        window.add(size);
        if outbound.send(ConnEvent::Write(frame)).is_err() {
            // Connection mailbox is gone; the connection has closed.
            break;
        }
    }
}

// src/connection/query.rs

//! One in-flight streaming query execution.
//!
//! The producer task drives the query's result stream, pacing emission
//! through the ack window exactly like subscription delivery. The final
//! result frame carries `last = true` exactly once; after sending it, the
//! producer asks the connection (via its mailbox) to drop this execution
//! from the query table.

use crate::connection::handler::ConnEvent;
use crate::core::LogBusError;
use crate::core::cqrs::QueryHandler;
use crate::core::flow::AckWindow;
use crate::core::protocol::{Document, ErrCode, Frame, FrameType, fields};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A streaming query execution owned by its connection and referenced by the
/// client-supplied query id.
pub struct QueryExecution {
    query_id: i64,
    /// Distinguishes this execution from any earlier one under the same
    /// reused query id, so a completion raced out of a replaced execution
    /// cannot tear down its replacement.
    generation: u64,
    window: Arc<AckWindow>,
    producer: JoinHandle<()>,
    closed: bool,
}

impl QueryExecution {
    /// Creates the execution and starts producing results immediately.
    pub(crate) fn spawn(
        query: Arc<dyn QueryHandler>,
        params: Document,
        query_id: i64,
        generation: u64,
        max_unacked_bytes: u64,
        outbound: mpsc::UnboundedSender<ConnEvent>,
    ) -> Self {
        let window = Arc::new(AckWindow::new(max_unacked_bytes));
        let producer = tokio::spawn(run_producer(
            query,
            params,
            query_id,
            generation,
            window.clone(),
            outbound,
        ));
        Self {
            query_id,
            generation,
            window,
            producer,
            closed: false,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Shrinks the unacknowledged-byte window, resuming a paused producer.
    pub fn handle_ack(&self, bytes: u64) {
        self.window.ack(bytes);
    }

    /// Aborts streaming and releases the producer. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.producer.abort();
        self.closed = true;
        debug!("Query execution {} closed", self.query_id);
    }
}

impl Drop for QueryExecution {
    fn drop(&mut self) {
        if !self.closed {
            self.producer.abort();
        }
    }
}

/// Builds a successful result frame for one query result document.
pub(crate) fn query_result_frame(query_id: i64, result: Document, last: bool) -> Frame {
    let mut body = Document::new();
    body.insert(fields::OK.into(), true.into());
    body.insert(fields::QUERY_ID.into(), query_id.into());
    body.insert(fields::RESULT.into(), serde_json::Value::Object(result));
    body.insert(fields::LAST.into(), last.into());
    Frame::new(FrameType::QueryResult, body)
}

/// Builds a terminal error result frame for a query id.
pub(crate) fn query_error_frame(query_id: i64, code: ErrCode, msg: &str) -> Frame {
    let mut body = Document::new();
    body.insert(fields::OK.into(), false.into());
    body.insert(fields::QUERY_ID.into(), query_id.into());
    body.insert(fields::LAST.into(), true.into());
    body.insert(fields::ERR_CODE.into(), code.as_i64().into());
    body.insert(fields::ERR_MSG.into(), msg.into());
    Frame::new(FrameType::QueryResult, body)
}

/// Drives the result stream to completion. Buffers one document so the final
/// one can be marked `last`; an empty result set still produces exactly one
/// `last = true` frame with an empty document.
async fn run_producer(
    query: Arc<dyn QueryHandler>,
    params: Document,
    query_id: i64,
    generation: u64,
    window: Arc<AckWindow>,
    outbound: mpsc::UnboundedSender<ConnEvent>,
) {
    use futures::StreamExt;

    let mut results = query.run(params);
    let mut pending: Option<Document> = None;

    while let Some(item) = results.next().await {
        match item {
            Ok(doc) => {
                if let Some(previous) = pending.replace(doc)
                    && !emit(query_id, previous, false, &window, &outbound).await
                {
                    return;
                }
            }
            Err(e) => {
                warn!("Query {query_id} failed mid-stream: {e}");
                let code = error_code(&e);
                let frame = query_error_frame(query_id, code, &e.to_string());
                let _ = outbound.send(ConnEvent::Write(frame));
                let _ = outbound.send(ConnEvent::QueryFinished {
                    query_id,
                    generation,
                });
                return;
            }
        }
    }

    let final_doc = pending.unwrap_or_default();
    if emit(query_id, final_doc, true, &window, &outbound).await {
        let _ = outbound.send(ConnEvent::QueryFinished {
            query_id,
            generation,
        });
    }
}

fn error_code(e: &LogBusError) -> ErrCode {
    e.code().unwrap_or(ErrCode::ServerError)
}

/// Emits one result frame with ack-window pacing. Returns false when the
/// connection is gone.
async fn emit(
    query_id: i64,
    doc: Document,
    last: bool,
    window: &AckWindow,
    outbound: &mpsc::UnboundedSender<ConnEvent>,
) -> bool {
    let frame = query_result_frame(query_id, doc, last);
    let size = match frame.encode_to_vec() {
        Ok(bytes) => bytes.len() as u64,
        Err(e) => {
            warn!("Failed to encode result for query {query_id}: {e}");
            return false;
        }
    };
    window.wait_capacity().await;
    window.add(size);
    outbound.send(ConnEvent::Write(frame)).is_ok()
}

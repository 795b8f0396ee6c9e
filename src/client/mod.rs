// src/client/mod.rs

//! A thin client for producing events to a logbus server.
//!
//! This is deliberately minimal: connect, authenticate, and publish through
//! [`Producer`] handles. Responses are correlated with requests by the
//! request id echoed back by the server.

mod producer;

pub use producer::Producer;

use crate::core::LogBusError;
use crate::core::auth::credentials;
use crate::core::protocol::{
    Document, DocumentExt, ErrCode, Frame, FrameCodec, FrameType, fields,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// A connection to a logbus server from the producing side.
pub struct ClientConnection {
    outgoing: mpsc::UnboundedSender<Frame>,
    requests: Arc<DashMap<i64, oneshot::Sender<Document>>>,
    pending_connect: Arc<Mutex<Option<oneshot::Sender<Document>>>>,
    next_request_id: AtomicI64,
    next_producer_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Connects to a server and starts the read/write pumps.
    pub async fn connect(addr: &str) -> Result<Self, LogBusError> {
        let socket = TcpStream::connect(addr).await?;
        let framed = Framed::new(socket, FrameCodec);
        let (mut sink, mut stream) = framed.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();
        let requests: Arc<DashMap<i64, oneshot::Sender<Document>>> = Arc::new(DashMap::new());
        let pending_connect: Arc<Mutex<Option<oneshot::Sender<Document>>>> =
            Arc::new(Mutex::new(None));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!("Client write failed: {e}");
                    break;
                }
            }
        });

        let reader = {
            let requests = requests.clone();
            let pending_connect = pending_connect.clone();
            tokio::spawn(async move {
                while let Some(result) = stream.next().await {
                    let frame = match result {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Client read failed: {e}");
                            break;
                        }
                    };
                    match frame.frame_type {
                        FrameType::Response | FrameType::SubResponse => {
                            match frame.body.get_i64(fields::REQUEST_ID) {
                                Some(request_id) => {
                                    if let Some((_, tx)) = requests.remove(&request_id) {
                                        let _ = tx.send(frame.body);
                                    }
                                }
                                // The connect response carries no request id.
                                None => {
                                    if let Some(tx) = pending_connect.lock().await.take() {
                                        let _ = tx.send(frame.body);
                                    }
                                }
                            }
                        }
                        other => {
                            debug!("Client ignoring unexpected {other} frame");
                        }
                    }
                }
            })
        };

        Ok(Self {
            outgoing,
            requests,
            pending_connect,
            next_request_id: AtomicI64::new(0),
            next_producer_id: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    /// Performs the `connect` exchange with the given credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), LogBusError> {
        let (tx, rx) = oneshot::channel();
        *self.pending_connect.lock().await = Some(tx);

        let mut body = Document::new();
        body.insert(
            fields::AUTH_INFO.into(),
            Value::Object(credentials(username, password)),
        );
        self.send(Frame::new(FrameType::Connect, body))?;

        let response = rx.await.map_err(|_| LogBusError::ConnectionClosed)?;
        if response.get_bool(fields::OK) == Some(true) {
            Ok(())
        } else {
            Err(response_error(&response))
        }
    }

    /// Creates a producer bound to a channel.
    pub fn producer(self: &Arc<Self>, channel: &str) -> Producer {
        let id = self.next_producer_id.fetch_add(1, Ordering::Relaxed);
        Producer::new(self.clone(), channel, id)
    }

    /// Publishes one event document to a channel and awaits the ack.
    pub async fn emit(&self, channel: &str, event: Document) -> Result<(), LogBusError> {
        let mut body = Document::new();
        body.insert(fields::CHANNEL.into(), channel.into());
        body.insert(fields::EVENT.into(), Value::Object(event));
        self.request(FrameType::Publish, body).await.map(|_| ())
    }

    /// Sends a request frame with a fresh request id and awaits the
    /// correlated response.
    pub async fn request(
        &self,
        frame_type: FrameType,
        mut body: Document,
    ) -> Result<Document, LogBusError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        body.insert(fields::REQUEST_ID.into(), request_id.into());

        let (tx, rx) = oneshot::channel();
        self.requests.insert(request_id, tx);
        self.send(Frame::new(frame_type, body))?;

        let response = rx.await.map_err(|_| LogBusError::ConnectionClosed)?;
        if response.get_bool(fields::OK) == Some(true) {
            Ok(response)
        } else {
            Err(response_error(&response))
        }
    }

    fn send(&self, frame: Frame) -> Result<(), LogBusError> {
        self.outgoing
            .send(frame)
            .map_err(|_| LogBusError::ConnectionClosed)
    }

    /// Stops the pumps and drops the transport.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Translates an error response body into the matching error value.
fn response_error(body: &Document) -> LogBusError {
    let msg = body.get_str(fields::ERR_MSG).unwrap_or("unknown").to_string();
    match body.get_i64(fields::ERR_CODE).and_then(ErrCode::from_i64) {
        Some(ErrCode::AuthenticationFailed) => LogBusError::AuthenticationFailed,
        Some(ErrCode::AuthorizationFailed) => LogBusError::AuthorizationFailed,
        Some(ErrCode::NotAuthorized) => LogBusError::NotAuthorized,
        Some(ErrCode::NoSuchChannel) => LogBusError::NoSuchChannel(msg),
        Some(ErrCode::NoSuchBinder) => LogBusError::NoSuchBinder(msg),
        Some(ErrCode::NoSuchQuery) => LogBusError::NoSuchQuery(msg),
        Some(ErrCode::ServerError) | None => LogBusError::ServerError(msg),
    }
}

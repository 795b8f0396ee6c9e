// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a client connection.
//!
//! One handler runs per accepted transport session, as one task: the
//! connection's single logical execution context. Incoming frames are
//! dispatched in arrival order; every frame other than `connect` passes the
//! capability gate before its body is interpreted. Frames produced on
//! foreign tasks (subscription pumps, query producers) arrive through the
//! mailbox and are written here, so writes are never interleaved.

use super::context;
use super::guard::ConnectionGuard;
use super::query::{QueryExecution, query_error_frame};
use super::session::SessionState;
use super::subscription::{SubDescriptor, Subscription};
use crate::core::LogBusError;
use crate::core::auth::UnauthorizedUser;
use crate::core::protocol::{
    Document, DocumentExt, ErrCode, Frame, FrameCodec, FrameType, fields,
};
use crate::core::state::ServerState;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Events marshaled onto a connection's execution context from other tasks.
#[derive(Debug)]
pub enum ConnEvent {
    /// An outgoing frame produced on a foreign task; written by the
    /// connection task to preserve write ordering.
    Write(Frame),
    /// A query execution delivered its `last = true` frame and must be
    /// removed from the query table. The generation identifies which
    /// execution finished, since a reused query id replaces its predecessor.
    QueryFinished { query_id: i64, generation: u64 },
}

/// The next step for the connection's main loop to take.
enum NextAction {
    Continue,
    Close,
}

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler<S> {
    framed: Framed<S, FrameCodec>,
    addr: SocketAddr,
    state: Arc<ServerState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
    global_shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ConnectionHandler<S> {
    /// Creates a new `ConnectionHandler` over an accepted transport stream.
    pub fn new(
        socket: S,
        addr: SocketAddr,
        state: Arc<ServerState>,
        session_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            framed: Framed::new(socket, FrameCodec),
            addr,
            state,
            session_id,
            shutdown_rx,
            global_shutdown_rx,
            session: SessionState::new(),
            events_tx,
            events_rx,
        }
    }

    /// The main event loop for the connection, handling incoming frames,
    /// mailbox events and shutdown signals. The whole loop runs inside this
    /// connection's execution-context scope.
    pub async fn run(&mut self) -> Result<(), LogBusError> {
        let session_id = self.session_id;
        context::scope(session_id, self.run_loop()).await
    }

    async fn run_loop(&mut self) -> Result<(), LogBusError> {
        let _guard = ConnectionGuard::new(self.state.clone(), self.session_id, self.addr);

        'main_loop: loop {
            tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    info!("Connection handler for {} received global shutdown signal.", self.addr);
                    break 'main_loop;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Connection handler for {} received kill signal.", self.addr);
                    break 'main_loop;
                }
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.process_event(event).await {
                        warn!("Connection error for {}: {}", self.addr, e);
                        break 'main_loop;
                    }
                }
                result = self.framed.next() => {
                    match result {
                        Some(Ok(frame)) => {
                            debug!("Session {}: Received frame: {:?}", self.session_id, frame.frame_type);
                            match self.dispatch(frame).await {
                                Ok(NextAction::Continue) => {}
                                Ok(NextAction::Close) => break 'main_loop,
                                Err(e) => {
                                    warn!("Connection error for {}: {}", self.addr, e);
                                    break 'main_loop;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection from {} closed by peer: {}", self.addr, e);
                            } else {
                                warn!("Connection error for {}: {}", self.addr, e);
                            }
                            break 'main_loop;
                        }
                        None => {
                            debug!("Connection from {} closed by peer.", self.addr);
                            break 'main_loop;
                        }
                    }
                }
            }
        }

        self.close().await;
        Ok(())
    }

    /// Applies an event marshaled from a foreign task onto this context.
    async fn process_event(&mut self, event: ConnEvent) -> Result<(), LogBusError> {
        context::assert_context(self.session_id);
        match event {
            ConnEvent::Write(frame) => self.framed.send(frame).await,
            ConnEvent::QueryFinished {
                query_id,
                generation,
            } => {
                if self.session.finish_query(query_id, generation) {
                    debug!(
                        "Session {}: query {} completed and was removed",
                        self.session_id, query_id
                    );
                }
                Ok(())
            }
        }
    }

    /// Routes a decoded frame to its handler, gating everything except
    /// `connect` on an authorization check for the current user. The frame
    /// body is not interpreted while the check is pending.
    async fn dispatch(&mut self, frame: Frame) -> Result<NextAction, LogBusError> {
        context::assert_context(self.session_id);
        if self.session.closed {
            return Ok(NextAction::Close);
        }

        let frame_type = frame.frame_type;
        if frame_type == FrameType::Connect {
            return self.handle_connect(frame.body).await;
        }

        let request_id = frame.body.get_i64(fields::REQUEST_ID);
        let operation = frame_type.to_string();
        let user = self.session.user.clone();
        match user.is_authorized(&operation).await {
            Ok(true) => {}
            Ok(false) => {
                // Authorization failure is always connection-fatal.
                self.send_error(ErrCode::NotAuthorized, "User is not authorised", request_id)
                    .await?;
                warn!(
                    "User '{}' is not authorised for '{}'; connection will be closed",
                    user.username(),
                    operation
                );
                return Ok(NextAction::Close);
            }
            Err(e) => {
                self.send_error(
                    ErrCode::AuthorizationFailed,
                    "Authorisation failed",
                    request_id,
                )
                .await?;
                warn!("Authorisation check failed: {e}; connection will be closed");
                return Ok(NextAction::Close);
            }
        }

        match frame_type {
            FrameType::Publish => self.handle_publish(frame.body).await,
            FrameType::Subscribe => self.handle_subscribe(frame.body).await,
            FrameType::SubClose => self.handle_sub_close(frame.body, false).await,
            FrameType::Unsubscribe => self.handle_sub_close(frame.body, true).await,
            FrameType::AckEv => self.handle_ack_ev(frame.body).await,
            FrameType::Query => self.handle_query(frame.body).await,
            FrameType::QueryAck => self.handle_query_ack(frame.body).await,
            FrameType::FindById => self.handle_find_by_id(frame.body).await,
            FrameType::Command => self.handle_command(frame.body).await,
            FrameType::ListBinders => self.handle_list_binders(frame.body).await,
            FrameType::ListChannels => self.handle_list_channels(frame.body).await,
            FrameType::CreateBinder => self.handle_create_binder(frame.body).await,
            FrameType::CreateChannel => self.handle_create_channel(frame.body).await,
            // Authorization-checked no-ops: ping keeps the connection warm;
            // transactions are a stub surface with no semantics yet.
            FrameType::Ping
            | FrameType::StartTx
            | FrameType::CommitTx
            | FrameType::AbortTx => Ok(NextAction::Continue),
            FrameType::Connect => unreachable!("connect is handled before the capability gate"),
            FrameType::Response
            | FrameType::SubResponse
            | FrameType::Recv
            | FrameType::QueryResult => {
                warn!(
                    "Protocol error: client sent server frame {frame_type}; connection will be closed"
                );
                Ok(NextAction::Close)
            }
        }
    }

    async fn handle_connect(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(auth_info) = body.get_document(fields::AUTH_INFO) else {
            return Ok(self.missing_field(fields::AUTH_INFO, FrameType::Connect));
        };

        match self.state.auth.authenticate(auth_info).await {
            Ok(Some(user)) => {
                info!(
                    "Session {}: user '{}' authenticated",
                    self.session_id,
                    user.username()
                );
                self.session.user = user;
                let mut resp = Document::new();
                resp.insert(fields::OK.into(), true.into());
                self.send_response(resp).await?;
                Ok(NextAction::Continue)
            }
            Ok(None) => {
                // Broken provider contract: success with no user. Surface it
                // loudly and tear the connection down.
                error!("AuthProvider returned success with no user; connection will be closed");
                Err(LogBusError::Internal(
                    "AuthProvider returned success with no user".into(),
                ))
            }
            Err(e) => {
                self.send_error(ErrCode::AuthenticationFailed, "Authentication failed", None)
                    .await?;
                warn!("Authentication failed: {e}; connection will be closed");
                Ok(NextAction::Close)
            }
        }
    }

    async fn handle_publish(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(channel) = body.get_str(fields::CHANNEL) else {
            return Ok(self.missing_field(fields::CHANNEL, FrameType::Publish));
        };
        let Some(event) = body.get_document(fields::EVENT) else {
            return Ok(self.missing_field(fields::EVENT, FrameType::Publish));
        };
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::Publish));
        };

        let Some(log) = self.state.channels.get_log(channel) else {
            self.send_error(
                ErrCode::NoSuchChannel,
                &format!("no such channel {channel}"),
                Some(request_id),
            )
            .await?;
            return Ok(NextAction::Continue);
        };

        match self.state.channels.publish(&log, event.clone()).await {
            Ok(seq) => {
                debug!(
                    "Session {}: published seq {seq} to channel '{channel}'",
                    self.session_id
                );
                self.send_ok_response(request_id).await?;
            }
            Err(e) => {
                warn!("Publish to '{channel}' failed: {e}");
                self.send_error(ErrCode::ServerError, "failed to persist", Some(request_id))
                    .await?;
            }
        }
        Ok(NextAction::Continue)
    }

    async fn handle_subscribe(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(channel) = body.get_str(fields::CHANNEL) else {
            return Ok(self.missing_field(fields::CHANNEL, FrameType::Subscribe));
        };
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::Subscribe));
        };

        let descriptor = SubDescriptor {
            channel: channel.to_string(),
            start_pos: body.get_u64(fields::START_POS),
            start_timestamp: body.get_i64(fields::START_TIMESTAMP),
            durable_id: body.get_str(fields::DURABLE_ID).map(str::to_string),
            matcher: body.get_document(fields::MATCHER).cloned(),
        };

        // An unknown channel is an application error; no subscription is
        // registered for it.
        let Some(log) = self.state.channels.get_log(channel) else {
            self.send_error(
                ErrCode::NoSuchChannel,
                &format!("no such channel {channel}"),
                Some(request_id),
            )
            .await?;
            return Ok(NextAction::Continue);
        };

        let sub_id = match self.session.next_sub_id() {
            Ok(id) => id,
            Err(e) => {
                error!("{e}; connection will be closed");
                return Ok(NextAction::Close);
            }
        };

        let subscription = Subscription::spawn(
            self.state.clone(),
            sub_id,
            descriptor,
            log,
            self.events_tx.clone(),
        );
        self.session.subscriptions.insert(sub_id, subscription);

        let mut resp = Document::new();
        resp.insert(fields::REQUEST_ID.into(), request_id.into());
        resp.insert(fields::OK.into(), true.into());
        resp.insert(fields::SUB_ID.into(), sub_id.into());
        self.framed
            .send(Frame::new(FrameType::SubResponse, resp))
            .await?;
        debug!(
            "Session {}: subscribed to channel '{channel}' as sub {sub_id}",
            self.session_id
        );
        Ok(NextAction::Continue)
    }

    /// Shared body of `sub_close` and `unsubscribe`; the latter additionally
    /// releases the durable registration.
    async fn handle_sub_close(
        &mut self,
        body: Document,
        release_durable: bool,
    ) -> Result<NextAction, LogBusError> {
        let frame_type = if release_durable {
            FrameType::Unsubscribe
        } else {
            FrameType::SubClose
        };
        let Some(sub_id) = body.get_u64(fields::SUB_ID) else {
            return Ok(self.missing_field(fields::SUB_ID, frame_type));
        };
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, frame_type));
        };

        let Some(mut subscription) = self.session.subscriptions.remove(&(sub_id as u32)) else {
            return Ok(self.invalid_field(fields::SUB_ID, frame_type));
        };
        if release_durable {
            subscription.unsubscribe();
        } else {
            subscription.close();
        }
        self.send_ok_response(request_id).await?;
        Ok(NextAction::Continue)
    }

    async fn handle_ack_ev(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(sub_id) = body.get_u64(fields::SUB_ID) else {
            return Ok(self.missing_field(fields::SUB_ID, FrameType::AckEv));
        };
        let Some(bytes) = body.get_u64(fields::BYTES) else {
            return Ok(self.missing_field(fields::BYTES, FrameType::AckEv));
        };
        let Some(pos) = body.get_u64(fields::POS) else {
            return Ok(self.missing_field(fields::POS, FrameType::AckEv));
        };

        let Some(subscription) = self.session.subscriptions.get(&(sub_id as u32)) else {
            return Ok(self.invalid_field(fields::SUB_ID, FrameType::AckEv));
        };
        subscription.handle_ack_ev(pos, bytes);
        // Acknowledgments carry no response frame.
        Ok(NextAction::Continue)
    }

    async fn handle_query(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(query_id) = body.get_i64(fields::QUERY_ID) else {
            return Ok(self.missing_field(fields::QUERY_ID, FrameType::Query));
        };
        let Some(query_name) = body.get_str(fields::QUERY_NAME) else {
            return Ok(self.missing_field(fields::QUERY_NAME, FrameType::Query));
        };
        let Some(params) = body.get_document(fields::QUERY_PARAMS) else {
            return Ok(self.missing_field(fields::QUERY_PARAMS, FrameType::Query));
        };

        let Some(query) = self.state.cqrs.get_query(query_name) else {
            let frame = query_error_frame(
                query_id,
                ErrCode::NoSuchQuery,
                &format!("No such query {query_name}"),
            );
            self.framed.send(frame).await?;
            return Ok(NextAction::Continue);
        };

        let execution = QueryExecution::spawn(
            query,
            params.clone(),
            query_id,
            self.session.next_query_generation(),
            self.state.config.max_unacked_bytes,
            self.events_tx.clone(),
        );
        // A reused query id replaces (and aborts) the previous execution.
        self.session.queries.insert(query_id, execution);
        Ok(NextAction::Continue)
    }

    async fn handle_query_ack(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(query_id) = body.get_i64(fields::QUERY_ID) else {
            return Ok(self.missing_field(fields::QUERY_ID, FrameType::QueryAck));
        };
        let Some(bytes) = body.get_u64(fields::BYTES) else {
            return Ok(self.missing_field(fields::BYTES, FrameType::QueryAck));
        };

        // An unknown id is not an error: the execution may have completed
        // while this ack was in flight.
        if let Some(execution) = self.session.queries.get(&query_id) {
            execution.handle_ack(bytes);
        }
        Ok(NextAction::Continue)
    }

    async fn handle_find_by_id(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::FindById));
        };
        let Some(doc_id) = body.get_str(fields::DOC_ID) else {
            return Ok(self.missing_field(fields::DOC_ID, FrameType::FindById));
        };
        let Some(binder_name) = body.get_str(fields::BINDER) else {
            return Ok(self.missing_field(fields::BINDER, FrameType::FindById));
        };

        let Some(binder) = self.state.binders.get_binder(binder_name) else {
            self.send_error(
                ErrCode::NoSuchBinder,
                &format!("No such binder {binder_name}"),
                Some(request_id),
            )
            .await?;
            return Ok(NextAction::Continue);
        };

        match binder.get(doc_id).await {
            Ok(found) => {
                let mut resp = Document::new();
                resp.insert(fields::OK.into(), true.into());
                resp.insert(fields::REQUEST_ID.into(), request_id.into());
                // A missing document is represented by an absent result field.
                if let Some(doc) = found {
                    resp.insert(fields::RESULT.into(), Value::Object(doc));
                }
                self.send_response(resp).await?;
            }
            Err(e) => {
                warn!("find_by_id on binder '{binder_name}' failed: {e}");
                self.send_error(ErrCode::ServerError, "failed to fetch", Some(request_id))
                    .await?;
            }
        }
        Ok(NextAction::Continue)
    }

    async fn handle_command(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(command_name) = body.get_str(fields::COMMAND_NAME) else {
            return Ok(self.missing_field(fields::COMMAND_NAME, FrameType::Command));
        };
        let Some(command) = body.get_document(fields::COMMAND) else {
            return Ok(self.missing_field(fields::COMMAND, FrameType::Command));
        };
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::Command));
        };

        let name = command_name.to_string();
        match self
            .state
            .cqrs
            .call_command_handler(&name, command.clone())
            .await
        {
            Ok(()) => self.send_ok_response(request_id).await?,
            Err(e) => {
                warn!("Command '{name}' dispatch failed: {e}");
                self.send_error(ErrCode::ServerError, "command failed", Some(request_id))
                    .await?;
            }
        }
        Ok(NextAction::Continue)
    }

    async fn handle_list_binders(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::ListBinders));
        };
        let names = self.state.binders.list_binders();
        let mut resp = Document::new();
        resp.insert(fields::REQUEST_ID.into(), request_id.into());
        resp.insert(fields::OK.into(), true.into());
        resp.insert(fields::BINDERS.into(), names.into());
        self.send_response(resp).await?;
        Ok(NextAction::Continue)
    }

    async fn handle_list_channels(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::ListChannels));
        };
        let names = self.state.channels.list_channels();
        let mut resp = Document::new();
        resp.insert(fields::REQUEST_ID.into(), request_id.into());
        resp.insert(fields::OK.into(), true.into());
        resp.insert(fields::CHANNELS.into(), names.into());
        self.send_response(resp).await?;
        Ok(NextAction::Continue)
    }

    async fn handle_create_binder(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::CreateBinder));
        };
        let Some(name) = body.get_str(fields::NAME) else {
            return Ok(self.missing_field(fields::NAME, FrameType::CreateBinder));
        };

        match self.state.binders.create_binder(name).await {
            Ok(created) => {
                self.send_created_response(request_id, created).await?;
            }
            Err(e) => {
                warn!("create_binder '{name}' failed: {e}");
                self.send_error(
                    ErrCode::ServerError,
                    "failed to create binder",
                    Some(request_id),
                )
                .await?;
            }
        }
        Ok(NextAction::Continue)
    }

    async fn handle_create_channel(&mut self, body: Document) -> Result<NextAction, LogBusError> {
        let Some(request_id) = body.get_i64(fields::REQUEST_ID) else {
            return Ok(self.missing_field(fields::REQUEST_ID, FrameType::CreateChannel));
        };
        let Some(name) = body.get_str(fields::NAME) else {
            return Ok(self.missing_field(fields::NAME, FrameType::CreateChannel));
        };

        match self.state.channels.create_channel(name).await {
            Ok(created) => {
                self.send_created_response(request_id, created).await?;
            }
            Err(e) => {
                warn!("create_channel '{name}' failed: {e}");
                self.send_error(
                    ErrCode::ServerError,
                    "failed to create channel",
                    Some(request_id),
                )
                .await?;
            }
        }
        Ok(NextAction::Continue)
    }

    /// Closes the connection: resets the user to the unauthorized sentinel,
    /// tears down every query execution and subscription, and closes the
    /// transport. Idempotent.
    async fn close(&mut self) {
        context::assert_context(self.session_id);
        if self.session.closed {
            return;
        }

        self.session.user = Arc::new(UnauthorizedUser);
        for (_, mut query) in self.session.queries.drain() {
            query.close();
        }
        for (_, mut subscription) in self.session.subscriptions.drain() {
            subscription.close();
        }
        self.session.closed = true;
        let _ = self.framed.close().await;
        debug!("Connection {} closed", self.addr);
    }

    // --- Response helpers ---

    async fn send_response(&mut self, body: Document) -> Result<(), LogBusError> {
        self.framed.send(Frame::new(FrameType::Response, body)).await
    }

    async fn send_ok_response(&mut self, request_id: i64) -> Result<(), LogBusError> {
        let mut resp = Document::new();
        resp.insert(fields::REQUEST_ID.into(), request_id.into());
        resp.insert(fields::OK.into(), true.into());
        self.send_response(resp).await
    }

    async fn send_created_response(
        &mut self,
        request_id: i64,
        created: bool,
    ) -> Result<(), LogBusError> {
        let mut resp = Document::new();
        resp.insert(fields::REQUEST_ID.into(), request_id.into());
        resp.insert(fields::OK.into(), true.into());
        resp.insert(fields::ALREADY_EXISTS.into(), (!created).into());
        self.send_response(resp).await
    }

    async fn send_error(
        &mut self,
        code: ErrCode,
        msg: &str,
        request_id: Option<i64>,
    ) -> Result<(), LogBusError> {
        let mut resp = Document::new();
        if let Some(request_id) = request_id {
            resp.insert(fields::REQUEST_ID.into(), request_id.into());
        }
        resp.insert(fields::OK.into(), false.into());
        resp.insert(fields::ERR_CODE.into(), code.as_i64().into());
        resp.insert(fields::ERR_MSG.into(), msg.into());
        self.send_response(resp).await
    }

    /// A missing required field is a protocol error: logged, never answered,
    /// and connection-fatal.
    fn missing_field(&self, field: &'static str, frame: FrameType) -> NextAction {
        warn!("Protocol error: missing {field} in {frame}. connection will be closed");
        NextAction::Close
    }

    /// An invalid field value (e.g. an unknown subscription id) is treated
    /// the same way as a missing one.
    fn invalid_field(&self, field: &'static str, frame: FrameType) -> NextAction {
        warn!("Protocol error: invalid {field} in {frame}. connection will be closed");
        NextAction::Close
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &LogBusError) -> bool {
    matches!(e, LogBusError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}

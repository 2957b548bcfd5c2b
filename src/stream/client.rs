//! Flow websocket client: session lifecycle, heartbeats and reconnects.
//!
//! [`FlowClient::connect`] acquires a session and spawns a background worker
//! that owns the socket, the subscription registry and the search correlator.
//! Callers talk to the worker through a cloneable [`FlowApi`] handle; commands
//! issued before the socket is open are queued and released in call order.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::retry::ReconnectPolicy;
use crate::session_api::{
    Credentials, CredentialsError, SessionApiClient, SessionApiClientOptions, SessionApiError,
    SessionId,
};
use crate::stream::correlator::{MessageCorrelator, SearchError, SearchResult};
use crate::stream::proto::{ClientMessage, FindOptions, InboundFrame};
use crate::stream::registry::{Listener, SubscriptionRegistry};

/// Production websocket base URL for the flow service.
pub const FLOW_WS_BASE_URL: &str = "wss://ws.flowthings.io";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowDefaults;

impl FlowDefaults {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
    pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
}

#[derive(Clone, Debug)]
pub struct FlowClientOptions {
    /// Period between heartbeat frames on an open socket.
    pub heartbeat_interval: Duration,
    /// Deadline for a search reply. `None` waits forever.
    pub search_timeout: Option<Duration>,
    /// How often pending searches are checked against their deadline.
    pub sweep_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Re-sends a subscribe frame for every registered flow after a reconnect.
    ///
    /// Off by default: listeners survive a reconnect but the new socket is not
    /// told about them.
    pub resubscribe_on_reconnect: bool,
    pub session_api: SessionApiClientOptions,
}

impl FlowClientOptions {
    /// Rejects settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), FlowClientError> {
        if self.heartbeat_interval.is_zero() {
            return Err(FlowClientError::InvalidOption("heartbeat_interval"));
        }
        if self.sweep_interval.is_zero() {
            return Err(FlowClientError::InvalidOption("sweep_interval"));
        }
        Ok(())
    }
}

impl Default for FlowClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: FlowDefaults::HEARTBEAT_INTERVAL,
            search_timeout: Some(FlowDefaults::SEARCH_TIMEOUT),
            sweep_interval: FlowDefaults::SWEEP_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            resubscribe_on_reconnect: false,
            session_api: SessionApiClientOptions::default(),
        }
    }
}

/// Entry point for creating flow connections.
///
/// Every [`FlowClient::connect`] call yields an independent connection with
/// its own socket, registry and counters.
#[derive(Clone, Debug)]
pub struct FlowClient {
    session_api: SessionApiClient,
    ws_base_url: String,
    options: FlowClientOptions,
}

impl FlowClient {
    pub fn new() -> Result<Self, FlowClientError> {
        Self::with_options(FlowClientOptions::default())
    }

    pub fn with_options(options: FlowClientOptions) -> Result<Self, FlowClientError> {
        options.validate()?;
        let session_api = SessionApiClient::with_options(options.session_api.clone())?;
        Ok(Self {
            session_api,
            ws_base_url: FLOW_WS_BASE_URL.to_string(),
            options,
        })
    }

    /// Points the client at another deployment.
    ///
    /// `api_base_url` serves `POST /session`, `ws_base_url` serves
    /// `/session/<id>/ws`.
    pub fn with_endpoint(
        mut self,
        api_base_url: impl Into<String>,
        ws_base_url: impl Into<String>,
    ) -> Self {
        self.session_api = self.session_api.with_base_url(api_base_url);
        self.ws_base_url = ws_base_url.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn api_base_url(&self) -> &str {
        self.session_api.base_url()
    }

    pub fn ws_base_url(&self) -> &str {
        &self.ws_base_url
    }

    /// Acquires a session and starts the connection worker.
    ///
    /// Credential and acquisition failures are returned here. The socket is
    /// opened in the background: this returns as soon as a session id is
    /// known, and [`FlowApi`] operations wait for the socket to open.
    pub async fn connect(
        &self,
        credentials: Credentials,
    ) -> Result<FlowConnection, FlowClientError> {
        credentials.validate()?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Acquiring);
        let session_id = self.session_api.acquire_session(&credentials).await?;
        info!(event = "flow_session_acquired", session_id = %session_id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = ConnectionWorker {
            session_api: self.session_api.clone(),
            credentials,
            ws_base_url: self.ws_base_url.clone(),
            correlator: MessageCorrelator::new(self.options.search_timeout),
            options: self.options.clone(),
            commands: command_rx,
            queued: VecDeque::new(),
            registry: SubscriptionRegistry::new(),
            next_msg_id: 0,
            state: state_tx,
        };
        tokio::spawn(worker.run(session_id));

        Ok(FlowConnection {
            flow: FlowApi {
                tx: command_tx,
                state: state_rx,
            },
        })
    }
}

/// Lifecycle of the connection worker, published through a watch channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Exchanging credentials for a session id.
    Acquiring,
    /// Socket open for `session_id`; outbound traffic flows.
    Open { session_id: SessionId },
    /// Socket closed; a reconnect is pending.
    Disconnected,
    /// Reconnect policy exhausted; the worker has stopped.
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Handle returned by [`FlowClient::connect`].
///
/// Dropping it and every [`FlowApi`] clone closes the socket.
#[derive(Debug)]
pub struct FlowConnection {
    flow: FlowApi,
}

impl FlowConnection {
    /// Returns a cloneable handle for flow operations.
    pub fn flow(&self) -> FlowApi {
        self.flow.clone()
    }

    pub fn into_flow(self) -> FlowApi {
        self.flow
    }

    /// Releases this handle and waits for the worker to stop.
    ///
    /// Commands already sent on an open socket are written before it is
    /// closed; commands queued behind a closed socket are dropped. Resolves
    /// only once every [`FlowApi`] clone is gone too.
    pub async fn shutdown(self) {
        let mut state = self.flow.state.clone();
        drop(self.flow);
        while state.changed().await.is_ok() {}
    }
}

/// Flow operations: subscribe, unsubscribe and search.
///
/// Every operation is queued immediately and performed by the worker once the
/// current socket is open.
#[derive(Clone, Debug)]
pub struct FlowApi {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl FlowApi {
    /// Subscribes to pushes for `flow_id`, replacing any previous listener.
    pub fn subscribe<F>(
        &self,
        flow_id: impl Into<String>,
        listener: F,
    ) -> Result<(), FlowClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.send(Command::Subscribe {
            flow_id: flow_id.into(),
            listener: Arc::new(listener),
        })
    }

    /// Unsubscribes from `flow_id` and drops its listener.
    pub fn unsubscribe(&self, flow_id: impl Into<String>) -> Result<(), FlowClientError> {
        self.send(Command::Unsubscribe {
            flow_id: flow_id.into(),
        })
    }

    /// Searches `flow_id` for drops matching `query`, newest first.
    ///
    /// The returned future resolves with the normalized records of the reply.
    /// The search deadline starts now, even if the socket is not yet open.
    pub fn search(
        &self,
        flow_id: impl Into<String>,
        query: impl Into<String>,
        limit: Option<u64>,
    ) -> SearchHandle {
        let (reply, rx) = oneshot::channel();
        // A closed queue drops `reply`, which the handle reports as closed.
        let _ = self.send(Command::Search {
            flow_id: flow_id.into(),
            options: FindOptions::newest_first(query, limit),
            reply,
            issued_at: Instant::now(),
        });
        SearchHandle { rx }
    }

    /// Waits until the current socket is open.
    pub async fn ready(&self) -> Result<(), FlowClientError> {
        let mut state = self.state.clone();
        let open = state
            .wait_for(|state| {
                !matches!(
                    state,
                    ConnectionState::Acquiring | ConnectionState::Disconnected
                )
            })
            .await
            .map(|state| state.is_open())
            .map_err(|_| FlowClientError::SendQueueClosed)?;

        if open {
            Ok(())
        } else {
            Err(FlowClientError::ConnectionFailed)
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver for connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<(), FlowClientError> {
        self.tx
            .send(command)
            .map_err(|_| FlowClientError::SendQueueClosed)
    }
}

/// Future resolving with the records of one search.
#[derive(Debug)]
pub struct SearchHandle {
    rx: oneshot::Receiver<SearchResult>,
}

impl Future for SearchHandle {
    type Output = SearchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(SearchError::ConnectionClosed)))
    }
}

/// Errors produced by flow transport and session handling.
#[derive(Debug, Error)]
pub enum FlowClientError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("session acquisition failed: {0}")]
    SessionAcquisition(#[from] SessionApiError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection worker has stopped.
    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("reconnect attempts exhausted")]
    ConnectionFailed,

    #[error("invalid option: {0} must be non-zero")]
    InvalidOption(&'static str),
}

enum Command {
    Subscribe {
        flow_id: String,
        listener: Listener,
    },
    Unsubscribe {
        flow_id: String,
    },
    Search {
        flow_id: String,
        options: FindOptions,
        reply: oneshot::Sender<SearchResult>,
        issued_at: Instant,
    },
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

type FlowSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct ConnectionWorker {
    session_api: SessionApiClient,
    credentials: Credentials,
    ws_base_url: String,
    options: FlowClientOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    queued: VecDeque<Command>,
    registry: SubscriptionRegistry,
    correlator: MessageCorrelator,
    next_msg_id: u64,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionWorker {
    async fn run(mut self, initial_session: SessionId) {
        let mut session = Some(initial_session);
        let mut attempt = 0;

        loop {
            let outcome = match session.take() {
                Some(session_id) => self.run_connected_session(&session_id).await,
                None => self.reacquire_and_run().await,
            };

            match outcome {
                Ok(SessionOutcome::GracefulShutdown) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    debug!(event = "flow_worker_shutdown");
                    return;
                }
                Ok(SessionOutcome::Reconnect) => attempt = 0,
                Err(err) => warn!(event = "flow_connect_failed", attempt, error = %err),
            }

            self.state.send_replace(ConnectionState::Disconnected);
            attempt += 1;
            if !self.options.reconnect.allows(attempt) {
                warn!(event = "flow_reconnect_exhausted", attempt);
                self.state.send_replace(ConnectionState::Failed);
                return;
            }

            let delay = self.options.reconnect.delay_for_attempt(attempt);
            info!(
                event = "flow_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64
            );
            if !self.collect_commands_during_delay(delay).await {
                debug!(event = "flow_worker_shutdown");
                return;
            }
        }
    }

    async fn reacquire_and_run(&mut self) -> Result<SessionOutcome, FlowClientError> {
        self.state.send_replace(ConnectionState::Acquiring);
        let session_id = self.session_api.acquire_session(&self.credentials).await?;
        info!(event = "flow_session_acquired", session_id = %session_id);
        self.run_connected_session(&session_id).await
    }

    async fn run_connected_session(
        &mut self,
        session_id: &SessionId,
    ) -> Result<SessionOutcome, FlowClientError> {
        let url = session_socket_url(&self.ws_base_url, session_id);
        let (mut socket, _) = connect_async(url.as_str()).await?;

        self.state.send_replace(ConnectionState::Open {
            session_id: session_id.clone(),
        });
        info!(event = "flow_socket_open", session_id = %session_id);

        let outcome = self.drive_open_socket(&mut socket).await;
        debug!(event = "flow_heartbeat_cancelled", session_id = %session_id);
        outcome
    }

    async fn drive_open_socket(
        &mut self,
        socket: &mut FlowSocket,
    ) -> Result<SessionOutcome, FlowClientError> {
        let period = self.options.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if self.options.resubscribe_on_reconnect {
            for flow_id in self.registry.flow_ids() {
                let frame = ClientMessage::subscribe(self.next_outbound_id(), flow_id);
                if send_client_message(socket, &frame).await.is_err() {
                    return Ok(SessionOutcome::Reconnect);
                }
            }
        }

        while let Some(command) = self.queued.pop_front() {
            if let Err(command) = self.dispatch(socket, command).await {
                self.queued.push_front(command);
                return Ok(SessionOutcome::Reconnect);
            }
        }

        loop {
            tokio::select! {
                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => {
                            if let Err(command) = self.dispatch(socket, command).await {
                                self.queued.push_front(command);
                                return Ok(SessionOutcome::Reconnect);
                            }
                        }
                        None => {
                            let _ = socket.close(None).await;
                            return Ok(SessionOutcome::GracefulShutdown);
                        }
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionOutcome::Reconnect);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(event = "flow_socket_closed", frame = ?frame);
                            return Ok(SessionOutcome::Reconnect);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "flow_socket_error", error = %err);
                            return Ok(SessionOutcome::Reconnect);
                        }
                        None => {
                            info!(event = "flow_socket_closed");
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if send_client_message(socket, &ClientMessage::Heartbeat).await.is_err() {
                        return Ok(SessionOutcome::Reconnect);
                    }
                }
                _ = sweep.tick() => self.sweep_expired_searches(),
            }
        }
    }

    /// Writes one command to the socket and applies its local effect.
    ///
    /// On a failed write the command is handed back so it can be replayed on
    /// the next socket.
    async fn dispatch(
        &mut self,
        socket: &mut FlowSocket,
        command: Command,
    ) -> Result<(), Command> {
        match command {
            Command::Subscribe { flow_id, listener } => {
                let frame = ClientMessage::subscribe(self.next_outbound_id(), flow_id.as_str());
                if send_client_message(socket, &frame).await.is_err() {
                    return Err(Command::Subscribe { flow_id, listener });
                }
                if self.registry.insert(flow_id.as_str(), listener) {
                    debug!(event = "flow_listener_replaced", flow_id = %flow_id);
                }
                Ok(())
            }
            Command::Unsubscribe { flow_id } => {
                let frame = ClientMessage::unsubscribe(self.next_outbound_id(), flow_id.as_str());
                if send_client_message(socket, &frame).await.is_err() {
                    return Err(Command::Unsubscribe { flow_id });
                }
                self.registry.remove(&flow_id);
                Ok(())
            }
            Command::Search {
                flow_id,
                options,
                reply,
                issued_at,
            } => {
                if reply.is_closed() {
                    return Ok(());
                }
                if self.correlator.is_expired(issued_at, Instant::now()) {
                    let msg_id = self.correlator.expire_unsent(reply);
                    warn!(event = "flow_search_timeout", msg_id = %msg_id, sent = false);
                    return Ok(());
                }
                let msg_id = self.correlator.next_msg_id();
                let frame =
                    ClientMessage::find_many(msg_id.as_str(), flow_id.as_str(), options.clone());
                if send_client_message(socket, &frame).await.is_err() {
                    return Err(Command::Search {
                        flow_id,
                        options,
                        reply,
                        issued_at,
                    });
                }
                self.correlator.register(msg_id, reply, issued_at);
                Ok(())
            }
        }
    }

    fn handle_inbound(&mut self, text: &str) {
        match InboundFrame::from_text(text) {
            Ok(InboundFrame::Push { flow_id, value }) => {
                if !self.registry.route(&flow_id, &value) {
                    debug!(event = "flow_push_unrouted", flow_id = %flow_id);
                }
            }
            Ok(InboundFrame::Reply { msg_id, body }) => {
                if !self.correlator.resolve(&msg_id, body) {
                    debug!(event = "flow_reply_unmatched", msg_id = %msg_id);
                }
            }
            Ok(InboundFrame::Other) => {}
            Err(err) => warn!(event = "flow_frame_decode_failed", error = %err),
        }
    }

    /// Times out expired searches, both in flight and still queued.
    fn sweep_expired_searches(&mut self) {
        let now = Instant::now();
        let mut expired = self.correlator.sweep_expired(now);

        for command in std::mem::take(&mut self.queued) {
            match command {
                Command::Search {
                    reply, issued_at, ..
                } if self.correlator.is_expired(issued_at, now) => {
                    self.correlator.expire_unsent(reply);
                    expired += 1;
                }
                command => self.queued.push_back(command),
            }
        }

        if expired > 0 {
            warn!(event = "flow_search_timeout", expired);
        }
    }

    fn next_outbound_id(&mut self) -> u64 {
        self.next_msg_id += 1;
        self.next_msg_id
    }

    /// Buffers commands while waiting out a reconnect delay.
    ///
    /// Returns `false` once every handle is dropped.
    async fn collect_commands_during_delay(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => self.queued.push_back(command),
                        None => return false,
                    }
                }
                _ = sweep.tick() => self.sweep_expired_searches(),
            }
        }
    }
}

fn session_socket_url(ws_base_url: &str, session_id: &SessionId) -> String {
    format!("{ws_base_url}/session/{session_id}/ws")
}

async fn send_client_message<S>(
    socket: &mut S,
    message: &ClientMessage,
) -> Result<(), FlowClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

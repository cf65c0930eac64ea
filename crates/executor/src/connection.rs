//! Duplex connection to the executor, run as a single actor task.
//!
//! The public [`ExecutorConnection`] handle only sends commands; all state
//! (current target, socket, retry counter, reconnect timer) lives in the
//! actor and changes one message at a time. Background tasks (socket open,
//! socket reader, reconnect timer, credential hand-offs) report back through
//! an internal channel tagged with the connection generation they belong
//! to, so anything left over from a torn-down connection is ignored.
//!
//! ```text
//! disconnected → connecting → connected
//!       ↑            ↓ fail       ↓ close
//!       └──── reconnecting ←──────┘   (up to max attempts, fixed delay)
//! ```
use futures_util::{
    SinkExt as _, StreamExt as _,
    stream::{SplitSink, SplitStream},
};
use keyrelay_config::ExecutorConfig;
use keyrelay_types::RelayError;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        client::IntoClientRequest as _,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

use crate::{
    discovery::{RemoteDiscovery, select_target},
    envelope::{Envelope, Inbound, Outbound, parse_inbound},
    events::{ConnectionEvent, ConnectionState},
    handoff::CredentialHandoff,
    target::ConnectionTarget,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const EVENT_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const WAITING_FOR_CREDENTIAL: &str = "waiting for credential";

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub localhost_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ConnectionOptions {
    fn from(c: &ExecutorConfig) -> Self {
        Self {
            localhost_url: c.localhost_url.clone(),
            max_reconnect_attempts: c.max_reconnect_attempts,
            reconnect_delay: c.reconnect_delay(),
            connect_timeout: c.connect_timeout(),
        }
    }
}

enum Command {
    Connect(ConnectionTarget),
    Disconnect,
    SwitchTarget(ConnectionTarget),
    Send(String),
    CredentialChanged,
    Retry,
}

enum Internal {
    Opened {
        generation: u64,
        result: Result<WsStream, String>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
    ReconnectDue {
        generation: u64,
    },
    Reply {
        generation: u64,
        text: String,
    },
}

/// Cloneable handle to the connection actor. The actor stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct ExecutorConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    target: watch::Receiver<Option<ConnectionTarget>>,
    credential: Arc<watch::Sender<Option<String>>>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: broadcast::Sender<Envelope>,
    discovery: Option<Arc<dyn RemoteDiscovery>>,
    localhost_url: String,
}

impl ExecutorConnection {
    /// Start the actor on the current tokio runtime. The connection starts
    /// `Disconnected`; call [`connect`](Self::connect) or
    /// [`auto_connect`](Self::auto_connect) to open it.
    pub fn spawn(
        options: ConnectionOptions,
        handoff: Arc<CredentialHandoff>,
        credential: Option<String>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (target_tx, target) = watch::channel(None);
        let credential = Arc::new(watch::Sender::new(credential));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let localhost_url = options.localhost_url.clone();

        let actor = Actor {
            options,
            handoff,
            credential: credential.subscribe(),
            state_tx,
            target_tx,
            events: events.clone(),
            inbound: inbound.clone(),
            internal_tx,
            generation: 0,
            retry_count: 0,
            writer: None,
            open_task: None,
            reader_task: None,
            timer: None,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Self {
            commands,
            state,
            target,
            credential,
            events,
            inbound,
            discovery: None,
            localhost_url,
        }
    }

    /// Enable remote environment discovery for [`auto_connect`](Self::auto_connect).
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn RemoteDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn target(&self) -> Option<ConnectionTarget> {
        self.target.borrow().clone()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    #[must_use]
    pub fn watch_target(&self) -> watch::Receiver<Option<ConnectionTarget>> {
        self.target.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Inbound envelopes the connection does not handle itself.
    #[must_use]
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    #[must_use]
    pub fn credential(&self) -> Option<String> {
        self.credential.borrow().clone()
    }

    /// Replace the bearer credential. A new credential re-arms a stopped
    /// reconnect machine.
    pub fn set_credential(&self, credential: Option<String>) {
        let changed = self.credential.send_if_modified(|current| {
            if *current == credential {
                false
            } else {
                *current = credential;
                true
            }
        });
        if changed {
            self.command(Command::CredentialChanged);
        }
    }

    pub fn connect(&self, target: ConnectionTarget) {
        self.command(Command::Connect(target));
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn switch_target(&self, target: ConnectionTarget) {
        self.command(Command::SwitchTarget(target));
    }

    /// Manually restart a stopped connection to the last target.
    pub fn retry(&self) {
        self.command(Command::Retry);
    }

    /// Queue `message` for the executor. Dropped with a warning unless connected.
    pub fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(text) => self.command(Command::Send(text)),
            Err(e) => tracing::warn!(error = %e, "outbound envelope not serializable"),
        }
    }

    /// Pick a target and connect to it: the first discovered remote
    /// environment with a duplex endpoint, else localhost.
    pub async fn auto_connect(&self) -> ConnectionTarget {
        let discovered = match (&self.discovery, self.credential()) {
            (Some(discovery), Some(credential)) => match discovery.discover(&credential).await {
                Ok(envs) => select_target(envs),
                Err(e) => {
                    tracing::warn!(error = %e, "remote discovery failed; using localhost");
                    None
                }
            },
            _ => None,
        };
        let target =
            discovered.unwrap_or_else(|| ConnectionTarget::localhost(self.localhost_url.clone()));
        tracing::info!(target = %target, "auto-connect target selected");
        self.connect(target.clone());
        target
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("executor connection actor has stopped");
        }
    }
}

struct Actor {
    options: ConnectionOptions,
    handoff: Arc<CredentialHandoff>,
    credential: watch::Receiver<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
    target_tx: watch::Sender<Option<ConnectionTarget>>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: broadcast::Sender<Envelope>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped for every connect attempt and teardown.
    generation: u64,
    retry_count: u32,
    writer: Option<WsSink>,
    open_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
            }
        }
        self.teardown().await;
        tracing::debug!("executor connection actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(target) => self.connect(target).await,
            Command::Disconnect => self.disconnect().await,
            Command::SwitchTarget(to) => {
                let from = self.current_target();
                tracing::info!(to = %to, "switching executor target");
                self.emit(ConnectionEvent::Switching {
                    from,
                    to: to.clone(),
                });
                self.disconnect().await;
                self.connect(to).await;
            }
            Command::Send(text) => self.send(text).await,
            Command::CredentialChanged => {
                if self.current_credential().is_some() {
                    self.resume("credential updated").await;
                }
            }
            Command::Retry => self.resume("manual retry").await,
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Opened { generation, result } if generation == self.generation => {
                self.open_task = None;
                match result {
                    Ok(stream) => self.on_open(stream),
                    Err(e) => {
                        let target = self.current_target();
                        tracing::warn!(error = %e, "executor connect failed");
                        self.emit(ConnectionEvent::Error {
                            target,
                            message: e.clone(),
                        });
                        self.on_closed(&e).await;
                    }
                }
            }
            Internal::Closed { generation, reason } if generation == self.generation => {
                self.on_closed(&reason).await;
            }
            Internal::Frame { generation, text } if generation == self.generation => {
                self.on_frame(&text).await;
            }
            Internal::ReconnectDue { generation } if generation == self.generation => {
                self.timer = None;
                let waiting = *self.state_tx.borrow() == ConnectionState::Reconnecting;
                if waiting && let Some(target) = self.current_target() {
                    self.open(target);
                }
            }
            Internal::Reply { generation, text } if generation == self.generation => {
                self.send(text).await;
            }
            Internal::Reply { .. } => {
                tracing::warn!("dropping reply for a connection that no longer exists");
            }
            // Stale generation.
            Internal::Opened { .. }
            | Internal::Closed { .. }
            | Internal::Frame { .. }
            | Internal::ReconnectDue { .. } => {}
        }
    }

    /// `connect(target)`: no-op when already connecting/connected to it.
    async fn connect(&mut self, target: ConnectionTarget) {
        let state = *self.state_tx.borrow();
        let busy = matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if busy && self.current_target().as_ref() == Some(&target) {
            tracing::debug!(target = %target, state = %state, "connect ignored");
            return;
        }
        if busy {
            self.disconnect().await;
        }
        self.cancel_timer();
        self.target_tx.send_replace(Some(target.clone()));
        self.open(target);
    }

    /// Start a socket open for `target`, or park until a credential arrives.
    fn open(&mut self, target: ConnectionTarget) {
        let Some(credential) = self.current_credential() else {
            tracing::info!(target = %target, "no executor credential; connection parked");
            self.set_state(ConnectionState::Disconnected);
            self.emit(ConnectionEvent::Error {
                target: Some(target),
                message: WAITING_FOR_CREDENTIAL.into(),
            });
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        self.emit(ConnectionEvent::Connecting {
            target: target.clone(),
        });

        let tx = self.internal_tx.clone();
        let timeout = self.options.connect_timeout;
        self.open_task = Some(tokio::spawn(async move {
            let result = open_socket(&target, &credential, timeout).await;
            let _ = tx.send(Internal::Opened { generation, result });
        }));
    }

    fn on_open(&mut self, stream: WsStream) {
        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.reader_task = Some(tokio::spawn(read_frames(
            reader,
            self.generation,
            self.internal_tx.clone(),
        )));
        self.retry_count = 0;
        self.cancel_timer();
        self.set_state(ConnectionState::Connected);
        if let Some(target) = self.current_target() {
            tracing::info!(target = %target, "executor connected");
            self.emit(ConnectionEvent::Connected { target });
        }
    }

    async fn on_closed(&mut self, reason: &str) {
        self.drop_socket().await;
        self.set_state(ConnectionState::Disconnected);
        if let Some(target) = self.current_target() {
            let lost = RelayError::ConnectionLost(reason.to_string());
            tracing::info!(target = %target, error = %lost, "executor disconnected");
            self.emit(ConnectionEvent::Disconnected { target });
        }
        self.attempt_reconnect();
    }

    fn attempt_reconnect(&mut self) {
        let Some(target) = self.current_target() else {
            return;
        };
        if self.current_credential().is_none() {
            tracing::debug!("no credential; waiting before reconnecting");
            return;
        }
        let max = self.options.max_reconnect_attempts;
        if self.retry_count < max {
            self.retry_count += 1;
            self.set_state(ConnectionState::Reconnecting);
            self.emit(ConnectionEvent::Reconnecting {
                attempt: self.retry_count,
                max,
            });
            let tx = self.internal_tx.clone();
            let generation = self.generation;
            let delay = self.options.reconnect_delay;
            self.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Internal::ReconnectDue { generation });
            }));
        } else {
            let exhausted = RelayError::ReconnectExhausted { attempts: max };
            tracing::warn!(
                target = %target,
                error = %exhausted,
                "stopping automatic reconnection"
            );
            self.retry_count = 0;
            self.emit(ConnectionEvent::ReconnectExhausted {
                target,
                attempts: max,
            });
        }
    }

    /// Full reset: no target, no retries, no pending timer.
    async fn disconnect(&mut self) {
        self.cancel_timer();
        self.drop_socket().await;
        self.retry_count = 0;
        self.set_state(ConnectionState::Disconnected);
        if let Some(target) = self.target_tx.send_replace(None) {
            self.handoff.forget(&target);
            tracing::info!(target = %target, "executor disconnected");
            self.emit(ConnectionEvent::Disconnected { target });
        }
    }

    /// Reconnect to the last target if the machine is idle.
    async fn resume(&mut self, why: &str) {
        let idle = *self.state_tx.borrow() == ConnectionState::Disconnected;
        if !idle {
            return;
        }
        if let Some(target) = self.current_target() {
            tracing::info!(target = %target, reason = why, "resuming executor connection");
            self.retry_count = 0;
            self.connect(target).await;
        }
    }

    async fn send(&mut self, text: String) {
        let connected = *self.state_tx.borrow() == ConnectionState::Connected;
        match (&mut self.writer, connected) {
            (Some(writer), true) => {
                if let Err(e) = writer.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "executor send failed");
                }
            }
            _ => tracing::warn!("executor not connected; dropping outbound envelope"),
        }
    }

    async fn on_frame(&mut self, text: &str) {
        let inbound = match parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        match inbound {
            Inbound::Ping { request_id } => self.reply(&Outbound::pong(request_id)).await,
            Inbound::RequestProviderToken {
                provider_id,
                request_id,
            } => {
                let Some(target) = self.current_target() else {
                    return;
                };
                let credential = self.current_credential();
                let handoff = Arc::clone(&self.handoff);
                self.spawn_reply(async move {
                    let response = handoff
                        .respond(
                            provider_id.as_deref(),
                            &request_id,
                            &target,
                            credential.as_deref(),
                        )
                        .await;
                    Outbound::ProviderAuthToken(response)
                });
            }
            Inbound::RequestUserTokens { request_id } => {
                let handoff = Arc::clone(&self.handoff);
                self.spawn_reply(async move { handoff.tokens_available(request_id).await });
            }
            Inbound::Other(envelope) => {
                tracing::debug!(kind = %envelope.kind, "inbound envelope");
                let _ = self.inbound.send(envelope);
            }
        }
    }

    async fn reply(&mut self, message: &Outbound) {
        match serde_json::to_string(message) {
            Ok(text) => self.send(text).await,
            Err(e) => tracing::warn!(error = %e, "reply not serializable"),
        }
    }

    /// Compute a reply off the actor and deliver it if the connection survives.
    fn spawn_reply<F>(&self, fut: F)
    where
        F: Future<Output = Outbound> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let message = fut.await;
            match serde_json::to_string(&message) {
                Ok(text) => {
                    let _ = tx.send(Internal::Reply { generation, text });
                }
                Err(e) => tracing::warn!(error = %e, "reply not serializable"),
            }
        });
    }

    async fn drop_socket(&mut self) {
        self.generation += 1;
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    async fn teardown(&mut self) {
        self.cancel_timer();
        self.drop_socket().await;
    }

    fn current_target(&self) -> Option<ConnectionTarget> {
        self.target_tx.borrow().clone()
    }

    fn current_credential(&self) -> Option<String> {
        self.credential.borrow().clone().filter(|c| !c.is_empty())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn open_socket(
    target: &ConnectionTarget,
    credential: &str,
    timeout: Duration,
) -> Result<WsStream, String> {
    let url = target.ws_endpoint();
    let mut request = url.as_str().into_client_request().map_err(|e| e.to_string())?;
    let bearer = HeaderValue::from_str(&format!("Bearer {credential}")).map_err(|e| e.to_string())?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(format!("connect to {url} failed: {e}")),
        Err(_) => Err(format!("connect to {url} timed out after {timeout:?}")),
    }
}

async fn read_frames(
    mut reader: SplitStream<WsStream>,
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                let _ = tx.send(Internal::Frame {
                    generation,
                    text: text.to_string(),
                });
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by peer".to_string(),
                    |f| f.reason.as_str().to_string(),
                );
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    let _ = tx.send(Internal::Closed { generation, reason });
}

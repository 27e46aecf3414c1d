//! Hub transport: SignalR JSON protocol over `tokio-tungstenite`.
//!
//! Only the parts of the protocol a chat client needs: negotiate, the JSON
//! handshake, invocations with completions, pings and close. Each started
//! connection is owned by one link task that multiplexes outbound commands,
//! inbound frames and keep-alive pings, and that reconnects on its own when
//! an established link drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::transport::{ConnectionState, EventSender, SessionKind, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Invocation waiting for its completion frame.
type PendingTx = oneshot::Sender<Result<Value>>;

/// Terminates every hub frame.
const RECORD_SEPARATOR: char = '\u{1e}';
const PING_INTERVAL: Duration = Duration::from_secs(15);
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Frames ──────────────────────────────────────────────────────────────

/// Serialize one message and terminate it.
pub fn encode_frame(message: &Value) -> String {
    let mut frame = message.to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Split a websocket text message into the frames it carries.
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|frame| !frame.trim().is_empty())
}

/// Hub messages the client acts on
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, cancellations and anything newer
    Other(u64),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

/// Parse a single frame (without its separator).
pub fn parse_frame(frame: &str) -> Result<HubFrame> {
    let raw: RawFrame = serde_json::from_str(frame)
        .map_err(|e| ChatError::Protocol(format!("malformed frame: {e}")))?;

    let parsed = match raw.kind {
        1 => HubFrame::Invocation {
            target: raw
                .target
                .ok_or_else(|| ChatError::Protocol("invocation without target".into()))?,
            arguments: raw.arguments,
        },
        3 => HubFrame::Completion {
            invocation_id: raw
                .invocation_id
                .ok_or_else(|| ChatError::Protocol("completion without invocationId".into()))?,
            result: raw.result,
            error: raw.error,
        },
        6 => HubFrame::Ping,
        7 => HubFrame::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubFrame::Other(other),
    };
    Ok(parsed)
}

// ─── URLs ────────────────────────────────────────────────────────────────

fn parse_url(base: &str) -> Result<Url> {
    Url::parse(base).map_err(|e| ChatError::Protocol(format!("invalid hub url '{base}': {e}")))
}

/// `<hub>/negotiate?negotiateVersion=1`, keeping any query on the hub url.
pub fn negotiate_url(base: &str) -> Result<Url> {
    let mut url = parse_url(base)?;
    url.path_segments_mut()
        .map_err(|_| ChatError::Protocol(format!("hub url '{base}' cannot have a path")))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Websocket url for a negotiated connection: ws(s) scheme plus `id=<token>`.
pub fn websocket_url(base: &str, token: &str) -> Result<Url> {
    let mut url = parse_url(base)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| ChatError::Protocol(format!("cannot use scheme '{scheme}' for '{base}'")))?;
    url.query_pairs_mut().append_pair("id", token);
    Ok(url)
}

// ─── Connection setup ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A freshly handshaken websocket
struct OpenedLink {
    ws: WsStream,
    connection_id: String,
    /// Frames that arrived in the same message as the handshake reply
    backlog: Vec<String>,
}

struct HubEndpoint {
    kind: SessionKind,
    url: String,
    http: reqwest::Client,
}

impl HubEndpoint {
    fn failure(&self, reason: impl std::fmt::Display) -> ChatError {
        ChatError::ConnectionFailure {
            session: self.kind,
            reason: reason.to_string(),
        }
    }

    async fn negotiate(&self) -> Result<(String, String)> {
        let url = negotiate_url(&self.url)?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| self.failure(format!("negotiate: {e}")))?
            .error_for_status()
            .map_err(|e| self.failure(format!("negotiate: {e}")))?;
        let body: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("negotiate response: {e}")))?;

        if let Some(error) = body.error {
            return Err(self.failure(error));
        }
        let connection_id = body
            .connection_id
            .ok_or_else(|| self.failure("negotiate response has no connectionId"))?;
        let token = body.connection_token.unwrap_or_else(|| connection_id.clone());
        Ok((connection_id, token))
    }

    /// Plain or TLS websocket, chosen by the URL scheme
    async fn connect_websocket(&self, ws_url: &Url) -> Result<WsStream> {
        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| self.failure(format!("websocket connect: {e}")))?;
        Ok(ws)
    }

    async fn open(&self) -> Result<OpenedLink> {
        let (connection_id, token) = self.negotiate().await?;
        let ws_url = websocket_url(&self.url, &token)?;

        let mut ws = self.connect_websocket(&ws_url).await?;

        let handshake = encode_frame(&json!({"protocol": "json", "version": 1}));
        ws.send(Message::Text(handshake.into()))
            .await
            .map_err(|e| self.failure(format!("handshake send: {e}")))?;

        let backlog = loop {
            let msg = ws
                .next()
                .await
                .ok_or_else(|| self.failure("connection closed during handshake"))?
                .map_err(|e| self.failure(format!("handshake: {e}")))?;
            let Message::Text(text) = msg else { continue };

            let mut frames = split_frames(text.as_str());
            let reply = frames
                .next()
                .ok_or_else(|| self.failure("empty handshake reply"))?;
            let reply: Value = serde_json::from_str(reply)
                .map_err(|e| self.failure(format!("handshake reply: {e}")))?;
            if let Some(error) = reply.get("error").and_then(Value::as_str) {
                return Err(self.failure(format!("handshake rejected: {error}")));
            }
            break frames.map(str::to_string).collect();
        };

        debug!(session = %self.kind, connection_id = %connection_id, "handshake complete");
        Ok(OpenedLink {
            ws,
            connection_id,
            backlog,
        })
    }
}

// ─── Link task ───────────────────────────────────────────────────────────

enum LinkCommand {
    Invoke {
        method: String,
        args: Vec<Value>,
        response_tx: PendingTx,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

enum LinkOutcome {
    Stopped(Option<oneshot::Sender<()>>),
    Dropped {
        cause: Option<String>,
        allow_reconnect: bool,
    },
}

#[derive(Clone)]
struct LinkContext {
    endpoint: Arc<HubEndpoint>,
    events: EventSender,
    state: Arc<AtomicU8>,
    reconnect_delays: Vec<Duration>,
}

impl LinkContext {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!(session = %self.endpoint.kind, "event receiver dropped");
        }
    }

    /// Apply every frame of one websocket message. Returns an outcome when
    /// the hub closed the connection.
    fn handle_message(
        &self,
        text: &str,
        pending: &mut HashMap<String, (String, PendingTx)>,
    ) -> Option<LinkOutcome> {
        for frame in split_frames(text) {
            let parsed = match parse_frame(frame) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(session = %self.endpoint.kind, error = %e, "skipping frame");
                    continue;
                }
            };
            match parsed {
                HubFrame::Invocation { target, arguments } => {
                    self.emit(TransportEvent::Invocation { target, arguments });
                }
                HubFrame::Completion {
                    invocation_id,
                    result,
                    error,
                } => {
                    let Some((method, tx)) = pending.remove(&invocation_id) else {
                        debug!(invocation_id = %invocation_id, "completion for unknown invocation");
                        continue;
                    };
                    let reply = match error {
                        Some(error) => Err(ChatError::invocation(&method, error)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(reply);
                }
                HubFrame::Ping => {}
                HubFrame::Close {
                    error,
                    allow_reconnect,
                } => {
                    return Some(LinkOutcome::Dropped {
                        cause: error,
                        allow_reconnect,
                    });
                }
                HubFrame::Other(kind) => {
                    debug!(session = %self.endpoint.kind, kind, "ignoring frame type");
                }
            }
        }
        None
    }

    /// Drive one websocket until it stops or drops
    async fn drive(
        &self,
        opened: OpenedLink,
        cmd_rx: &mut mpsc::Receiver<LinkCommand>,
    ) -> LinkOutcome {
        let (mut ws_tx, mut ws_rx) = opened.ws.split();
        let mut pending: HashMap<String, (String, PendingTx)> = HashMap::new();
        let mut next_id: u64 = 1;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        let mut outcome = None;
        for text in &opened.backlog {
            outcome = self.handle_message(text, &mut pending);
            if outcome.is_some() {
                break;
            }
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            // Transport dropped
                            None => break LinkOutcome::Stopped(None),
                            Some(LinkCommand::Invoke { method, args, response_tx }) => {
                                let id = next_id.to_string();
                                next_id += 1;
                                let frame = encode_frame(&json!({
                                    "type": 1,
                                    "invocationId": id,
                                    "target": method,
                                    "arguments": args,
                                }));
                                let _ = pending.insert(id, (method, response_tx));
                                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                                    break LinkOutcome::Dropped { cause: Some(e.to_string()), allow_reconnect: true };
                                }
                            }
                            Some(LinkCommand::Stop { done }) => {
                                let _ = ws_tx.send(Message::Text(encode_frame(&json!({"type": 7})).into())).await;
                                let _ = ws_tx.close().await;
                                break LinkOutcome::Stopped(Some(done));
                            }
                        }
                    }
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(outcome) = self.handle_message(text.as_str(), &mut pending) {
                                    break outcome;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let cause = frame
                                    .map(|f| f.reason.as_str().to_string())
                                    .filter(|reason| !reason.is_empty());
                                break LinkOutcome::Dropped { cause, allow_reconnect: true };
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                break LinkOutcome::Dropped { cause: Some(e.to_string()), allow_reconnect: true };
                            }
                            None => break LinkOutcome::Dropped { cause: None, allow_reconnect: true },
                        }
                    }
                    _ = ping.tick() => {
                        let frame = encode_frame(&json!({"type": 6}));
                        if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                            break LinkOutcome::Dropped { cause: Some(e.to_string()), allow_reconnect: true };
                        }
                    }
                }
            },
        };

        let cause = match &outcome {
            LinkOutcome::Dropped { cause, .. } => cause.clone(),
            LinkOutcome::Stopped(_) => None,
        };
        for (_, (_, tx)) in pending.drain() {
            let _ = tx.send(Err(ChatError::ConnectionClosed {
                cause: cause.clone(),
            }));
        }
        outcome
    }

    /// Try the reconnect schedule once. Returns the new link, if any.
    async fn reconnect(&self) -> Option<OpenedLink> {
        for (attempt, delay) in self.reconnect_delays.iter().enumerate() {
            tokio::time::sleep(*delay).await;
            match self.endpoint.open().await {
                Ok(opened) => return Some(opened),
                Err(e) => warn!(
                    session = %self.endpoint.kind,
                    attempt = attempt + 1,
                    error = %e,
                    "reconnect attempt failed"
                ),
            }
        }
        None
    }

    async fn run(self, mut opened: OpenedLink, mut cmd_rx: mpsc::Receiver<LinkCommand>) {
        loop {
            match self.drive(opened, &mut cmd_rx).await {
                LinkOutcome::Stopped(done) => {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(TransportEvent::Closed { cause: None });
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                LinkOutcome::Dropped {
                    cause,
                    allow_reconnect,
                } => {
                    warn!(session = %self.endpoint.kind, cause = ?cause, "link dropped");
                    let reopened = if allow_reconnect {
                        self.set_state(ConnectionState::Reconnecting);
                        self.reconnect().await
                    } else {
                        None
                    };
                    match reopened {
                        Some(next) => {
                            info!(
                                session = %self.endpoint.kind,
                                connection_id = %next.connection_id,
                                "link reestablished"
                            );
                            self.set_state(ConnectionState::Connected);
                            self.emit(TransportEvent::Reconnected {
                                connection_id: next.connection_id.clone(),
                            });
                            opened = next;
                        }
                        None => {
                            self.set_state(ConnectionState::Disconnected);
                            self.emit(TransportEvent::Closed { cause });
                            return;
                        }
                    }
                }
            }
        }
    }
}

struct LinkHandle {
    cmd_tx: mpsc::Sender<LinkCommand>,
    task: JoinHandle<()>,
}

// ─── Transport ───────────────────────────────────────────────────────────

/// [`Transport`] speaking the hub's JSON protocol over a websocket.
pub struct HubTransport {
    ctx: LinkContext,
    link: Mutex<Option<LinkHandle>>,
    /// `None` lets an invocation run until its completion arrives
    invocation_timeout: Option<Duration>,
}

impl HubTransport {
    /// Transport for the hub at `url`, publishing its events on `events`.
    pub fn new(
        kind: SessionKind,
        url: impl Into<String>,
        reconnect_delays: Vec<Duration>,
        events: EventSender,
    ) -> Self {
        Self {
            ctx: LinkContext {
                endpoint: Arc::new(HubEndpoint {
                    kind,
                    url: url.into(),
                    http: reqwest::Client::new(),
                }),
                events,
                state: Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())),
                reconnect_delays,
            },
            link: Mutex::new(None),
            invocation_timeout: Some(INVOCATION_TIMEOUT),
        }
    }

    /// Wait for completions indefinitely. For hubs whose invocations only
    /// complete after streaming their whole result.
    pub fn without_invocation_timeout(mut self) -> Self {
        self.invocation_timeout = None;
        self
    }

    pub fn url(&self) -> &str {
        &self.ctx.endpoint.url
    }

    #[cfg(test)]
    fn with_http_client(mut self, http: reqwest::Client) -> Self {
        let endpoint = &self.ctx.endpoint;
        self.ctx.endpoint = Arc::new(HubEndpoint {
            kind: endpoint.kind,
            url: endpoint.url.clone(),
            http,
        });
        self
    }
}

#[async_trait]
impl Transport for HubTransport {
    async fn start(&self) -> Result<String> {
        let mut link = self.link.lock().await;
        if let Some(previous) = link.take() {
            previous.task.abort();
        }

        self.ctx.set_state(ConnectionState::Connecting);
        let opened = match self.ctx.endpoint.open().await {
            Ok(opened) => opened,
            Err(e) => {
                self.ctx.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let connection_id = opened.connection_id.clone();

        let (cmd_tx, cmd_rx) = mpsc::channel::<LinkCommand>(64);
        self.ctx.set_state(ConnectionState::Connected);
        let task = tokio::spawn(self.ctx.clone().run(opened, cmd_rx));
        *link = Some(LinkHandle { cmd_tx, task });

        info!(
            session = %self.ctx.endpoint.kind,
            url = %self.ctx.endpoint.url,
            connection_id = %connection_id,
            "hub connection started"
        );
        Ok(connection_id)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected {
                method: method.to_string(),
            });
        }
        let cmd_tx = match self.link.lock().await.as_ref() {
            Some(link) => link.cmd_tx.clone(),
            None => {
                return Err(ChatError::NotConnected {
                    method: method.to_string(),
                });
            }
        };

        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(LinkCommand::Invoke {
                method: method.to_string(),
                args,
                response_tx: tx,
            })
            .await
            .map_err(|_| ChatError::invocation(method, "link task ended"))?;

        let completion = match self.invocation_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ChatError::invocation(method, "timed out waiting for completion"))?,
            None => rx.await,
        };
        completion.map_err(|_| ChatError::invocation(method, "completion dropped"))?
    }

    async fn stop(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if link.cmd_tx.send(LinkCommand::Stop { done: done_tx }).await.is_ok() {
            let _ = tokio::time::timeout(STOP_TIMEOUT, done_rx).await;
        }
        link.task.abort();

        // Stopped mid-reconnect: the task never got to report it
        if self.state() != ConnectionState::Disconnected {
            self.ctx.set_state(ConnectionState::Disconnected);
            self.ctx.emit(TransportEvent::Closed { cause: None });
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.ctx.state.load(Ordering::SeqCst))
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::directory::UserDirectory;
use crate::error::{ChatError, Result};
use crate::events::{
    ChatMessage, ConversationChannel, ConversationEntry, InboundEvent, Peer, decode_topic_message,
    methods,
};
use crate::membership::GroupMembership;
use crate::streaming::{FragmentOutcome, StreamAssembler};
use crate::transport::{ConnectionState, SessionKind, Transport, TransportEvent};

/// One logical connection and its retry policy
pub struct Session {
    kind: SessionKind,
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    retry_delay: Duration,
    connection_id: Option<String>,
    attempts: u64,
    connect_task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(kind: SessionKind, transport: Arc<dyn Transport>, retry_delay: Duration) -> Self {
        Self {
            kind,
            transport,
            state: ConnectionState::Disconnected,
            retry_delay,
            connection_id: None,
            attempts: 0,
            connect_task: None,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Connection attempts made so far, successful or not
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    fn is_connecting(&self) -> bool {
        self.connect_task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Progress of a session's connect loop
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectReport {
    Failed { attempt: u64, reason: String },
    Connected { attempt: u64, connection_id: String },
}

/// Work finished in the background, to be applied by the driver
#[derive(Debug)]
pub enum SessionSignal {
    Connect { kind: SessionKind, report: ConnectReport },
    /// The `SendAiMessage` invocation returned
    GenerationSettled(Result<Value>),
}

pub type SignalSender = mpsc::UnboundedSender<SessionSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<SessionSignal>;

/// Try to connect until it works, waiting a fixed delay between attempts.
///
/// There is no attempt cap and no backoff. Every attempt is reported; the
/// loop ends after the first success or once nobody is listening.
async fn connect_with_retry(
    kind: SessionKind,
    transport: Arc<dyn Transport>,
    retry_delay: Duration,
    signals: SignalSender,
) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let report = match transport.start().await {
            Ok(connection_id) => ConnectReport::Connected { attempt, connection_id },
            Err(e) => {
                warn!(
                    session = %kind,
                    attempt,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    error = %e,
                    "connection attempt failed"
                );
                ConnectReport::Failed {
                    attempt,
                    reason: e.to_string(),
                }
            }
        };

        let connected = matches!(report, ConnectReport::Connected { .. });
        if signals.send(SessionSignal::Connect { kind, report }).is_err() || connected {
            return;
        }
        tokio::time::sleep(retry_delay).await;
    }
}

/// Something the front end may want to show after an event was handled
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Entry {
        channel: ConversationChannel,
        entry: ConversationEntry,
    },
    /// A non-terminal AI fragment was appended
    AiToken(String),
    /// The streamed AI response finished
    AiReply(ChatMessage),
    RosterChanged,
    GroupsChanged,
    /// A session finished its connect loop
    Connected(SessionKind),
    Status(String),
}

/// Owns both sessions and routes everything between the transports and the
/// conversation state.
///
/// All methods take `&mut self`; the driver calls them one at a time, so
/// handlers never overlap. Connect loops and AI generation requests run as
/// tasks and come back as [`SessionSignal`]s.
pub struct SessionManager {
    primary: Session,
    ai: Session,
    directory: UserDirectory,
    store: ConversationStore,
    membership: GroupMembership,
    assembler: StreamAssembler,
    /// Last error or status message, overwritten on every update
    status: String,
    local_peer_id: Option<String>,
    display_name: String,
    private_target: Option<String>,
    models: Vec<String>,
    selected_model: Option<String>,
    signals: SignalSender,
    signal_rx: Option<SignalReceiver>,
}

impl SessionManager {
    pub fn new(config: &Config, primary: Arc<dyn Transport>, ai: Arc<dyn Transport>) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Self {
            primary: Session::new(SessionKind::Primary, primary, config.retry_delay()),
            ai: Session::new(SessionKind::Ai, ai, config.retry_delay()),
            directory: UserDirectory::new(),
            store: ConversationStore::with_welcome(&config.app_name, &config.welcome_message),
            membership: GroupMembership::new(),
            assembler: StreamAssembler::new(),
            status: String::new(),
            local_peer_id: None,
            display_name: String::new(),
            private_target: None,
            models: config.models.clone(),
            selected_model: config.default_model.clone().filter(|m| !m.is_empty()),
            signals,
            signal_rx: Some(signal_rx),
        }
    }

    /// Receiver for background results. Handed out once, to the driver.
    pub fn take_signals(&mut self) -> Option<SignalReceiver> {
        self.signal_rx.take()
    }

    fn session(&self, kind: SessionKind) -> &Session {
        match kind {
            SessionKind::Primary => &self.primary,
            SessionKind::Ai => &self.ai,
        }
    }

    fn session_mut(&mut self, kind: SessionKind) -> &mut Session {
        match kind {
            SessionKind::Primary => &mut self.primary,
            SessionKind::Ai => &mut self.ai,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the connect loop for one session. Returns false when the
    /// session is connected or its loop is already running.
    pub fn start(&mut self, kind: SessionKind) -> bool {
        let signals = self.signals.clone();
        let session = self.session_mut(kind);
        if session.is_connecting() || session.state == ConnectionState::Connected {
            debug!(session = %kind, state = %session.state, "not starting session");
            return false;
        }
        session.state = ConnectionState::Connecting;
        let task = connect_with_retry(kind, Arc::clone(&session.transport), session.retry_delay, signals);
        session.connect_task = Some(tokio::spawn(task));
        true
    }

    /// Start both sessions. Their loops run side by side and neither waits
    /// for the other.
    pub fn start_all(&mut self) {
        self.start(SessionKind::Primary);
        self.start(SessionKind::Ai);
    }

    /// Apply one background result
    pub async fn handle_signal(&mut self, signal: SessionSignal) -> Option<SessionUpdate> {
        match signal {
            SessionSignal::Connect { kind, report } => self.on_connect_report(kind, report).await,
            SessionSignal::GenerationSettled(outcome) => self.on_generation_settled(outcome),
        }
    }

    async fn on_connect_report(&mut self, kind: SessionKind, report: ConnectReport) -> Option<SessionUpdate> {
        match report {
            ConnectReport::Failed { attempt, reason } => {
                let session = self.session_mut(kind);
                session.state = ConnectionState::Disconnected;
                session.attempts = attempt;
                // Only the primary session owns the status line
                if kind != SessionKind::Primary {
                    return None;
                }
                self.status = reason;
                Some(SessionUpdate::Status(self.status.clone()))
            }
            ConnectReport::Connected {
                attempt,
                connection_id,
            } => {
                let session = self.session_mut(kind);
                session.state = ConnectionState::Connected;
                session.attempts = attempt;
                session.connection_id = Some(connection_id.clone());
                info!(session = %kind, connection_id = %connection_id, attempts = attempt, "session connected");

                if kind == SessionKind::Primary {
                    self.on_primary_connected(connection_id).await;
                }
                Some(SessionUpdate::Connected(kind))
            }
        }
    }

    async fn on_primary_connected(&mut self, connection_id: String) {
        self.local_peer_id = Some(connection_id);
        self.status = "Connected.".to_string();
        // Failure is already on the status line
        let _ = self.refresh_groups().await;
    }

    /// The transport re-established a dropped link
    pub fn on_reconnected(&mut self, kind: SessionKind, connection_id: String) {
        let session = self.session_mut(kind);
        session.state = ConnectionState::Connected;
        session.connection_id = Some(connection_id.clone());

        if kind == SessionKind::Primary && self.local_peer_id.as_deref() != Some(connection_id.as_str()) {
            info!(connection_id = %connection_id, "local peer id changed after reconnect");
            self.local_peer_id = Some(connection_id.clone());
        }
        self.status = format!(
            "Connection reestablished. Connected with connectionId \"{}\".",
            connection_id
        );
    }

    /// An established session ended. Not retried here.
    pub fn on_closed(&mut self, kind: SessionKind, cause: Option<String>) {
        self.session_mut(kind).state = ConnectionState::Disconnected;
        warn!(session = %kind, cause = cause.as_deref().unwrap_or("none"), "session closed");
        self.status = format!(
            "Connection closed due to error \"{}\". Try restarting to reconnect.",
            cause.as_deref().unwrap_or("none")
        );
    }

    /// Close both sessions, giving up on any that is still connecting
    pub async fn stop(&mut self) {
        for session in [&mut self.primary, &mut self.ai] {
            if let Some(task) = session.connect_task.take() {
                task.abort();
            }
            session.transport.stop().await;
        }
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    /// Apply one event pushed by a session's transport
    pub fn handle_event(&mut self, kind: SessionKind, event: TransportEvent) -> Option<SessionUpdate> {
        match event {
            TransportEvent::Invocation { target, arguments } => {
                self.dispatch(kind, &target, arguments)
            }
            TransportEvent::Reconnected { connection_id } => {
                self.on_reconnected(kind, connection_id);
                Some(SessionUpdate::Status(self.status.clone()))
            }
            TransportEvent::Closed { cause } => {
                self.on_closed(kind, cause);
                Some(SessionUpdate::Status(self.status.clone()))
            }
        }
    }

    /// Route a named event to its handler by exact name
    pub fn dispatch(&mut self, kind: SessionKind, target: &str, arguments: Vec<Value>) -> Option<SessionUpdate> {
        let event = match InboundEvent::decode(target, arguments) {
            Ok(event) => event,
            Err(e) => {
                warn!(session = %kind, event = target, error = %e, "dropping undecodable event");
                return None;
            }
        };
        if event.session() != kind {
            debug!(session = %kind, event = target, "dropping event sent on the wrong session");
            return None;
        }
        debug!(session = %kind, event = target, "dispatching event");

        let local = self.local_peer_id.as_deref();
        match event {
            InboundEvent::Roster(peers) => {
                self.directory.replace_roster(peers);
                Some(SessionUpdate::RosterChanged)
            }
            InboundEvent::Groups(groups) => {
                self.directory.replace_groups(groups);
                Some(SessionUpdate::GroupsChanged)
            }
            InboundEvent::Broadcast {
                username,
                connection_id,
                message,
            } => {
                let author = if username.is_empty() {
                    self.directory.resolve_label(&connection_id, local)
                } else {
                    username
                };
                let entry = ConversationEntry::new(author, connection_id, message);
                self.store.append(&ConversationChannel::Broadcast, entry.clone());
                Some(SessionUpdate::Entry {
                    channel: ConversationChannel::Broadcast,
                    entry,
                })
            }
            InboundEvent::Private(envelope) => {
                let entry = self.store.append_from(
                    &ConversationChannel::Private,
                    &self.directory,
                    local,
                    &envelope.sender_connection_id,
                    &envelope.message,
                );
                self.private_target = Some(envelope.sender_connection_id);
                Some(SessionUpdate::Entry {
                    channel: ConversationChannel::Private,
                    entry,
                })
            }
            InboundEvent::AiFragment(fragment) => {
                let token = fragment.message.content.clone();
                match self.assembler.on_fragment(fragment) {
                    FragmentOutcome::Appended => Some(SessionUpdate::AiToken(token)),
                    FragmentOutcome::Completed(message) => Some(SessionUpdate::AiReply(message)),
                    FragmentOutcome::Ignored => None,
                }
            }
            InboundEvent::Topic { name, arguments } => {
                let Some(listener) = self.membership.listener(&name) else {
                    debug!(session = %kind, event = %name, "no listener for event");
                    return None;
                };
                let (sender_id, message) = match decode_topic_message(&name, &arguments) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(group = %name, error = %e, "dropping undecodable group message");
                        return None;
                    }
                };
                let entry = listener.deliver(&self.directory, &mut self.store, local, &sender_id, &message);
                Some(SessionUpdate::Entry {
                    channel: ConversationChannel::Group(name),
                    entry,
                })
            }
        }
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    fn record_failure(&mut self, method: &str, err: &ChatError) {
        if err.is_invocation_failure() {
            warn!(method, error = %err, "invocation failed");
        } else {
            warn!(method, error = %err, "invocation lost with its connection");
        }
        self.status = err.to_string();
    }

    /// Invoke a named remote operation on one session. Failures land on the
    /// status line and are returned to the caller.
    pub async fn invoke(&mut self, kind: SessionKind, method: &str, args: Vec<Value>) -> Result<Value> {
        let transport = Arc::clone(&self.session(kind).transport);
        match transport.invoke(method, args).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.record_failure(method, &e);
                Err(e)
            }
        }
    }

    /// Ask the hub to republish the group roster
    pub async fn refresh_groups(&mut self) -> Result<()> {
        self.invoke(SessionKind::Primary, methods::GET_GROUPS, vec![])
            .await
            .map(|_| ())
    }

    /// Register the display name other peers see
    pub async fn save_display_name(&mut self, name: &str) -> Result<()> {
        self.invoke(SessionKind::Primary, methods::SAVE_USERNAME, vec![json!(name)])
            .await?;
        self.display_name = name.to_string();
        Ok(())
    }

    /// Broadcast to everyone. The hub echoes it back as a `ReceiveMessage`.
    pub async fn send_to_all(&mut self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Ok(());
        }
        let args = vec![json!(self.display_name), json!(message)];
        self.invoke(SessionKind::Primary, methods::SEND_MESSAGE_TO_ALL, args)
            .await
            .map(|_| ())
    }

    /// Send a private message and echo it locally once the hub accepted it.
    ///
    /// Returns `Ok(false)` when either argument is empty.
    pub async fn send_private(&mut self, receiver_id: &str, message: &str) -> Result<bool> {
        if receiver_id.is_empty() || message.is_empty() {
            return Ok(false);
        }
        let args = vec![json!(self.local_peer_id), json!(receiver_id), json!(message)];
        self.invoke(SessionKind::Primary, methods::SEND_PRIVATE_MESSAGE, args)
            .await?;

        let local = self.local_peer_id.clone().unwrap_or_default();
        self.store.append_from(
            &ConversationChannel::Private,
            &self.directory,
            Some(&local),
            &local,
            message,
        );
        Ok(true)
    }

    /// Switch the active group
    pub async fn join_group(&mut self, group: &str) -> Result<bool> {
        let result = self
            .membership
            .join(
                self.primary.transport.as_ref(),
                self.local_peer_id.as_deref(),
                &mut self.store,
                group,
            )
            .await;
        if let Err(e) = &result {
            self.record_failure(methods::ADD_TO_GROUP, e);
        }
        result
    }

    /// Leave the active group, if any
    pub async fn leave_group(&mut self) -> Result<bool> {
        let Some(group) = self.membership.active_group().map(str::to_string) else {
            return Ok(false);
        };
        let result = self
            .membership
            .leave(
                self.primary.transport.as_ref(),
                self.local_peer_id.as_deref(),
                &mut self.store,
                &group,
            )
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.record_failure(methods::REMOVE_FROM_GROUP, &e);
                Err(e)
            }
        }
    }

    /// Post to the active group. The hub echoes it on the group topic.
    pub async fn send_group_message(&mut self, message: &str) -> Result<bool> {
        let Some(group) = self.membership.active_group().map(str::to_string) else {
            return Ok(false);
        };
        if message.is_empty() {
            return Ok(false);
        }
        let args = vec![json!(self.local_peer_id), json!(message), json!(group)];
        self.invoke(SessionKind::Primary, methods::SEND_MESSAGE_TO_GROUP, args)
            .await?;
        Ok(true)
    }

    /// Start an AI generation round. `model` overrides the selected model.
    ///
    /// The request runs in the background so fragments keep flowing while it
    /// is outstanding; its outcome arrives as [`SessionSignal::GenerationSettled`].
    /// Returns false while a previous response is still streaming.
    pub fn send_to_ai(&mut self, message: &str, model: Option<&str>) -> bool {
        let model = model.or(self.selected_model.as_deref()).map(str::to_string);
        let Some(request) = self.assembler.begin(message, model.as_deref()) else {
            return false;
        };

        let args = vec![json!(request.history), json!(request.model)];
        let transport = Arc::clone(&self.ai.transport);
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let outcome = transport.invoke(methods::SEND_AI_MESSAGE, args).await;
            let _ = signals.send(SessionSignal::GenerationSettled(outcome));
        });
        true
    }

    fn on_generation_settled(&mut self, outcome: Result<Value>) -> Option<SessionUpdate> {
        let err = match outcome {
            Ok(_) => {
                debug!("generation request completed");
                return None;
            }
            Err(e) => e,
        };
        self.record_failure(methods::SEND_AI_MESSAGE, &err);
        match self.assembler.on_request_failed() {
            Some(partial) => Some(SessionUpdate::AiReply(partial)),
            None => Some(SessionUpdate::Status(self.status.clone())),
        }
    }

    /// Pick the model for later AI rounds. An empty name restores the
    /// server default. Unknown names are rejected.
    pub fn select_model(&mut self, name: &str) -> bool {
        if name.is_empty() {
            self.selected_model = None;
            return true;
        }
        if !self.models.iter().any(|m| m == name) {
            return false;
        }
        self.selected_model = Some(name.to_string());
        true
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn local_peer_id(&self) -> Option<&str> {
        self.local_peer_id.as_deref()
    }

    pub fn connection_state(&self, kind: SessionKind) -> ConnectionState {
        self.session(kind).state()
    }

    pub fn session_info(&self, kind: SessionKind) -> &Session {
        self.session(kind)
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    /// Peers other than ourselves
    pub fn filtered_users(&self) -> Vec<&Peer> {
        self.directory.peers_except(self.local_peer_id.as_deref())
    }

    pub fn group_members(&self, group: &str) -> &[Peer] {
        self.directory.members_of(group)
    }

    pub fn active_group(&self) -> Option<&str> {
        self.membership.active_group()
    }

    pub fn membership(&self) -> &GroupMembership {
        &self.membership
    }

    pub fn history(&self, channel: &ConversationChannel) -> &[ConversationEntry] {
        self.store.history(channel)
    }

    /// History of the group currently joined
    pub fn group_history(&self) -> &[ConversationEntry] {
        match self.membership.active_group() {
            Some(group) => self.store.history(&ConversationChannel::Group(group.to_string())),
            None => &[],
        }
    }

    /// Peer that last wrote to us privately
    pub fn private_target(&self) -> Option<&str> {
        self.private_target.as_deref()
    }

    pub fn ai_history(&self) -> &[ChatMessage] {
        self.assembler.history()
    }

    /// Partial AI response streamed so far
    pub fn ai_pending(&self) -> &str {
        self.assembler.state().pending()
    }

    pub fn ai_in_flight(&self) -> bool {
        self.assembler.state().is_in_flight()
    }

    /// Waiting for the first token of a response
    pub fn is_loading(&self) -> bool {
        self.assembler.state().is_loading()
    }

    pub fn available_models(&self) -> &[String] {
        &self.models
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RECEIVE_AI_MESSAGE, RECEIVE_CONNECTED_USERS, RECEIVE_MESSAGE, RECEIVE_PRIVATE_MESSAGE};
    use crate::testutil::RecordingTransport;
    use assert_matches::assert_matches;
    use tokio::time::Instant;

    struct Harness {
        manager: SessionManager,
        hub: Arc<RecordingTransport>,
        ai: Arc<RecordingTransport>,
        signals: SignalReceiver,
    }

    impl Harness {
        fn new(hub: RecordingTransport, ai: RecordingTransport) -> Self {
            let hub = Arc::new(hub);
            let ai = Arc::new(ai);
            let mut manager = SessionManager::new(&Config::default(), hub.clone(), ai.clone());
            let signals = manager.take_signals().unwrap();
            Harness {
                manager,
                hub,
                ai,
                signals,
            }
        }

        /// Apply the next background result
        async fn settle(&mut self) -> Option<SessionUpdate> {
            let signal = self.signals.recv().await.unwrap();
            self.manager.handle_signal(signal).await
        }
    }

    async fn connected() -> Harness {
        let mut h = Harness::new(
            RecordingTransport::new(SessionKind::Primary, "me"),
            RecordingTransport::new(SessionKind::Ai, "ai-1"),
        );
        h.manager.start_all();
        while h.manager.connection_state(SessionKind::Primary) != ConnectionState::Connected
            || h.manager.connection_state(SessionKind::Ai) != ConnectionState::Connected
        {
            h.settle().await;
        }
        h
    }

    fn roster(manager: &mut SessionManager, payload: &str) {
        manager.dispatch(SessionKind::Primary, RECEIVE_CONNECTED_USERS, vec![json!(payload)]);
    }

    fn fragment(manager: &mut SessionManager, content: &str, done: bool) -> Option<SessionUpdate> {
        manager.dispatch(
            SessionKind::Ai,
            RECEIVE_AI_MESSAGE,
            vec![json!({"done": done, "message": {"content": content}})],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_at_a_fixed_interval() {
        let mut h = Harness::new(
            RecordingTransport::new(SessionKind::Primary, "me").fail_starts(2),
            RecordingTransport::new(SessionKind::Ai, "ai-1"),
        );

        let began = Instant::now();
        assert!(h.manager.start(SessionKind::Primary));
        assert_eq!(h.manager.connection_state(SessionKind::Primary), ConnectionState::Connecting);

        let mut updates = Vec::new();
        while h.manager.local_peer_id().is_none() {
            updates.push(h.settle().await);
        }

        assert_eq!(updates.len(), 3);
        assert_matches!(&updates[0], Some(SessionUpdate::Status(s)) if s.contains("connection refused"));
        assert_eq!(updates[2], Some(SessionUpdate::Connected(SessionKind::Primary)));
        assert_eq!(h.hub.start_attempts(), 3);
        assert_eq!(h.manager.session_info(SessionKind::Primary).attempts(), 3);
        assert!(began.elapsed() >= Duration::from_secs(10));
        assert_eq!(h.manager.connection_state(SessionKind::Primary), ConnectionState::Connected);
        assert_eq!(h.manager.local_peer_id(), Some("me"));
        assert_eq!(h.manager.status(), "Connected.");
        assert_eq!(h.hub.calls_to(methods::GET_GROUPS).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_is_usable_while_ai_keeps_retrying() {
        let mut h = Harness::new(
            RecordingTransport::new(SessionKind::Primary, "me"),
            RecordingTransport::new(SessionKind::Ai, "ai-1").fail_starts(usize::MAX),
        );
        h.manager.start_all();

        while h.manager.local_peer_id().is_none() {
            h.settle().await;
        }
        assert_eq!(h.manager.local_peer_id(), Some("me"));
        assert_eq!(h.manager.status(), "Connected.");
        assert_eq!(h.hub.calls_to(methods::GET_GROUPS).len(), 1);

        // The AI loop carries on by itself and stays off the status line
        assert!(!h.manager.start(SessionKind::Ai));
        let began = Instant::now();
        while began.elapsed() < Duration::from_secs(30) {
            assert_eq!(h.settle().await, None);
        }
        assert!(h.ai.start_attempts() >= 6);
        assert_eq!(h.manager.connection_state(SessionKind::Ai), ConnectionState::Disconnected);
        assert_eq!(h.manager.status(), "Connected.");

        h.manager.send_to_all("still here").await.unwrap();
        assert_eq!(h.hub.calls_to(methods::SEND_MESSAGE_TO_ALL).len(), 1);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn ai_session_does_not_request_groups() {
        let mut h = connected().await;
        assert!(!h.manager.start(SessionKind::Ai));
        assert!(h.ai.calls().is_empty());
        assert_eq!(h.manager.connection_state(SessionKind::Ai), ConnectionState::Connected);
        assert_eq!(h.manager.session_info(SessionKind::Ai).connection_id(), Some("ai-1"));
    }

    #[tokio::test]
    async fn failed_invocation_lands_on_status_line() {
        let mut h = connected().await;
        h.hub.fail_method(methods::SAVE_USERNAME);
        let err = h.manager.save_display_name("alice").await.unwrap_err();
        assert_matches!(err, ChatError::Invocation { .. });
        assert_eq!(h.manager.status(), err.to_string());
    }

    #[tokio::test]
    async fn broadcast_uses_saved_name() {
        let mut h = connected().await;
        h.manager.save_display_name("alice").await.unwrap();
        h.manager.send_to_all("hello").await.unwrap();
        assert_eq!(
            h.hub.calls_to(methods::SEND_MESSAGE_TO_ALL),
            vec![vec![json!("alice"), json!("hello")]]
        );
    }

    #[tokio::test]
    async fn inbound_broadcast_is_appended() {
        let mut h = connected().await;
        let update = h.manager.dispatch(
            SessionKind::Primary,
            RECEIVE_MESSAGE,
            vec![json!("bob"), json!("B"), json!("hey")],
        );
        assert_matches!(update, Some(SessionUpdate::Entry { channel: ConversationChannel::Broadcast, .. }));

        let history = h.manager.history(&ConversationChannel::Broadcast);
        // Welcome entry first
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].author, "bob");
        assert_eq!(history[1].body, "hey");
    }

    #[tokio::test]
    async fn local_peer_is_excluded_from_filtered_users() {
        let mut h = connected().await;
        roster(&mut h.manager, r#"[{"ConnectionId":"me","Name":"Alice"}]"#);
        assert!(h.manager.filtered_users().is_empty());

        roster(&mut h.manager, r#"[{"ConnectionId":"me","Name":"Alice"},{"ConnectionId":"B","Name":"Bob"}]"#);
        let ids: Vec<_> = h.manager.filtered_users().iter().map(|p| p.connection_id.as_str()).collect();
        assert_eq!(ids, ["B"]);
    }

    #[tokio::test]
    async fn private_send_echoes_only_on_success() {
        let mut h = connected().await;

        h.hub.fail_method(methods::SEND_PRIVATE_MESSAGE);
        assert!(h.manager.send_private("B", "psst").await.is_err());
        assert!(h.manager.history(&ConversationChannel::Private).is_empty());

        h.hub.heal_method(methods::SEND_PRIVATE_MESSAGE);
        assert!(h.manager.send_private("B", "psst").await.unwrap());
        let history = h.manager.history(&ConversationChannel::Private);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, "You");
        assert_eq!(history[0].author_id, "me");
        assert_eq!(
            h.hub.calls_to(methods::SEND_PRIVATE_MESSAGE).last().unwrap(),
            &vec![json!("me"), json!("B"), json!("psst")]
        );
    }

    #[tokio::test]
    async fn empty_private_send_is_a_no_op() {
        let mut h = connected().await;
        assert!(!h.manager.send_private("", "psst").await.unwrap());
        assert!(!h.manager.send_private("B", "").await.unwrap());
        assert!(h.hub.calls_to(methods::SEND_PRIVATE_MESSAGE).is_empty());
    }

    #[tokio::test]
    async fn inbound_private_sets_reply_target() {
        let mut h = connected().await;
        roster(&mut h.manager, r#"[{"ConnectionId":"B","Name":"Bob"}]"#);
        h.manager.dispatch(
            SessionKind::Primary,
            RECEIVE_PRIVATE_MESSAGE,
            vec![json!(r#"{"SenderConnectionId":"B","Message":"hi"}"#)],
        );
        assert_eq!(h.manager.private_target(), Some("B"));
        assert_eq!(h.manager.history(&ConversationChannel::Private)[0].author, "Bob");
    }

    #[tokio::test]
    async fn group_topic_routes_only_while_joined() {
        let mut h = connected().await;
        let topic_event = |m: &mut SessionManager| {
            m.dispatch(SessionKind::Primary, "rust", vec![json!("C"), json!("hello")])
        };

        assert!(topic_event(&mut h.manager).is_none());

        h.manager.join_group("rust").await.unwrap();
        assert!(topic_event(&mut h.manager).is_some());
        assert_eq!(h.manager.group_history().len(), 1);
        assert_eq!(h.manager.group_history()[0].author, "Unknown User (C)");

        h.manager.leave_group().await.unwrap();
        assert!(topic_event(&mut h.manager).is_none());
        assert!(h.manager.group_history().is_empty());
        assert!(h.manager.history(&ConversationChannel::Group("rust".into())).is_empty());
    }

    #[tokio::test]
    async fn group_message_needs_an_active_group() {
        let mut h = connected().await;
        assert!(!h.manager.send_group_message("hi").await.unwrap());

        h.manager.join_group("rust").await.unwrap();
        assert!(h.manager.send_group_message("hi").await.unwrap());
        assert_eq!(
            h.hub.calls_to(methods::SEND_MESSAGE_TO_GROUP),
            vec![vec![json!("me"), json!("hi"), json!("rust")]]
        );
    }

    #[tokio::test]
    async fn events_are_taken_only_from_their_own_session() {
        let mut h = connected().await;
        assert!(h.manager.send_to_ai("hi", None));
        h.settle().await;

        let stray_fragment = h.manager.dispatch(
            SessionKind::Primary,
            RECEIVE_AI_MESSAGE,
            vec![json!({"done": false, "message": {"content": "x"}})],
        );
        assert!(stray_fragment.is_none());
        assert!(h.manager.is_loading());
        assert_eq!(h.manager.ai_pending(), "");

        let stray_roster = h.manager.dispatch(
            SessionKind::Ai,
            RECEIVE_CONNECTED_USERS,
            vec![json!(r#"[{"ConnectionId":"B","Name":"Bob"}]"#)],
        );
        assert!(stray_roster.is_none());
        assert!(h.manager.directory().peers().is_empty());

        let stray_broadcast = h.manager.dispatch(
            SessionKind::Ai,
            RECEIVE_MESSAGE,
            vec![json!("bob"), json!("B"), json!("hey")],
        );
        assert!(stray_broadcast.is_none());
        assert_eq!(h.manager.history(&ConversationChannel::Broadcast).len(), 1);
    }

    #[tokio::test]
    async fn ai_round_trip() {
        let mut h = connected().await;
        assert!(h.manager.send_to_ai("hi", Some("")));
        assert!(h.manager.is_loading());

        // Rejected while the first response streams
        assert!(!h.manager.send_to_ai("again", None));

        assert_eq!(h.settle().await, None);
        assert_eq!(
            h.ai.calls_to(methods::SEND_AI_MESSAGE),
            vec![vec![json!([{"role": "user", "content": "hi"}]), Value::Null]]
        );

        assert_eq!(fragment(&mut h.manager, "He", false), Some(SessionUpdate::AiToken("He".into())));
        assert_eq!(fragment(&mut h.manager, "llo", false), Some(SessionUpdate::AiToken("llo".into())));
        assert!(!h.manager.is_loading());
        assert_eq!(h.manager.ai_pending(), "Hello");

        let update = fragment(&mut h.manager, "", true);
        assert_eq!(update, Some(SessionUpdate::AiReply(ChatMessage::assistant("Hello"))));
        assert!(!h.manager.ai_in_flight());
        assert_eq!(h.manager.ai_history().len(), 2);
    }

    #[tokio::test]
    async fn fragments_stream_while_the_request_is_outstanding() {
        let mut h = connected().await;
        h.ai.hold_method(methods::SEND_AI_MESSAGE);

        assert!(h.manager.send_to_ai("hi", None));
        tokio::task::yield_now().await;
        assert_eq!(h.ai.calls_to(methods::SEND_AI_MESSAGE).len(), 1);

        assert_eq!(fragment(&mut h.manager, "He", false), Some(SessionUpdate::AiToken("He".into())));
        assert_eq!(fragment(&mut h.manager, "llo", false), Some(SessionUpdate::AiToken("llo".into())));
        let update = fragment(&mut h.manager, "", true);
        assert_eq!(update, Some(SessionUpdate::AiReply(ChatMessage::assistant("Hello"))));

        // The request itself never came back
        assert!(h.signals.try_recv().is_err());
        assert_eq!(
            h.manager.ai_history(),
            [ChatMessage::user("hi"), ChatMessage::assistant("Hello")]
        );
    }

    #[tokio::test]
    async fn request_failing_mid_stream_keeps_the_answer() {
        let mut h = connected().await;
        h.ai.fail_method(methods::SEND_AI_MESSAGE);

        assert!(h.manager.send_to_ai("hi", None));
        assert_eq!(fragment(&mut h.manager, "He", false), Some(SessionUpdate::AiToken("He".into())));
        assert_eq!(fragment(&mut h.manager, "llo", false), Some(SessionUpdate::AiToken("llo".into())));

        let update = h.settle().await;
        assert_eq!(update, Some(SessionUpdate::AiReply(ChatMessage::assistant("Hello"))));
        assert_eq!(
            h.manager.ai_history(),
            [ChatMessage::user("hi"), ChatMessage::assistant("Hello")]
        );
        assert!(!h.manager.ai_in_flight());
        assert!(h.manager.status().contains(methods::SEND_AI_MESSAGE));

        // Nothing left to attach a late terminal fragment to
        assert_eq!(fragment(&mut h.manager, "", true), None);
    }

    #[tokio::test]
    async fn failed_generation_request_can_be_retried() {
        let mut h = connected().await;
        h.ai.fail_method(methods::SEND_AI_MESSAGE);
        assert!(h.manager.send_to_ai("hi", None));
        assert_matches!(h.settle().await, Some(SessionUpdate::Status(_)));
        assert!(!h.manager.ai_in_flight());
        assert!(h.manager.ai_history().is_empty());

        h.ai.heal_method(methods::SEND_AI_MESSAGE);
        assert!(h.manager.send_to_ai("hi", None));
        assert_eq!(h.settle().await, None);
        assert!(h.manager.ai_in_flight());
    }

    #[tokio::test]
    async fn selected_model_is_sent() {
        let mut h = connected().await;
        assert!(!h.manager.select_model("gpt-nothing"));
        assert!(h.manager.select_model("llama2"));
        h.manager.send_to_ai("hi", None);
        h.settle().await;
        assert_eq!(h.ai.calls_to(methods::SEND_AI_MESSAGE)[0][1], json!("llama2"));
    }

    #[tokio::test]
    async fn reconnect_updates_local_peer_id() {
        let mut h = connected().await;
        h.manager.handle_event(
            SessionKind::Primary,
            TransportEvent::Reconnected {
                connection_id: "me-2".into(),
            },
        );
        assert_eq!(h.manager.local_peer_id(), Some("me-2"));
        assert!(h.manager.status().contains("me-2"));
    }

    #[tokio::test]
    async fn close_is_surfaced_not_retried() {
        let mut h = connected().await;
        let update = h.manager.handle_event(
            SessionKind::Primary,
            TransportEvent::Closed {
                cause: Some("server went away".into()),
            },
        );
        assert_matches!(update, Some(SessionUpdate::Status(s)) if s.contains("server went away"));
        assert_eq!(h.manager.connection_state(SessionKind::Primary), ConnectionState::Disconnected);
        assert_eq!(h.hub.start_attempts(), 1);
    }

    #[tokio::test]
    async fn undecodable_events_are_dropped() {
        let mut h = connected().await;
        let update = h.manager.dispatch(SessionKind::Primary, RECEIVE_CONNECTED_USERS, vec![json!("[oops")]);
        assert!(update.is_none());
        assert!(h.manager.directory().peers().is_empty());
    }
}

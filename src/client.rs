//! Lobby client engine.
//!
//! All mutable state (session, player registry, game session, reconnect
//! policy) lives in a single engine task; commands from collaborators, wire
//! events, timer ticks, and completions of slow external steps are funneled
//! through one inbox channel and handled in arrival order. Collaborators hold
//! a cloneable [`LobbyClient`] handle that queues commands, reads state
//! snapshots, and subscribes to broadcast event streams.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::auth::{
    hash_password, CredentialDecision, CredentialProvider, NoCredentials, Sha256Uid, UidSource,
};
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ServerConnection, WireEvent, WireUpdate};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, FatalFault, Notice, NoticeStyle, SocialEvent};
use crate::matchmaker::{self, MatchmakerEvent};
use crate::players::{Player, PlayerRegistry};
use crate::probe::{ConnectivityProbe, ProbeError, ProbeReport, StaticProbe};
use crate::protocol::{
    token_to_string, AdminAction, AuthenticationFailedPayload, ClientMessage, Faction,
    GameLaunchPayload, GameVisibility, MatchmakerQueuesPayload, NoticePayload, PlayerInfoPayload,
    RegistrationResponsePayload, SocialPayload, WelcomePayload,
};
use crate::reconnect::ReconnectPolicy;
use crate::session::{
    launch_arguments, GameLaunch, GameSession, LaunchIntent, ListenState, Session,
};
use crate::transport::{Connector, WsConnector};

/// Client-visible lifecycle state, derived by the engine's state machine and
/// never set from outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Engine created, never connected.
    None,
    /// Wire connection attempt in flight.
    Connecting,
    /// Wire up, handshake not finished.
    Connected,
    /// Handshake complete.
    LoggedIn,
    /// Wire down.
    Disconnected,
    /// Terminal: absorbing all further events.
    ShuttingDown,
}

impl ClientState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            ClientState::None => 0,
            ClientState::Connecting => 1,
            ClientState::Connected => 2,
            ClientState::LoggedIn => 3,
            ClientState::Disconnected => 4,
            ClientState::ShuttingDown => 5,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::LoggedIn,
            4 => ClientState::Disconnected,
            5 => ClientState::ShuttingDown,
            _ => ClientState::None,
        }
    }
}

/// Handle errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine task has stopped (after shutdown).
    #[error("engine task has stopped")]
    Stopped,
}

/// Commands queued from the [`LobbyClient`] handle.
#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    SendLogin {
        login: String,
        password: String,
    },
    SearchRanked {
        faction: Faction,
    },
    StopSearch,
    HostGame {
        title: String,
        mod_: String,
        visibility: GameVisibility,
        mapname: String,
        password: Option<String>,
    },
    JoinGame {
        uid: u32,
        password: Option<String>,
    },
    AddFriend(u32),
    RemoveFriend(u32),
    AddFoe(u32),
    RemoveFoe(u32),
    RequestAvatars {
        personal: bool,
    },
    AdminCloseGame {
        user_id: u32,
    },
    AdminJoinChannel {
        user_ids: Vec<u32>,
        channel: String,
    },
    GameExit,
    Shutdown,
}

/// Everything the engine task can receive. One queue keeps dispatch order
/// equal to arrival order.
enum EngineMsg {
    Command(Command),
    Wire {
        conn: u64,
        event: WireEvent,
    },
    ReconnectTick {
        epoch: u64,
    },
    ProbeDone {
        login_generation: u64,
        result: Result<ProbeReport, ProbeError>,
    },
    RelayBound {
        generation: u64,
        result: std::io::Result<(u16, TcpListener)>,
    },
    Credentials {
        login_generation: u64,
        decision: CredentialDecision,
    },
}

/// State snapshots shared between the engine and its handles. Written only by
/// the engine task.
struct Shared {
    client_state: AtomicU8,
    connection_state: AtomicU8,
    registry: RwLock<PlayerRegistry>,
}

/// Builder wiring a [`LobbyClient`] to its external collaborators.
pub struct LobbyClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    credentials: Arc<dyn CredentialProvider>,
    probe: Arc<dyn ConnectivityProbe>,
    uid_source: Arc<dyn UidSource>,
}

impl LobbyClientBuilder {
    /// Start a builder with default collaborators: a WebSocket connector for
    /// the configured URL, no credential dialog, a probe that assumes direct
    /// reachability, and the SHA-256 fingerprint source.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            credentials: Arc::new(NoCredentials),
            probe: Arc::new(StaticProbe::public()),
            uid_source: Arc::new(Sha256Uid),
        }
    }

    /// Use a custom wire connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a credential dialog collaborator.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Use a connectivity probe collaborator.
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use a custom unique-id fingerprint source.
    pub fn uid_source(mut self, uid_source: Arc<dyn UidSource>) -> Self {
        self.uid_source = uid_source;
        self
    }

    /// Spawn the engine task and return the client handle.
    pub fn spawn(self) -> LobbyClient {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            client_state: AtomicU8::new(ClientState::None.to_u8()),
            connection_state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            registry: RwLock::new(PlayerRegistry::new()),
        });
        let bus = Arc::new(EventBus::new(self.config.event_capacity));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(self.config.server_url.clone())));
        let connection = ServerConnection::new(connector, inbox_tx.clone(), |update: WireUpdate| {
            EngineMsg::Wire {
                conn: update.conn,
                event: update.event,
            }
        });
        let policy = ReconnectPolicy::new(
            self.config.reconnect_initial_delay,
            self.config.reconnect_max_delay,
        );

        let engine = LobbyEngine {
            login: self.config.login.clone(),
            password: self.config.password.clone(),
            auto_relogin: self.config.remember,
            config: self.config,
            inbox: inbox_tx.clone(),
            connection,
            policy,
            session: Session::default(),
            game_session: None,
            connectivity: None,
            shared: Arc::clone(&shared),
            bus: Arc::clone(&bus),
            credentials: self.credentials,
            probe: self.probe,
            uid_source: self.uid_source,
            state: ClientState::None,
            login_seq: 0,
            reconnect_epoch: 0,
            game_generation: 0,
            probe_started: false,
            searching: false,
            last_faction: None,
            fatal: None,
            shutting_down: false,
        };
        tokio::spawn(engine.run(inbox_rx));

        LobbyClient {
            inbox: inbox_tx,
            shared,
            bus,
        }
    }
}

/// Cloneable handle to the engine task.
#[derive(Clone)]
pub struct LobbyClient {
    inbox: mpsc::UnboundedSender<EngineMsg>,
    shared: Arc<Shared>,
    bus: Arc<EventBus>,
}

impl LobbyClient {
    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.inbox
            .send(EngineMsg::Command(command))
            .map_err(|_| EngineError::Stopped)
    }

    /// Open the wire connection.
    pub fn connect(&self) -> Result<(), EngineError> {
        self.send(Command::Connect)
    }

    /// Go offline explicitly. No reconnect attempts follow.
    pub fn disconnect(&self) -> Result<(), EngineError> {
        self.send(Command::Disconnect)
    }

    /// Re-enable reconnects and open the wire connection.
    pub fn reconnect(&self) -> Result<(), EngineError> {
        self.send(Command::Reconnect)
    }

    /// Submit credentials for the current login cycle. The password must
    /// already be hashed by the settings layer.
    pub fn send_login(
        &self,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(Command::SendLogin {
            login: login.into(),
            password: password.into(),
        })
    }

    /// Queue for a ranked 1v1 game with the given faction.
    pub fn search_ranked(&self, faction: Faction) -> Result<(), EngineError> {
        self.send(Command::SearchRanked { faction })
    }

    /// Leave the ranked queue.
    pub fn stop_search(&self) -> Result<(), EngineError> {
        self.send(Command::StopSearch)
    }

    /// Host a custom game once the session is ready.
    pub fn host_game(
        &self,
        title: impl Into<String>,
        mod_: impl Into<String>,
        visibility: GameVisibility,
        mapname: impl Into<String>,
        password: Option<String>,
    ) -> Result<(), EngineError> {
        self.send(Command::HostGame {
            title: title.into(),
            mod_: mod_.into(),
            visibility,
            mapname: mapname.into(),
            password,
        })
    }

    /// Join an existing game once the session is ready.
    pub fn join_game(&self, uid: u32, password: Option<String>) -> Result<(), EngineError> {
        self.send(Command::JoinGame { uid, password })
    }

    /// Mark a known player as friend.
    pub fn add_friend(&self, id: u32) -> Result<(), EngineError> {
        self.send(Command::AddFriend(id))
    }

    /// Unmark a known player as friend.
    pub fn remove_friend(&self, id: u32) -> Result<(), EngineError> {
        self.send(Command::RemoveFriend(id))
    }

    /// Mark a known player as foe.
    pub fn add_foe(&self, id: u32) -> Result<(), EngineError> {
        self.send(Command::AddFoe(id))
    }

    /// Unmark a known player as foe.
    pub fn remove_foe(&self, id: u32) -> Result<(), EngineError> {
        self.send(Command::RemoveFoe(id))
    }

    /// Request the personal or the full avatar list.
    pub fn request_avatars(&self, personal: bool) -> Result<(), EngineError> {
        self.send(Command::RequestAvatars { personal })
    }

    /// Moderator: close a player's running game.
    pub fn admin_close_game(&self, user_id: u32) -> Result<(), EngineError> {
        self.send(Command::AdminCloseGame { user_id })
    }

    /// Moderator: force users into a chat channel.
    pub fn admin_join_channel(
        &self,
        user_ids: Vec<u32>,
        channel: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(Command::AdminJoinChannel {
            user_ids,
            channel: channel.into(),
        })
    }

    /// Tell the engine the game process exited; starts a fresh game session.
    pub fn notify_game_exit(&self) -> Result<(), EngineError> {
        self.send(Command::GameExit)
    }

    /// Shut down the engine: disable reconnects, close the wire, release the
    /// session identity, notify collaborators, stop the task.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Command::Shutdown)
    }

    /// Current client lifecycle state.
    pub fn client_state(&self) -> ClientState {
        ClientState::from_u8(self.shared.client_state.load(Ordering::SeqCst))
    }

    /// Current wire connection state.
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.connection_state.load(Ordering::SeqCst))
    }

    fn registry(&self) -> RwLockReadGuard<'_, PlayerRegistry> {
        self.shared.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all known players.
    pub fn players(&self) -> Vec<Player> {
        self.registry().snapshot()
    }

    /// Snapshot of one player.
    pub fn player(&self, id: u32) -> Option<Player> {
        self.registry().get(id).cloned()
    }

    /// Snapshot of the logged-in user's record.
    pub fn me(&self) -> Option<Player> {
        self.registry().me().cloned()
    }

    /// Whether `id` is a friend of the logged-in user.
    pub fn is_friend(&self, id: u32) -> bool {
        self.registry().is_friend(id)
    }

    /// Whether `id` is a foe of the logged-in user.
    pub fn is_foe(&self, id: u32) -> bool {
        self.registry().is_foe(id)
    }

    /// Whether the logged-in user has moderation capabilities.
    pub fn has_admin_power(&self) -> bool {
        self.registry().has_admin_power()
    }

    /// Subscribe to client-state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ClientState> {
        self.bus.subscribe_state()
    }

    /// Subscribe to wire connection-state changes.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionState> {
        self.bus.subscribe_connection()
    }

    /// Subscribe to successful logins.
    pub fn subscribe_authorized(&self) -> broadcast::Receiver<Player> {
        self.bus.subscribe_authorized()
    }

    /// Subscribe to connectivity-probe completions.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ProbeReport> {
        self.bus.subscribe_connectivity()
    }

    /// Subscribe to matchmaker events.
    pub fn subscribe_matchmaker(&self) -> broadcast::Receiver<MatchmakerEvent> {
        self.bus.subscribe_matchmaker()
    }

    /// Subscribe to game-launch hand-offs.
    pub fn subscribe_launches(&self) -> broadcast::Receiver<GameLaunch> {
        self.bus.subscribe_launches()
    }

    /// Subscribe to user-visible notices.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.bus.subscribe_notices()
    }

    /// Subscribe to social updates.
    pub fn subscribe_social(&self) -> broadcast::Receiver<SocialEvent> {
        self.bus.subscribe_social()
    }

    /// Subscribe to fatal protocol faults.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FatalFault> {
        self.bus.subscribe_faults()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

struct LobbyEngine {
    config: ClientConfig,
    inbox: mpsc::UnboundedSender<EngineMsg>,
    connection: ServerConnection<EngineMsg>,
    policy: ReconnectPolicy,
    session: Session,
    game_session: Option<GameSession>,
    connectivity: Option<ProbeReport>,
    shared: Arc<Shared>,
    bus: Arc<EventBus>,
    credentials: Arc<dyn CredentialProvider>,
    probe: Arc<dyn ConnectivityProbe>,
    uid_source: Arc<dyn UidSource>,
    state: ClientState,
    /// Credentials for the current and future login attempts.
    login: Option<String>,
    password: Option<String>,
    /// Whether remembered credentials may be reused silently. Armed after a
    /// successful login, disarmed by fresh credentials, auth failures, and
    /// error/kick notices.
    auto_relogin: bool,
    /// Guards stale probe/credential completions across login cycles.
    login_seq: u64,
    /// Guards stale reconnect timers across explicit connects/disconnects.
    reconnect_epoch: u64,
    /// Guards stale relay binds across game-session replacements.
    game_generation: u64,
    probe_started: bool,
    searching: bool,
    last_faction: Option<Faction>,
    fatal: Option<FatalFault>,
    shutting_down: bool,
}

impl LobbyEngine {
    async fn run(mut self, mut inbox_rx: mpsc::UnboundedReceiver<EngineMsg>) {
        let dispatcher = Self::dispatcher();
        while let Some(message) = inbox_rx.recv().await {
            match message {
                EngineMsg::Command(command) => self.handle_command(command),
                EngineMsg::Wire { conn, event } => self.handle_wire(conn, event, &dispatcher),
                EngineMsg::ReconnectTick { epoch } => self.handle_reconnect_tick(epoch),
                EngineMsg::ProbeDone {
                    login_generation,
                    result,
                } => self.handle_probe_done(login_generation, result),
                EngineMsg::RelayBound { generation, result } => {
                    self.handle_relay_bound(generation, result)
                }
                EngineMsg::Credentials {
                    login_generation,
                    decision,
                } => self.handle_credentials(login_generation, decision),
            }
            if self.shutting_down {
                break;
            }
        }
        debug!("engine task exited");
    }

    fn dispatcher() -> Dispatcher<Self> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("session", Self::handle_session);
        dispatcher.register("welcome", Self::handle_welcome);
        dispatcher.register("authentication_failed", Self::handle_authentication_failed);
        dispatcher.register("notice", Self::handle_notice);
        dispatcher.register("invalid", Self::handle_invalid);
        dispatcher.register("update", Self::handle_update);
        dispatcher.register("social", Self::handle_social);
        dispatcher.register("player_info", Self::handle_player_info);
        dispatcher.register("matchmaker_info", Self::handle_matchmaker_info);
        dispatcher.register("game_launch", Self::handle_game_launch);
        dispatcher.register("registration_response", Self::handle_registration_response);
        dispatcher
    }

    fn registry_read(&self) -> RwLockReadGuard<'_, PlayerRegistry> {
        self.shared.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, PlayerRegistry> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// The single place client state changes. ShuttingDown is terminal.
    fn set_state(&mut self, state: ClientState) {
        if self.state == ClientState::ShuttingDown {
            return;
        }
        self.state = state;
        self.shared
            .client_state
            .store(state.to_u8(), Ordering::SeqCst);
        self.bus.publish_state(state);
    }

    // ── Commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        if self.shutting_down {
            return;
        }
        match command {
            Command::Connect => {
                self.reconnect_epoch += 1;
                self.connection.connect();
            }
            Command::Reconnect => {
                self.reconnect_epoch += 1;
                self.policy.set_enabled(true);
                self.policy.reset();
                self.connection.connect();
            }
            Command::Disconnect => {
                // The user wants to stay offline.
                self.reconnect_epoch += 1;
                self.policy.set_enabled(false);
                self.connection.disconnect();
            }
            Command::SendLogin { login, password } => {
                if !self.send_login(login, password) {
                    self.request_credentials();
                }
            }
            Command::SearchRanked { faction } => {
                self.register_intent(LaunchIntent::SearchRanked { faction })
            }
            Command::StopSearch => self.stop_search(),
            Command::HostGame {
                title,
                mod_,
                visibility,
                mapname,
                password,
            } => self.register_intent(LaunchIntent::HostGame {
                title,
                mod_,
                visibility,
                mapname,
                password,
            }),
            Command::JoinGame { uid, password } => {
                self.register_intent(LaunchIntent::JoinGame { uid, password })
            }
            Command::AddFriend(id) => self.social_mutation(id, true, true),
            Command::RemoveFriend(id) => self.social_mutation(id, true, false),
            Command::AddFoe(id) => self.social_mutation(id, false, true),
            Command::RemoveFoe(id) => self.social_mutation(id, false, false),
            Command::RequestAvatars { personal } => {
                let message = if personal {
                    ClientMessage::Avatar {
                        action: "list_avatar".into(),
                    }
                } else {
                    ClientMessage::Admin(AdminAction::RequestAvatars)
                };
                self.connection.send(&message);
            }
            Command::AdminCloseGame { user_id } => {
                self.connection
                    .send(&ClientMessage::Admin(AdminAction::CloseGame { user_id }));
            }
            Command::AdminJoinChannel { user_ids, channel } => {
                self.connection
                    .send(&ClientMessage::Admin(AdminAction::JoinChannel {
                        user_ids,
                        channel,
                    }));
            }
            Command::GameExit => self.replace_game_session(),
            Command::Shutdown => self.shutdown(),
        }
    }

    fn social_mutation(&mut self, id: u32, friend: bool, add: bool) {
        let known = {
            let mut registry = self.registry_write();
            match (friend, add) {
                (true, true) => registry.add_friend(id),
                (true, false) => registry.remove_friend(id),
                (false, true) => registry.add_foe(id),
                (false, false) => registry.remove_foe(id),
            }
        };
        if !known {
            debug!("ignoring social mutation for unknown player {id}");
            return;
        }
        let (friend_field, foe_field) = if friend { (Some(id), None) } else { (None, Some(id)) };
        let message = if add {
            ClientMessage::SocialAdd {
                friend: friend_field,
                foe: foe_field,
            }
        } else {
            ClientMessage::SocialRemove {
                friend: friend_field,
                foe: foe_field,
            }
        };
        self.connection.send(&message);
    }

    fn stop_search(&mut self) {
        if !self.searching {
            return;
        }
        self.searching = false;
        self.connection.send(&ClientMessage::GameMatchmaking {
            mod_: "ladder1v1".into(),
            state: "stop".into(),
            gameport: None,
            faction: None,
            relay_address: None,
        });
    }

    fn replace_game_session(&mut self) {
        let Some(report) = self.connectivity.clone() else {
            return;
        };
        if let Some(session) = &self.game_session {
            if session.has_pending() {
                debug!("discarding pending launch intent with the replaced game session");
            }
        }
        self.game_generation += 1;
        self.game_session = Some(GameSession::new(self.game_generation, report));
        self.searching = false;
    }

    // ── Wire events ─────────────────────────────────────────────────

    fn handle_wire(&mut self, conn: u64, event: WireEvent, dispatcher: &Dispatcher<Self>) {
        if self.shutting_down {
            return;
        }
        if conn != self.connection.current_conn() {
            debug!("dropping event from superseded connection {conn}");
            return;
        }
        match event {
            WireEvent::StateChanged(wire_state) => {
                self.connection.note_state(wire_state);
                self.shared
                    .connection_state
                    .store(wire_state.to_u8(), Ordering::SeqCst);
                self.bus.publish_connection(wire_state);
                match wire_state {
                    ConnectionState::Connecting => self.set_state(ClientState::Connecting),
                    ConnectionState::Connected => {
                        self.on_connected();
                        self.set_state(ClientState::Connected);
                    }
                    ConnectionState::Disconnected => {
                        self.on_disconnected();
                        self.set_state(ClientState::Disconnected);
                        self.schedule_reconnect();
                    }
                }
            }
            WireEvent::Message(message) => dispatcher.dispatch(self, message),
        }
    }

    fn on_connected(&mut self) {
        // Re-enable reconnects in case we used to explicitly stay offline.
        self.policy.set_enabled(true);
        self.policy.reset();
        self.login_seq += 1;
        self.probe_started = false;
        self.connection.send(&ClientMessage::AskSession {
            version: self.config.version.clone(),
            user_agent: self.config.user_agent.clone(),
        });
    }

    fn on_disconnected(&mut self) {
        warn!("disconnected from lobby server");
        self.session.clear();
        self.game_session = None;
        self.connectivity = None;
        self.searching = false;
        self.registry_write().clear_on_disconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.shutting_down {
            return;
        }
        let Some(delay) = self.policy.next_delay() else {
            return;
        };
        info!(
            "scheduling reconnect attempt {} in {:?}",
            self.policy.attempts(),
            delay
        );
        let epoch = self.reconnect_epoch;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(EngineMsg::ReconnectTick { epoch });
        });
    }

    fn handle_reconnect_tick(&mut self, epoch: u64) {
        if self.shutting_down || epoch != self.reconnect_epoch || !self.policy.enabled() {
            return;
        }
        if self.connection.state() != ConnectionState::Disconnected {
            return;
        }
        info!("attempting reconnect");
        self.connection.connect();
    }

    // ── Authentication handshake ────────────────────────────────────

    fn handle_session(&mut self, message: Value) {
        let Some(token) = message.get("session").and_then(token_to_string) else {
            warn!("session message without a token: {message}");
            return;
        };
        self.session.token = Some(token);
        self.get_creds_and_login();
    }

    fn get_creds_and_login(&mut self) {
        if self.auto_relogin {
            if let (Some(login), Some(password)) = (self.login.clone(), self.password.clone()) {
                if self.send_login(login, password) {
                    return;
                }
            }
        }
        self.request_credentials();
    }

    fn request_credentials(&mut self) {
        let provider = Arc::clone(&self.credentials);
        let prior_login = self.login.clone();
        let login_generation = self.login_seq;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let decision = provider.request_credentials(prior_login).await;
            let _ = inbox.send(EngineMsg::Credentials {
                login_generation,
                decision,
            });
        });
    }

    fn handle_credentials(&mut self, login_generation: u64, decision: CredentialDecision) {
        if self.shutting_down || login_generation != self.login_seq {
            debug!("dropping credential decision from a previous login cycle");
            return;
        }
        match decision {
            CredentialDecision::Submit { login, password } => {
                if !self.send_login(login, password) {
                    self.request_credentials();
                }
            }
            CredentialDecision::Cancel => {
                info!("login cancelled, staying offline");
                self.reconnect_epoch += 1;
                self.policy.set_enabled(false);
                self.connection.disconnect();
            }
            CredentialDecision::Quit => {
                info!("quit requested from the login dialog");
                self.shutdown();
            }
        }
    }

    /// Send `hello`. Returns false when the attempt was aborted before
    /// anything hit the wire.
    fn send_login(&mut self, login: String, password: String) -> bool {
        // Fresh credentials: no silent reuse until the server accepts them.
        self.auto_relogin = false;
        let Some(token) = self.session.token.clone() else {
            warn!("login requested without a session token");
            return false;
        };
        let password = if self.config.test_mode {
            // Never send a real password to a development server.
            hash_password("foo")
        } else {
            password
        };
        let unique_id = match self.uid_source.unique_id(&login, &token) {
            Ok(id) => id,
            Err(e) => {
                error!("unique id computation failed: {e}");
                self.bus.publish_notice(Notice::error(
                    "Failed to calculate your unique ID. Please report this to support.",
                ));
                return false;
            }
        };
        self.login = Some(login.clone());
        self.password = Some(password.clone());
        self.connection.send(&ClientMessage::Hello {
            login,
            password,
            unique_id,
            session: token,
        });
        true
    }

    fn handle_welcome(&mut self, message: Value) {
        if self.session.token.is_none() {
            // Protocol fault: the handshake cannot have reached this point.
            error!("welcome received before a session token exists: {message}");
            return;
        }
        let payload: WelcomePayload = match serde_json::from_value(message.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!("malformed welcome: {e}: {message}");
                return;
            }
        };
        info!("logged in as {} ({})", payload.login, payload.id);
        self.session.user_id = Some(payload.id);
        self.session.login = Some(payload.login.clone());
        self.session.authenticated = true;
        self.auto_relogin = true;
        self.login = Some(payload.login.clone());

        let me = Player::new(payload.id, payload.login);
        self.registry_write().insert_me(me.clone());

        if self.config.use_upnp {
            // Port mapping itself belongs to the platform collaborator.
            debug!(
                "UPnP mapping requested for game port {}",
                self.config.game_port
            );
        }

        self.set_state(ClientState::LoggedIn);
        self.bus.publish_authorized(me);
        self.start_probe();
    }

    fn handle_authentication_failed(&mut self, message: Value) {
        let text = serde_json::from_value::<AuthenticationFailedPayload>(message)
            .map(|p| p.text)
            .unwrap_or_else(|_| "Authentication failed".into());
        warn!("authentication failed: {text}");
        self.bus.publish_notice(Notice {
            style: NoticeStyle::Warning,
            text,
        });
        self.auto_relogin = false;
        self.get_creds_and_login();
    }

    // ── Connectivity probe & game session ───────────────────────────

    fn start_probe(&mut self) {
        if self.probe_started {
            return;
        }
        self.probe_started = true;
        let probe = Arc::clone(&self.probe);
        let game_port = self.config.game_port;
        let login_generation = self.login_seq;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = probe.probe(game_port).await;
            let _ = inbox.send(EngineMsg::ProbeDone {
                login_generation,
                result,
            });
        });
    }

    fn handle_probe_done(
        &mut self,
        login_generation: u64,
        result: Result<ProbeReport, ProbeError>,
    ) {
        if self.shutting_down || login_generation != self.login_seq {
            debug!("dropping probe result from a previous login cycle");
            return;
        }
        match result {
            Ok(report) => {
                info!("connectivity established: {:?}", report.mode);
                self.connectivity = Some(report.clone());
                self.game_generation += 1;
                self.game_session = Some(GameSession::new(self.game_generation, report.clone()));
                self.bus.publish_connectivity(report);
            }
            Err(e) => {
                error!("connectivity probe failed: {e}");
                self.bus
                    .publish_notice(Notice::error(format!("Connectivity test failed: {e}")));
            }
        }
    }

    // ── Game launch readiness ───────────────────────────────────────

    fn register_intent(&mut self, intent: LaunchIntent) {
        let Some(session) = self.game_session.as_mut() else {
            warn!("launch requested before the connectivity probe completed");
            self.bus
                .publish_notice(Notice::error("Not ready to launch a game yet"));
            return;
        };
        let (id, replaced) = session.register_intent(intent);
        if let Some(replaced) = replaced {
            debug!("pending launch intent {} replaced by {id}", replaced.id);
        }
        match session.listen_state() {
            ListenState::Ready => self.fire_pending(),
            ListenState::Binding => {}
            ListenState::Idle => {
                session.mark_binding();
                let generation = session.generation();
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let result = bind_relay().await;
                    let _ = inbox.send(EngineMsg::RelayBound { generation, result });
                });
            }
        }
    }

    fn handle_relay_bound(
        &mut self,
        generation: u64,
        result: std::io::Result<(u16, TcpListener)>,
    ) {
        if self.shutting_down {
            return;
        }
        let Some(session) = self.game_session.as_mut() else {
            return;
        };
        if session.generation() != generation {
            debug!("dropping relay bind for a replaced game session");
            return;
        }
        match result {
            Ok((port, listener)) => {
                info!("relay port {port} bound");
                session.mark_ready(port, listener);
                self.fire_pending();
            }
            Err(e) => {
                error!("failed to bind the relay port: {e}");
                session.mark_idle();
                self.bus
                    .publish_notice(Notice::error("Failed to open the local relay port"));
            }
        }
    }

    /// Fire the pending launch intent, exactly once per registration.
    fn fire_pending(&mut self) {
        let Some(session) = self.game_session.as_mut() else {
            return;
        };
        if !session.is_ready() {
            return;
        }
        let Some(pending) = session.take_pending() else {
            return;
        };
        let relay_address = session.launch_relay_address().map(str::to_owned);
        let gameport = self.config.game_port;
        debug!("firing launch intent {}", pending.id);
        let message = match pending.intent {
            LaunchIntent::SearchRanked { faction } => {
                self.searching = true;
                self.last_faction = Some(faction);
                ClientMessage::GameMatchmaking {
                    mod_: "ladder1v1".into(),
                    state: "start".into(),
                    gameport: Some(gameport),
                    faction: Some(faction),
                    relay_address,
                }
            }
            LaunchIntent::HostGame {
                title,
                mod_,
                visibility,
                mapname,
                password,
            } => {
                session.game_password = password.clone();
                ClientMessage::GameHost {
                    title,
                    mod_,
                    visibility,
                    mapname,
                    password,
                    is_rehost: false,
                    relay_address,
                }
            }
            LaunchIntent::JoinGame { uid, password } => {
                session.game_password = password.clone();
                ClientMessage::GameJoin {
                    uid,
                    gameport,
                    password,
                    relay_address,
                }
            }
        };
        self.connection.send(&message);
    }

    fn handle_game_launch(&mut self, message: Value) {
        let Some(relay_port) = self.game_session.as_ref().and_then(|s| s.relay_port()) else {
            error!("not ready for game launch: {message}");
            self.bus
                .publish_notice(Notice::error("Not ready for game launch"));
            return;
        };
        let payload: GameLaunchPayload = match serde_json::from_value(message.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!("malformed game_launch: {e}: {message}");
                return;
            }
        };
        let me = self.registry_read().me().cloned();
        let Some(me) = me else {
            error!("game launch before login completed: {message}");
            return;
        };

        self.searching = false;
        let (args, init_mode) = launch_arguments(&me, &payload.mod_, self.last_faction);
        if let Some(session) = self.game_session.as_mut() {
            session.game_uid = Some(payload.uid);
            session.init_mode = init_mode;
        }

        info!("handing off launch of game {} ({})", payload.uid, payload.mod_);
        self.bus.publish_launch(GameLaunch {
            uid: payload.uid,
            featured_mod: payload.mod_,
            mapname: payload.mapname,
            sim_mods: payload.sim_mods,
            init_mode,
            relay_port,
            recorder: me.login,
            launched_at: chrono::Utc::now(),
            args,
        });
    }

    // ── Directory, matchmaker, notices ──────────────────────────────

    fn handle_player_info(&mut self, message: Value) {
        let payload: PlayerInfoPayload = match serde_json::from_value(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed player_info: {e}");
                return;
            }
        };
        let mut registry = self.registry_write();
        for entry in &payload.players {
            registry.upsert(entry);
        }
    }

    fn handle_social(&mut self, message: Value) {
        let payload: SocialPayload = match serde_json::from_value(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed social: {e}");
                return;
            }
        };
        {
            let mut registry = self.registry_write();
            if let Some(friends) = payload.friends {
                registry.set_friends(friends);
            }
            if let Some(foes) = payload.foes {
                registry.set_foes(foes);
            }
            if let Some(power) = payload.power {
                registry.set_power(power);
            }
        }
        if let Some(channels) = payload.channels {
            self.bus
                .publish_social(SocialEvent::ChannelsUpdated(channels));
        }
        if let Some(autojoin) = payload.autojoin {
            self.bus.publish_social(SocialEvent::AutoJoin(autojoin));
        }
    }

    fn handle_matchmaker_info(&mut self, message: Value) {
        let me = self.registry_read().me().cloned();
        let Some(me) = me else {
            return;
        };
        if message.get("action").is_some() {
            self.bus.publish_matchmaker(MatchmakerEvent::Action(message));
            return;
        }
        if message.get("queues").is_none() {
            return;
        }
        // An unconverged rating or a running search says nothing useful.
        if me.ladder_rating_deviation > matchmaker::SUPPRESS_DEVIATION || self.searching {
            return;
        }
        let payload: MatchmakerQueuesPayload = match serde_json::from_value(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed matchmaker_info: {e}");
                return;
            }
        };
        let eligible = matchmaker::is_eligible(
            &payload.queues,
            me.ladder_rating_mean,
            me.ladder_rating_deviation,
        );
        self.bus
            .publish_matchmaker(MatchmakerEvent::Eligibility(eligible));
    }

    fn handle_notice(&mut self, message: Value) {
        let payload: NoticePayload = match serde_json::from_value(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed notice: {e}");
                return;
            }
        };
        let style = NoticeStyle::from_wire(payload.style.as_deref());
        if matches!(style, NoticeStyle::Error | NoticeStyle::Kick) {
            // Server-side rejection: retrying these credentials would loop.
            self.auto_relogin = false;
        }
        if style == NoticeStyle::Kick {
            info!("kicked from the lobby");
        }
        if style == NoticeStyle::Kill {
            info!("server killed the running game");
        }
        match payload.text {
            Some(text) => self.bus.publish_notice(Notice { style, text }),
            None if matches!(style, NoticeStyle::Kill | NoticeStyle::Kick) => {
                self.bus.publish_notice(Notice {
                    style,
                    text: String::new(),
                })
            }
            None => {}
        }
    }

    fn handle_registration_response(&mut self, message: Value) {
        let payload: RegistrationResponsePayload = match serde_json::from_value(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed registration_response: {e}");
                return;
            }
        };
        if payload.result == "SUCCESS" {
            return;
        }
        self.bus.publish_notice(Notice {
            style: NoticeStyle::Info,
            text: payload.error.unwrap_or_else(|| "Registration failed".into()),
        });
    }

    fn handle_update(&mut self, message: Value) {
        warn!("server requires a client update: {message}");
        self.bus.publish_notice(Notice {
            style: NoticeStyle::Warning,
            text: "A client update is required".into(),
        });
    }

    fn handle_invalid(&mut self, message: Value) {
        // The server considers our state unrecoverable; reconnecting would
        // reproduce the same fault over and over.
        error!("server declared the client state invalid: {message}");
        self.policy.set_enabled(false);
        let fault = FatalFault {
            reason: "server declared the session invalid".into(),
            raw: message,
        };
        self.fatal = Some(fault.clone());
        self.bus.publish_fault(fault);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("shutting down");
        if let Some(fault) = &self.fatal {
            warn!("shutdown follows a fatal fault: {}", fault.reason);
        }
        self.shutting_down = true;
        self.reconnect_epoch += 1;
        // Strictly sequential: policy, wire, identity, notification.
        self.policy.set_enabled(false);
        self.connection.disconnect();
        self.session.clear();
        self.game_session = None;
        self.connectivity = None;
        self.set_state(ClientState::ShuttingDown);
    }
}

/// Bind the local relay port the game process will connect to.
async fn bind_relay() -> std::io::Result<(u16, TcpListener)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((port, listener))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_password, Sha256Uid, UidSource};
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    // ── Test doubles ────────────────────────────────────────────────

    /// Transport fed by the test through a channel; `None` closes the link.
    struct ChannelTransport {
        feed: mpsc::UnboundedReceiver<Option<String>>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            match self.feed.recv().await {
                Some(Some(text)) => Some(Ok(text)),
                Some(None) | None => None,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// One pre-wired connection the test can feed and inspect.
    struct TestWire {
        feed: mpsc::UnboundedSender<Option<String>>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    impl TestWire {
        fn push(&self, message: Value) {
            // A closed feed means the engine already dropped the transport,
            // which is exactly what absorption tests exercise.
            let _ = self.feed.send(Some(message.to_string()));
        }

        fn close(&self) {
            let _ = self.feed.send(None);
        }
    }

    struct TestConnector {
        wires: StdMutex<VecDeque<ChannelTransport>>,
        connects: AtomicU32,
    }

    impl TestConnector {
        fn with_wires(count: usize) -> (Arc<Self>, Vec<TestWire>) {
            let mut transports = VecDeque::new();
            let mut wires = Vec::new();
            for _ in 0..count {
                let (feed_tx, feed_rx) = mpsc::unbounded_channel();
                let sent = Arc::new(StdMutex::new(Vec::new()));
                transports.push_back(ChannelTransport {
                    feed: feed_rx,
                    sent: Arc::clone(&sent),
                });
                wires.push(TestWire {
                    feed: feed_tx,
                    sent,
                });
            }
            let connector = Arc::new(Self {
                wires: StdMutex::new(transports),
                connects: AtomicU32::new(0),
            });
            (connector, wires)
        }

        fn connect_count(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let transport = self.wires.lock().unwrap().pop_front();
            match transport {
                Some(t) => Ok(Box::new(t)),
                None => Err(TransportError::Connect("no wire scripted".into())),
            }
        }
    }

    struct ScriptedCredentials {
        decisions: StdMutex<VecDeque<CredentialDecision>>,
        calls: AtomicU32,
    }

    impl ScriptedCredentials {
        fn new(decisions: Vec<CredentialDecision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: StdMutex::new(decisions.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialProvider for ScriptedCredentials {
        async fn request_credentials(&self, _prior_login: Option<String>) -> CredentialDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decisions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CredentialDecision::Cancel)
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn test_config() -> ClientConfig {
        ClientConfig {
            remember: true,
            login: Some("bob".into()),
            password: Some("pw".into()),
            reconnect_initial_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            ..Default::default()
        }
    }

    fn sent_commands(wire: &TestWire) -> Vec<Value> {
        wire.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| serde_json::from_str(m).unwrap())
            .collect()
    }

    /// Poll the wire until a message with the given command was sent.
    async fn wait_for_sent(wire: &TestWire, command: &str) -> Value {
        for _ in 0..200 {
            if let Some(found) = sent_commands(wire)
                .into_iter()
                .find(|m| m["command"] == command)
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for outbound {command}");
    }

    async fn wait_for_state(
        rx: &mut broadcast::Receiver<ClientState>,
        wanted: ClientState,
    ) -> ClientState {
        for _ in 0..50 {
            let state = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for state change")
                .expect("state channel closed");
            if state == wanted {
                return state;
            }
        }
        panic!("never reached state {wanted:?}");
    }

    /// Drive a client through the full handshake on `wire`.
    async fn login(client: &LobbyClient, wire: &TestWire) {
        let mut states = client.subscribe_state();
        client.connect().unwrap();
        wait_for_sent(wire, "ask_session").await;
        wire.push(json!({"command": "session", "session": "abc"}));
        wait_for_sent(wire, "hello").await;
        wire.push(json!({"command": "welcome", "id": 7, "login": "bob"}));
        wait_for_state(&mut states, ClientState::LoggedIn).await;
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_full_handshake_with_remembered_credentials() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut states = client.subscribe_state();
        let mut authorized = client.subscribe_authorized();

        client.connect().unwrap();
        wait_for_state(&mut states, ClientState::Connected).await;

        let ask_session = wait_for_sent(&wires[0], "ask_session").await;
        assert_eq!(ask_session["user_agent"], "faf-client");

        wires[0].push(json!({"command": "session", "session": "abc"}));
        let hello = wait_for_sent(&wires[0], "hello").await;
        assert_eq!(hello["login"], "bob");
        assert_eq!(hello["password"], "pw");
        assert_eq!(hello["session"], "abc");
        let expected_uid = Sha256Uid.unique_id("bob", "abc").unwrap();
        assert_eq!(hello["unique_id"], expected_uid.as_str());

        wires[0].push(json!({"command": "welcome", "id": 7, "login": "bob"}));
        wait_for_state(&mut states, ClientState::LoggedIn).await;

        let me = tokio::time::timeout(Duration::from_secs(2), authorized.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(me.id, 7);
        assert_eq!(client.me().unwrap().login, "bob");
        assert_eq!(client.player(7).unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_numeric_session_token_accepted() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;

        wires[0].push(json!({"command": "session", "session": 31337}));
        let hello = wait_for_sent(&wires[0], "hello").await;
        assert_eq!(hello["session"], "31337");
    }

    #[tokio::test]
    async fn test_test_mode_sends_fixed_password() {
        let (connector, wires) = TestConnector::with_wires(1);
        let config = ClientConfig {
            test_mode: true,
            ..test_config()
        };
        let client = LobbyClientBuilder::new(config).connector(connector).spawn();
        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;

        wires[0].push(json!({"command": "session", "session": "abc"}));
        let hello = wait_for_sent(&wires[0], "hello").await;
        assert_eq!(hello["password"], hash_password("foo").as_str());
    }

    #[tokio::test]
    async fn test_fingerprint_failure_aborts_attempt_without_disconnect() {
        struct BrokenUid;
        impl UidSource for BrokenUid {
            fn unique_id(&self, _login: &str, _session: &str) -> Result<String, crate::auth::UidError> {
                Err(crate::auth::UidError::Failed("no hardware token".into()))
            }
        }

        // The re-prompt dialog stays open, like a real one would.
        struct StuckCredentials;
        #[async_trait]
        impl CredentialProvider for StuckCredentials {
            async fn request_credentials(&self, _prior_login: Option<String>) -> CredentialDecision {
                std::future::pending().await
            }
        }

        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .uid_source(Arc::new(BrokenUid))
            .credentials(Arc::new(StuckCredentials))
            .spawn();
        let mut notices = client.subscribe_notices();

        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;
        wires[0].push(json!({"command": "session", "session": "abc"}));

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.style, NoticeStyle::Error);

        // No hello went out, and the transport stayed up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            !sent_commands(&wires[0])
                .iter()
                .any(|m| m["command"] == "hello"),
            "hello must be withheld when the fingerprint fails"
        );
        assert_eq!(client.client_state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_welcome_before_session_is_fault_not_crash() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut authorized = client.subscribe_authorized();
        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;

        // Out-of-order welcome must be dropped, not acted on.
        wires[0].push(json!({"command": "welcome", "id": 7, "login": "bob"}));
        let premature =
            tokio::time::timeout(Duration::from_millis(100), authorized.recv()).await;
        assert!(premature.is_err(), "premature welcome must not authorize");

        // The engine is still alive and finishes a proper handshake.
        wires[0].push(json!({"command": "session", "session": "abc"}));
        wait_for_sent(&wires[0], "hello").await;
        wires[0].push(json!({"command": "welcome", "id": 7, "login": "bob"}));
        let me = tokio::time::timeout(Duration::from_secs(2), authorized.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(me.id, 7);
    }

    #[tokio::test]
    async fn test_host_game_defers_until_ready_and_carries_relay_for_stun() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .probe(Arc::new(StaticProbe::stun("9.9.9.9:4711")))
            .spawn();
        let mut connectivity = client.subscribe_connectivity();

        login(&client, &wires[0]).await;
        let report = tokio::time::timeout(Duration::from_secs(2), connectivity.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.launch_relay_address(), Some("9.9.9.9:4711"));

        // Registered before the relay port exists; fires once it is bound.
        client
            .host_game("T", "faf", GameVisibility::Public, "map1", None)
            .unwrap();
        let host = wait_for_sent(&wires[0], "game_host").await;
        assert_eq!(host["title"], "T");
        assert_eq!(host["mod"], "faf");
        assert_eq!(host["mapname"], "map1");
        assert!(host["password"].is_null());
        assert_eq!(host["relay_address"], "9.9.9.9:4711");
    }

    #[tokio::test]
    async fn test_launch_omits_relay_for_public_traversal() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .probe(Arc::new(StaticProbe::public()))
            .spawn();
        let mut connectivity = client.subscribe_connectivity();

        login(&client, &wires[0]).await;
        connectivity.recv().await.unwrap();

        client
            .host_game("T", "faf", GameVisibility::Public, "map1", None)
            .unwrap();
        let host = wait_for_sent(&wires[0], "game_host").await;
        assert!(host.get("relay_address").is_none());
    }

    #[tokio::test]
    async fn test_second_intent_replaces_first() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut connectivity = client.subscribe_connectivity();

        login(&client, &wires[0]).await;
        connectivity.recv().await.unwrap();

        // Both intents are queued before the relay bind can complete, so the
        // second replaces the first and only game_join goes out.
        client
            .host_game("T", "faf", GameVisibility::Public, "map1", None)
            .unwrap();
        client.join_game(42, Some("sesame".into())).unwrap();

        let join = wait_for_sent(&wires[0], "game_join").await;
        assert_eq!(join["uid"], 42);
        assert_eq!(join["password"], "sesame");
        assert!(
            !sent_commands(&wires[0])
                .iter()
                .any(|m| m["command"] == "game_host"),
            "replaced intent must never fire"
        );
    }

    #[tokio::test]
    async fn test_launch_refused_without_game_session() {
        let (connector, wires) = TestConnector::with_wires(1);
        // A probe that never completes: the game session never exists.
        struct StuckProbe;
        #[async_trait]
        impl ConnectivityProbe for StuckProbe {
            async fn probe(&self, _game_port: u16) -> Result<ProbeReport, ProbeError> {
                std::future::pending().await
            }
        }
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .probe(Arc::new(StuckProbe))
            .spawn();
        let mut notices = client.subscribe_notices();

        login(&client, &wires[0]).await;
        client
            .host_game("T", "faf", GameVisibility::Public, "map1", None)
            .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.style, NoticeStyle::Error);
        assert!(
            !sent_commands(&wires[0])
                .iter()
                .any(|m| m["command"] == "game_host"),
            "command must be withheld"
        );
        // The session stays usable.
        assert_eq!(client.client_state(), ClientState::LoggedIn);
    }

    #[tokio::test]
    async fn test_search_ranked_and_game_launch_arguments() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut connectivity = client.subscribe_connectivity();
        let mut launches = client.subscribe_launches();

        login(&client, &wires[0]).await;
        connectivity.recv().await.unwrap();

        client.search_ranked(Faction::Aeon).unwrap();
        let search = wait_for_sent(&wires[0], "game_matchmaking").await;
        assert_eq!(search["mod"], "ladder1v1");
        assert_eq!(search["state"], "start");
        assert_eq!(search["faction"], "aeon");

        // Server found a match; ladder launches carry the faction and the
        // fixed 1v1 layout.
        wires[0].push(json!({
            "command": "player_info",
            "players": [{"id": 7, "ladder_rating": [1650.0, 80.0]}]
        }));
        wires[0].push(json!({"command": "game_launch", "uid": 99, "mod": "ladder1v1"}));

        let launch = tokio::time::timeout(Duration::from_secs(2), launches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(launch.uid, 99);
        assert_eq!(launch.featured_mod, "ladder1v1");
        assert_eq!(launch.recorder, "bob");
        assert!(launch.relay_port > 0);
        assert_eq!(
            launch.args,
            vec![
                "/aeon",
                "/mean",
                "1650",
                "/deviation",
                "80",
                "/players 2",
                "/team 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_search_clears_active_search() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut connectivity = client.subscribe_connectivity();

        login(&client, &wires[0]).await;
        connectivity.recv().await.unwrap();

        client.search_ranked(Faction::Uef).unwrap();
        wait_for_sent(&wires[0], "game_matchmaking").await;

        client.stop_search().unwrap();
        for _ in 0..200 {
            let stops = sent_commands(&wires[0])
                .iter()
                .filter(|m| m["command"] == "game_matchmaking" && m["state"] == "stop")
                .count();
            if stops == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stop message never sent");
    }

    #[tokio::test]
    async fn test_explicit_disconnect_schedules_no_reconnect() {
        let (connector, wires) = TestConnector::with_wires(2);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector.clone())
            .spawn();
        let mut states = client.subscribe_state();

        client.connect().unwrap();
        wait_for_state(&mut states, ClientState::Connected).await;

        client.disconnect().unwrap();
        wait_for_state(&mut states, ClientState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.connect_count(), 1, "no retry after going offline");
        let _ = &wires;
    }

    #[tokio::test]
    async fn test_wire_drop_triggers_backed_off_reconnect() {
        let (connector, wires) = TestConnector::with_wires(2);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector.clone())
            .spawn();
        let mut states = client.subscribe_state();

        client.connect().unwrap();
        wait_for_state(&mut states, ClientState::Connected).await;

        // Transport fault, not a user action: the policy retries.
        wires[0].close();
        wait_for_state(&mut states, ClientState::Disconnected).await;
        wait_for_state(&mut states, ClientState::Connected).await;
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_is_fatal_and_disables_reconnect() {
        let (connector, wires) = TestConnector::with_wires(2);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector.clone())
            .spawn();
        let mut states = client.subscribe_state();
        let mut faults = client.subscribe_faults();

        client.connect().unwrap();
        wait_for_state(&mut states, ClientState::Connected).await;

        wires[0].push(json!({"command": "invalid"}));
        let fault = tokio::time::timeout(Duration::from_secs(2), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.raw["command"], "invalid");

        // The server will drop us; the client must not retry into the same
        // fault.
        wires[0].close();
        wait_for_state(&mut states, ClientState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_authentication_failed_reprompts_for_credentials() {
        let (connector, wires) = TestConnector::with_wires(1);
        let credentials = ScriptedCredentials::new(vec![CredentialDecision::Submit {
            login: "alice".into(),
            password: "pw2".into(),
        }]);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .credentials(Arc::clone(&credentials) as Arc<dyn CredentialProvider>)
            .spawn();

        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;
        wires[0].push(json!({"command": "session", "session": "abc"}));
        wait_for_sent(&wires[0], "hello").await;

        wires[0].push(json!({
            "command": "authentication_failed",
            "text": "wrong password"
        }));

        // The dialog collaborator is asked and its answer retries the login.
        for _ in 0..200 {
            let hellos: Vec<_> = sent_commands(&wires[0])
                .into_iter()
                .filter(|m| m["command"] == "hello")
                .collect();
            if hellos.len() == 2 {
                assert_eq!(hellos[1]["login"], "alice");
                assert_eq!(credentials.call_count(), 1);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("second hello never sent");
    }

    #[tokio::test]
    async fn test_error_notice_disarms_auto_relogin() {
        let (connector, wires) = TestConnector::with_wires(2);
        let credentials = ScriptedCredentials::new(vec![]);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector.clone())
            .credentials(Arc::clone(&credentials) as Arc<dyn CredentialProvider>)
            .spawn();
        let mut states = client.subscribe_state();

        login(&client, &wires[0]).await;

        wires[0].push(json!({
            "command": "notice",
            "style": "error",
            "text": "you broke a rule"
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // After the reconnect, the engine must prompt instead of silently
        // reusing the remembered credentials.
        wires[0].close();
        wait_for_state(&mut states, ClientState::Connected).await;
        wait_for_sent(&wires[1], "ask_session").await;
        wires[1].push(json!({"command": "session", "session": "def"}));

        for _ in 0..200 {
            if credentials.call_count() >= 1 {
                assert!(
                    !sent_commands(&wires[1])
                        .iter()
                        .any(|m| m["command"] == "hello"),
                    "no silent relogin after an error notice"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("credential dialog never requested");
    }

    #[tokio::test]
    async fn test_friend_mutation_echoes_to_server_and_ignores_unknown_ids() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();

        login(&client, &wires[0]).await;
        wires[0].push(json!({
            "command": "player_info",
            "players": [{"id": 3, "login": "eve"}]
        }));
        for _ in 0..200 {
            if client.player(3).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.add_friend(3).unwrap();
        let add = wait_for_sent(&wires[0], "social_add").await;
        assert_eq!(add["friend"], 3);
        assert!(add.get("foe").is_none());
        assert!(client.is_friend(3));

        // Unknown id: silent no-op, nothing on the wire.
        client.add_friend(999).unwrap();
        client.add_foe(999).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sent_commands(&wires[0])
                .iter()
                .filter(|m| m["command"] == "social_add")
                .count(),
            1
        );
        assert!(!client.is_friend(999));
    }

    #[tokio::test]
    async fn test_social_message_updates_power_and_channels() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut social = client.subscribe_social();

        login(&client, &wires[0]).await;
        assert!(!client.has_admin_power());

        wires[0].push(json!({
            "command": "social",
            "power": 2,
            "channels": ["#aeolus"]
        }));
        let event = tokio::time::timeout(Duration::from_secs(2), social.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SocialEvent::ChannelsUpdated(channels) => assert_eq!(channels, vec!["#aeolus"]),
            other => panic!("unexpected social event {other:?}"),
        }
        assert!(client.has_admin_power());
    }

    #[tokio::test]
    async fn test_matchmaker_eligibility_cases() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut matchmaker_rx = client.subscribe_matchmaker();

        login(&client, &wires[0]).await;

        // Converged rating inside a 75s window: eligible.
        wires[0].push(json!({
            "command": "player_info",
            "players": [{"id": 7, "ladder_rating": [1500.0, 90.0]}]
        }));
        wires[0].push(json!({
            "command": "matchmaker_info",
            "queues": [{"queue_name": "ladder1v1", "boundary_75s": [[1400.0, 1600.0]]}]
        }));
        let event = tokio::time::timeout(Duration::from_secs(2), matchmaker_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MatchmakerEvent::Eligibility(true)));

        // Unconverged rating: suppressed entirely, regardless of mean.
        wires[0].push(json!({
            "command": "player_info",
            "players": [{"id": 7, "ladder_rating": [1500.0, 250.0]}]
        }));
        wires[0].push(json!({
            "command": "matchmaker_info",
            "queues": [{"queue_name": "ladder1v1", "boundary_75s": [[1400.0, 1600.0]]}]
        }));
        let suppressed =
            tokio::time::timeout(Duration::from_millis(100), matchmaker_rx.recv()).await;
        assert!(suppressed.is_err(), "high deviation must suppress the gate");
    }

    #[tokio::test]
    async fn test_matchmaker_action_passes_through() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut matchmaker_rx = client.subscribe_matchmaker();

        login(&client, &wires[0]).await;
        wires[0].push(json!({
            "command": "matchmaker_info",
            "action": "startSearching",
            "extra": 1
        }));
        let event = tokio::time::timeout(Duration::from_secs(2), matchmaker_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MatchmakerEvent::Action(raw) => {
                assert_eq!(raw["action"], "startSearching");
                assert_eq!(raw["extra"], 1);
            }
            other => panic!("unexpected matchmaker event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_clears_directory_but_keeps_me_shell() {
        let (connector, wires) = TestConnector::with_wires(2);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();
        let mut states = client.subscribe_state();

        login(&client, &wires[0]).await;
        wires[0].push(json!({
            "command": "player_info",
            "players": [{"id": 3, "login": "eve"}, {"id": 4, "login": "mallory"}]
        }));
        for _ in 0..200 {
            if client.players().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        wires[0].close();
        wait_for_state(&mut states, ClientState::Disconnected).await;

        let players = client.players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].id, 7);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector.clone())
            .spawn();
        let mut states = client.subscribe_state();

        login(&client, &wires[0]).await;
        client.shutdown().unwrap();
        wait_for_state(&mut states, ClientState::ShuttingDown).await;
        assert_eq!(client.client_state(), ClientState::ShuttingDown);

        // Anything after shutdown is absorbed; the state never changes again.
        wires[0].push(json!({"command": "session", "session": "zzz"}));
        wires[0].close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.client_state(), ClientState::ShuttingDown);
        assert_eq!(connector.connect_count(), 1);
        assert!(client.connect().is_err(), "commands after shutdown fail");
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let (connector, wires) = TestConnector::with_wires(1);
        let client = LobbyClientBuilder::new(test_config())
            .connector(connector)
            .spawn();

        client.connect().unwrap();
        wait_for_sent(&wires[0], "ask_session").await;
        wires[0].push(json!({"command": "shiny_new_feature", "data": [1, 2, 3]}));

        // Still alive and well.
        wires[0].push(json!({"command": "session", "session": "abc"}));
        wait_for_sent(&wires[0], "hello").await;
    }

    #[test]
    fn test_client_state_roundtrip() {
        for state in [
            ClientState::None,
            ClientState::Connecting,
            ClientState::Connected,
            ClientState::LoggedIn,
            ClientState::Disconnected,
            ClientState::ShuttingDown,
        ] {
            assert_eq!(ClientState::from_u8(state.to_u8()), state);
        }
    }
}

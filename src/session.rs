//! Session state
//!
//! Two lifetimes live here: the login [`Session`] (token + identity, one per
//! login cycle) and the per-launch [`GameSession`] (NAT traversal outcome,
//! relay port, pending launch intent). The GameSession is created after the
//! connectivity probe completes and replaced on the next login or when the
//! game exits.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::players::Player;
use crate::probe::ProbeReport;
use crate::protocol::{Faction, GameVisibility};

/// Login-cycle identity state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Opaque token issued by `session`, required for `hello`.
    pub token: Option<String>,
    /// Player id assigned by `welcome`.
    pub user_id: Option<u32>,
    /// Canonical login from `welcome`.
    pub login: Option<String>,
    /// Whether `welcome` completed this cycle.
    pub authenticated: bool,
}

impl Session {
    /// Drop all identity state (on disconnect or shutdown).
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Lobby mode the launched game starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Normal custom-game lobby.
    Normal,
    /// Automatic lobby for matchmade games.
    Auto,
}

/// A launch command waiting for session readiness.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchIntent {
    /// Enter the ranked queue.
    SearchRanked {
        /// Faction to queue with.
        faction: Faction,
    },
    /// Host a custom game.
    HostGame {
        /// Game title.
        title: String,
        /// Featured mod.
        mod_: String,
        /// Lobby visibility.
        visibility: GameVisibility,
        /// Map name.
        mapname: String,
        /// Lobby password.
        password: Option<String>,
    },
    /// Join an existing game.
    JoinGame {
        /// Game uid.
        uid: u32,
        /// Lobby password, when required.
        password: Option<String>,
    },
}

/// A registered launch intent, consumed exactly once when readiness fires.
#[derive(Debug, Clone)]
pub struct PendingIntent {
    /// Registration id, for tracing replaced intents.
    pub id: Uuid,
    /// The deferred command.
    pub intent: LaunchIntent,
}

/// Listening sub-state of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    /// No relay port requested yet.
    Idle,
    /// Relay port bind in flight.
    Binding,
    /// Relay port bound; launch intents may fire.
    Ready,
}

/// Per-launch session state, one generation per login or game exit.
#[derive(Debug)]
pub struct GameSession {
    generation: u64,
    connectivity: ProbeReport,
    listen_state: ListenState,
    relay_port: Option<u16>,
    /// Held so the bound port stays reserved for the game process.
    #[allow(dead_code)]
    relay_listener: Option<TcpListener>,
    pending: Option<PendingIntent>,
    /// Uid of the launched game, once `game_launch` arrives.
    pub game_uid: Option<u32>,
    /// Lobby password the launch was requested with.
    pub game_password: Option<String>,
    /// Lobby mode for the next launch.
    pub init_mode: InitMode,
}

impl GameSession {
    /// Create a fresh session for one probe outcome.
    pub fn new(generation: u64, connectivity: ProbeReport) -> Self {
        Self {
            generation,
            connectivity,
            listen_state: ListenState::Idle,
            relay_port: None,
            relay_listener: None,
            pending: None,
            game_uid: None,
            game_password: None,
            init_mode: InitMode::Normal,
        }
    }

    /// Generation counter distinguishing this session from replaced ones.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The probe outcome this session was created from.
    pub fn connectivity(&self) -> &ProbeReport {
        &self.connectivity
    }

    /// Relay endpoint for launch commands, present iff traversal is
    /// relay-based.
    pub fn launch_relay_address(&self) -> Option<&str> {
        self.connectivity.launch_relay_address()
    }

    /// Current listening sub-state.
    pub fn listen_state(&self) -> ListenState {
        self.listen_state
    }

    /// Bound relay port, once listening.
    pub fn relay_port(&self) -> Option<u16> {
        self.relay_port
    }

    /// Whether launch intents may fire.
    pub fn is_ready(&self) -> bool {
        self.listen_state == ListenState::Ready
    }

    /// Note that a relay bind was started.
    pub fn mark_binding(&mut self) {
        self.listen_state = ListenState::Binding;
    }

    /// Install the bound relay port and enter the ready sub-state.
    pub fn mark_ready(&mut self, port: u16, listener: TcpListener) {
        self.relay_port = Some(port);
        self.relay_listener = Some(listener);
        self.listen_state = ListenState::Ready;
    }

    /// Abandon an in-flight bind (after a bind failure).
    pub fn mark_idle(&mut self) {
        self.listen_state = ListenState::Idle;
    }

    /// Register a launch intent. A second registration before firing replaces
    /// the first; the replaced record is returned for logging and never
    /// fires.
    pub fn register_intent(&mut self, intent: LaunchIntent) -> (Uuid, Option<PendingIntent>) {
        let id = Uuid::new_v4();
        let replaced = self.pending.replace(PendingIntent { id, intent });
        (id, replaced)
    }

    /// Consume the pending intent. Each registration fires at most once.
    pub fn take_pending(&mut self) -> Option<PendingIntent> {
        self.pending.take()
    }

    /// Whether an intent is waiting for readiness.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Launch hand-off to the game-runner collaborator. The engine does not
/// start processes; it only assembles what the runner needs.
#[derive(Debug, Clone)]
pub struct GameLaunch {
    /// Game uid assigned by the server.
    pub uid: u32,
    /// Featured mod of the game.
    pub featured_mod: String,
    /// Map to launch on, when the server picked one.
    pub mapname: Option<String>,
    /// Sim mods required by the game.
    pub sim_mods: Option<Value>,
    /// Lobby mode for the game process.
    pub init_mode: InitMode,
    /// Local relay port the game process connects to.
    pub relay_port: u16,
    /// Login recording the replay.
    pub recorder: String,
    /// When the hand-off was produced.
    pub launched_at: DateTime<Utc>,
    /// Command-line arguments for the game process.
    pub args: Vec<String>,
}

/// Build the launch argument list for a featured mod.
///
/// The ladder mod differs structurally from every other mod: it carries the
/// queued faction, the ladder rating, and a fixed 1v1 team layout, and the
/// game starts in the automatic lobby.
pub fn launch_arguments(
    me: &Player,
    featured_mod: &str,
    faction: Option<Faction>,
) -> (Vec<String>, InitMode) {
    let mut args = Vec::new();
    let init_mode;

    if featured_mod == "ladder1v1" {
        if let Some(faction) = faction {
            args.push(format!("/{}", faction.to_name()));
        }
        args.push("/mean".into());
        args.push(me.ladder_rating_mean.to_string());
        args.push("/deviation".into());
        args.push(me.ladder_rating_deviation.to_string());
        args.push("/players 2".into());
        args.push("/team 1".into());
        init_mode = InitMode::Auto;
    } else {
        args.push("/mean".into());
        args.push(me.rating_mean.to_string());
        args.push("/deviation".into());
        args.push(me.rating_deviation.to_string());
        if let Some(country) = &me.country {
            args.push("/country".into());
            args.push(country.clone());
        }
        init_mode = InitMode::Normal;
    }

    if let Some(clan) = &me.clan {
        args.push("/clan".into());
        args.push(clan.clone());
    }

    (args, init_mode)
}

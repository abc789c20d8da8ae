//! Protocol Messages
//!
//! Wire format for client-server communication. Every message is a JSON
//! object carrying a `command` discriminant field, one message per frame.
//! Outbound messages are a tagged enum; inbound messages are kept as raw
//! JSON until a registered handler deserializes its typed payload, so unknown
//! commands and unknown fields pass through harmlessly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a login cycle; the server answers with `session`.
    AskSession {
        /// Client version string.
        version: String,
        /// Client identification.
        user_agent: String,
    },

    /// Credentials message completing the handshake.
    Hello {
        /// Account login.
        login: String,
        /// Hashed password.
        password: String,
        /// Deterministic fingerprint of (login, session token).
        unique_id: String,
        /// Session token issued by `session`.
        session: String,
    },

    /// Moderator action.
    Admin(AdminAction),

    /// Add a friend or foe relation.
    SocialAdd {
        /// Friend id, when adding a friend.
        #[serde(skip_serializing_if = "Option::is_none")]
        friend: Option<u32>,
        /// Foe id, when adding a foe.
        #[serde(skip_serializing_if = "Option::is_none")]
        foe: Option<u32>,
    },

    /// Remove a friend or foe relation.
    SocialRemove {
        /// Friend id, when removing a friend.
        #[serde(skip_serializing_if = "Option::is_none")]
        friend: Option<u32>,
        /// Foe id, when removing a foe.
        #[serde(skip_serializing_if = "Option::is_none")]
        foe: Option<u32>,
    },

    /// Avatar request for the logged-in user.
    Avatar {
        /// Requested avatar action.
        action: String,
    },

    /// Start or stop a ranked matchmaker search.
    GameMatchmaking {
        /// Featured mod of the queue.
        #[serde(rename = "mod")]
        mod_: String,
        /// `start` or `stop`.
        state: String,
        /// Local game port.
        #[serde(skip_serializing_if = "Option::is_none")]
        gameport: Option<u16>,
        /// Faction to search with.
        #[serde(skip_serializing_if = "Option::is_none")]
        faction: Option<Faction>,
        /// Relay endpoint, present only for relay-based traversal.
        #[serde(skip_serializing_if = "Option::is_none")]
        relay_address: Option<String>,
    },

    /// Host a custom game.
    GameHost {
        /// Game title.
        title: String,
        /// Featured mod.
        #[serde(rename = "mod")]
        mod_: String,
        /// Lobby visibility.
        visibility: GameVisibility,
        /// Map name.
        mapname: String,
        /// Lobby password; `null` hosts an open game.
        password: Option<String>,
        /// Whether this hosts a replacement for a dead lobby.
        is_rehost: bool,
        /// Relay endpoint, present only for relay-based traversal.
        #[serde(skip_serializing_if = "Option::is_none")]
        relay_address: Option<String>,
    },

    /// Join an existing game.
    GameJoin {
        /// Game uid from the directory.
        uid: u32,
        /// Local game port.
        gameport: u16,
        /// Lobby password, when the game requires one.
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Relay endpoint, present only for relay-based traversal.
        #[serde(skip_serializing_if = "Option::is_none")]
        relay_address: Option<String>,
    },
}

impl ClientMessage {
    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Moderator actions carried by the `admin` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminAction {
    /// Close a player's running game.
    #[serde(rename = "closeFA")]
    CloseGame {
        /// Target player id.
        user_id: u32,
    },
    /// Force users into a chat channel.
    JoinChannel {
        /// Target player ids.
        user_ids: Vec<u32>,
        /// Channel to join.
        channel: String,
    },
    /// Request the full avatar list.
    #[serde(rename = "requestavatars")]
    RequestAvatars,
}

/// Playable factions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Faction {
    /// United Earth Federation.
    Uef,
    /// Aeon Illuminate.
    Aeon,
    /// Cybran Nation.
    Cybran,
    /// Seraphim.
    Seraphim,
}

impl Faction {
    /// Faction name as used in launch arguments.
    pub fn to_name(self) -> &'static str {
        match self {
            Faction::Uef => "uef",
            Faction::Aeon => "aeon",
            Faction::Cybran => "cybran",
            Faction::Seraphim => "seraphim",
        }
    }
}

/// Lobby visibility of a hosted game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameVisibility {
    /// Listed for everyone.
    Public,
    /// Listed for friends only.
    Friends,
}

// =============================================================================
// SERVER -> CLIENT PAYLOADS
// =============================================================================

/// Payload of `welcome`.
#[derive(Debug, Clone, Deserialize)]
pub struct WelcomePayload {
    /// Assigned player id.
    pub id: u32,
    /// Canonical login spelling.
    pub login: String,
}

/// Payload of `authentication_failed`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationFailedPayload {
    /// Human-readable failure reason.
    pub text: String,
}

/// Payload of `notice`.
#[derive(Debug, Clone, Deserialize)]
pub struct NoticePayload {
    /// Notice style; absent means a plain informational notice.
    #[serde(default)]
    pub style: Option<String>,
    /// Notice text, when the notice carries one.
    #[serde(default)]
    pub text: Option<String>,
}

/// Payload of `registration_response`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponsePayload {
    /// `SUCCESS` or a failure marker.
    pub result: String,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of `social`.
#[derive(Debug, Clone, Deserialize)]
pub struct SocialPayload {
    /// Full friend id list, when present.
    #[serde(default, deserialize_with = "lenient_id_seq")]
    pub friends: Option<Vec<u32>>,
    /// Full foe id list, when present.
    #[serde(default, deserialize_with = "lenient_id_seq")]
    pub foes: Option<Vec<u32>>,
    /// Chat channels the user belongs to.
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    /// Channels to join automatically.
    #[serde(default)]
    pub autojoin: Option<Vec<String>>,
    /// Moderator power level.
    #[serde(default)]
    pub power: Option<u8>,
}

/// Payload of `player_info`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerInfoPayload {
    /// Player directory entries.
    pub players: Vec<PlayerInfoEntry>,
}

/// One directory entry inside `player_info`.
///
/// All fields except `id` are optional so partial updates merge into the
/// registry without clobbering known values.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerInfoEntry {
    /// Player id.
    pub id: u32,
    /// Login.
    #[serde(default)]
    pub login: Option<String>,
    /// Global rating as `[mean, deviation]`.
    #[serde(default)]
    pub global_rating: Option<(f64, f64)>,
    /// Ladder rating as `[mean, deviation]`.
    #[serde(default)]
    pub ladder_rating: Option<(f64, f64)>,
    /// Total games played.
    #[serde(default)]
    pub number_of_games: Option<u32>,
    /// Clan tag.
    #[serde(default)]
    pub clan: Option<String>,
    /// Country code.
    #[serde(default)]
    pub country: Option<String>,
}

/// Payload of `matchmaker_info` carrying queue tables.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakerQueuesPayload {
    /// Per-queue rating boundary tables.
    pub queues: Vec<QueueInfo>,
}

/// One matchmaker queue entry.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    /// Queue identifier, e.g. `ladder1v1`.
    pub queue_name: String,
    /// Rating windows for converged players.
    #[serde(default)]
    pub boundary_75s: Vec<(f64, f64)>,
    /// Rating windows for unconverged players.
    #[serde(default)]
    pub boundary_80s: Vec<(f64, f64)>,
}

/// Payload of `game_launch`.
#[derive(Debug, Clone, Deserialize)]
pub struct GameLaunchPayload {
    /// Game uid assigned by the server.
    pub uid: u32,
    /// Featured mod of the launched game.
    #[serde(rename = "mod")]
    pub mod_: String,
    /// Map to launch on, when the server picked one.
    #[serde(default)]
    pub mapname: Option<String>,
    /// Sim mods required for the game.
    #[serde(default)]
    pub sim_mods: Option<Value>,
}

// =============================================================================
// DECODING HELPERS
// =============================================================================

/// Extract the `command` discriminant of an inbound message.
pub fn command_of(message: &Value) -> Option<&str> {
    message.get("command").and_then(Value::as_str)
}

/// Normalize a token-like JSON value (number or string) to its string form.
pub fn token_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accept id lists whose elements arrive as numbers or numeric strings.
fn lenient_id_seq<'de, D>(deserializer: D) -> Result<Option<Vec<u32>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|values| {
        values
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_u64().map(|n| n as u32),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect()
    }))
}

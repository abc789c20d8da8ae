//! # Lobby Session Engine
//!
//! Session engine for a multiplayer lobby client: maintains the control
//! connection to the lobby server, authenticates the user, mirrors the live
//! player directory, and orchestrates the deferred handshake that launches a
//! game once the NAT-traversal probe has a verdict.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LOBBY SESSION ENGINE                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  transport.rs  - Transport/Connector trait + WebSocket impl  │
//! │  connection.rs - Wire lifecycle, io task, fire-and-forget tx │
//! │  protocol.rs   - Wire messages (command-tagged JSON)         │
//! │  dispatch.rs   - Command-name keyed inbound routing          │
//! │  reconnect.rs  - Backed-off reconnection policy              │
//! │  players.rs    - Player directory + friend/foe/power state   │
//! │  session.rs    - Login session & per-launch game session     │
//! │  matchmaker.rs - Ladder invite eligibility gate              │
//! │  auth.rs       - Fingerprint, password hash, login dialog    │
//! │  probe.rs      - NAT-traversal probe collaborator seam       │
//! │  events.rs     - Broadcast channel per event type            │
//! │  client.rs     - Engine task + cloneable LobbyClient handle  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency model
//!
//! Everything mutable is owned by one engine task. Wire events, collaborator
//! commands, reconnect timers, and completions of slow external steps
//! (connectivity probe, credential dialog, relay port bind) arrive through a
//! single inbox channel and are handled strictly in arrival order, so the
//! handshake sequence can never be violated by reordering. Collaborators get
//! read-only snapshots and per-type broadcast streams.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod matchmaker;
pub mod players;
pub mod probe;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientState, EngineError, LobbyClient, LobbyClientBuilder};
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use events::{FatalFault, Notice, NoticeStyle, SocialEvent};
pub use matchmaker::MatchmakerEvent;
pub use players::{Player, PlayerRegistry};
pub use probe::{ConnectivityProbe, ProbeReport, StaticProbe, TraversalMode};
pub use protocol::{ClientMessage, Faction, GameVisibility};
pub use session::{GameLaunch, InitMode, LaunchIntent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

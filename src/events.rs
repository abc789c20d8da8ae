//! Engine events.
//!
//! One broadcast channel per event type; subscribers receive events in
//! subscription order and never block the engine. A full channel drops the
//! oldest events for that subscriber (tokio broadcast semantics), which is
//! acceptable for UI-facing streams.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::client::ClientState;
use crate::connection::ConnectionState;
use crate::matchmaker::MatchmakerEvent;
use crate::players::Player;
use crate::probe::ProbeReport;
use crate::session::GameLaunch;

/// Style of a server notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeStyle {
    /// Plain information.
    Info,
    /// Warning.
    Warning,
    /// Error; disarms auto-relogin.
    Error,
    /// Score broadcast for the tray/chat collaborators.
    Scores,
    /// The server killed the running game process.
    Kill,
    /// The user was kicked from the lobby; disarms auto-relogin.
    Kick,
}

impl NoticeStyle {
    /// Map the wire style string; unknown styles degrade to `Info`.
    pub fn from_wire(style: Option<&str>) -> Self {
        match style {
            Some("warning") => NoticeStyle::Warning,
            Some("error") => NoticeStyle::Error,
            Some("scores") => NoticeStyle::Scores,
            Some("kill") => NoticeStyle::Kill,
            Some("kick") => NoticeStyle::Kick,
            _ => NoticeStyle::Info,
        }
    }
}

/// A user-visible notice from the server or the engine itself.
#[derive(Debug, Clone)]
pub struct Notice {
    /// Presentation style.
    pub style: NoticeStyle,
    /// Human-readable text.
    pub text: String,
}

impl Notice {
    /// Engine-originated error notice.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            style: NoticeStyle::Error,
            text: text.into(),
        }
    }
}

/// Social updates for the chat collaborator.
#[derive(Debug, Clone)]
pub enum SocialEvent {
    /// The user's channel list changed.
    ChannelsUpdated(Vec<String>),
    /// Channels to join automatically.
    AutoJoin(Vec<String>),
}

/// A fatal, non-retriable protocol fault. The engine stores the latest fault
/// and shutdown logic reports it.
#[derive(Debug, Clone)]
pub struct FatalFault {
    /// What went wrong.
    pub reason: String,
    /// The raw offending message, for diagnosis.
    pub raw: Value,
}

/// Broadcast channels for every engine event type.
pub struct EventBus {
    state: broadcast::Sender<ClientState>,
    connection: broadcast::Sender<ConnectionState>,
    authorized: broadcast::Sender<Player>,
    connectivity: broadcast::Sender<ProbeReport>,
    matchmaker: broadcast::Sender<MatchmakerEvent>,
    launches: broadcast::Sender<GameLaunch>,
    notices: broadcast::Sender<Notice>,
    social: broadcast::Sender<SocialEvent>,
    faults: broadcast::Sender<FatalFault>,
}

impl EventBus {
    /// Create a bus where every channel holds up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: broadcast::channel(capacity).0,
            connection: broadcast::channel(capacity).0,
            authorized: broadcast::channel(capacity).0,
            connectivity: broadcast::channel(capacity).0,
            matchmaker: broadcast::channel(capacity).0,
            launches: broadcast::channel(capacity).0,
            notices: broadcast::channel(capacity).0,
            social: broadcast::channel(capacity).0,
            faults: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to client-state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Subscribe to wire connection-state changes.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Subscribe to successful logins (the "me" record).
    pub fn subscribe_authorized(&self) -> broadcast::Receiver<Player> {
        self.authorized.subscribe()
    }

    /// Subscribe to connectivity-probe completions (a game session exists
    /// once this fires).
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ProbeReport> {
        self.connectivity.subscribe()
    }

    /// Subscribe to matchmaker events.
    pub fn subscribe_matchmaker(&self) -> broadcast::Receiver<MatchmakerEvent> {
        self.matchmaker.subscribe()
    }

    /// Subscribe to game-launch hand-offs.
    pub fn subscribe_launches(&self) -> broadcast::Receiver<GameLaunch> {
        self.launches.subscribe()
    }

    /// Subscribe to user-visible notices.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Subscribe to social updates.
    pub fn subscribe_social(&self) -> broadcast::Receiver<SocialEvent> {
        self.social.subscribe()
    }

    /// Subscribe to fatal protocol faults.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FatalFault> {
        self.faults.subscribe()
    }

    pub(crate) fn publish_state(&self, state: ClientState) {
        let _ = self.state.send(state);
    }

    pub(crate) fn publish_connection(&self, state: ConnectionState) {
        let _ = self.connection.send(state);
    }

    pub(crate) fn publish_authorized(&self, me: Player) {
        let _ = self.authorized.send(me);
    }

    pub(crate) fn publish_connectivity(&self, report: ProbeReport) {
        let _ = self.connectivity.send(report);
    }

    pub(crate) fn publish_matchmaker(&self, event: MatchmakerEvent) {
        let _ = self.matchmaker.send(event);
    }

    pub(crate) fn publish_launch(&self, launch: GameLaunch) {
        let _ = self.launches.send(launch);
    }

    pub(crate) fn publish_notice(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    pub(crate) fn publish_social(&self, event: SocialEvent) {
        let _ = self.social.send(event);
    }

    pub(crate) fn publish_fault(&self, fault: FatalFault) {
        let _ = self.faults.send(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_style_mapping() {
        assert_eq!(NoticeStyle::from_wire(Some("error")), NoticeStyle::Error);
        assert_eq!(NoticeStyle::from_wire(Some("kick")), NoticeStyle::Kick);
        assert_eq!(NoticeStyle::from_wire(Some("scores")), NoticeStyle::Scores);
        assert_eq!(NoticeStyle::from_wire(None), NoticeStyle::Info);
        assert_eq!(
            NoticeStyle::from_wire(Some("something_new")),
            NoticeStyle::Info
        );
    }

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe_notices();
        let mut second = bus.subscribe_notices();

        bus.publish_notice(Notice::error("boom"));

        assert_eq!(first.recv().await.unwrap().text, "boom");
        assert_eq!(second.recv().await.unwrap().text, "boom");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish_state(ClientState::Connecting);
        bus.publish_notice(Notice::error("nobody listening"));
    }
}

//! Client configuration.
//!
//! The engine does not own settings persistence. Collaborators build a
//! [`ClientConfig`] from whatever settings store they use and hand it over at
//! construction time.

use std::time::Duration;

/// Default lobby server endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8001";

/// Default local game port announced in launch commands.
pub const DEFAULT_GAME_PORT: u16 = 6112;

/// Configuration for a lobby client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Lobby server WebSocket URL.
    pub server_url: String,
    /// Client version reported in `ask_session`.
    pub version: String,
    /// User agent reported in `ask_session`.
    pub user_agent: String,
    /// Whether remembered credentials may be reused for auto-relogin.
    pub remember: bool,
    /// Remembered login (only honored when `remember` is set).
    pub login: Option<String>,
    /// Remembered password, already hashed by the settings layer.
    pub password: Option<String>,
    /// Local game port announced to the server.
    pub game_port: u16,
    /// Whether UPnP port mapping is requested by the user.
    pub use_upnp: bool,
    /// Non-production mode: `hello` carries a fixed hashed test password so
    /// development servers never see a real one.
    pub test_mode: bool,
    /// First reconnect delay after an unexpected disconnect.
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reconnect backoff.
    pub reconnect_max_delay: Duration,
    /// Capacity of each broadcast event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: "faf-client".to_string(),
            remember: false,
            login: None,
            password: None,
            game_port: DEFAULT_GAME_PORT,
            use_upnp: false,
            test_mode: false,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            event_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LOBBY_URL") {
            config.server_url = url;
        }
        config.login = std::env::var("LOBBY_LOGIN").ok();
        config.remember = config.login.is_some();
        config.password = std::env::var("LOBBY_PASSWORD").ok();
        if let Some(port) = std::env::var("LOBBY_GAME_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.game_port = port;
        }
        config.use_upnp = std::env::var("LOBBY_UPNP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        config.test_mode = std::env::var("LOBBY_TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        config
    }

    /// Remembered credentials, if both halves exist and `remember` is set.
    pub fn remembered_credentials(&self) -> Option<(String, String)> {
        if !self.remember {
            return None;
        }
        match (&self.login, &self.password) {
            (Some(l), Some(p)) => Some((l.clone(), p.clone())),
            _ => None,
        }
    }
}

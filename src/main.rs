//! Lobby engine demo client.
//!
//! Connects to a lobby server, logs in with credentials from the
//! environment, and prints engine events until the session shuts down.

use anyhow::Result;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lobby_engine::{
    ClientConfig, ClientState, LobbyClientBuilder, MatchmakerEvent, NoticeStyle, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ClientConfig::from_env();
    info!("lobby-engine v{} connecting to {}", VERSION, config.server_url);
    if config.login.is_none() {
        warn!("LOBBY_LOGIN not set; the handshake will stop at the credential prompt");
    }

    let client = LobbyClientBuilder::new(config).spawn();
    let mut states = client.subscribe_state();
    let mut notices = client.subscribe_notices();
    let mut matchmaker = client.subscribe_matchmaker();
    let mut launches = client.subscribe_launches();

    client.connect()?;

    loop {
        tokio::select! {
            state = states.recv() => {
                let Ok(state) = state else { break };
                info!("client state: {state:?}");
                if state == ClientState::ShuttingDown {
                    break;
                }
            }
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    match notice.style {
                        NoticeStyle::Error => warn!("server error: {}", notice.text),
                        _ => info!("notice ({:?}): {}", notice.style, notice.text),
                    }
                }
            }
            event = matchmaker.recv() => {
                if let Ok(MatchmakerEvent::Eligibility(eligible)) = event {
                    info!("ladder invite affordance: {}", if eligible { "show" } else { "hide" });
                }
            }
            launch = launches.recv() => {
                if let Ok(launch) = launch {
                    info!(
                        "game {} ready to launch: relay port {}, args {:?}",
                        launch.uid, launch.relay_port, launch.args
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                client.shutdown()?;
            }
        }
    }

    Ok(())
}

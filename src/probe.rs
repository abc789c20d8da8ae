//! Connectivity Probe
//!
//! The NAT-traversal test is an external collaborator: the engine asks it for
//! a traversal mode once per login and case-splits launch commands on the
//! result. Implementations talk STUN/TURN infrastructure; the engine only
//! sees the report.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// NAT-traversal mode determined by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraversalMode {
    /// Directly reachable; no relay needed.
    Public,
    /// Reachable through a relay endpoint.
    Stun,
    /// Not reachable at all.
    Blocked,
}

/// Result of a connectivity test.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// Determined traversal mode.
    pub mode: TraversalMode,
    /// Relay endpoint, meaningful for relay-based traversal.
    pub relay_address: Option<String>,
}

impl ProbeReport {
    /// Relay endpoint to attach to launch commands. Present iff the
    /// traversal mode is relay-based.
    pub fn launch_relay_address(&self) -> Option<&str> {
        match self.mode {
            TraversalMode::Stun => self.relay_address.as_deref(),
            _ => None,
        }
    }
}

/// Probe errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The test could not produce a result.
    #[error("connectivity test failed: {0}")]
    Failed(String),
}

/// External NAT-traversal tester.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Run a connectivity test for the given local game port.
    async fn probe(&self, game_port: u16) -> Result<ProbeReport, ProbeError>;
}

/// Probe with a fixed outcome. Useful for tests and LAN setups where the
/// traversal situation is known in advance.
pub struct StaticProbe {
    report: ProbeReport,
}

impl StaticProbe {
    /// Always report the given outcome.
    pub fn new(report: ProbeReport) -> Self {
        Self { report }
    }

    /// Always report direct reachability.
    pub fn public() -> Self {
        Self::new(ProbeReport {
            mode: TraversalMode::Public,
            relay_address: None,
        })
    }

    /// Always report relay-based traversal through `relay_address`.
    pub fn stun(relay_address: impl Into<String>) -> Self {
        Self::new(ProbeReport {
            mode: TraversalMode::Stun,
            relay_address: Some(relay_address.into()),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self, _game_port: u16) -> Result<ProbeReport, ProbeError> {
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_address_only_for_stun() {
        let stun = ProbeReport {
            mode: TraversalMode::Stun,
            relay_address: Some("1.2.3.4:7777".into()),
        };
        assert_eq!(stun.launch_relay_address(), Some("1.2.3.4:7777"));

        let public = ProbeReport {
            mode: TraversalMode::Public,
            relay_address: Some("1.2.3.4:7777".into()),
        };
        assert_eq!(public.launch_relay_address(), None);
    }

    #[tokio::test]
    async fn test_static_probe() {
        let probe = StaticProbe::stun("relay:1");
        let report = probe.probe(6112).await.unwrap();
        assert_eq!(report.mode, TraversalMode::Stun);
        assert_eq!(report.launch_relay_address(), Some("relay:1"));
    }
}

//! Authentication support.
//!
//! The handshake itself lives in the engine; this module holds the pieces it
//! leans on: the unique-id fingerprint, password hashing, and the credential
//! dialog seam.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fingerprint computation errors.
#[derive(Debug, Error)]
pub enum UidError {
    /// The fingerprint source could not produce an id.
    #[error("unique id computation failed: {0}")]
    Failed(String),
}

/// Source of the deterministic client fingerprint sent with `hello`.
///
/// The fingerprint binds a login attempt to (login, session token).
/// Real deployments may shell out to a hardware-backed tool, which can fail;
/// a failure aborts the login attempt without touching the transport.
pub trait UidSource: Send + Sync {
    /// Compute the fingerprint for this login attempt.
    fn unique_id(&self, login: &str, session: &str) -> Result<String, UidError>;
}

/// SHA-256 based fingerprint over (login, session).
pub struct Sha256Uid;

impl UidSource for Sha256Uid {
    fn unique_id(&self, login: &str, session: &str) -> Result<String, UidError> {
        let mut hasher = Sha256::new();
        hasher.update(login.as_bytes());
        hasher.update(b":");
        hasher.update(session.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Hash a password the way the settings layer does before remembering it.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialDecision {
    /// The user submitted credentials; the password is already hashed.
    Submit {
        /// Entered login.
        login: String,
        /// Entered password, hashed.
        password: String,
    },
    /// The user dismissed the dialog; stay offline.
    Cancel,
    /// The user asked to quit the client.
    Quit,
}

/// External login dialog.
///
/// Requested asynchronously whenever the engine holds a session token but no
/// usable credentials; the engine resumes the handshake on the decision.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Ask the user for credentials. `prior_login` pre-fills the dialog.
    async fn request_credentials(&self, prior_login: Option<String>) -> CredentialDecision;
}

/// Provider that always cancels. Default for headless use, where only
/// remembered credentials make sense.
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn request_credentials(&self, _prior_login: Option<String>) -> CredentialDecision {
        CredentialDecision::Cancel
    }
}

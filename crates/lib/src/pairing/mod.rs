//! Pairing store: one-shot pairing requests, claimable pairing codes, and hashed sessions.
//!
//! A browser asks for a pairing *request* code, the gateway owner turns it into a pairing
//! *code* bound to their (encrypted) gateway credential, and the browser claims that code for
//! an opaque session token. Only the token's hash is kept; each chat turn resolves the token
//! back to the credential.

mod clock;
mod records;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use records::{
    sanitize_pairing_code, CODE_ALPHABET, CODE_LENGTH, DEFAULT_AGENT_NAME,
    DEFAULT_PAIRING_TTL_SECONDS, DEFAULT_REQUEST_TTL_SECONDS, DEFAULT_SESSION_TTL_SECONDS,
};
pub use store::PairingStore;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Failures surfaced by [`PairingStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing request code is invalid")]
    InvalidRequestCode,
    #[error("pairing request code has expired")]
    ExpiredRequestCode,
    #[error("pairing code is invalid")]
    InvalidCode,
    #[error("pairing code has expired")]
    ExpiredCode,
    #[error("pairing code has no claims left")]
    MaxClaimsReached,
    #[error("session is invalid")]
    InvalidSession,
    #[error("session has expired")]
    ExpiredSession,
    #[error("gateway url is invalid: {0}")]
    InvalidUrl(String),
    #[error("gateway token is missing")]
    MissingToken,
    #[error("could not allocate a unique code")]
    CodeSpaceExhausted,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("pairing store persistence failed: {0}")]
    Storage(#[from] std::io::Error),
    #[error("pairing store is not running")]
    Unavailable,
}

/// Input for creating a pairing code. Optional fields fall back to defaults and are clamped.
#[derive(Debug, Clone, Default)]
pub struct NewPairingCode {
    pub gateway_url: String,
    pub gateway_token: String,
    pub agent_name: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub max_claims: Option<i64>,
}

/// Result of `create_pairing_request`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestIssued {
    pub request_code: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

/// Result of creating a pairing code (directly or from a request).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedPairingCode {
    pub pairing_code: String,
    pub expires_at: DateTime<Utc>,
    pub agent_name: String,
    pub max_claims: u32,
    pub ttl_seconds: i64,
}

/// Result of a successful claim. `session_token` exists only here; the store keeps its hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedSession {
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub agent_name: String,
}

/// Decrypted gateway credential for one session.
#[derive(Clone)]
pub struct ResolvedSession {
    pub gateway_url: String,
    pub gateway_token: String,
    pub agent_name: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ResolvedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSession")
            .field("gateway_url", &self.gateway_url)
            .field("gateway_token", &"<redacted>")
            .field("agent_name", &self.agent_name)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

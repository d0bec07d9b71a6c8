//! Persisted record shapes and the state transitions applied to them.
//!
//! Everything here is synchronous and operates on a [`StoreData`] value; the actor in
//! `store.rs` decides when a step runs and whether its result is committed.

use super::{ClaimedSession, IssuedPairingCode, PairingError, PairingRequestIssued, ResolvedSession};
use crate::crypto::{fill_random, hash_token, SecretBox};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Human-typable alphabet (no I, O, 0, 1). Its size divides 256, so `byte % len` is unbiased.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 8;
const MAX_CODE_INPUT: usize = 12;
const CODE_ATTEMPTS: usize = 32;
const SESSION_TOKEN_BYTES: usize = 24;
const STORE_VERSION: u32 = 2;

pub const DEFAULT_AGENT_NAME: &str = "web-shimeji-1";
pub const DEFAULT_REQUEST_TTL_SECONDS: i64 = 5 * 60;
pub const DEFAULT_PAIRING_TTL_SECONDS: i64 = 10 * 60;
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

pub(crate) const REQUEST_TTL_BOUNDS: (i64, i64) = (60, 30 * 60);
pub(crate) const PAIRING_TTL_BOUNDS: (i64, i64) = (60, 24 * 60 * 60);
pub(crate) const SESSION_TTL_BOUNDS: (i64, i64) = (5 * 60, 60 * 24 * 60 * 60);
pub(crate) const MAX_CLAIMS_BOUNDS: (i64, i64) = (1, 25);
pub(crate) const MAX_GATEWAY_TOKEN_CHARS: usize = 1600;
pub(crate) const MAX_SESSION_TOKEN_CHARS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairingRequestRecord {
    pub code: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairingRecord {
    pub code: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub gateway_url: String,
    pub gateway_token_enc: String,
    pub agent_name: String,
    pub max_claims: u32,
    pub claims_used: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRecord {
    pub token_hash: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub gateway_url: String,
    pub gateway_token_enc: String,
    pub agent_name: String,
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default = "store_version")]
    pub version: u32,
    #[serde(default)]
    pub requests: BTreeMap<String, PairingRequestRecord>,
    #[serde(default)]
    pub pairings: BTreeMap<String, PairingRecord>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
}

fn store_version() -> u32 {
    STORE_VERSION
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            requests: BTreeMap::new(),
            pairings: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }
}

/// Validated input for a new pairing code; the token is already sealed.
#[derive(Debug, Clone)]
pub(crate) struct PreparedPairing {
    pub gateway_url: String,
    pub gateway_token_enc: String,
    pub agent_name: String,
    pub ttl_seconds: i64,
    pub max_claims: u32,
}

/// Round-trip-safe conversion from stored milliseconds.
pub(crate) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Clamp an optional integer into `[min, max]`, using `fallback` when absent.
pub(crate) fn clamp_int(value: Option<i64>, fallback: i64, bounds: (i64, i64)) -> i64 {
    value.unwrap_or(fallback).clamp(bounds.0, bounds.1)
}

/// Trim and truncate a bearer-style token.
pub(crate) fn sanitize_token(input: &str, max_chars: usize) -> String {
    input.trim().chars().take(max_chars).collect()
}

/// Normalize user-typed codes: uppercase, alphanumerics only, at most 12 characters.
pub fn sanitize_pairing_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(MAX_CODE_INPUT)
        .collect()
}

fn random_code() -> Result<String, PairingError> {
    let mut bytes = [0u8; CODE_LENGTH];
    fill_random(&mut bytes)?;
    Ok(bytes
        .iter()
        .map(|b| CODE_ALPHABET[(*b as usize) % CODE_ALPHABET.len()] as char)
        .collect())
}

fn random_session_token() -> Result<String, PairingError> {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    fill_random(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

impl StoreData {
    /// Drop expired requests, expired or exhausted pairing codes, and expired sessions.
    pub fn sweep(&mut self, now_ms: i64) {
        self.requests.retain(|_, r| r.expires_at_ms > now_ms);
        self.pairings
            .retain(|_, p| p.expires_at_ms > now_ms && p.claims_used < p.max_claims);
        self.sessions.retain(|_, s| s.expires_at_ms > now_ms);
    }

    fn unused_code(&self) -> Result<String, PairingError> {
        for _ in 0..CODE_ATTEMPTS {
            let code = random_code()?;
            if !self.requests.contains_key(&code) && !self.pairings.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(PairingError::CodeSpaceExhausted)
    }

    pub fn insert_request(
        &mut self,
        now_ms: i64,
        ttl_seconds: i64,
    ) -> Result<PairingRequestIssued, PairingError> {
        let code = self.unused_code()?;
        let expires_at_ms = now_ms + ttl_seconds * 1000;
        self.requests.insert(
            code.clone(),
            PairingRequestRecord {
                code: code.clone(),
                created_at_ms: now_ms,
                expires_at_ms,
            },
        );
        Ok(PairingRequestIssued {
            request_code: code,
            expires_at: ms_to_datetime(expires_at_ms),
            ttl_seconds,
        })
    }

    pub fn insert_pairing(
        &mut self,
        now_ms: i64,
        prepared: PreparedPairing,
    ) -> Result<IssuedPairingCode, PairingError> {
        let code = self.unused_code()?;
        let expires_at_ms = now_ms + prepared.ttl_seconds * 1000;
        self.pairings.insert(
            code.clone(),
            PairingRecord {
                code: code.clone(),
                created_at_ms: now_ms,
                expires_at_ms,
                gateway_url: prepared.gateway_url,
                gateway_token_enc: prepared.gateway_token_enc,
                agent_name: prepared.agent_name.clone(),
                max_claims: prepared.max_claims,
                claims_used: 0,
            },
        );
        Ok(IssuedPairingCode {
            pairing_code: code,
            expires_at: ms_to_datetime(expires_at_ms),
            agent_name: prepared.agent_name,
            max_claims: prepared.max_claims,
            ttl_seconds: prepared.ttl_seconds,
        })
    }

    /// Remove a one-shot request code. Expired requests are removed too, but reported.
    pub fn take_request(&mut self, code: &str, now_ms: i64) -> Result<(), PairingError> {
        let request = self
            .requests
            .remove(code)
            .ok_or(PairingError::InvalidRequestCode)?;
        if request.expires_at_ms <= now_ms {
            return Err(PairingError::ExpiredRequestCode);
        }
        Ok(())
    }

    pub fn claim(
        &mut self,
        code: &str,
        now_ms: i64,
        session_ttl_seconds: i64,
    ) -> Result<ClaimedSession, PairingError> {
        let pairing = self.pairings.get_mut(code).ok_or(PairingError::InvalidCode)?;
        if pairing.expires_at_ms <= now_ms {
            self.pairings.remove(code);
            return Err(PairingError::ExpiredCode);
        }
        if pairing.claims_used >= pairing.max_claims {
            self.pairings.remove(code);
            return Err(PairingError::MaxClaimsReached);
        }

        let session_token = random_session_token()?;
        pairing.claims_used += 1;
        let gateway_url = pairing.gateway_url.clone();
        let gateway_token_enc = pairing.gateway_token_enc.clone();
        let agent_name = pairing.agent_name.clone();
        if pairing.claims_used >= pairing.max_claims {
            self.pairings.remove(code);
        }

        let token_hash = hash_token(&session_token);
        let expires_at_ms = now_ms + session_ttl_seconds * 1000;
        self.sessions.insert(
            token_hash.clone(),
            SessionRecord {
                token_hash,
                created_at_ms: now_ms,
                expires_at_ms,
                gateway_url,
                gateway_token_enc,
                agent_name: agent_name.clone(),
            },
        );
        Ok(ClaimedSession {
            session_token,
            expires_at: ms_to_datetime(expires_at_ms),
            agent_name,
        })
    }

    pub fn resolve(
        &mut self,
        token: &str,
        now_ms: i64,
        secrets: &SecretBox,
    ) -> Result<ResolvedSession, PairingError> {
        let token_hash = hash_token(token);
        let session = self
            .sessions
            .get(&token_hash)
            .ok_or(PairingError::InvalidSession)?;
        if session.expires_at_ms <= now_ms {
            self.sessions.remove(&token_hash);
            return Err(PairingError::ExpiredSession);
        }
        match secrets.decrypt_str(&session.gateway_token_enc) {
            Ok(gateway_token) => Ok(ResolvedSession {
                gateway_url: session.gateway_url.clone(),
                gateway_token,
                agent_name: session.agent_name.clone(),
                expires_at: ms_to_datetime(session.expires_at_ms),
            }),
            Err(e) => {
                log::warn!("pruning session whose credential cannot be decrypted: {}", e);
                self.sessions.remove(&token_hash);
                Err(PairingError::InvalidSession)
            }
        }
    }
}

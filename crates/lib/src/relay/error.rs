//! Relay errors and their HTTP mapping.

use crate::gateway::GatewayError;
use crate::pairing::PairingError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Issue call without a request code and without issuer credentials.
    #[error("a pairing request code is required")]
    RequestRequired,
    #[error("issuer token is missing or wrong")]
    Unauthorized,
    #[error("gateway url and token are required")]
    GatewayRequired,
    #[error("gateway url is invalid: {0}")]
    InvalidUrl(String),
    #[error("gateway must be reachable on a public address")]
    PublicGatewayRequired,
    #[error("a session token is required")]
    SessionRequired,
    #[error(transparent)]
    Pairing(#[from] PairingError),
    /// Failure while verifying a gateway before issuing a code.
    #[error("gateway verification failed: {0}")]
    Preflight(GatewayError),
    /// Failure during a relayed chat turn.
    #[error(transparent)]
    Gateway(GatewayError),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// HTTP status and stable error code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RelayError::RequestRequired => {
                (StatusCode::BAD_REQUEST, "OPENCLAW_PAIRING_REQUEST_REQUIRED")
            }
            RelayError::Unauthorized => (StatusCode::UNAUTHORIZED, "OPENCLAW_PAIRING_UNAUTHORIZED"),
            RelayError::GatewayRequired => {
                (StatusCode::BAD_REQUEST, "OPENCLAW_PAIRING_GATEWAY_REQUIRED")
            }
            RelayError::InvalidUrl(_) => (StatusCode::BAD_REQUEST, "OPENCLAW_INVALID_URL"),
            RelayError::PublicGatewayRequired => (
                StatusCode::BAD_REQUEST,
                "OPENCLAW_PAIRING_PUBLIC_GATEWAY_REQUIRED",
            ),
            RelayError::SessionRequired => (StatusCode::UNAUTHORIZED, "OPENCLAW_PAIRING_REQUIRED"),
            RelayError::Pairing(e) => pairing_status(e),
            RelayError::Preflight(e) => match e {
                GatewayError::AuthFailed(_) => (StatusCode::BAD_REQUEST, "OPENCLAW_AUTH_FAILED"),
                GatewayError::InvalidUrl(_) => (StatusCode::BAD_REQUEST, "OPENCLAW_INVALID_URL"),
                GatewayError::MissingToken => {
                    (StatusCode::BAD_REQUEST, "OPENCLAW_PAIRING_GATEWAY_REQUIRED")
                }
                GatewayError::Connect(_) | GatewayError::Timeout | GatewayError::IdleTimeout => {
                    (StatusCode::GATEWAY_TIMEOUT, "OPENCLAW_CONNECT")
                }
                other => (StatusCode::BAD_GATEWAY, other.code()),
            },
            RelayError::Gateway(e) => match e {
                GatewayError::EmptyMessage => (StatusCode::BAD_REQUEST, e.code()),
                GatewayError::Connect(_) | GatewayError::Timeout | GatewayError::IdleTimeout => {
                    (StatusCode::GATEWAY_TIMEOUT, e.code())
                }
                other => (StatusCode::BAD_GATEWAY, other.code()),
            },
        }
    }
}

fn pairing_status(e: &PairingError) -> (StatusCode, &'static str) {
    match e {
        PairingError::InvalidRequestCode => (StatusCode::NOT_FOUND, "OPENCLAW_PAIRING_REQUEST_INVALID"),
        PairingError::ExpiredRequestCode => (StatusCode::GONE, "OPENCLAW_PAIRING_REQUEST_EXPIRED"),
        PairingError::InvalidCode => (StatusCode::NOT_FOUND, "OPENCLAW_PAIRING_CODE_INVALID"),
        PairingError::ExpiredCode => (StatusCode::GONE, "OPENCLAW_PAIRING_CODE_EXPIRED"),
        PairingError::MaxClaimsReached => (StatusCode::GONE, "OPENCLAW_PAIRING_MAX_CLAIMS"),
        PairingError::InvalidSession => (StatusCode::UNAUTHORIZED, "OPENCLAW_PAIRING_INVALID"),
        PairingError::ExpiredSession => (StatusCode::UNAUTHORIZED, "OPENCLAW_PAIRING_EXPIRED"),
        PairingError::InvalidUrl(_) => (StatusCode::BAD_REQUEST, "OPENCLAW_INVALID_URL"),
        PairingError::MissingToken => (StatusCode::BAD_REQUEST, "OPENCLAW_PAIRING_GATEWAY_REQUIRED"),
        PairingError::CodeSpaceExhausted
        | PairingError::Crypto(_)
        | PairingError::Storage(_)
        | PairingError::Unavailable => (StatusCode::INTERNAL_SERVER_ERROR, "OPENCLAW_INTERNAL"),
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("relay internal error: {}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = json!({
            "error": code,
            "message": message,
        });
        let mut res = (status, axum::Json(body)).into_response();
        res.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        res
    }
}

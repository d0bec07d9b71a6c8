//! Relay HTTP server (single port, JSON in and out).

use super::{int_field, string_field, IssueRequest, RelayError, RelayService, RelaySettings};
use crate::config::{resolve_pairing_secret, resolve_store_path, Config};
use crate::crypto::SecretBox;
use crate::gateway::{ChatMessage, GatewayChatClient, Role, PROTOCOL_VERSION};
use crate::pairing::{PairingStore, SystemClock};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Header carrying the issuer token (a Bearer token works too).
pub const ISSUER_TOKEN_HEADER: &str = "x-openclaw-pairing-issuer-token";

/// Build the relay routes around a service.
pub fn router(service: RelayService) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/pairings/request", post(pairing_request))
        .route("/pairings/issue", post(pairing_issue))
        .route("/pairings/claim", post(pairing_claim))
        .route("/chat", post(chat))
        .with_state(service)
}

/// Run the relay; binds to config.relay.bind:config.relay.port.
/// Fails before binding when no pairing secret is configured or the store is locked by another
/// process. Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_relay(config: Config, config_path: PathBuf) -> Result<()> {
    let secret = resolve_pairing_secret(&config).context(
        "pairing secret is not configured (set pairing.secret or OPENCLAW_PAIRING_SECRET)",
    )?;
    let secrets =
        Arc::new(SecretBox::new(&secret)?.with_previous(&config.pairing.previous_secrets));
    let store_path = resolve_store_path(&config, &config_path);
    let store = PairingStore::open(&store_path, secrets, Arc::new(SystemClock))
        .await
        .with_context(|| format!("opening pairing store {}", store_path.display()))?;

    let connector = Arc::new(GatewayChatClient::new(config.gateway.client_options()));
    let settings = RelaySettings::from_config(&config);
    if settings.allow_private_gateways {
        log::warn!("relay accepts gateways on private networks (relay.allowPrivateGateways)");
    }
    let service = RelayService::new(store.clone(), connector, settings);
    let app = router(service);

    let bind_addr = format!("{}:{}", config.relay.bind.trim(), config.relay.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited")?;
    store.shutdown().await;
    log::info!("relay stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

fn no_store<T: Serialize>(value: T) -> Response {
    let mut res = Json(value).into_response();
    res.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    res
}

/// Parse a JSON body; anything unparseable (or not an object) acts as `{}`.
fn lenient_json(body: &Bytes) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(v @ Value::Object(_)) => v,
        _ => json!({}),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn issuer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ISSUER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| bearer_token(headers))
}

/// Messages with a known role and string content; anything else is dropped.
fn parse_messages(body: &Value) -> Vec<ChatMessage> {
    let Some(items) = body.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|m| {
            let role = match m.get("role").and_then(Value::as_str)? {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => return None,
            };
            let content = m.get("content").and_then(Value::as_str)?;
            Some(ChatMessage {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}

/// GET / returns a simple health JSON (for probes).
async fn health_http() -> Response {
    no_store(json!({
        "runtime": "running",
        "service": "clawrelay",
        "protocol": PROTOCOL_VERSION,
    }))
}

/// POST /pairings/request — mint a one-shot request code.
async fn pairing_request(
    State(service): State<RelayService>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let body = lenient_json(&body);
    let issued = service
        .request_pairing(int_field(&body, "ttlSeconds"))
        .await?;
    Ok(no_store(json!({
        "requestCode": issued.request_code,
        "expiresAt": issued.expires_at,
        "ttlSeconds": issued.ttl_seconds,
        "maxClaims": 1,
    })))
}

/// POST /pairings/issue — verify the gateway and bind it to a pairing code.
async fn pairing_issue(
    State(service): State<RelayService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let input = IssueRequest::from_json(&lenient_json(&body));
    let issuer = issuer_token(&headers);
    let issued = service.issue_pairing(input, issuer.as_deref()).await?;
    Ok(no_store(issued))
}

/// POST /pairings/claim — exchange a pairing code for a session token.
async fn pairing_claim(
    State(service): State<RelayService>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let body = lenient_json(&body);
    let code = string_field(&body, "code").unwrap_or_default();
    let claimed = service.claim_pairing(&code).await?;
    Ok(no_store(claimed))
}

/// POST /chat — relay the latest user message to the session's gateway.
async fn chat(
    State(service): State<RelayService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let body = lenient_json(&body);
    let token = bearer_token(&headers).or_else(|| string_field(&body, "sessionToken"));
    let agent_name = string_field(&body, "agentName");
    let reply = service
        .chat_send(token.as_deref(), parse_messages(&body), agent_name.as_deref())
        .await?;
    Ok(no_store(reply))
}

//! Gateway WebSocket protocol types (frames, connect, chat.send) and streamed-text helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Protocol version spoken by this client (sent as both min and max).
pub const PROTOCOL_VERSION: u32 = 3;
pub const CLIENT_ID: &str = "gateway-client";
pub const CLIENT_PLATFORM: &str = "server";
pub const OPERATOR_ROLE: &str = "operator";
pub const OPERATOR_SCOPES: [&str; 2] = ["operator.read", "operator.write"];

const MAX_AGENT_NAME: usize = 32;
const MAX_SESSION_KEY_PART: usize = 48;

/// Any frame on the wire, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(WsRequest),
    Res(WsResponse),
    Event(WsEvent),
}

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
///
/// `error` is a plain string on some gateways and `{ message, code }` on others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Wire event: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Client connect params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Params for `chat.send`: one user message for a gateway-side session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
}

/// Which surface a connection is for; reported to the gateway as `client.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    SiteRelay,
    PairingPreflight,
}

impl ClientMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientMode::SiteRelay => "site-relay",
            ClientMode::PairingPreflight => "pairing-preflight",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidGatewayUrl(pub String);

impl Frame {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl WsResponse {
    /// Human-readable failure reason: the string error, else `error.message`, else `error.code`.
    pub fn error_reason(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let reason = match error {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => non_empty_str(o.get("message")).or(non_empty_str(o.get("code"))),
            _ => None,
        };
        reason
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// True for the acknowledgement a gateway sends for `chat.send` (carries `runId`).
    pub fn is_run_ack(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|p| p.get("runId"))
            .is_some_and(|v| !v.is_null())
    }
}

/// Parse one text frame. Anything that is not a known frame shape is `None`.
pub fn parse_frame(text: &str) -> Option<Frame> {
    serde_json::from_str(text).ok()
}

/// `connect` request carrying the bearer token.
pub fn build_connect_request(token: &str, mode: ClientMode) -> Frame {
    let params = ConnectParams {
        min_protocol: Some(PROTOCOL_VERSION),
        max_protocol: Some(PROTOCOL_VERSION),
        client: ConnectClient {
            id: Some(CLIENT_ID.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            platform: Some(CLIENT_PLATFORM.to_string()),
            mode: Some(mode.as_str().to_string()),
        },
        role: OPERATOR_ROLE.to_string(),
        scopes: OPERATOR_SCOPES.iter().map(|s| s.to_string()).collect(),
        auth: ConnectAuth {
            token: Some(token.to_string()),
        },
    };
    Frame::Req(WsRequest {
        id: new_request_id(),
        method: "connect".to_string(),
        params: serde_json::to_value(params).unwrap_or_default(),
    })
}

/// `chat.send` request with a fresh idempotency key.
pub fn build_chat_send_request(session_key: &str, message: &str) -> Frame {
    let params = ChatSendParams {
        session_key: session_key.to_string(),
        message: message.to_string(),
        idempotency_key: uuid::Uuid::new_v4().to_string(),
    };
    Frame::Req(WsRequest {
        id: new_request_id(),
        method: "chat.send".to_string(),
        params: serde_json::to_value(params).unwrap_or_default(),
    })
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Text-bearing payload shapes seen from gateways, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamPayload<'a> {
    /// The payload itself is a string.
    Bare(&'a str),
    /// `{ content: "..." }`
    Content(&'a str),
    /// `{ text: "..." }`
    Text(&'a str),
    /// `{ delta: { content | text: "..." } }`
    Delta(&'a str),
    /// `{ message: { content: "..." } }`
    MessageContent(&'a str),
    /// `{ message: { content: [parts] } }`
    MessageParts(&'a [Value]),
    /// `{ content: [parts] }`
    ContentParts(&'a [Value]),
    Unrecognized,
}

impl<'a> StreamPayload<'a> {
    pub fn classify(payload: &'a Value) -> Self {
        if let Value::String(s) = payload {
            return Self::Bare(s);
        }
        if let Some(s) = payload.get("content").and_then(Value::as_str) {
            return Self::Content(s);
        }
        if let Some(s) = payload.get("text").and_then(Value::as_str) {
            return Self::Text(s);
        }
        if let Some(delta) = payload.get("delta") {
            if let Some(s) = delta
                .get("content")
                .and_then(Value::as_str)
                .or_else(|| delta.get("text").and_then(Value::as_str))
            {
                return Self::Delta(s);
            }
        }
        if let Some(content) = payload.get("message").and_then(|m| m.get("content")) {
            match content {
                Value::String(s) => return Self::MessageContent(s),
                Value::Array(parts) => return Self::MessageParts(parts),
                _ => {}
            }
        }
        if let Some(parts) = payload.get("content").and_then(Value::as_array) {
            return Self::ContentParts(parts);
        }
        Self::Unrecognized
    }
}

fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| {
            non_empty_str(p.get("text"))
                .or(non_empty_str(p.get("content")))
                .or(non_empty_str(p.get("value")))
        })
        .collect()
}

/// Text carried by a frame payload, if any. Empty text counts as none.
pub fn extract_streamed_text(payload: &Value) -> Option<String> {
    let text = match StreamPayload::classify(payload) {
        StreamPayload::Bare(s)
        | StreamPayload::Content(s)
        | StreamPayload::Text(s)
        | StreamPayload::Delta(s)
        | StreamPayload::MessageContent(s) => s.to_string(),
        StreamPayload::MessageParts(parts) | StreamPayload::ContentParts(parts) => {
            join_parts(parts)
        }
        StreamPayload::Unrecognized => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Whether a payload says the run is finished.
pub fn completion_signalled(payload: &Value) -> bool {
    let status = payload.get("status").and_then(Value::as_str);
    let typ = payload.get("type").and_then(Value::as_str);
    matches!(status, Some("completed") | Some("done"))
        || typ == Some("done")
        || payload.get("done").and_then(Value::as_bool) == Some(true)
}

/// Combine streamed text where gateways may send deltas or the full text so far.
///
/// A cumulative snapshot replaces the buffer, a replayed prefix is ignored, anything else is
/// appended. Delivering the same chunk twice is a no-op once it has been seen as a snapshot.
pub fn merge_streamed_text(existing: &str, incoming: &str) -> String {
    if incoming.is_empty() {
        return existing.to_string();
    }
    if existing.is_empty() || incoming.starts_with(existing) {
        return incoming.to_string();
    }
    if existing.starts_with(incoming) {
        return existing.to_string();
    }
    format!("{}{}", existing, incoming)
}

fn is_separator(c: char) -> bool {
    c == '-' || c == '_'
}

/// Agent display name: `[A-Za-z0-9_-]`, single separators, at most 32 chars.
pub fn sanitize_agent_name(input: &str, fallback: &str) -> String {
    let mut out = String::new();
    for c in input.trim().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if !(c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            continue;
        }
        if is_separator(c) && out.ends_with(is_separator) {
            continue;
        }
        out.push(c);
    }
    let trimmed: String = out
        .trim_matches(is_separator)
        .chars()
        .take(MAX_AGENT_NAME)
        .collect();
    let trimmed = trimmed.trim_end_matches(is_separator);
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Gateway-side session key for an agent: `agent:<name>:main`. Characters outside
/// `[a-z0-9_-]` become `-` and runs of `-` collapse, so keys match existing gateway sessions.
pub fn session_key(agent_name: &str) -> String {
    let mut safe = String::new();
    for c in agent_name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            c
        } else {
            '-'
        };
        if c == '-' && safe.ends_with('-') {
            continue;
        }
        safe.push(c);
    }
    let safe: String = safe.chars().take(MAX_SESSION_KEY_PART).collect();
    let safe = if safe.is_empty() { "main" } else { safe.as_str() };
    format!("agent:{}:main", safe)
}

/// Normalize a user-supplied gateway address to a `ws://` or `wss://` URL.
pub fn normalize_gateway_url(raw: &str) -> Result<Url, InvalidGatewayUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidGatewayUrl("gateway url is empty".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{}", trimmed)
    };
    let mut url = Url::parse(&candidate).map_err(|e| InvalidGatewayUrl(format!("{}: {}", trimmed, e)))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(InvalidGatewayUrl(format!("unsupported scheme {}", other)));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(InvalidGatewayUrl(trimmed.to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(InvalidGatewayUrl(format!("{}: missing host", trimmed)));
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a relayed conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The most recent user message, trimmed. The gateway keeps history via the session key.
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
}

//! One chat turn (or a connect-only preflight) against an OpenClaw gateway.
//!
//! Every turn opens a fresh WebSocket, waits for `connect.challenge`, authenticates, sends a
//! single `chat.send` and collects streamed text until the gateway signals completion. When no
//! explicit signal arrives, a remote close with buffered text (or, if enabled, an idle gap) ends
//! the turn instead; [`CompletionKind`] records which rule fired.

use super::protocol::{
    build_chat_send_request, build_connect_request, completion_signalled,
    extract_streamed_text, last_user_message, merge_streamed_text, normalize_gateway_url,
    parse_frame, session_key, ChatMessage, ClientMode, Frame, WsEvent, WsResponse,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(70);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(9);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const NO_RESPONSE: &str = "(no response)";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway url is invalid: {0}")]
    InvalidUrl(String),
    #[error("gateway token is missing")]
    MissingToken,
    #[error("no user message to send")]
    EmptyMessage,
    #[error("could not reach gateway: {0}")]
    Connect(String),
    #[error("gateway rejected the token: {0}")]
    AuthFailed(String),
    #[error("gateway error: {0}")]
    Remote(String),
    #[error("gateway closed without a reply")]
    EmptyResponse,
    #[error("gateway closed the connection (code {0})")]
    ClosedUnexpectedly(u16),
    #[error("gateway connection ended without a close frame")]
    IncompleteClose,
    #[error("gateway did not finish in time")]
    Timeout,
    #[error("gateway stopped streaming")]
    IdleTimeout,
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidUrl(_) => "OPENCLAW_INVALID_URL",
            GatewayError::MissingToken => "OPENCLAW_TOKEN_REQUIRED",
            GatewayError::EmptyMessage => "OPENCLAW_EMPTY_MESSAGE",
            GatewayError::Connect(_) => "OPENCLAW_CONNECT",
            GatewayError::AuthFailed(_) => "OPENCLAW_AUTH_FAILED",
            GatewayError::Remote(_) => "OPENCLAW_ERROR",
            GatewayError::EmptyResponse => "OPENCLAW_EMPTY_RESPONSE",
            GatewayError::ClosedUnexpectedly(_) => "OPENCLAW_CLOSED",
            GatewayError::IncompleteClose => "OPENCLAW_INCOMPLETE_CLOSE",
            GatewayError::Timeout => "OPENCLAW_TIMEOUT",
            GatewayError::IdleTimeout => "OPENCLAW_IDLE_TIMEOUT",
        }
    }
}

/// Timers and fallbacks for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub chat_timeout: Duration,
    pub verify_timeout: Duration,
    pub idle_timeout: Duration,
    /// Finish a turn with the buffered text when the stream goes idle.
    pub idle_completion: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            chat_timeout: DEFAULT_CHAT_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_completion: false,
        }
    }
}

impl ClientOptions {
    /// Build from configured milliseconds, clamping to the supported ranges.
    pub fn from_millis(chat_ms: u64, verify_ms: u64, idle_ms: u64, idle_completion: bool) -> Self {
        Self {
            chat_timeout: Duration::from_millis(chat_ms.clamp(5_000, 120_000)),
            verify_timeout: Duration::from_millis(verify_ms.clamp(3_000, 30_000)),
            idle_timeout: Duration::from_millis(idle_ms.clamp(1_000, 120_000)),
            idle_completion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Sending,
    Streaming,
    Completed,
    Errored,
}

/// Which rule ended a successful turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// The gateway sent a completion marker.
    Explicit,
    /// The gateway closed the socket after streaming some text.
    RemoteClose,
    /// The stream went idle with text buffered and idle completion enabled.
    IdleFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub completion: CompletionKind,
}

/// Everything needed for one relayed turn.
#[derive(Clone)]
pub struct ChatTurn {
    pub messages: Vec<ChatMessage>,
    pub gateway_url: String,
    pub gateway_token: String,
    pub agent_name: String,
}

impl std::fmt::Debug for ChatTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTurn")
            .field("messages", &self.messages.len())
            .field("gateway_url", &self.gateway_url)
            .field("agent_name", &self.agent_name)
            .finish_non_exhaustive()
    }
}

/// Gateway operations the relay depends on.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Connect and authenticate only.
    async fn verify(&self, gateway_url: &str, gateway_token: &str) -> Result<(), GatewayError>;
    /// Run one chat turn.
    async fn chat(&self, turn: ChatTurn) -> Result<ChatReply, GatewayError>;
}

enum Goal {
    Verify,
    Chat { session_key: String, message: String },
}

#[derive(Debug)]
enum Finished {
    Verified,
    Reply(ChatReply),
}

enum Step {
    Continue,
    Send(Frame),
    Done(Finished),
}

#[derive(Debug, Clone, Default)]
pub struct GatewayChatClient {
    options: ClientOptions,
}

impl GatewayChatClient {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// Preflight: connect and authenticate, then close with 1000.
    pub async fn verify(&self, gateway_url: &str, gateway_token: &str) -> Result<(), GatewayError> {
        let (url, token) = validate_target(gateway_url, gateway_token)?;
        self.run(&url, &token, Goal::Verify).await.map(|_| ())
    }

    /// Send the latest user message and wait for the reply.
    pub async fn send_turn(&self, turn: &ChatTurn) -> Result<ChatReply, GatewayError> {
        let (url, token) = validate_target(&turn.gateway_url, &turn.gateway_token)?;
        let message = last_user_message(&turn.messages)
            .filter(|m| !m.is_empty())
            .ok_or(GatewayError::EmptyMessage)?;
        let goal = Goal::Chat {
            session_key: session_key(&turn.agent_name),
            message: message.to_string(),
        };
        match self.run(&url, &token, goal).await? {
            Finished::Reply(reply) => Ok(reply),
            Finished::Verified => Err(GatewayError::EmptyResponse),
        }
    }

    async fn run(&self, url: &Url, token: &str, goal: Goal) -> Result<Finished, GatewayError> {
        let (limit, mode) = match goal {
            Goal::Verify => (self.options.verify_timeout, ClientMode::PairingPreflight),
            Goal::Chat { .. } => (self.options.chat_timeout, ClientMode::SiteRelay),
        };
        let deadline = tokio::time::Instant::now() + limit;

        let mut turn = Turn::new(mode, self.options);
        let mut ws = match tokio::time::timeout_at(
            deadline,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                turn.enter(TurnPhase::Errored);
                return Err(GatewayError::Connect(e.to_string()));
            }
            Err(_) => {
                turn.enter(TurnPhase::Errored);
                return Err(GatewayError::Timeout);
            }
        };
        turn.enter(TurnPhase::AwaitingChallenge);

        let result = tokio::time::timeout_at(deadline, turn.drive(&mut ws, token, &goal))
            .await
            .unwrap_or(Err(GatewayError::Timeout));

        let code = match &result {
            Ok(_) => {
                turn.enter(TurnPhase::Completed);
                CloseCode::Normal
            }
            Err(e) => {
                log::debug!("gateway turn failed: {}", e);
                turn.enter(TurnPhase::Errored);
                CloseCode::Error
            }
        };
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        let _ = tokio::time::timeout(CLOSE_GRACE, ws.close(Some(frame))).await;
        result
    }
}

#[async_trait]
impl GatewayConnector for GatewayChatClient {
    async fn verify(&self, gateway_url: &str, gateway_token: &str) -> Result<(), GatewayError> {
        GatewayChatClient::verify(self, gateway_url, gateway_token).await
    }

    async fn chat(&self, turn: ChatTurn) -> Result<ChatReply, GatewayError> {
        self.send_turn(&turn).await
    }
}

fn validate_target(gateway_url: &str, gateway_token: &str) -> Result<(Url, String), GatewayError> {
    let url = normalize_gateway_url(gateway_url).map_err(|e| GatewayError::InvalidUrl(e.0))?;
    let token = gateway_token.trim();
    if token.is_empty() {
        return Err(GatewayError::MissingToken);
    }
    Ok((url, token.to_string()))
}

/// Per-connection state machine.
struct Turn {
    phase: TurnPhase,
    mode: ClientMode,
    options: ClientOptions,
    buffer: String,
}

impl Turn {
    fn new(mode: ClientMode, options: ClientOptions) -> Self {
        Self {
            phase: TurnPhase::Connecting,
            mode,
            options,
            buffer: String::new(),
        }
    }

    fn enter(&mut self, next: TurnPhase) {
        if self.phase != next {
            log::debug!("gateway {} turn: {:?} -> {:?}", self.mode.as_str(), self.phase, next);
            self.phase = next;
        }
    }

    fn authenticated(&self) -> bool {
        matches!(self.phase, TurnPhase::Sending | TurnPhase::Streaming)
    }

    async fn drive(
        &mut self,
        ws: &mut WsStream,
        token: &str,
        goal: &Goal,
    ) -> Result<Finished, GatewayError> {
        loop {
            let next = if self.phase == TurnPhase::Streaming {
                match tokio::time::timeout(self.options.idle_timeout, ws.next()).await {
                    Ok(next) => next,
                    Err(_) => return self.on_idle(),
                }
            } else {
                ws.next().await
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) if !self.authenticated() => {
                    return Err(GatewayError::Connect(e.to_string()));
                }
                Some(Err(e)) => {
                    log::debug!("gateway stream error: {}", e);
                    return self.on_stream_end();
                }
                None => return self.on_stream_end(),
            };

            let step = match msg {
                Message::Text(text) => self.on_text(&text, token, goal)?,
                Message::Close(frame) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    return self.on_close(code);
                }
                _ => Step::Continue,
            };

            match step {
                Step::Continue => {}
                Step::Done(finished) => return Ok(finished),
                Step::Send(frame) => {
                    if let Err(e) = ws.send(Message::Text(frame.to_text())).await {
                        return Err(GatewayError::Connect(e.to_string()));
                    }
                    if self.phase == TurnPhase::Sending {
                        self.enter(TurnPhase::Streaming);
                    }
                }
            }
        }
    }

    fn on_text(&mut self, text: &str, token: &str, goal: &Goal) -> Result<Step, GatewayError> {
        let Some(frame) = parse_frame(text) else {
            log::debug!("ignoring unparseable gateway frame");
            return Ok(Step::Continue);
        };
        match self.phase {
            TurnPhase::AwaitingChallenge => match frame {
                Frame::Event(WsEvent { ref event, .. }) if event == "connect.challenge" => {
                    self.enter(TurnPhase::Authenticating);
                    Ok(Step::Send(build_connect_request(token, self.mode)))
                }
                _ => Ok(Step::Continue),
            },
            TurnPhase::Authenticating => self.on_auth_frame(frame, goal),
            TurnPhase::Streaming => self.on_stream_frame(frame),
            _ => Ok(Step::Continue),
        }
    }

    fn on_auth_frame(&mut self, frame: Frame, goal: &Goal) -> Result<Step, GatewayError> {
        let hello = match &frame {
            Frame::Res(res) if !res.ok => {
                let reason = res
                    .error_reason()
                    .unwrap_or_else(|| "unauthorized".to_string());
                return Err(GatewayError::AuthFailed(reason));
            }
            Frame::Res(_) => true,
            Frame::Event(ev) => is_hello(ev.payload.as_ref()),
            Frame::Req(_) => false,
        };
        if !hello {
            return Ok(Step::Continue);
        }
        match goal {
            Goal::Verify => Ok(Step::Done(Finished::Verified)),
            Goal::Chat {
                session_key,
                message,
            } => {
                self.enter(TurnPhase::Sending);
                Ok(Step::Send(build_chat_send_request(session_key, message)))
            }
        }
    }

    fn on_stream_frame(&mut self, frame: Frame) -> Result<Step, GatewayError> {
        let payload = match frame {
            Frame::Res(res) if !res.ok => {
                return Err(GatewayError::Remote(
                    res.error_reason()
                        .unwrap_or_else(|| "request failed".to_string()),
                ));
            }
            Frame::Res(res) if res.is_run_ack() => return Ok(Step::Continue),
            Frame::Res(WsResponse { payload, .. }) => payload,
            Frame::Event(WsEvent { payload, .. }) => payload,
            Frame::Req(_) => return Ok(Step::Continue),
        };
        let Some(payload) = payload else {
            return Ok(Step::Continue);
        };
        if let Some(text) = extract_streamed_text(&payload) {
            self.buffer = merge_streamed_text(&self.buffer, &text);
        }
        if completion_signalled(&payload) {
            let text = if self.buffer.is_empty() {
                NO_RESPONSE.to_string()
            } else {
                std::mem::take(&mut self.buffer)
            };
            return Ok(Step::Done(Finished::Reply(ChatReply {
                text,
                completion: CompletionKind::Explicit,
            })));
        }
        Ok(Step::Continue)
    }

    fn take_buffered(&mut self, completion: CompletionKind) -> Option<Finished> {
        if self.phase != TurnPhase::Streaming || self.buffer.is_empty() {
            return None;
        }
        Some(Finished::Reply(ChatReply {
            text: std::mem::take(&mut self.buffer),
            completion,
        }))
    }

    fn on_close(&mut self, code: u16) -> Result<Finished, GatewayError> {
        if !self.authenticated() {
            return Err(GatewayError::Connect(format!(
                "gateway closed before authenticating (code {})",
                code
            )));
        }
        if let Some(done) = self.take_buffered(CompletionKind::RemoteClose) {
            return Ok(done);
        }
        match code {
            1000 | 1001 => Err(GatewayError::EmptyResponse),
            other => Err(GatewayError::ClosedUnexpectedly(other)),
        }
    }

    fn on_stream_end(&mut self) -> Result<Finished, GatewayError> {
        if !self.authenticated() {
            return Err(GatewayError::Connect(
                "gateway ended the connection before authenticating".to_string(),
            ));
        }
        self.take_buffered(CompletionKind::RemoteClose)
            .ok_or(GatewayError::IncompleteClose)
    }

    fn on_idle(&mut self) -> Result<Finished, GatewayError> {
        if self.options.idle_completion {
            if let Some(done) = self.take_buffered(CompletionKind::IdleFallback) {
                log::warn!("gateway went idle mid-reply; returning buffered text");
                return Ok(done);
            }
        }
        Err(GatewayError::IdleTimeout)
    }
}

fn is_hello(payload: Option<&Value>) -> bool {
    payload
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str)
        == Some("hello-ok")
}

//! Gateway: OpenClaw WebSocket protocol and the per-turn chat client.
//!
//! One connection per chat turn. The gateway opens with `connect.challenge`; the client answers
//! with `connect`, then sends a single `chat.send` and reads req/res/event frames until the reply
//! is complete.

mod client;
mod protocol;

pub use client::{
    ChatReply, ChatTurn, ClientOptions, CompletionKind, GatewayChatClient, GatewayConnector,
    GatewayError, TurnPhase,
};
pub use protocol::{
    build_chat_send_request, build_connect_request, completion_signalled, extract_streamed_text,
    last_user_message, merge_streamed_text, normalize_gateway_url, parse_frame,
    sanitize_agent_name, session_key, ChatMessage, ChatSendParams, ClientMode, ConnectParams,
    Frame, InvalidGatewayUrl, Role, StreamPayload, WsEvent, WsRequest, WsResponse,
    PROTOCOL_VERSION,
};

//! Integration tests: drive `GatewayChatClient` against a scripted gateway.

mod common;

use common::{completed_event, spawn_gateway, text_event, Ending, Hello, Opening, Script};
use lib::gateway::{
    ChatMessage, ChatTurn, ClientOptions, CompletionKind, GatewayChatClient, GatewayError, Role,
};
use lib::relay::RelayError;
use serde_json::json;
use std::time::Duration;

fn client(idle_ms: u64, idle_completion: bool) -> GatewayChatClient {
    GatewayChatClient::new(ClientOptions {
        chat_timeout: Duration::from_secs(5),
        verify_timeout: Duration::from_secs(3),
        idle_timeout: Duration::from_millis(idle_ms),
        idle_completion,
    })
}

fn turn(url: &str, token: &str, message: &str) -> ChatTurn {
    ChatTurn {
        messages: vec![
            ChatMessage {
                role: Role::User,
                content: "earlier".into(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "reply".into(),
            },
            ChatMessage {
                role: Role::User,
                content: message.into(),
            },
        ],
        gateway_url: url.to_string(),
        gateway_token: token.to_string(),
        agent_name: "Desk-Pet".to_string(),
    }
}

#[tokio::test]
async fn explicit_completion_returns_streamed_text() {
    let gw = spawn_gateway(
        Script::new("gw-secret")
            .frames(vec![text_event("Hel"), text_event("lo"), completed_event()])
            .ending(Ending::Linger),
    )
    .await;

    let reply = client(2_000, false)
        .send_turn(&turn(&gw.url(), "gw-secret", "ping"))
        .await
        .expect("reply");
    assert_eq!(reply.text, "Hello");
    assert_eq!(reply.completion, CompletionKind::Explicit);

    let requests = gw.requests();
    assert_eq!(gw.methods(), ["connect", "chat.send"]);
    let connect = &requests[0]["params"];
    assert_eq!(connect["minProtocol"], 3);
    assert_eq!(connect["maxProtocol"], 3);
    assert_eq!(connect["role"], "operator");
    assert_eq!(connect["client"]["mode"], "site-relay");
    assert_eq!(connect["auth"]["token"], "gw-secret");
    let chat = &requests[1]["params"];
    assert_eq!(chat["message"], "ping");
    assert_eq!(chat["sessionKey"], "agent:desk-pet:main");
    assert!(chat["idempotencyKey"].as_str().is_some_and(|k| !k.is_empty()));
}

#[tokio::test]
async fn hello_event_also_authenticates() {
    let gw = spawn_gateway(
        Script::new("tok")
            .hello(Hello::Event)
            .frames(vec![json!({"type": "event", "event": "chat",
                "payload": {"message": {"content": [{"type": "text", "text": "hi "}, {"value": "there"}]},
                            "done": true}})]),
    )
    .await;

    let reply = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .expect("reply");
    assert_eq!(reply.text, "hi there");
    assert_eq!(reply.completion, CompletionKind::Explicit);
}

#[tokio::test]
async fn normal_close_without_text_is_empty_response() {
    let gw = spawn_gateway(Script::new("tok").ending(Ending::Close(1000))).await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::EmptyResponse), "{:?}", err);
}

#[tokio::test]
async fn going_away_close_without_text_is_empty_response() {
    let gw = spawn_gateway(Script::new("tok").ending(Ending::Close(1001))).await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::EmptyResponse), "{:?}", err);
}

#[tokio::test]
async fn close_with_buffered_text_completes() {
    let gw = spawn_gateway(
        Script::new("tok")
            .frames(vec![text_event("partial")])
            .ending(Ending::Close(1000)),
    )
    .await;
    let reply = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .expect("reply");
    assert_eq!(reply.text, "partial");
    assert_eq!(reply.completion, CompletionKind::RemoteClose);
}

#[tokio::test]
async fn abnormal_close_without_text_reports_code() {
    let gw = spawn_gateway(Script::new("tok").ending(Ending::Close(4001))).await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ClosedUnexpectedly(4001)), "{:?}", err);
}

#[tokio::test]
async fn dropped_connection_without_text_is_incomplete() {
    let gw = spawn_gateway(Script::new("tok").ending(Ending::Drop)).await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::IncompleteClose), "{:?}", err);
}

#[tokio::test]
async fn wrong_token_is_auth_failure() {
    let gw = spawn_gateway(Script::new("right")).await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "wrong", "ping"))
        .await
        .unwrap_err();
    match err {
        GatewayError::AuthFailed(reason) => assert_eq!(reason, "invalid token"),
        other => panic!("expected auth failure, got {:?}", other),
    }
    assert_eq!(gw.methods(), ["connect"]);
}

#[tokio::test]
async fn idle_stream_times_out_unless_fallback_enabled() {
    let script = Script::new("tok")
        .frames(vec![text_event("half a thou")])
        .ending(Ending::Linger);

    let gw = spawn_gateway(script.clone()).await;
    let err = client(300, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::IdleTimeout), "{:?}", err);

    let gw = spawn_gateway(script).await;
    let reply = client(300, true)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .expect("reply");
    assert_eq!(reply.text, "half a thou");
    assert_eq!(reply.completion, CompletionKind::IdleFallback);
}

#[tokio::test]
async fn remote_error_after_send_is_reported() {
    let gw = spawn_gateway(
        Script::new("tok")
            .frames(vec![json!({"type": "res", "id": "x", "ok": false, "error": "agent busy"})])
            .ending(Ending::Linger),
    )
    .await;
    let err = client(2_000, false)
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    match err {
        GatewayError::Remote(reason) => assert_eq!(reason, "agent busy"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn verify_connects_without_chatting() {
    let gw = spawn_gateway(Script::new("tok")).await;
    let c = client(2_000, false);
    c.verify(&gw.url(), "tok").await.expect("verified");
    assert_eq!(gw.methods(), ["connect"]);
    assert_eq!(gw.requests()[0]["params"]["client"]["mode"], "pairing-preflight");

    let err = c.verify(&gw.url(), "nope").await.unwrap_err();
    assert_eq!(err.code(), "OPENCLAW_AUTH_FAILED");
}

#[tokio::test]
async fn unreachable_gateway_is_a_connect_error() {
    let port = common::free_port();
    let err = client(2_000, false)
        .verify(&format!("ws://127.0.0.1:{}", port), "tok")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Connect(_)), "{:?}", err);
}

#[tokio::test]
async fn close_before_challenge_fails_preflight_as_connect() {
    let gw = spawn_gateway(Script::new("tok").opening(Opening::Close(1000))).await;
    let err = client(2_000, false).verify(&gw.url(), "tok").await.unwrap_err();
    assert!(matches!(err, GatewayError::Connect(_)), "{:?}", err);
    assert!(gw.methods().is_empty());

    let (status, code) = RelayError::Preflight(err).status_and_code();
    assert_eq!(status.as_u16(), 504);
    assert_eq!(code, "OPENCLAW_CONNECT");
}

#[tokio::test]
async fn silent_gateway_hits_the_hard_timeout() {
    let gw = spawn_gateway(Script::new("tok").opening(Opening::Silent)).await;
    let client = GatewayChatClient::new(ClientOptions {
        chat_timeout: Duration::from_millis(500),
        verify_timeout: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(10),
        idle_completion: false,
    });

    let started = std::time::Instant::now();
    let err = client
        .send_turn(&turn(&gw.url(), "tok", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = client.verify(&gw.url(), "tok").await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout), "{:?}", err);
}

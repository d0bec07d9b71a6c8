//! Shared helpers: free ports and a scripted OpenClaw gateway served over axum WebSockets.

#![allow(dead_code)]

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// What the mock does once the scripted frames are sent.
#[derive(Debug, Clone, Copy)]
pub enum Ending {
    /// Send a close frame with this code.
    Close(u16),
    /// Keep the socket open until the client goes away.
    Linger,
    /// Drop the connection without a close frame.
    Drop,
}

/// What the mock does right after the WebSocket upgrade.
#[derive(Debug, Clone, Copy)]
pub enum Opening {
    /// Send `connect.challenge` and run the script.
    Challenge,
    /// Close with this code before any frame.
    Close(u16),
    /// Send nothing and wait for the client to leave.
    Silent,
}

/// How the mock answers a valid `connect`.
#[derive(Debug, Clone, Copy)]
pub enum Hello {
    /// `res` with `ok: true`.
    Response,
    /// `event` whose payload is `{ type: "hello-ok" }`.
    Event,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub opening: Opening,
    pub token: String,
    pub hello: Hello,
    /// Frames sent after acknowledging `chat.send`.
    pub frames: Vec<Value>,
    pub ending: Ending,
}

impl Script {
    pub fn new(token: &str) -> Self {
        Self {
            opening: Opening::Challenge,
            token: token.to_string(),
            hello: Hello::Response,
            frames: Vec::new(),
            ending: Ending::Close(1000),
        }
    }

    pub fn frames(mut self, frames: Vec<Value>) -> Self {
        self.frames = frames;
        self
    }

    pub fn ending(mut self, ending: Ending) -> Self {
        self.ending = ending;
        self
    }

    pub fn opening(mut self, opening: Opening) -> Self {
        self.opening = opening;
        self
    }

    pub fn hello(mut self, hello: Hello) -> Self {
        self.hello = hello;
        self
    }
}

pub fn text_event(text: &str) -> Value {
    json!({"type": "event", "event": "chat", "payload": {"text": text}})
}

pub fn completed_event() -> Value {
    json!({"type": "event", "event": "chat", "payload": {"status": "completed"}})
}

#[derive(Clone)]
struct MockState {
    script: Arc<Script>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// A running mock gateway.
pub struct MockGateway {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockGateway {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every request frame the mock received, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

pub async fn spawn_gateway(script: Script) -> MockGateway {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        script: Arc::new(script),
        requests: requests.clone(),
    };
    let app = Router::new().route("/", get(upgrade)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock gateway");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockGateway { addr, requests }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| run_script(socket, state))
}

async fn next_request(socket: &mut WebSocket, state: &MockState) -> Option<Value> {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                state.requests.lock().unwrap().push(value.clone());
                return Some(value);
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send(socket: &mut WebSocket, frame: Value) -> bool {
    socket.send(Message::Text(frame.to_string())).await.is_ok()
}

async fn run_script(mut socket: WebSocket, state: MockState) {
    let script = state.script.clone();
    match script.opening {
        Opening::Challenge => {}
        Opening::Close(code) => {
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            let _ = tokio::time::timeout(Duration::from_secs(1), socket.recv()).await;
            return;
        }
        Opening::Silent => {
            while let Some(Ok(_)) = socket.recv().await {}
            return;
        }
    }
    let challenge = json!({
        "type": "event",
        "event": "connect.challenge",
        "payload": {"nonce": uuid::Uuid::new_v4().to_string()}
    });
    if !send(&mut socket, challenge).await {
        return;
    }

    let Some(connect) = next_request(&mut socket, &state).await else {
        return;
    };
    let id = connect.get("id").cloned().unwrap_or(Value::Null);
    let token = connect
        .pointer("/params/auth/token")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if token != script.token {
        let denied = json!({
            "type": "res", "id": id, "ok": false,
            "error": {"code": "UNAUTHORIZED", "message": "invalid token"}
        });
        send(&mut socket, denied).await;
        let _ = socket.recv().await;
        return;
    }
    let hello = match script.hello {
        Hello::Response => json!({
            "type": "res", "id": id, "ok": true,
            "payload": {"type": "hello-ok", "protocol": 3}
        }),
        Hello::Event => json!({
            "type": "event", "event": "hello",
            "payload": {"type": "hello-ok", "protocol": 3}
        }),
    };
    if !send(&mut socket, hello).await {
        return;
    }

    let Some(chat) = next_request(&mut socket, &state).await else {
        return;
    };
    let ack = json!({
        "type": "res", "id": chat.get("id").cloned().unwrap_or(Value::Null), "ok": true,
        "payload": {"runId": "run-1", "status": "started"}
    });
    if !send(&mut socket, ack).await {
        return;
    }
    for frame in &script.frames {
        if !send(&mut socket, frame.clone()).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    match script.ending {
        Ending::Close(code) => {
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            let _ = tokio::time::timeout(Duration::from_secs(1), socket.recv()).await;
        }
        Ending::Linger => while let Some(Ok(_)) = socket.recv().await {},
        Ending::Drop => drop(socket),
    }
}

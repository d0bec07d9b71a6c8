//! Pairing HTTP facade: request, issue and claim pairing codes, and relay chat turns.
//!
//! [`RelayService`] holds the operations; `server` exposes them over axum. The service never
//! returns encrypted blobs or token hashes, and gateway credentials only leave the store on
//! their way into a [`GatewayConnector`].

mod error;
mod policy;
mod server;

pub use error::{RelayError, RelayResult};
pub use policy::{constant_time_eq, is_public_gateway};
pub use server::{router, run_relay, ISSUER_TOKEN_HEADER};

use crate::config::{resolve_issuer_defaults, resolve_issuer_token, Config, IssuerDefaults};
use crate::gateway::{
    last_user_message, normalize_gateway_url, sanitize_agent_name, ChatMessage, ChatTurn,
    CompletionKind, GatewayConnector, GatewayError,
};
use crate::pairing::{
    sanitize_pairing_code, ClaimedSession, IssuedPairingCode, NewPairingCode, PairingRequestIssued,
    PairingStore, DEFAULT_AGENT_NAME,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Relay policy knobs resolved from config and environment.
#[derive(Clone, Default)]
pub struct RelaySettings {
    pub issuer_token: Option<String>,
    pub defaults: IssuerDefaults,
    pub allow_private_gateways: bool,
    pub session_ttl_seconds: Option<i64>,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            issuer_token: resolve_issuer_token(config),
            defaults: resolve_issuer_defaults(config),
            allow_private_gateways: config.relay.allow_private_gateways,
            session_ttl_seconds: config.pairing.session_ttl_seconds,
        }
    }
}

/// Body of an issue call. Fields that are missing or of the wrong type are `None`.
#[derive(Clone, Default)]
pub struct IssueRequest {
    pub request_code: Option<String>,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub agent_name: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub max_claims: Option<i64>,
}

impl std::fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueRequest")
            .field("request_code", &self.request_code.is_some())
            .field("gateway_url", &self.gateway_url)
            .field("agent_name", &self.agent_name)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_claims", &self.max_claims)
            .finish_non_exhaustive()
    }
}

impl IssueRequest {
    pub fn from_json(body: &Value) -> Self {
        Self {
            request_code: string_field(body, "requestCode"),
            gateway_url: string_field(body, "gatewayUrl"),
            gateway_token: string_field(body, "gatewayToken"),
            agent_name: string_field(body, "agentName"),
            ttl_seconds: int_field(body, "ttlSeconds"),
            max_claims: int_field(body, "maxClaims"),
        }
    }
}

/// Result of a relayed chat turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedReply {
    pub reply: String,
    pub agent_name: String,
    #[serde(skip)]
    pub completion: CompletionKind,
}

/// Trimmed, non-empty string field.
pub(crate) fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer field given as a JSON number or a numeric string; fractions are rounded.
pub(crate) fn int_field(body: &Value, key: &str) -> Option<i64> {
    let n = match body.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then(|| n.round() as i64)
}

#[derive(Clone)]
pub struct RelayService {
    store: PairingStore,
    connector: Arc<dyn GatewayConnector>,
    settings: Arc<RelaySettings>,
}

impl RelayService {
    pub fn new(
        store: PairingStore,
        connector: Arc<dyn GatewayConnector>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            connector,
            settings: Arc::new(settings),
        }
    }

    /// Whether `presented` matches the configured issuer token. Always false when none is set.
    pub fn issuer_authorized(&self, presented: Option<&str>) -> bool {
        match (self.settings.issuer_token.as_deref(), presented.map(str::trim)) {
            (Some(expected), Some(given)) if !given.is_empty() => {
                constant_time_eq(given.as_bytes(), expected.as_bytes())
            }
            _ => false,
        }
    }

    pub async fn request_pairing(&self, ttl_seconds: Option<i64>) -> RelayResult<PairingRequestIssued> {
        Ok(self.store.create_pairing_request(ttl_seconds).await?)
    }

    /// Issue a pairing code, either for a browser's request code or for an authorized issuer.
    pub async fn issue_pairing(
        &self,
        input: IssueRequest,
        issuer: Option<&str>,
    ) -> RelayResult<IssuedPairingCode> {
        let request_code = input
            .request_code
            .as_deref()
            .map(sanitize_pairing_code)
            .filter(|c| !c.is_empty());
        let privileged = request_code.is_none();
        if privileged {
            match issuer.map(str::trim).filter(|t| !t.is_empty()) {
                None => return Err(RelayError::RequestRequired),
                Some(t) if !self.issuer_authorized(Some(t)) => return Err(RelayError::Unauthorized),
                Some(_) => {}
            }
        }

        let defaults = &self.settings.defaults;
        let fallback = |value: Option<String>, default: &Option<String>| {
            value.or_else(|| if privileged { default.clone() } else { None })
        };
        let gateway_url = fallback(input.gateway_url, &defaults.gateway_url);
        let gateway_token = fallback(input.gateway_token, &defaults.gateway_token);
        let (Some(gateway_url), Some(gateway_token)) = (gateway_url, gateway_token) else {
            return Err(RelayError::GatewayRequired);
        };

        let url = normalize_gateway_url(&gateway_url).map_err(|e| RelayError::InvalidUrl(e.0))?;
        if !self.settings.allow_private_gateways && !is_public_gateway(&url) {
            return Err(RelayError::PublicGatewayRequired);
        }
        self.connector
            .verify(url.as_str(), &gateway_token)
            .await
            .map_err(RelayError::Preflight)?;

        let default_agent = sanitize_agent_name(
            defaults.agent_name.as_deref().unwrap_or_default(),
            DEFAULT_AGENT_NAME,
        );
        let new_code = NewPairingCode {
            gateway_url: url.to_string(),
            gateway_token,
            agent_name: Some(sanitize_agent_name(
                input.agent_name.as_deref().unwrap_or_default(),
                &default_agent,
            )),
            ttl_seconds: input.ttl_seconds,
            max_claims: input.max_claims,
        };
        let issued = match request_code {
            Some(code) => {
                self.store
                    .issue_pairing_code_from_request(&code, new_code)
                    .await?
            }
            None => self.store.create_pairing_code(new_code).await?,
        };
        Ok(issued)
    }

    pub async fn claim_pairing(&self, code: &str) -> RelayResult<ClaimedSession> {
        Ok(self
            .store
            .claim_pairing_code(code, self.settings.session_ttl_seconds)
            .await?)
    }

    /// Resolve the session and run one turn against its gateway.
    pub async fn chat_send(
        &self,
        session_token: Option<&str>,
        messages: Vec<ChatMessage>,
        agent_name: Option<&str>,
    ) -> RelayResult<RelayedReply> {
        let token = session_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RelayError::SessionRequired)?;
        let session = self.store.resolve_session(token).await?;
        if last_user_message(&messages).map_or(true, str::is_empty) {
            return Err(RelayError::Gateway(GatewayError::EmptyMessage));
        }
        let agent_name = sanitize_agent_name(agent_name.unwrap_or_default(), &session.agent_name);
        let turn = ChatTurn {
            messages,
            gateway_url: session.gateway_url,
            gateway_token: session.gateway_token,
            agent_name: agent_name.clone(),
        };
        let reply = self.connector.chat(turn).await.map_err(RelayError::Gateway)?;
        Ok(RelayedReply {
            reply: reply.text,
            agent_name,
            completion: reply.completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretBox;
    use crate::gateway::{ChatReply, Role};
    use crate::pairing::{ManualClock, PairingError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConnector {
        verified: Mutex<Vec<String>>,
        turns: Mutex<Vec<ChatTurn>>,
    }

    #[async_trait]
    impl GatewayConnector for FakeConnector {
        async fn verify(&self, gateway_url: &str, gateway_token: &str) -> Result<(), GatewayError> {
            self.verified.lock().unwrap().push(gateway_url.to_string());
            if gateway_token == "bad" {
                return Err(GatewayError::AuthFailed("invalid token".into()));
            }
            Ok(())
        }

        async fn chat(&self, turn: ChatTurn) -> Result<ChatReply, GatewayError> {
            self.turns.lock().unwrap().push(turn);
            Ok(ChatReply {
                text: "pong".into(),
                completion: CompletionKind::Explicit,
            })
        }
    }

    fn service(settings: RelaySettings) -> (RelayService, Arc<FakeConnector>) {
        let secrets = Arc::new(SecretBox::new("relay-test").unwrap());
        let store = PairingStore::in_memory(secrets, Arc::new(ManualClock::default()));
        let connector = Arc::new(FakeConnector::default());
        (RelayService::new(store, connector.clone(), settings), connector)
    }

    fn issue_body(request_code: &str, url: &str, token: &str) -> IssueRequest {
        IssueRequest::from_json(&json!({
            "requestCode": request_code,
            "gatewayUrl": url,
            "gatewayToken": token,
            "agentName": "Desk Pet",
        }))
    }

    #[test]
    fn lenient_fields() {
        let body = json!({"ttlSeconds": "90.4", "maxClaims": 2.6, "agentName": "  ", "x": true});
        assert_eq!(int_field(&body, "ttlSeconds"), Some(90));
        assert_eq!(int_field(&body, "maxClaims"), Some(3));
        assert_eq!(int_field(&body, "x"), None);
        assert_eq!(string_field(&body, "agentName"), None);
        assert_eq!(int_field(&json!("not an object"), "ttlSeconds"), None);
    }

    #[tokio::test]
    async fn private_gateway_is_rejected_before_preflight() {
        let (svc, connector) = service(RelaySettings::default());
        let req = svc.request_pairing(None).await.unwrap();
        let err = svc
            .issue_pairing(issue_body(&req.request_code, "http://192.168.1.5:8080", "tok"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "OPENCLAW_PAIRING_PUBLIC_GATEWAY_REQUIRED");
        assert!(connector.verified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn issue_requires_request_code_or_issuer() {
        let settings = RelaySettings {
            issuer_token: Some("issuer-secret".into()),
            defaults: IssuerDefaults {
                gateway_url: Some("wss://gw.example.com".into()),
                gateway_token: Some("default-token".into()),
                agent_name: Some("Front Desk".into()),
            },
            ..Default::default()
        };
        let (svc, connector) = service(settings);

        let err = svc.issue_pairing(IssueRequest::default(), None).await.unwrap_err();
        assert!(matches!(err, RelayError::RequestRequired));
        let err = svc
            .issue_pairing(IssueRequest::default(), Some("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));

        let issued = svc
            .issue_pairing(IssueRequest::default(), Some("issuer-secret"))
            .await
            .unwrap();
        assert_eq!(issued.agent_name, "Front-Desk");
        assert_eq!(
            connector.verified.lock().unwrap().as_slice(),
            ["wss://gw.example.com/".to_string()]
        );
    }

    #[tokio::test]
    async fn request_bound_issue_does_not_use_defaults() {
        let settings = RelaySettings {
            defaults: IssuerDefaults {
                gateway_url: Some("wss://gw.example.com".into()),
                gateway_token: Some("default-token".into()),
                agent_name: None,
            },
            ..Default::default()
        };
        let (svc, _) = service(settings);
        let req = svc.request_pairing(None).await.unwrap();
        let body = IssueRequest {
            request_code: Some(req.request_code),
            ..Default::default()
        };
        assert!(matches!(
            svc.issue_pairing(body, None).await,
            Err(RelayError::GatewayRequired)
        ));
    }

    #[tokio::test]
    async fn failed_preflight_keeps_request_code() {
        let (svc, _) = service(RelaySettings::default());
        let req = svc.request_pairing(None).await.unwrap();
        let err = svc
            .issue_pairing(issue_body(&req.request_code, "wss://gw.example.com", "bad"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "OPENCLAW_AUTH_FAILED");

        let issued = svc
            .issue_pairing(issue_body(&req.request_code, "wss://gw.example.com", "good"), None)
            .await
            .unwrap();
        assert_eq!(issued.agent_name, "Desk-Pet");
        let err = svc
            .issue_pairing(issue_body(&req.request_code, "wss://gw.example.com", "good"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Pairing(PairingError::InvalidRequestCode)));
    }

    #[tokio::test]
    async fn chat_send_resolves_session_and_forwards_turn() {
        let (svc, connector) = service(RelaySettings::default());
        let req = svc.request_pairing(None).await.unwrap();
        let issued = svc
            .issue_pairing(issue_body(&req.request_code, "gw.example.com:18789", "gw-token"), None)
            .await
            .unwrap();
        let claimed = svc.claim_pairing(&issued.pairing_code).await.unwrap();

        let messages = vec![ChatMessage {
            role: Role::User,
            content: "ping".into(),
        }];
        assert!(matches!(
            svc.chat_send(None, messages.clone(), None).await,
            Err(RelayError::SessionRequired)
        ));
        assert!(matches!(
            svc.chat_send(Some(&claimed.session_token), vec![], None).await,
            Err(RelayError::Gateway(GatewayError::EmptyMessage))
        ));

        let reply = svc
            .chat_send(Some(&claimed.session_token), messages, Some("Other Pet"))
            .await
            .unwrap();
        assert_eq!(reply.reply, "pong");
        assert_eq!(reply.agent_name, "Other-Pet");

        let turns = connector.turns.lock().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].gateway_url, "ws://gw.example.com:18789/");
        assert_eq!(turns[0].gateway_token, "gw-token");
    }
}

//! Single-writer pairing store.
//!
//! One tokio task owns [`StoreData`]. Handles send typed commands over an mpsc channel and
//! wait on a oneshot for the answer, so steps run in arrival order and never interleave.
//! A step works on a copy of the data; the copy replaces the live data only after it has been
//! written to disk (when the store is file-backed).

use super::clock::Clock;
use super::records::{
    clamp_int, sanitize_pairing_code, sanitize_token, PreparedPairing, StoreData,
    DEFAULT_AGENT_NAME, DEFAULT_PAIRING_TTL_SECONDS, DEFAULT_REQUEST_TTL_SECONDS,
    DEFAULT_SESSION_TTL_SECONDS, MAX_CLAIMS_BOUNDS, MAX_GATEWAY_TOKEN_CHARS,
    MAX_SESSION_TOKEN_CHARS, PAIRING_TTL_BOUNDS, REQUEST_TTL_BOUNDS, SESSION_TTL_BOUNDS,
};
use super::{
    ClaimedSession, IssuedPairingCode, NewPairingCode, PairingError, PairingRequestIssued,
    ResolvedSession,
};
use crate::crypto::SecretBox;
use crate::gateway::{normalize_gateway_url, sanitize_agent_name};
use fs2::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, PairingError>>;

enum Command {
    CreateRequest {
        ttl_seconds: i64,
        reply: Reply<PairingRequestIssued>,
    },
    CreatePairing {
        prepared: PreparedPairing,
        reply: Reply<IssuedPairingCode>,
    },
    IssueFromRequest {
        request_code: String,
        prepared: PreparedPairing,
        reply: Reply<IssuedPairingCode>,
    },
    Claim {
        code: String,
        session_ttl_seconds: i64,
        reply: Reply<ClaimedSession>,
    },
    Resolve {
        token: String,
        reply: Reply<ResolvedSession>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the store task.
#[derive(Clone)]
pub struct PairingStore {
    tx: mpsc::Sender<Command>,
    secrets: Arc<SecretBox>,
}

impl std::fmt::Debug for PairingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingStore")
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

impl PairingStore {
    /// Open a file-backed store. Takes an exclusive lock on `<path>.lock` and fails if another
    /// process holds it. A missing or unreadable store file starts empty.
    pub async fn open(
        path: impl AsRef<Path>,
        secrets: Arc<SecretBox>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PairingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let lock = lock_file(sibling(&path, "lock")).await?;

        let data = load(&path).await;
        log::info!(
            "pairing store opened at {} ({} sessions)",
            path.display(),
            data.sessions.len()
        );
        Ok(Self::spawn(
            StoreActor {
                data,
                path: Some(path),
                secrets: secrets.clone(),
                clock,
                _lock: Some(lock),
            },
            secrets,
        ))
    }

    /// Store that lives only as long as the process.
    pub fn in_memory(secrets: Arc<SecretBox>, clock: Arc<dyn Clock>) -> Self {
        Self::spawn(
            StoreActor {
                data: StoreData::default(),
                path: None,
                secrets: secrets.clone(),
                clock,
                _lock: None,
            },
            secrets,
        )
    }

    fn spawn(actor: StoreActor, secrets: Arc<SecretBox>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(actor.run(rx));
        Self { tx, secrets }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, PairingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PairingError::Unavailable)?;
        rx.await.map_err(|_| PairingError::Unavailable)?
    }

    /// Validate and seal the input before it reaches the store task.
    fn prepare(&self, input: NewPairingCode) -> Result<PreparedPairing, PairingError> {
        let gateway_url = normalize_gateway_url(&input.gateway_url)
            .map_err(|e| PairingError::InvalidUrl(e.to_string()))?;
        let gateway_token = sanitize_token(&input.gateway_token, MAX_GATEWAY_TOKEN_CHARS);
        if gateway_token.is_empty() {
            return Err(PairingError::MissingToken);
        }
        Ok(PreparedPairing {
            gateway_url: gateway_url.to_string(),
            gateway_token_enc: self.secrets.encrypt_str(&gateway_token)?,
            agent_name: sanitize_agent_name(
                input.agent_name.as_deref().unwrap_or_default(),
                DEFAULT_AGENT_NAME,
            ),
            ttl_seconds: clamp_int(
                input.ttl_seconds,
                DEFAULT_PAIRING_TTL_SECONDS,
                PAIRING_TTL_BOUNDS,
            ),
            max_claims: clamp_int(input.max_claims, 1, MAX_CLAIMS_BOUNDS) as u32,
        })
    }

    /// Mint a one-shot request code for a browser that wants to be paired.
    pub async fn create_pairing_request(
        &self,
        ttl_seconds: Option<i64>,
    ) -> Result<PairingRequestIssued, PairingError> {
        let ttl_seconds = clamp_int(ttl_seconds, DEFAULT_REQUEST_TTL_SECONDS, REQUEST_TTL_BOUNDS);
        self.call(|reply| Command::CreateRequest { ttl_seconds, reply })
            .await
    }

    /// Bind a gateway credential to a fresh claimable code.
    pub async fn create_pairing_code(
        &self,
        input: NewPairingCode,
    ) -> Result<IssuedPairingCode, PairingError> {
        let prepared = self.prepare(input)?;
        self.call(|reply| Command::CreatePairing { prepared, reply })
            .await
    }

    /// Consume `request_code` and create a pairing code in the same step.
    pub async fn issue_pairing_code_from_request(
        &self,
        request_code: &str,
        input: NewPairingCode,
    ) -> Result<IssuedPairingCode, PairingError> {
        let request_code = sanitize_pairing_code(request_code);
        if request_code.is_empty() {
            return Err(PairingError::InvalidRequestCode);
        }
        let prepared = self.prepare(input)?;
        self.call(|reply| Command::IssueFromRequest {
            request_code,
            prepared,
            reply,
        })
        .await
    }

    /// Exchange a pairing code for a session token.
    pub async fn claim_pairing_code(
        &self,
        code: &str,
        session_ttl_seconds: Option<i64>,
    ) -> Result<ClaimedSession, PairingError> {
        let code = sanitize_pairing_code(code);
        if code.is_empty() {
            return Err(PairingError::InvalidCode);
        }
        let session_ttl_seconds = clamp_int(
            session_ttl_seconds,
            DEFAULT_SESSION_TTL_SECONDS,
            SESSION_TTL_BOUNDS,
        );
        self.call(|reply| Command::Claim {
            code,
            session_ttl_seconds,
            reply,
        })
        .await
    }

    /// Look up the gateway credential behind a session token.
    pub async fn resolve_session(&self, token: &str) -> Result<ResolvedSession, PairingError> {
        let token = sanitize_token(token, MAX_SESSION_TOKEN_CHARS);
        if token.is_empty() {
            return Err(PairingError::InvalidSession);
        }
        self.call(|reply| Command::Resolve { token, reply }).await
    }

    /// Stop the store task and release the file lock. Other handles start failing with
    /// [`PairingError::Unavailable`].
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct StoreActor {
    data: StoreData,
    path: Option<PathBuf>,
    secrets: Arc<SecretBox>,
    clock: Arc<dyn Clock>,
    _lock: Option<std::fs::File>,
}

impl StoreActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut stopped = None;
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::CreateRequest { ttl_seconds, reply } => {
                    let r = self
                        .step(|data, now| data.insert_request(now, ttl_seconds))
                        .await;
                    if r.is_ok() {
                        log::info!("pairing request created");
                    }
                    let _ = reply.send(r);
                }
                Command::CreatePairing { prepared, reply } => {
                    let r = self
                        .step(|data, now| data.insert_pairing(now, prepared))
                        .await;
                    if let Ok(issued) = &r {
                        log::info!("pairing code issued for agent {}", issued.agent_name);
                    }
                    let _ = reply.send(r);
                }
                Command::IssueFromRequest {
                    request_code,
                    prepared,
                    reply,
                } => {
                    let r = self
                        .step(|data, now| {
                            let issued = data.insert_pairing(now, prepared)?;
                            if let Err(e) = data.take_request(&request_code, now) {
                                data.pairings.remove(&issued.pairing_code);
                                return Err(e);
                            }
                            Ok(issued)
                        })
                        .await;
                    if let Ok(issued) = &r {
                        log::info!(
                            "pairing code issued from request for agent {}",
                            issued.agent_name
                        );
                    }
                    let _ = reply.send(r);
                }
                Command::Claim {
                    code,
                    session_ttl_seconds,
                    reply,
                } => {
                    let r = self
                        .step(|data, now| data.claim(&code, now, session_ttl_seconds))
                        .await;
                    if let Ok(claimed) = &r {
                        log::info!("pairing code claimed for agent {}", claimed.agent_name);
                    }
                    let _ = reply.send(r);
                }
                Command::Resolve { token, reply } => {
                    let secrets = self.secrets.clone();
                    let r = self
                        .step(move |data, now| data.resolve(&token, now, &secrets))
                        .await;
                    let _ = reply.send(r);
                }
                Command::Shutdown { reply } => {
                    stopped = Some(reply);
                    break;
                }
            }
        }
        drop(self);
        if let Some(reply) = stopped {
            let _ = reply.send(());
        }
    }

    /// Apply `op` and the expiry sweep to a copy of the data, persist if anything changed,
    /// then commit. A failed write leaves the live data untouched.
    async fn step<T>(
        &mut self,
        op: impl FnOnce(&mut StoreData, i64) -> Result<T, PairingError>,
    ) -> Result<T, PairingError> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut next = self.data.clone();
        let result = op(&mut next, now_ms);
        next.sweep(now_ms);
        if next != self.data {
            if let Some(path) = &self.path {
                persist(path, &next).await?;
            }
            self.data = next;
        }
        result
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Create `path` if needed and take an exclusive advisory lock on it without blocking the runtime.
async fn lock_file(path: PathBuf) -> std::io::Result<std::fs::File> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

async fn load(path: &Path) -> StoreData {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            log::warn!("pairing store {} is unreadable, starting empty: {}", path.display(), e);
            StoreData::default()
        }),
        Err(_) => StoreData::default(),
    }
}

async fn persist(path: &Path, data: &StoreData) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = sibling(path, "tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

//! Socket adapter backed by an external bridge process.
//!
//! Every `open` spawns the configured command and talks to it in JSON lines
//! over stdin/stdout. The first line sent is an `open` notification carrying
//! the session id and any stored credentials. After that the bridge answers
//! requests `{id, method, params}` with `{id, result}` or `{id, error}` and
//! pushes lifecycle events shaped like `{"event": "qr", "code": ...}`.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, ChildStdout, Command},
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, trace, warn},
    wagate_channels::{
        ConversationSummary, Credentials, DisconnectReason, OpenedSocket, RemoteSocket,
        SocketCommand, SocketConnector, SocketError, SocketEvent, StoredMessage,
    },
    wagate_config::BridgeConfig,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, SocketError>>>>>;

// ── Wire frames ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Open,
    Close {
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
    },
    Creds {
        credentials: Value,
    },
}

impl From<BridgeEvent> for SocketEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => Self::PairingCode(code),
            BridgeEvent::Open => Self::Opened,
            BridgeEvent::Close { status_code } => Self::Closed(
                status_code
                    .map(DisconnectReason::from_status_code)
                    .unwrap_or(DisconnectReason::ConnectionClosed),
            ),
            BridgeEvent::Creds { credentials } => {
                Self::CredentialsUpdated(Credentials::new(credentials))
            },
        }
    }
}

fn remote_error(error: Value) -> SocketError {
    let message = match &error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    };
    SocketError::Remote(message)
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Spawns one bridge process per socket.
pub struct StdioBridgeConnector {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
}

impl StdioBridgeConnector {
    pub fn new(command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// `None` when no bridge command is configured.
    pub fn from_config(cfg: &BridgeConfig) -> Option<Self> {
        let command = cfg.command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self::new(command, cfg.args.clone(), cfg.env.clone()))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl SocketConnector for StdioBridgeConnector {
    async fn open(
        &self,
        session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<OpenedSocket, SocketError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("WAGATE_SESSION_ID", session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SocketError::Spawn(format!("{}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SocketError::Spawn("bridge stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SocketError::Spawn("bridge stdout not captured".into()))?;
        debug!(session_id, command = %self.command, pid = ?child.id(), "bridge spawned");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(64);
        let reader = tokio::spawn(read_frames(
            session_id.to_string(),
            stdout,
            Arc::clone(&pending),
            events_tx,
        ));

        let socket = BridgeSocket {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
            request_timeout: self.request_timeout,
        };
        socket
            .write_frame(&BridgeRequest {
                id: None,
                method: "open",
                params: Some(json!({
                    "sessionId": session_id,
                    "credentials": credentials.map(Credentials::into_value),
                })),
            })
            .await?;

        Ok(OpenedSocket {
            socket: Box::new(socket),
            events: events_rx,
        })
    }
}

/// Route bridge output until stdout closes. Dropping `events` on exit tells
/// the session the link is gone; dropping `pending` fails in-flight requests.
async fn read_frames(
    session_id: String,
    stdout: ChildStdout,
    pending: Pending,
    events: mpsc::Sender<SocketEvent>,
) {
    let session_id = session_id.as_str();
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(session_id, "bridge stdout closed");
                break;
            },
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                trace!(session_id, raw = %trimmed, "bridge -> gateway");

                match serde_json::from_str::<Inbound>(trimmed) {
                    Ok(Inbound::Response { id, result, error }) => {
                        let Some(tx) = pending.lock().await.remove(&id) else {
                            warn!(session_id, id, "response for unknown request id");
                            continue;
                        };
                        let outcome = match error {
                            Some(error) => Err(remote_error(error)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    },
                    Ok(Inbound::Event(event)) => {
                        if events.send(event.into()).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => warn!(session_id, error = %e, "unrecognised bridge frame"),
                }
            },
            Err(e) => {
                warn!(session_id, error = %e, "error reading bridge stdout");
                break;
            },
        }
    }
    pending.lock().await.clear();
}

// ── Socket ───────────────────────────────────────────────────────────────────

struct BridgeSocket {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl BridgeSocket {
    async fn write_frame(&self, frame: &BridgeRequest<'_>) -> Result<(), SocketError> {
        let mut payload = serde_json::to_string(frame)?;
        payload.push('\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(SocketError::Closed)?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SocketError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!(method, id, "gateway -> bridge");
        if let Err(e) = self
            .write_frame(&BridgeRequest {
                id: Some(id),
                method,
                params,
            })
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SocketError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SocketError::Timeout(format!("bridge request {method}")))
            },
        }
    }
}

#[async_trait]
impl RemoteSocket for BridgeSocket {
    async fn send(&self, command: SocketCommand) -> Result<Value, SocketError> {
        self.request("send", Some(serde_json::to_value(command)?))
            .await
    }

    async fn logout(&self) -> Result<(), SocketError> {
        self.request("logout", None).await.map(|_| ())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SocketError> {
        Ok(serde_json::from_value(self.request("chats", None).await?)?)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, SocketError> {
        let result = self
            .request(
                "messages",
                Some(json!({ "conversationId": conversation_id })),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.stdin.lock().await.take();
        self.pending.lock().await.clear();
        let _ = self.child.lock().await.kill().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> StdioBridgeConnector {
        StdioBridgeConnector::new("sh", vec!["-c".into(), script.into()], HashMap::new())
    }

    #[tokio::test]
    async fn events_and_responses_are_routed() {
        let connector = sh(r#"read open
echo '{"event":"qr","code":"2@abc"}'
read req
echo '{"id":1,"result":{"status":"sent"}}'
read never"#);
        let mut opened = connector.open("s1", None).await.unwrap();

        assert_eq!(
            opened.events.recv().await,
            Some(SocketEvent::PairingCode("2@abc".into()))
        );
        let result = opened
            .socket
            .send(SocketCommand::SendText {
                to: "1@s.whatsapp.net".into(),
                text: "hi".into(),
            })
            .await
            .unwrap();
        assert_eq!(result["status"], "sent");
        opened.socket.close().await;
    }

    #[tokio::test]
    async fn close_event_carries_status_code() {
        let connector = sh(r#"read open
echo '{"event":"close","statusCode":401}'
read never"#);
        let mut opened = connector.open("s1", None).await.unwrap();
        assert_eq!(
            opened.events.recv().await,
            Some(SocketEvent::Closed(DisconnectReason::LoggedOut))
        );
        opened.socket.close().await;
    }

    #[tokio::test]
    async fn remote_errors_surface_message() {
        let connector = sh(r#"read open
read req
echo '{"id":1,"error":{"message":"no such chat"}}'
read never"#);
        let opened = connector.open("s1", None).await.unwrap();
        let err = opened.socket.list_messages("x").await.unwrap_err();
        assert!(matches!(err, SocketError::Remote(ref m) if m == "no such chat"));
        opened.socket.close().await;
    }

    #[tokio::test]
    async fn exit_ends_event_stream() {
        let connector = sh("read open");
        let mut opened = connector.open("s1", None).await.unwrap();
        assert_eq!(opened.events.recv().await, None);
    }

    #[tokio::test]
    async fn requests_time_out() {
        // Reads every request and never answers.
        let connector = sh("read open; while read line; do :; done")
            .with_request_timeout(Duration::from_millis(50));
        let opened = connector.open("s1", None).await.unwrap();
        assert!(matches!(
            opened.socket.logout().await,
            Err(SocketError::Timeout(_))
        ));
        opened.socket.close().await;
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let connector =
            StdioBridgeConnector::new("/nonexistent/wagate-bridge", Vec::new(), HashMap::new());
        assert!(matches!(
            connector.open("s1", None).await,
            Err(SocketError::Spawn(_))
        ));
    }

    #[test]
    fn from_config_requires_command() {
        assert!(StdioBridgeConnector::from_config(&BridgeConfig::default()).is_none());
        let cfg = BridgeConfig {
            command: Some("node".into()),
            args: vec!["bridge.js".into()],
            env: HashMap::new(),
        };
        assert_eq!(
            StdioBridgeConnector::from_config(&cfg).unwrap().command(),
            "node"
        );
    }
}

//! Scripted connector for exercising session code without a network.
//!
//! Each `open` consumes the next queued `OpenScript` (or the fallback),
//! pushes its events into the new socket's stream and records a
//! `SocketProbe` that tests use to inject further events and inspect what
//! the session did with the socket.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    credentials::Credentials,
    error::SocketError,
    socket::{
        ConversationSummary, OpenedSocket, RemoteSocket, SocketCommand, SocketConnector,
        SocketEvent, StoredMessage,
    },
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a single `open` call does.
#[derive(Debug, Clone, Default)]
pub struct OpenScript {
    pub fail: Option<String>,
    pub events: Vec<SocketEvent>,
}

impl OpenScript {
    /// Emits one pairing code and then waits.
    pub fn pairing(code: &str) -> Self {
        Self {
            fail: None,
            events: vec![SocketEvent::PairingCode(code.to_string())],
        }
    }

    /// Opens straight away, as a socket with valid stored credentials would.
    pub fn restored() -> Self {
        Self {
            fail: None,
            events: vec![SocketEvent::Opened],
        }
    }

    /// Emits nothing.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            events: Vec::new(),
        }
    }
}

/// Fake chat store shared by every socket the connector opens.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStore {
    conversations: Vec<ConversationSummary>,
    messages: HashMap<String, Vec<StoredMessage>>,
    failing: HashSet<String>,
    fail_listing: bool,
    listing_delay: Option<Duration>,
}

impl ScriptedStore {
    pub fn with_conversation(mut self, id: &str, messages: Vec<StoredMessage>) -> Self {
        self.conversations.push(ConversationSummary {
            id: id.to_string(),
            name: None,
        });
        self.messages.insert(id.to_string(), messages);
        self
    }

    /// A conversation that is listed but whose messages cannot be read.
    pub fn with_failing_conversation(mut self, id: &str) -> Self {
        self.conversations.push(ConversationSummary {
            id: id.to_string(),
            name: None,
        });
        self.failing.insert(id.to_string());
        self
    }

    pub fn with_failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Make every conversation listing take `delay` before answering.
    pub fn with_listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct ProbeShared {
    closed: AtomicBool,
    logged_out: AtomicBool,
    sent: Mutex<Vec<SocketCommand>>,
}

/// Test-side view of one opened socket.
#[derive(Clone)]
pub struct SocketProbe {
    pub session_id: String,
    pub credentials: Option<Credentials>,
    events: mpsc::Sender<SocketEvent>,
    shared: Arc<ProbeShared>,
}

impl SocketProbe {
    /// Deliver an event to the session owning this socket.
    pub async fn emit(&self, event: SocketEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn logged_out(&self) -> bool {
        self.shared.logged_out.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SocketCommand> {
        lock(&self.shared.sent).clone()
    }
}

struct ConnectorState {
    scripts: VecDeque<OpenScript>,
    fallback: OpenScript,
    sockets: Vec<SocketProbe>,
    failed_opens: usize,
}

pub struct ScriptedConnector {
    state: Mutex<ConnectorState>,
    store: Arc<Mutex<ScriptedStore>>,
}

impl ScriptedConnector {
    pub fn new(fallback: OpenScript) -> Self {
        Self {
            state: Mutex::new(ConnectorState {
                scripts: VecDeque::new(),
                fallback,
                sockets: Vec::new(),
                failed_opens: 0,
            }),
            store: Arc::new(Mutex::new(ScriptedStore::default())),
        }
    }

    pub fn with_store(self, store: ScriptedStore) -> Self {
        *lock(&self.store) = store;
        self
    }

    pub fn set_store(&self, store: ScriptedStore) {
        *lock(&self.store) = store;
    }

    /// Queue a script for the next `open` call.
    pub fn push_script(&self, script: OpenScript) {
        lock(&self.state).scripts.push_back(script);
    }

    /// Number of sockets handed out (failed opens excluded).
    pub fn open_count(&self) -> usize {
        lock(&self.state).sockets.len()
    }

    pub fn failed_opens(&self) -> usize {
        lock(&self.state).failed_opens
    }

    pub fn socket(&self, index: usize) -> Option<SocketProbe> {
        lock(&self.state).sockets.get(index).cloned()
    }

    pub fn last_socket(&self) -> Option<SocketProbe> {
        lock(&self.state).sockets.last().cloned()
    }

    /// Sockets opened and not yet closed.
    pub fn live_sockets(&self) -> usize {
        lock(&self.state)
            .sockets
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }
}

#[async_trait]
impl SocketConnector for ScriptedConnector {
    async fn open(
        &self,
        session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<OpenedSocket, SocketError> {
        let mut state = lock(&self.state);
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| state.fallback.clone());

        if let Some(message) = script.fail {
            state.failed_opens += 1;
            return Err(SocketError::Remote(message));
        }

        let (tx, rx) = mpsc::channel(64);
        for event in script.events {
            // Fresh channel with spare capacity; cannot be full here.
            let _ = tx.try_send(event);
        }

        let shared = Arc::new(ProbeShared::default());
        state.sockets.push(SocketProbe {
            session_id: session_id.to_string(),
            credentials,
            events: tx,
            shared: Arc::clone(&shared),
        });

        Ok(OpenedSocket {
            socket: Box::new(ScriptedSocket {
                shared,
                store: Arc::clone(&self.store),
            }),
            events: rx,
        })
    }
}

struct ScriptedSocket {
    shared: Arc<ProbeShared>,
    store: Arc<Mutex<ScriptedStore>>,
}

impl ScriptedSocket {
    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSocket for ScriptedSocket {
    async fn send(&self, command: SocketCommand) -> Result<serde_json::Value, SocketError> {
        self.ensure_open()?;
        lock(&self.shared.sent).push(command);
        Ok(serde_json::json!({ "status": "sent" }))
    }

    async fn logout(&self) -> Result<(), SocketError> {
        self.ensure_open()?;
        self.shared.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SocketError> {
        self.ensure_open()?;
        let delay = lock(&self.store).listing_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let store = lock(&self.store);
        if store.fail_listing {
            return Err(SocketError::Remote("chat store unavailable".into()));
        }
        Ok(store.conversations.clone())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, SocketError> {
        self.ensure_open()?;
        let store = lock(&self.store);
        if store.failing.contains(conversation_id) {
            return Err(SocketError::Remote(format!(
                "corrupted conversation {conversation_id}"
            )));
        }
        Ok(store
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

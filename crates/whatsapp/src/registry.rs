//! Process-wide table of live sessions.
//!
//! The registry is the only way to create a session. At most one attempt
//! per id is ever live: creation goes through the map's entry API, and a
//! finished attempt removes its own slot only if it still owns it.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    chrono::{DateTime, Utc},
    dashmap::{DashMap, mapref::entry::Entry},
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    wagate_channels::{CredentialStore, SocketCommand, SocketConnector},
};

use crate::{
    aggregate::{FetchWindow, MessageBatch},
    error::{GatewayError, Result},
    pairing::{self, PairingArtifact, PairingWait},
    session::{self, SessionCommand, SessionDeps, SessionHandle, SessionSnapshot, SessionState},
    settings::SessionSettings,
};

const MAX_SESSION_ID_LEN: usize = 128;

/// How a `start_session` call resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A live connected session already existed; nothing was started.
    AlreadyConnected,
    /// Stored credentials were accepted without pairing.
    Connected,
    /// A new pairing code is waiting to be scanned.
    QrIssued(PairingArtifact),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// A live session was unlinked and its credentials purged.
    LoggedOut,
    /// No session was live; stored credentials were purged.
    CredentialsPurged,
}

/// Answer to a status query. `connected` is true only for a live session
/// in the connected state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub connected: bool,
    pub state: Option<SessionState>,
    pub pairing_expires_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl SessionStatus {
    fn absent(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            connected: false,
            state: None,
            pairing_expires_at: None,
            reconnect_attempts: 0,
        }
    }
}

impl From<SessionSnapshot> for SessionStatus {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            connected: snapshot.is_connected(),
            state: Some(snapshot.state),
            pairing_expires_at: snapshot.pairing.map(|p| p.expires_at),
            reconnect_attempts: snapshot.reconnect_attempts,
            session_id: snapshot.session_id,
        }
    }
}

/// Ids double as storage keys and directory names on every backend.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.trim().is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || session_id == "."
        || session_id == ".."
        || session_id
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control())
    {
        return Err(GatewayError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

pub struct SessionRegistry {
    slots: Arc<DashMap<String, SessionHandle>>,
    connector: Arc<dyn SocketConnector>,
    store: Arc<dyn CredentialStore>,
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
    next_attempt: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        store: Arc<dyn CredentialStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            connector,
            store,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps {
            connector: Arc::clone(&self.connector),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            slots: Arc::clone(&self.slots),
            shutdown: self.shutdown.clone(),
        }
    }

    fn live(&self, session_id: &str) -> Option<SessionHandle> {
        self.slots.get(session_id).map(|slot| slot.value().clone())
    }

    /// Start (or report on) the session for `session_id`.
    ///
    /// Returns once the new attempt has either issued a pairing code or
    /// connected with stored credentials. If neither happens within the
    /// pairing code timeout the attempt is torn down before returning.
    pub async fn start_session(&self, session_id: &str) -> Result<StartOutcome> {
        validate_session_id(session_id)?;

        let handle = match self.slots.entry(session_id.to_string()) {
            Entry::Occupied(slot) => {
                let state = slot.get().state();
                debug!(session_id, ?state, "start requested for live session");
                return match state {
                    SessionState::Connected => Ok(StartOutcome::AlreadyConnected),
                    _ => Err(GatewayError::PairingAlreadyActive(session_id.to_string())),
                };
            },
            Entry::Vacant(slot) => {
                let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
                let handle = session::spawn(session_id, attempt, self.deps());
                slot.insert(handle.clone());
                handle
            },
        };
        info!(session_id, attempt = handle.attempt(), "session attempt registered");

        let timeout = self.settings.code_timeout;
        let mut status = handle.subscribe();
        match pairing::await_pairing(&mut status, timeout).await {
            PairingWait::Issued(artifact) => Ok(StartOutcome::QrIssued(artifact)),
            PairingWait::Connected => Ok(StartOutcome::Connected),
            PairingWait::TimedOut => {
                warn!(session_id, ?timeout, "no pairing code in time, abandoning attempt");
                handle.cancel();
                handle.terminated().await;
                Err(GatewayError::PairingTimeout {
                    session_id: session_id.to_string(),
                    waited: timeout,
                })
            },
            PairingWait::Terminated(snapshot) => Err(snapshot
                .termination
                .map(|cause| cause.to_error(session_id, timeout))
                .unwrap_or_else(|| GatewayError::PairingCancelled(session_id.to_string()))),
        }
    }

    /// Constant-time status lookup; an absent session reads as disconnected.
    pub fn status(&self, session_id: &str) -> Result<SessionStatus> {
        validate_session_id(session_id)?;
        Ok(match self.live(session_id) {
            Some(handle) => handle.snapshot().into(),
            None => SessionStatus::absent(session_id),
        })
    }

    /// Snapshots of every live session, ordered by id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .slots
            .iter()
            .map(|slot| slot.value().snapshot())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// Route a command to the session's socket.
    pub async fn send(&self, session_id: &str, command: SocketCommand) -> Result<serde_json::Value> {
        validate_session_id(session_id)?;
        let not_connected = || GatewayError::SessionNotConnected(session_id.to_string());
        let handle = self
            .live(session_id)
            .filter(|h| h.state() == SessionState::Connected)
            .ok_or_else(not_connected)?;
        handle
            .request(|reply| SessionCommand::Send { command, reply })
            .await
            .unwrap_or_else(|| Err(not_connected()))
    }

    /// Collect stored messages from every conversation of a connected
    /// session. `None` uses the configured look-back.
    pub async fn fetch_messages(
        &self,
        session_id: &str,
        window: Option<FetchWindow>,
    ) -> Result<MessageBatch> {
        validate_session_id(session_id)?;
        let handle = self
            .live(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        if handle.state() != SessionState::Connected {
            return Err(GatewayError::SessionNotConnected(session_id.to_string()));
        }

        let window = window.unwrap_or_else(|| {
            FetchWindow::days_back(self.settings.default_days_back, Utc::now())
        });
        let request = handle.request(|reply| SessionCommand::Fetch { window, reply });
        match tokio::time::timeout(self.settings.fetch_timeout, request).await {
            Ok(Some(batch)) => batch,
            Ok(None) => Err(GatewayError::SessionNotConnected(session_id.to_string())),
            Err(_) => Err(GatewayError::FetchTimeout(session_id.to_string())),
        }
    }

    /// Unlink and forget a session. Works on live sessions in any state and
    /// on sessions known only by their stored credentials.
    pub async fn logout(&self, session_id: &str) -> Result<LogoutOutcome> {
        validate_session_id(session_id)?;

        if let Some(handle) = self.live(session_id) {
            match handle
                .request(|reply| SessionCommand::Logout { reply })
                .await
            {
                Some(result) => result?,
                None => {
                    // The attempt ended on its own before seeing the request.
                    handle.terminated().await;
                    self.purge(session_id).await?;
                },
            }
            return Ok(LogoutOutcome::LoggedOut);
        }

        let stored = self
            .store
            .load(session_id)
            .await
            .map_err(GatewayError::Credentials)?;
        match stored {
            Some(_) => {
                self.purge(session_id).await?;
                info!(session_id, "purged credentials of inactive session");
                Ok(LogoutOutcome::CredentialsPurged)
            },
            None => Err(GatewayError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn purge(&self, session_id: &str) -> Result<()> {
        self.store
            .delete(session_id)
            .await
            .map_err(GatewayError::Credentials)
    }

    /// Stop every session and wait for each to release its socket.
    /// Credentials are kept.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .slots
            .iter()
            .map(|slot| slot.value().clone())
            .collect();
        info!(sessions = handles.len(), "shutting down sessions");
        for handle in handles {
            handle.terminated().await;
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{policy::Backoff, store::FileCredentialStore},
        serde_json::json,
        std::time::Duration,
        wagate_channels::{
            Credentials, DisconnectReason, MemoryCredentialStore, SocketEvent, StoredMessage,
            testing::{OpenScript, ScriptedConnector, ScriptedStore},
        },
    };

    fn settings() -> SessionSettings {
        SessionSettings {
            code_timeout: Duration::from_secs(60),
            qr_ttl: Duration::from_secs(60),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(4), 3),
            open_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            default_days_back: 30,
            logout_timeout: Duration::from_secs(10),
        }
    }

    fn registry(fallback: OpenScript) -> (SessionRegistry, Arc<ScriptedConnector>, Arc<MemoryCredentialStore>) {
        let connector = Arc::new(ScriptedConnector::new(fallback));
        let store = Arc::new(MemoryCredentialStore::new());
        let registry = SessionRegistry::new(connector.clone(), store.clone(), settings());
        (registry, connector, store)
    }

    async fn seed(store: &MemoryCredentialStore, session_id: &str) {
        store
            .save(session_id, &Credentials::new(json!({"me": session_id})))
            .await
            .unwrap();
    }

    async fn wait_state(registry: &SessionRegistry, session_id: &str, state: SessionState) {
        let mut status = registry.live(session_id).unwrap().subscribe();
        let _ = status.wait_for(|s| s.state == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_start_issues_pairing_code() {
        let (registry, _, _) = registry(OpenScript::pairing("2@code"));

        match registry.start_session("s1").await.unwrap() {
            StartOutcome::QrIssued(artifact) => {
                assert_eq!(artifact.code, "2@code");
                assert!(artifact.image.unwrap().starts_with("data:image/svg+xml;base64,"));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        let status = registry.status("s1").unwrap();
        assert!(!status.connected);
        assert_eq!(status.state, Some(SessionState::Pairing));
        assert!(status.pairing_expires_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_credentials_connect_without_pairing() {
        let (registry, _, store) = registry(OpenScript::restored());
        seed(&store, "s1").await;

        assert_eq!(
            registry.start_session("s1").await.unwrap(),
            StartOutcome::Connected
        );
        assert!(registry.status("s1").unwrap().connected);
        assert_eq!(
            registry.start_session("s1").await.unwrap(),
            StartOutcome::AlreadyConnected
        );
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_pairing_is_rejected() {
        let (registry, connector, _) = registry(OpenScript::pairing("qr"));
        registry.start_session("s1").await.unwrap();

        assert!(matches!(
            registry.start_session("s1").await,
            Err(GatewayError::PairingAlreadyActive(_))
        ));
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_create_one_socket() {
        let (registry, connector, _) = registry(OpenScript::pairing("qr"));
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.start_session("s1").await })
            })
            .collect();
        let mut issued = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(StartOutcome::QrIssued(_)) => issued += 1,
                Err(GatewayError::PairingAlreadyActive(_)) => {},
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(issued, 1);
        assert_eq!(connector.open_count(), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_socket_times_out_and_is_torn_down() {
        let (registry, connector, _) = registry(OpenScript::silent());

        let err = registry.start_session("s1").await.unwrap_err();
        assert!(matches!(err, GatewayError::PairingTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(registry.active_count(), 0);
        assert_eq!(connector.live_sockets(), 0);
        assert!(!registry.status("s1").unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pairing_allows_a_fresh_attempt() {
        let (registry, connector, _) = registry(OpenScript::pairing("qr"));
        registry.start_session("s1").await.unwrap();
        let first = registry.live("s1").unwrap();

        first.terminated().await;
        assert!(!registry.status("s1").unwrap().connected);

        match registry.start_session("s1").await.unwrap() {
            StartOutcome::QrIssued(_) => {},
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(connector.open_count(), 2);
        assert_eq!(connector.live_sockets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_then_restart_connects() {
        let (registry, connector, store) = registry(OpenScript::restored());
        connector.push_script(OpenScript::pairing("qr"));
        registry.start_session("s1").await.unwrap();

        let probe = connector.last_socket().unwrap();
        probe
            .emit(SocketEvent::CredentialsUpdated(Credentials::new(json!({"paired": true}))))
            .await;
        probe
            .emit(SocketEvent::Closed(DisconnectReason::RestartRequired))
            .await;

        wait_state(&registry, "s1", SessionState::Connected).await;
        let reopened = connector.last_socket().unwrap();
        assert_eq!(reopened.credentials.unwrap().as_value()["paired"], true);
        assert!(store.load("s1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn send_routes_only_to_connected_sessions() {
        let (registry, connector, store) = registry(OpenScript::restored());
        let command = SocketCommand::SendText {
            to: "1@s.whatsapp.net".into(),
            text: "hello".into(),
        };

        assert!(matches!(
            registry.send("s1", command.clone()).await,
            Err(GatewayError::SessionNotConnected(_))
        ));

        seed(&store, "s1").await;
        registry.start_session("s1").await.unwrap();
        let result = registry.send("s1", command.clone()).await.unwrap();
        assert_eq!(result["status"], "sent");
        assert_eq!(connector.last_socket().unwrap().sent(), vec![command]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_requires_a_connected_session() {
        let (registry, _, _) = registry(OpenScript::pairing("qr"));
        assert!(matches!(
            registry.fetch_messages("s1", None).await,
            Err(GatewayError::SessionNotFound(_))
        ));

        registry.start_session("s1").await.unwrap();
        assert!(matches!(
            registry.fetch_messages("s1", None).await,
            Err(GatewayError::SessionNotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_returns_partial_batches() {
        let message = StoredMessage {
            id: Some("m1".into()),
            remote_jid: "a@s.whatsapp.net".into(),
            from_me: true,
            timestamp: Some(Utc::now().timestamp()),
            conversation: Some("hi".into()),
            extended_text: None,
        };
        let (registry, connector, store) = registry(OpenScript::restored());
        connector.set_store(
            ScriptedStore::default()
                .with_conversation("a@s.whatsapp.net", vec![message])
                .with_failing_conversation("broken@g.us"),
        );
        seed(&store, "s1").await;
        registry.start_session("s1").await.unwrap();

        let batch = registry.fetch_messages("s1", None).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.records[0].sender_is_self);
        assert!(batch.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_fetches_return_identical_batches() {
        let message = |id: &str, jid: &str, from_me: bool, ts: i64| StoredMessage {
            id: Some(id.into()),
            remote_jid: jid.into(),
            from_me,
            timestamp: Some(ts),
            conversation: Some(format!("body {id}")),
            extended_text: None,
        };
        let (registry, connector, store) = registry(OpenScript::restored());
        connector.set_store(
            ScriptedStore::default()
                .with_conversation("a@s.whatsapp.net", vec![
                    message("m1", "a@s.whatsapp.net", false, 100),
                    message("m2", "a@s.whatsapp.net", true, 200),
                ])
                .with_failing_conversation("broken@g.us")
                .with_conversation("b@s.whatsapp.net", vec![message(
                    "m3",
                    "b@s.whatsapp.net",
                    false,
                    150,
                )]),
        );
        seed(&store, "s1").await;
        registry.start_session("s1").await.unwrap();

        let first = registry
            .fetch_messages("s1", Some(FetchWindow::all()))
            .await
            .unwrap();
        let second = registry
            .fetch_messages("s1", Some(FetchWindow::all()))
            .await
            .unwrap();

        assert_eq!(first, second);
        let ids: Vec<_> = first
            .records
            .iter()
            .map(|r| r.id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(first.skipped.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_pending_pairing() {
        let (registry, connector, store) = registry(OpenScript::pairing("qr"));
        seed(&store, "s1").await;
        registry.start_session("s1").await.unwrap();

        assert_eq!(registry.logout("s1").await.unwrap(), LogoutOutcome::LoggedOut);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(connector.live_sockets(), 0);
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_start_reports_cancellation() {
        let (registry, _, _) = registry(OpenScript::silent());
        let registry = Arc::new(registry);

        let starter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.start_session("s1").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.logout("s1").await.unwrap();

        assert!(matches!(
            starter.await.unwrap(),
            Err(GatewayError::PairingCancelled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_of_inactive_session_purges_stored_credentials() {
        let (registry, _, store) = registry(OpenScript::restored());
        seed(&store, "s1").await;

        assert_eq!(
            registry.logout("s1").await.unwrap(),
            LogoutOutcome::CredentialsPurged
        );
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(matches!(
            registry.logout("s1").await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_keeps_credentials() {
        let (registry, connector, store) = registry(OpenScript::restored());
        seed(&store, "a").await;
        seed(&store, "b").await;
        registry.start_session("a").await.unwrap();
        registry.start_session("b").await.unwrap();
        assert_eq!(
            registry
                .list()
                .iter()
                .map(|s| s.session_id.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        registry.shutdown().await;
        assert_eq!(registry.active_count(), 0);
        assert_eq!(connector.live_sockets(), 0);
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(validate_session_id("support-line").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("   ").is_err());
        assert!(validate_session_id("a\nb").is_err());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
        for id in ["tenant/a", "a\\b", ".", ".."] {
            assert!(validate_session_id(id).is_err(), "{id:?} accepted");
        }
        assert!(validate_session_id("tenant.a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn path_like_ids_are_refused_everywhere() {
        let (registry, connector, _) = registry(OpenScript::restored());
        let command = SocketCommand::SendText {
            to: "1@s.whatsapp.net".into(),
            text: "hi".into(),
        };

        assert!(matches!(
            registry.start_session("tenant/a").await,
            Err(GatewayError::InvalidSessionId(_))
        ));
        assert!(matches!(
            registry.status(".."),
            Err(GatewayError::InvalidSessionId(_))
        ));
        assert!(matches!(
            registry.send("a\\b", command).await,
            Err(GatewayError::InvalidSessionId(_))
        ));
        assert!(matches!(
            registry.fetch_messages("tenant/a", None).await,
            Err(GatewayError::InvalidSessionId(_))
        ));
        assert!(matches!(
            registry.logout("tenant/a").await,
            Err(GatewayError::InvalidSessionId(_))
        ));
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn accepted_ids_persist_with_the_file_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(tmp.path().join("sessions")));
        let connector = Arc::new(ScriptedConnector::new(OpenScript::pairing("qr")));
        let registry = SessionRegistry::new(connector.clone(), store.clone(), settings());

        registry.start_session("tenant.a").await.unwrap();
        let probe = connector.last_socket().unwrap();
        probe
            .emit(SocketEvent::CredentialsUpdated(Credentials::new(json!({"v": 1}))))
            .await;
        probe.emit(SocketEvent::Opened).await;
        wait_state(&registry, "tenant.a", SessionState::Connected).await;

        let saved = store.load("tenant.a").await.unwrap().unwrap();
        assert_eq!(saved.as_value()["v"], 1);
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_value(SessionStatus::absent("s1")).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["connected"], false);
        assert!(json["state"].is_null());
    }
}

//! One actor task per session.
//!
//! The task owns the session's socket exclusively. Callers talk to it
//! through a bounded command queue and observe it through a `watch`
//! channel that always holds the latest `SessionSnapshot`.

use std::{fmt, sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    serde::Serialize,
    tokio::{
        sync::{mpsc, oneshot, watch},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    wagate_channels::{
        CredentialStore, Credentials, DisconnectReason, RemoteSocket, SocketCommand,
        SocketConnector, SocketError, SocketEvent,
    },
};

use crate::{
    aggregate::{self, FetchWindow, MessageBatch},
    error::{GatewayError, Result},
    pairing::PairingArtifact,
    policy::{self, ReconnectDecision},
    settings::SessionSettings,
};

const COMMAND_QUEUE: usize = 32;

// ── Observable state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pairing,
    Connected,
    Reconnecting,
    Terminated,
}

/// Why a session task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationCause {
    PairingTimeout,
    /// The remote identity unlinked this device.
    LoggedOutRemotely,
    /// Explicit logout through the registry.
    Logout,
    RetriesExhausted {
        attempts: u32,
        last_reason: String,
    },
    AdapterFault {
        message: String,
    },
    Shutdown,
}

impl TerminationCause {
    pub fn purges_credentials(&self) -> bool {
        matches!(self, Self::LoggedOutRemotely | Self::Logout)
    }

    /// Error reported to a caller still waiting on the session's pairing.
    pub fn to_error(&self, session_id: &str, waited: Duration) -> GatewayError {
        let id = session_id.to_string();
        match self {
            Self::PairingTimeout => GatewayError::PairingTimeout {
                session_id: id,
                waited,
            },
            Self::Logout | Self::Shutdown => GatewayError::PairingCancelled(id),
            Self::LoggedOutRemotely => GatewayError::AdapterFault(SocketError::Remote(
                "device was unlinked by the remote identity".into(),
            )),
            Self::RetriesExhausted {
                attempts,
                last_reason,
            } => GatewayError::AdapterFault(SocketError::Remote(format!(
                "gave up after {attempts} reconnect attempts ({last_reason})"
            ))),
            Self::AdapterFault { message } => {
                GatewayError::AdapterFault(SocketError::Remote(message.clone()))
            },
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairingTimeout => f.write_str("pairing timed out"),
            Self::LoggedOutRemotely => f.write_str("logged out remotely"),
            Self::Logout => f.write_str("logout"),
            Self::RetriesExhausted { attempts, .. } => {
                write!(f, "reconnect failed after {attempts} attempts")
            },
            Self::AdapterFault { message } => write!(f, "adapter fault: {message}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    /// Present only while pairing and after a code was issued.
    pub pairing: Option<PairingArtifact>,
    pub connected_since: Option<DateTime<Utc>>,
    /// Consecutive failed reconnects; reset on every successful open.
    pub reconnect_attempts: u32,
    pub termination: Option<TerminationCause>,
}

impl SessionSnapshot {
    pub fn pairing(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: SessionState::Pairing,
            pairing: None,
            connected_since: None,
            reconnect_attempts: 0,
            termination: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

pub(crate) enum SessionCommand {
    Send {
        command: SocketCommand,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
    Fetch {
        window: FetchWindow,
        reply: oneshot::Sender<Result<MessageBatch>>,
    },
    Logout {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap, cloneable reference to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    attempt: u64,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identifies this attempt; a restart under the same id gets a new one.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.clone()
    }

    /// Ask the task to stop. Credentials are kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolve once the task has released every resource it held.
    pub async fn terminated(&self) -> SessionSnapshot {
        let mut status = self.subscribe();
        let _ = status
            .wait_for(|s| s.state == SessionState::Terminated)
            .await;
        status.borrow().clone()
    }

    /// Queue a command and wait for its reply. `None` when the task is gone.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

/// Everything a session task shares with the registry.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub connector: Arc<dyn SocketConnector>,
    pub store: Arc<dyn CredentialStore>,
    pub settings: Arc<SessionSettings>,
    pub slots: Arc<DashMap<String, SessionHandle>>,
    pub shutdown: CancellationToken,
}

/// Start the task for one session attempt. The caller registers the handle.
pub(crate) fn spawn(session_id: &str, attempt: u64, deps: SessionDeps) -> SessionHandle {
    let (status_tx, status_rx) = watch::channel(SessionSnapshot::pairing(session_id));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let cancel = deps.shutdown.child_token();

    let machine = SessionMachine {
        session_id: session_id.to_string(),
        attempt,
        deps,
        status: status_tx,
        commands: command_rx,
        cancel: cancel.clone(),
        socket: None,
        pairing_deadline: None,
        open_deadline: None,
        failures: 0,
        pending_logout: None,
    };
    tokio::spawn(machine.run());

    SessionHandle {
        session_id: session_id.to_string(),
        attempt,
        commands: command_tx,
        status: status_rx,
        cancel,
    }
}

enum Pump {
    Closed(DisconnectReason),
    Finished(TerminationCause),
}

struct SessionMachine {
    session_id: String,
    attempt: u64,
    deps: SessionDeps,
    status: watch::Sender<SessionSnapshot>,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    socket: Option<Arc<dyn RemoteSocket>>,
    pairing_deadline: Option<Instant>,
    /// Set while a reconnected socket has yet to report `Opened`.
    open_deadline: Option<Instant>,
    failures: u32,
    pending_logout: Option<oneshot::Sender<Result<()>>>,
}

impl SessionMachine {
    async fn run(mut self) {
        info!(session_id = %self.session_id, attempt = self.attempt, "session started");
        let cause = self.drive().await;
        self.finish(cause).await;
    }

    async fn drive(&mut self) -> TerminationCause {
        self.pairing_deadline = Some(Instant::now() + self.deps.settings.code_timeout);

        let mut events = match self.open().await {
            Ok(events) => events,
            Err(_) if self.cancel.is_cancelled() => return self.cancel_cause(),
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to open socket");
                return TerminationCause::AdapterFault {
                    message: e.to_string(),
                };
            },
        };

        loop {
            let reason = match self.pump(&mut events).await {
                Pump::Closed(reason) => reason,
                Pump::Finished(cause) => return cause,
            };
            self.close_socket().await;

            if policy::decide(reason) == ReconnectDecision::Terminate {
                warn!(session_id = %self.session_id, %reason, "device unlinked by remote identity");
                return TerminationCause::LoggedOutRemotely;
            }
            events = match self.reconnect(reason).await {
                Ok(events) => events,
                Err(cause) => return cause,
            };
        }
    }

    /// Process socket events and commands until the socket closes or the
    /// session has to end.
    async fn pump(&mut self, events: &mut mpsc::Receiver<SocketEvent>) -> Pump {
        loop {
            let deadline = self.active_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => return Pump::Finished(self.cancel_cause()),
                _ = deadline_elapsed(deadline) => {
                    if self.state() == SessionState::Reconnecting {
                        warn!(session_id = %self.session_id, "reopened socket never came up");
                        return Pump::Closed(DisconnectReason::ConnectionLost);
                    }
                    info!(session_id = %self.session_id, "pairing window elapsed");
                    return Pump::Finished(TerminationCause::PairingTimeout);
                },
                event = events.recv() => match event {
                    Some(SocketEvent::PairingCode(code)) => self.on_pairing_code(&code),
                    Some(SocketEvent::Opened) => self.on_opened(),
                    Some(SocketEvent::CredentialsUpdated(credentials)) => {
                        self.persist(&credentials).await
                    },
                    Some(SocketEvent::Closed(reason)) => {
                        info!(session_id = %self.session_id, %reason, "socket closed");
                        return Pump::Closed(reason);
                    },
                    None => {
                        warn!(session_id = %self.session_id, "event stream ended without a close");
                        return Pump::Closed(DisconnectReason::ConnectionLost);
                    },
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command).await {
                            self.pending_logout = Some(reply);
                            self.unlink().await;
                            return Pump::Finished(TerminationCause::Logout);
                        }
                    },
                    None => return Pump::Finished(TerminationCause::Shutdown),
                },
            }
        }
    }

    async fn reconnect(
        &mut self,
        reason: DisconnectReason,
    ) -> std::result::Result<mpsc::Receiver<SocketEvent>, TerminationCause> {
        if self.state() == SessionState::Connected {
            self.status
                .send_modify(|s| s.state = SessionState::Reconnecting);
        }
        self.open_deadline = None;
        let max_attempts = self.deps.settings.backoff.max_attempts();

        loop {
            self.failures += 1;
            let attempt = self.failures;
            let Some(delay) = self.deps.settings.backoff.delay(attempt) else {
                warn!(
                    session_id = %self.session_id,
                    attempts = attempt - 1,
                    %reason,
                    "reconnect budget exhausted"
                );
                return Err(TerminationCause::RetriesExhausted {
                    attempts: attempt - 1,
                    last_reason: reason.to_string(),
                });
            };

            self.status.send_modify(|s| s.reconnect_attempts = attempt);
            info!(session_id = %self.session_id, attempt, max_attempts, ?delay, %reason, "reconnecting");
            self.idle(delay).await?;

            match self.open().await {
                Ok(events) => {
                    if self.state() == SessionState::Reconnecting {
                        self.open_deadline = Some(Instant::now() + self.deps.settings.open_timeout);
                    }
                    return Ok(events);
                },
                Err(_) if self.cancel.is_cancelled() => return Err(self.cancel_cause()),
                Err(e) => {
                    warn!(session_id = %self.session_id, attempt, error = %e, "reconnect attempt failed")
                },
            }
        }
    }

    /// Sit out a backoff delay while still answering callers.
    async fn idle(&mut self, delay: Duration) -> std::result::Result<(), TerminationCause> {
        let wake = Instant::now() + delay;
        loop {
            let deadline = self.active_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancel_cause()),
                _ = deadline_elapsed(deadline) => return Err(TerminationCause::PairingTimeout),
                _ = tokio::time::sleep_until(wake) => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command).await {
                            self.pending_logout = Some(reply);
                            return Err(TerminationCause::Logout);
                        }
                    },
                    None => return Err(TerminationCause::Shutdown),
                },
            }
        }
    }

    async fn open(&mut self) -> std::result::Result<mpsc::Receiver<SocketEvent>, SocketError> {
        let credentials = match self.deps.store.load(&self.session_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to load credentials, pairing from scratch");
                None
            },
        };
        debug!(
            session_id = %self.session_id,
            restoring = credentials.is_some(),
            "opening socket"
        );

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SocketError::Closed),
            opened = self.deps.connector.open(&self.session_id, credentials) => opened?,
        };
        self.socket = Some(Arc::from(opened.socket));
        Ok(opened.events)
    }

    /// Answer a caller. Returns the reply channel when the command is a
    /// logout, which the caller must turn into termination.
    async fn handle(&self, command: SessionCommand) -> Option<oneshot::Sender<Result<()>>> {
        let connected = self.state() == SessionState::Connected;

        match command {
            SessionCommand::Send { command, reply } => {
                let result = match self.socket.as_deref().filter(|_| connected) {
                    Some(socket) => socket.send(command).await.map_err(|e| {
                        warn!(session_id = %self.session_id, error = %e, "send failed");
                        GatewayError::from(e)
                    }),
                    None => Err(self.not_connected()),
                };
                let _ = reply.send(result);
                None
            },
            SessionCommand::Fetch { window, reply } => {
                match self.socket.clone().filter(|_| connected) {
                    Some(socket) => self.spawn_fetch(socket, window, reply),
                    None => {
                        let _ = reply.send(Err(self.not_connected()));
                    },
                }
                None
            },
            SessionCommand::Logout { reply } => {
                info!(session_id = %self.session_id, "logout requested");
                Some(reply)
            },
        }
    }

    /// Aggregate beside the actor so socket events keep draining meanwhile.
    fn spawn_fetch(
        &self,
        socket: Arc<dyn RemoteSocket>,
        window: FetchWindow,
        reply: oneshot::Sender<Result<MessageBatch>>,
    ) {
        let session_id = self.session_id.clone();
        let timeout = self.deps.settings.fetch_timeout;
        tokio::spawn(async move {
            let collected = aggregate::collect(socket.as_ref(), &session_id, &window);
            let result = match tokio::time::timeout(timeout, collected).await {
                Ok(batch) => batch.map_err(GatewayError::from),
                Err(_) => {
                    warn!(session_id = %session_id, ?timeout, "message fetch timed out");
                    Err(GatewayError::FetchTimeout(session_id.clone()))
                },
            };
            let _ = reply.send(result);
        });
    }

    fn on_pairing_code(&mut self, code: &str) {
        if self.state() != SessionState::Pairing {
            debug!(session_id = %self.session_id, "ignoring pairing code outside pairing");
            return;
        }
        let ttl = self.deps.settings.qr_ttl;
        let mut artifact = PairingArtifact::issue(&self.session_id, code, ttl);

        let previous = self.status.borrow().pairing.as_ref().map(|a| a.expires_at);
        match previous {
            // Refreshed codes keep the original window.
            Some(expires_at) => {
                artifact.expires_at = expires_at;
                debug!(session_id = %self.session_id, "pairing code refreshed");
            },
            None => {
                self.pairing_deadline = Some(Instant::now() + ttl);
                info!(session_id = %self.session_id, expires_at = %artifact.expires_at, "pairing code issued");
            },
        }
        self.status.send_modify(|s| s.pairing = Some(artifact));
    }

    fn on_opened(&mut self) {
        let recovered = self.failures > 0;
        self.failures = 0;
        self.pairing_deadline = None;
        self.open_deadline = None;
        self.status.send_modify(|s| {
            s.state = SessionState::Connected;
            s.pairing = None;
            s.reconnect_attempts = 0;
            s.connected_since = Some(Utc::now());
        });
        info!(session_id = %self.session_id, recovered, "session connected");
    }

    async fn persist(&self, credentials: &Credentials) {
        match self.deps.store.save(&self.session_id, credentials).await {
            Ok(()) => debug!(session_id = %self.session_id, "credentials saved"),
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to save credentials")
            },
        }
    }

    async fn unlink(&self) {
        let Some(socket) = self.socket.as_deref() else {
            return;
        };
        match tokio::time::timeout(self.deps.settings.logout_timeout, socket.logout()).await {
            Ok(Ok(())) => info!(session_id = %self.session_id, "device unlinked"),
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "unlink failed, purging credentials regardless")
            },
            Err(_) => {
                warn!(session_id = %self.session_id, "unlink timed out, purging credentials regardless")
            },
        }
    }

    async fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }
    }

    /// Release the socket, purge if required, free the slot, then publish.
    /// Anyone observing `Terminated` can immediately start a new attempt.
    async fn finish(mut self, cause: TerminationCause) {
        self.close_socket().await;

        let purged = if cause.purges_credentials() {
            let result = self.deps.store.delete(&self.session_id).await;
            match &result {
                Ok(()) => info!(session_id = %self.session_id, "credentials purged"),
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "failed to purge credentials")
                },
            }
            result
        } else {
            Ok(())
        };

        let attempt = self.attempt;
        self.deps
            .slots
            .remove_if(&self.session_id, |_, handle| handle.attempt == attempt);

        self.status.send_modify(|s| {
            s.state = SessionState::Terminated;
            s.pairing = None;
            s.termination = Some(cause.clone());
        });
        info!(session_id = %self.session_id, attempt, %cause, "session terminated");

        if let Some(reply) = self.pending_logout.take() {
            let _ = reply.send(purged.map_err(GatewayError::Credentials));
        }
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn active_deadline(&self) -> Option<Instant> {
        match self.state() {
            SessionState::Pairing => self.pairing_deadline,
            SessionState::Reconnecting => self.open_deadline,
            _ => None,
        }
    }

    fn cancel_cause(&self) -> TerminationCause {
        if !self.deps.shutdown.is_cancelled() && self.state() == SessionState::Pairing {
            TerminationCause::PairingTimeout
        } else {
            TerminationCause::Shutdown
        }
    }

    fn not_connected(&self) -> GatewayError {
        GatewayError::SessionNotConnected(self.session_id.clone())
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::json,
    tracing::{debug, warn},
};

use {
    wagate_channels::SocketCommand,
    wagate_protocol::{ErrorShape, PROTOCOL_VERSION, ResponseFrame, error_codes},
    wagate_whatsapp::{FetchWindow, GatewayError, LogoutOutcome, StartOutcome},
};

use crate::state::GatewayState;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Params ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesParams {
    session_id: String,
    #[serde(default)]
    days_back: Option<u32>,
    /// Unix seconds.
    #[serde(default)]
    since: Option<i64>,
    #[serde(default)]
    until: Option<i64>,
}

impl MessagesParams {
    /// `None` leaves the choice to the registry's configured look-back.
    fn window(&self) -> Result<Option<FetchWindow>, ErrorShape> {
        let at = |secs: i64, field: &str| {
            DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("{field} is out of range"),
                )
            })
        };
        match (self.days_back, self.since, self.until) {
            (Some(_), Some(_), _) => Err(ErrorShape::new(
                error_codes::INVALID_REQUEST,
                "daysBack and since are mutually exclusive",
            )),
            (Some(days), None, until) => Ok(Some(FetchWindow {
                until: until.map(|u| at(u, "until")).transpose()?,
                ..FetchWindow::days_back(days, Utc::now())
            })),
            (None, None, None) => Ok(None),
            (None, since, until) => Ok(Some(FetchWindow {
                since: since.map(|s| at(s, "since")).transpose()?,
                until: until.map(|u| at(u, "until")).transpose()?,
            })),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendParams {
    session_id: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    text: Option<String>,
    /// Full command; takes precedence over `to`/`text`.
    #[serde(default)]
    command: Option<SocketCommand>,
}

impl SendParams {
    fn into_command(self) -> Result<(String, SocketCommand), ErrorShape> {
        let command = match (self.command, self.to, self.text) {
            (Some(command), ..) => command,
            (None, Some(to), Some(text)) => SocketCommand::SendText { to, text },
            _ => {
                return Err(ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    "expected either command or both to and text",
                ));
            },
        };
        Ok((self.session_id, command))
    }
}

fn parse<T: DeserializeOwned>(ctx: &MethodContext) -> Result<T, ErrorShape> {
    serde_json::from_value(ctx.params.clone()).map_err(|e| {
        ErrorShape::new(
            error_codes::INVALID_REQUEST,
            format!("invalid params for {}: {e}", ctx.method),
        )
    })
}

fn to_payload<T: serde::Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| ErrorShape::new(error_codes::UNAVAILABLE, e.to_string()))
}

/// Map a core error onto the wire shape callers see.
pub fn error_shape(err: &GatewayError) -> ErrorShape {
    ErrorShape::new(err.code(), err.to_string()).retryable(err.is_retryable())
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, request_id = %request_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, request_id = %request_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_session_methods();
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        self.register(
            "health",
            Box::new(|ctx| {
                Box::pin(async move {
                    Ok(json!({
                        "status": "ok",
                        "version": ctx.state.version,
                        "protocol": PROTOCOL_VERSION,
                        "activeSessions": ctx.state.registry.active_count(),
                        "uptimeMs": ctx.state.uptime_ms(),
                        "timestamp": Utc::now(),
                    }))
                })
            }),
        );
    }

    // ── Session methods ──────────────────────────────────────────────────

    fn register_session_methods(&mut self) {
        // sessions.start
        self.register(
            "sessions.start",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionParams = parse(&ctx)?;
                    let outcome = ctx
                        .state
                        .registry
                        .start_session(&params.session_id)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    Ok(match outcome {
                        StartOutcome::QrIssued(artifact) => json!({
                            "sessionId": params.session_id,
                            "status": "qr_issued",
                            "qrCode": artifact.image,
                            "qrText": artifact.code,
                            "expiresIn": artifact.remaining(Utc::now()).as_secs(),
                            "expiresAt": artifact.expires_at,
                        }),
                        StartOutcome::Connected => json!({
                            "sessionId": params.session_id,
                            "status": "connected",
                        }),
                        StartOutcome::AlreadyConnected => json!({
                            "sessionId": params.session_id,
                            "status": "already_connected",
                        }),
                    })
                })
            }),
        );

        // sessions.status
        self.register(
            "sessions.status",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionParams = parse(&ctx)?;
                    let status = ctx
                        .state
                        .registry
                        .status(&params.session_id)
                        .map_err(|e| error_shape(&e))?;
                    to_payload(&status)
                })
            }),
        );

        // sessions.list
        self.register(
            "sessions.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let sessions = ctx.state.registry.list();
                    Ok(json!({
                        "count": sessions.len(),
                        "sessions": to_payload(&sessions)?,
                    }))
                })
            }),
        );

        // sessions.messages
        self.register(
            "sessions.messages",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: MessagesParams = parse(&ctx)?;
                    let window = params.window()?;
                    let batch = ctx
                        .state
                        .registry
                        .fetch_messages(&params.session_id, window)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    Ok(json!({
                        "sessionId": params.session_id,
                        "total": batch.records.len(),
                        "partial": batch.is_partial(),
                        "messages": to_payload(&batch.records)?,
                        "skipped": to_payload(&batch.skipped)?,
                    }))
                })
            }),
        );

        // sessions.send
        self.register(
            "sessions.send",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SendParams = parse(&ctx)?;
                    let (session_id, command) = params.into_command()?;
                    let result = ctx
                        .state
                        .registry
                        .send(&session_id, command)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    Ok(json!({ "sessionId": session_id, "result": result }))
                })
            }),
        );

        // sessions.logout
        self.register(
            "sessions.logout",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionParams = parse(&ctx)?;
                    let outcome = ctx
                        .state
                        .registry
                        .logout(&params.session_id)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    let status = match outcome {
                        LogoutOutcome::LoggedOut => "logged_out",
                        LogoutOutcome::CredentialsPurged => "credentials_purged",
                    };
                    Ok(json!({ "sessionId": params.session_id, "status": status }))
                })
            }),
        );
    }
}

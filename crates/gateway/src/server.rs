use std::sync::Arc;

use {
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
        sync::mpsc,
        task::JoinSet,
    },
    tracing::{debug, info, warn},
};

use wagate_protocol::{
    ErrorShape, MAX_FRAME_BYTES, PROTOCOL_VERSION, RequestFrame, ResponseFrame, error_codes,
};

use crate::{
    methods::{MethodContext, MethodRegistry},
    state::GatewayState,
};

fn invalid(id: &str, message: impl Into<String>) -> ResponseFrame {
    ResponseFrame::err(id, ErrorShape::new(error_codes::INVALID_REQUEST, message))
}

/// Parse one inbound line. On failure, answer with whatever id could be
/// recovered so the caller can still correlate the error.
fn parse_frame(line: &str) -> Result<RequestFrame, ResponseFrame> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(invalid("", format!("frame exceeds {MAX_FRAME_BYTES} bytes")));
    }
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| invalid("", format!("malformed frame: {e}")))?;
    let id = value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value).map_err(|e| invalid(&id, format!("invalid request frame: {e}")))
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &ResponseFrame) {
    match serde_json::to_string(frame) {
        Ok(line) => {
            let _ = tx.send(line);
        },
        Err(e) => warn!(id = %frame.id, error = %e, "failed to serialize response"),
    }
}

/// Serve JSON-line requests from `reader`, writing one response line per
/// request to `writer`. Returns when the reader hits EOF and every request
/// already accepted has been answered.
pub async fn serve_lines<R, W>(
    reader: R,
    writer: W,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(
        version = %state.version,
        protocol = PROTOCOL_VERSION,
        methods = methods.method_names().len(),
        "gateway serving"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let write_loop = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut inflight = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame = match parse_frame(line) {
            Ok(frame) => frame,
            Err(response) => {
                warn!(error = ?response.error, "rejected inbound frame");
                send_frame(&tx, &response);
                continue;
            },
        };
        debug!(id = %frame.id, method = %frame.method, "request received");

        let tx = tx.clone();
        let state = Arc::clone(&state);
        let methods = Arc::clone(&methods);
        inflight.spawn(async move {
            let response = methods
                .dispatch(MethodContext {
                    request_id: frame.id,
                    method: frame.method,
                    params: frame.params,
                    state,
                })
                .await;
            send_frame(&tx, &response);
        });

        // Reap finished requests so the set does not grow unbounded.
        while inflight.try_join_next().is_some() {}
    }

    debug!(pending = inflight.len(), "input closed, draining requests");
    while inflight.join_next().await.is_some() {}
    drop(tx);
    write_loop.await??;
    Ok(())
}

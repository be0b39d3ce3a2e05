//! Frame types for the wagate command/query surface.
//!
//! Every frame is a single JSON object on its own line. Requests carry a
//! caller-chosen `id` that is echoed back on the matching response.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Hard cap on a single inbound frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const PAIRING_TIMEOUT: &str = "PAIRING_TIMEOUT";
    pub const PAIRING_CANCELLED: &str = "PAIRING_CANCELLED";
    pub const PAIRING_ALREADY_ACTIVE: &str = "PAIRING_ALREADY_ACTIVE";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const SESSION_NOT_CONNECTED: &str = "SESSION_NOT_CONNECTED";
    pub const ADAPTER_FAULT: &str = "ADAPTER_FAULT";
    pub const FETCH_TIMEOUT: &str = "FETCH_TIMEOUT";
    pub const CREDENTIALS: &str = "CREDENTIALS";
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Structured error returned to callers in place of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_params_default_to_null() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"id":"1","method":"health"}"#).unwrap();
        assert_eq!(frame.method, "health");
        assert!(frame.params.is_null());
    }

    #[test]
    fn error_frame_omits_payload() {
        let frame = ResponseFrame::err(
            "7",
            ErrorShape::new(error_codes::SESSION_NOT_FOUND, "no session s1"),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["ok"], false);
        assert!(json.get("payload").is_none());
        assert_eq!(json["error"]["code"], "SESSION_NOT_FOUND");
        assert_eq!(json["error"]["retryable"], false);
    }
}

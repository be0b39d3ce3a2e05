//! Pairing artifacts and the bounded wait for the first pairing code.

use std::time::Duration;

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    chrono::{DateTime, Utc},
    qrcode::{QrCode, render::svg},
    serde::Serialize,
    tokio::sync::watch,
    tracing::warn,
};

use crate::session::{SessionSnapshot, SessionState};

/// A pairing payload ready to hand to a human, valid for a fixed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingArtifact {
    pub session_id: String,
    /// Raw payload, as emitted by the socket.
    pub code: String,
    /// `data:image/svg+xml;base64,...` QR rendering of `code`.
    pub image: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingArtifact {
    pub fn issue(session_id: &str, code: &str, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let image = match render_data_url(code) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(session_id, error = %e, "failed to render pairing QR");
                None
            },
        };
        Self {
            session_id: session_id.to_string(),
            code: code.to_string(),
            image,
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Validity left at `now`; zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Render `code` as an SVG QR code wrapped in a data URL.
pub fn render_data_url(code: &str) -> Result<String, qrcode::types::QrError> {
    let svg = QrCode::new(code.as_bytes())?
        .render::<svg::Color<'_>>()
        .min_dimensions(264, 264)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)))
}

/// Result of waiting on a freshly started session.
#[derive(Debug, Clone)]
pub enum PairingWait {
    /// A code arrived; the session is waiting to be scanned.
    Issued(PairingArtifact),
    /// Stored credentials were accepted; no pairing needed.
    Connected,
    /// The session ended before either happened.
    Terminated(SessionSnapshot),
    TimedOut,
}

/// Wait for the session to publish a pairing code or leave `Pairing`.
///
/// Driven by the session's state channel, so it wakes as soon as the
/// adapter emits a code instead of polling.
pub async fn await_pairing(
    status: &mut watch::Receiver<SessionSnapshot>,
    timeout: Duration,
) -> PairingWait {
    let waited = tokio::time::timeout(
        timeout,
        status.wait_for(|s| s.pairing.is_some() || s.state != SessionState::Pairing),
    )
    .await
    .map(|result| result.map(|s| s.clone()));

    let snapshot = match waited {
        Err(_) => return PairingWait::TimedOut,
        Ok(Ok(snapshot)) => snapshot,
        // Sender dropped: the session task is gone, its last state stands.
        Ok(Err(_)) => status.borrow().clone(),
    };

    match snapshot.state {
        SessionState::Pairing => match snapshot.pairing {
            Some(artifact) => PairingWait::Issued(artifact),
            None => PairingWait::Terminated(snapshot),
        },
        SessionState::Connected | SessionState::Reconnecting => PairingWait::Connected,
        SessionState::Terminated => PairingWait::Terminated(snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_expires_after_ttl() {
        let artifact = PairingArtifact::issue("s1", "2@abc,def", Duration::from_secs(60));
        assert_eq!(artifact.expires_at - artifact.issued_at, chrono::Duration::seconds(60));
        assert_eq!(artifact.remaining(artifact.expires_at), Duration::ZERO);
        assert_eq!(
            artifact.remaining(artifact.issued_at + chrono::Duration::seconds(45)),
            Duration::from_secs(15)
        );
        assert_eq!(
            artifact.remaining(artifact.expires_at + chrono::Duration::seconds(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn renders_svg_data_url() {
        let url = render_data_url("2@pairing-ref,noise,identity").unwrap();
        assert!(url.starts_with("data:image/svg+xml;base64,"));
        let encoded = url.trim_start_matches("data:image/svg+xml;base64,");
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn serializes_camel_case() {
        let artifact = PairingArtifact::issue("s1", "code", Duration::from_secs(60));
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert!(json["expiresAt"].is_string());
        assert!(json["image"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_code() {
        let (_tx, mut rx) = watch::channel(SessionSnapshot::pairing("s1"));
        let result = await_pairing(&mut rx, Duration::from_secs(60)).await;
        assert!(matches!(result, PairingWait::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_wakes_on_published_code() {
        let (tx, mut rx) = watch::channel(SessionSnapshot::pairing("s1"));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send_modify(|s| {
                s.pairing = Some(PairingArtifact::issue("s1", "qr", Duration::from_secs(60)))
            });
            // Keep the sender alive past the wake-up.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        match await_pairing(&mut rx, Duration::from_secs(60)).await {
            PairingWait::Issued(artifact) => assert_eq!(artifact.code, "qr"),
            other => panic!("unexpected wait result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_sender_reports_last_state() {
        let (tx, mut rx) = watch::channel(SessionSnapshot::pairing("s1"));
        drop(tx);
        assert!(matches!(
            await_pairing(&mut rx, Duration::from_secs(1)).await,
            PairingWait::Terminated(_)
        ));
    }
}

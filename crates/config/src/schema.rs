//! Config schema types (pairing, reconnect, fetch, credentials, bridge).

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    pub pairing: PairingConfig,
    pub reconnect: ReconnectConfig,
    pub fetch: FetchConfig,
    pub credentials: CredentialsConfig,
    pub bridge: BridgeConfig,
}

/// Pairing handshake timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// How long `start` waits for the first pairing code.
    pub code_timeout_secs: u64,
    /// Validity window of an issued pairing artifact.
    pub qr_ttl_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_timeout_secs: 60,
            qr_ttl_secs: 60,
        }
    }
}

impl PairingConfig {
    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }

    pub fn qr_ttl(&self) -> Duration {
        Duration::from_secs(self.qr_ttl_secs)
    }
}

/// Backoff applied when a socket closes for a recoverable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the session is terminated.
    pub max_attempts: u32,
    /// How long a reopened socket may take to report itself open.
    pub open_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 8,
            open_timeout_secs: 30,
        }
    }
}

impl ReconnectConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// History aggregation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Window used when a caller does not pass one.
    pub default_days_back: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            default_days_back: 30,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// One directory per session under `dir`.
    #[default]
    File,
    /// Embedded sled database at `dir`.
    Sled,
    /// Process memory only; sessions do not survive restarts.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub backend: CredentialBackend,
    /// Storage location. Defaults to a path under the data dir.
    pub dir: Option<PathBuf>,
}

/// External bridge process that speaks the messaging network protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let cfg = WagateConfig::default();
        assert_eq!(cfg.pairing.code_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.pairing.qr_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.fetch.default_days_back, 30);
        assert_eq!(cfg.reconnect.open_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.credentials.backend, CredentialBackend::File);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg: WagateConfig = toml::from_str(
            r#"
            [reconnect]
            max_attempts = 3

            [credentials]
            backend = "sled"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.initial_delay_ms, 1_000);
        assert_eq!(cfg.credentials.backend, CredentialBackend::Sled);
        assert_eq!(cfg.pairing.qr_ttl_secs, 60);
    }
}

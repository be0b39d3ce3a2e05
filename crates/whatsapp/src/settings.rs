use std::time::Duration;

use wagate_config::WagateConfig;

use crate::policy::Backoff;

/// Runtime knobs shared by every session, resolved from config once.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub code_timeout: Duration,
    pub qr_ttl: Duration,
    pub backoff: Backoff,
    /// Deadline for a reconnected socket to report `Opened`.
    pub open_timeout: Duration,
    pub fetch_timeout: Duration,
    pub default_days_back: u32,
    /// Upper bound on the unlink request sent during logout.
    pub logout_timeout: Duration,
}

impl From<&WagateConfig> for SessionSettings {
    fn from(cfg: &WagateConfig) -> Self {
        Self {
            code_timeout: cfg.pairing.code_timeout(),
            qr_ttl: cfg.pairing.qr_ttl(),
            backoff: Backoff::from(&cfg.reconnect),
            open_timeout: cfg.reconnect.open_timeout(),
            fetch_timeout: cfg.fetch.timeout(),
            default_days_back: cfg.fetch.default_days_back,
            logout_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&WagateConfig::default())
    }
}

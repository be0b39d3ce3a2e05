use std::{sync::Arc, time::Instant};

use wagate_whatsapp::SessionRegistry;

/// Shared state handed to every method handler.
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

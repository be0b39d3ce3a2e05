//! Reconnect decisions and retry budget.

use std::time::Duration;

use {wagate_channels::DisconnectReason, wagate_config::ReconnectConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Reconnect,
    Terminate,
}

/// Only an explicit unlink by the remote identity is final; every other
/// closure is retried with the same stored credentials.
pub fn decide(reason: DisconnectReason) -> ReconnectDecision {
    match reason {
        DisconnectReason::LoggedOut => ReconnectDecision::Terminate,
        _ => ReconnectDecision::Reconnect,
    }
}

/// Exponential backoff with a ceiling on consecutive attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.initial_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.max_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_logged_out_terminates() {
        assert_eq!(
            decide(DisconnectReason::LoggedOut),
            ReconnectDecision::Terminate
        );
        for code in 0..=u16::MAX {
            let reason = DisconnectReason::from_status_code(code);
            let expected = if code == 401 {
                ReconnectDecision::Terminate
            } else {
                ReconnectDecision::Reconnect
            };
            assert_eq!(decide(reason), expected, "code {code}");
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 5);
        let delays: Vec<_> = (1..=5).filter_map(|n| backoff.delay(n)).collect();
        assert_eq!(delays, vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ]);
        assert_eq!(backoff.delay(6), None);
        assert_eq!(backoff.delay(0), None);
    }

    #[test]
    fn large_attempt_counts_saturate() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 100);
        assert_eq!(backoff.delay(64), Some(Duration::from_secs(30)));
    }

    #[test]
    fn built_from_config() {
        let backoff = Backoff::from(&ReconnectConfig::default());
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(backoff.max_attempts(), 8);
    }
}

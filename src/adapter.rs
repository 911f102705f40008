use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AdapterError;
use crate::stats::AdapterStats;

/// Exponential backoff schedule shared by every venue adapter:
/// `min(base * 2^attempt, cap)`. Matches the reconnect cadence used
/// throughout the venue streams this crate talks to.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u64.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(factor as u32).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Owns the running flag and stats block shared by a connect/listen loop and
/// whatever stops it. Each venue adapter wraps one of these; the adapter's
/// `start()` spawns a task that loops on `connect_once` until `stop()` is
/// called or a non-retryable error (an [`AdapterError::Auth`]) is hit.
pub struct ReconnectSupervisor {
    pub running: Arc<AtomicBool>,
    pub stats: Arc<AdapterStats>,
    pub backoff: Backoff,
}

impl ReconnectSupervisor {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AdapterStats::default()),
            backoff: Backoff::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Relaxed);
    }

    /// Records a connection failure and decides whether to keep retrying.
    /// Returns `None` when the supervisor should give up (stopped, or a
    /// non-retryable auth error).
    pub fn on_error(&mut self, err: &AdapterError) -> Option<Duration> {
        self.stats.mark_connection_error();
        if !self.is_running() || !err.is_retryable() {
            return None;
        }
        self.stats.mark_reconnect();
        Some(self.backoff.next_delay())
    }

    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.stats.mark_connected();
    }
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn backoff_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn auth_error_is_not_retryable() {
        let mut sup = ReconnectSupervisor::new();
        sup.set_running(true);
        let err = AdapterError::Auth("bad key".into());
        assert!(sup.on_error(&err).is_none());
    }

    #[test]
    fn connection_error_schedules_retry() {
        let mut sup = ReconnectSupervisor::new();
        sup.set_running(true);
        let err = AdapterError::Connection("reset".into());
        assert_eq!(sup.on_error(&err), Some(Duration::from_secs(1)));
    }

    #[test]
    fn stopped_supervisor_does_not_retry() {
        let mut sup = ReconnectSupervisor::new();
        sup.set_running(false);
        let err = AdapterError::Connection("reset".into());
        assert!(sup.on_error(&err).is_none());
    }
}

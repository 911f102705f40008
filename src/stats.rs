use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Connection/throughput counters shared between an adapter's background
/// task and whatever polls `get_stats()`. Every field is an atomic so
/// readers never block the receive loop.
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub connected_since_ms: AtomicU64,
    pub total_reconnects: AtomicU64,
    pub connection_errors: AtomicU64,
    pub total_fills: AtomicU64,
    pub last_fill_time_ms: AtomicU64,
}

impl AdapterStats {
    pub fn mark_connected(&self) {
        self.connected_since_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn mark_reconnect(&self) {
        self.total_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_fill(&self) {
        self.total_fills.fetch_add(1, Ordering::Relaxed);
        self.last_fill_time_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        let connected_since = self.connected_since_ms.load(Ordering::Relaxed);
        let connected_duration_secs = if connected_since > 0 {
            (now_ms().saturating_sub(connected_since)) as f64 / 1000.0
        } else {
            0.0
        };
        let total_fills = self.total_fills.load(Ordering::Relaxed);
        let fills_per_hour = if total_fills > 0 && connected_duration_secs > 0.0 {
            total_fills as f64 / (connected_duration_secs / 3600.0).max(0.01 / 3600.0)
        } else {
            0.0
        };

        AdapterStatsSnapshot {
            connected_since_ms: connected_since,
            connected_duration_secs,
            total_reconnects: self.total_reconnects.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            total_fills,
            last_fill_time_ms: self.last_fill_time_ms.load(Ordering::Relaxed),
            fills_per_hour,
        }
    }
}

/// A point-in-time, plain-data copy of [`AdapterStats`] suitable for
/// serializing or logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdapterStatsSnapshot {
    pub connected_since_ms: u64,
    pub connected_duration_secs: f64,
    pub total_reconnects: u64,
    pub connection_errors: u64,
    pub total_fills: u64,
    pub last_fill_time_ms: u64,
    pub fills_per_hour: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_snapshot_is_zeroed() {
        let stats = AdapterStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.total_fills, 0);
        assert_eq!(snap.fills_per_hour, 0.0);
    }

    #[test]
    fn mark_fill_increments_counter() {
        let stats = AdapterStats::default();
        stats.mark_connected();
        stats.mark_fill();
        stats.mark_fill();
        let snap = stats.snapshot();
        assert_eq!(snap.total_fills, 2);
        assert!(snap.last_fill_time_ms > 0);
    }
}

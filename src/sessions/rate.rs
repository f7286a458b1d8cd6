//! Per-session inbound message rate limit.
//!
//! A fixed one-minute window: the counter resets once more than a minute has
//! passed since the window opened, not continuously. A burst straddling a
//! window boundary can therefore see up to twice the limit in one minute.

use std::time::Duration;

use tokio::time::Instant;

/// Length of one counting window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateWindow {
    limit: u32,
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    pub fn new(limit: u32, now: Instant) -> Self {
        Self {
            limit,
            count: 0,
            window_start: now,
        }
    }

    /// Count one message. Returns `false` when it exceeds the limit and must
    /// be dropped.
    pub fn admit(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > RATE_WINDOW {
            self.count = 0;
            self.window_start = now;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_boundary() {
        let t0 = Instant::now();
        let mut rate = RateWindow::new(3, t0);
        assert!(rate.admit(t0));
        assert!(rate.admit(t0));
        assert!(rate.admit(t0));
        assert!(!rate.admit(t0));
        assert!(!rate.admit(t0 + Duration::from_secs(59)));
    }

    #[test]
    fn test_window_resets_after_a_minute() {
        let t0 = Instant::now();
        let mut rate = RateWindow::new(1, t0);
        assert!(rate.admit(t0));
        assert!(!rate.admit(t0));
        // Exactly one minute is still the same window.
        assert!(!rate.admit(t0 + RATE_WINDOW));
        let t1 = t0 + RATE_WINDOW + Duration::from_millis(1);
        assert!(rate.admit(t1));
        assert!(!rate.admit(t1));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let t0 = Instant::now();
        let mut rate = RateWindow::new(0, t0);
        assert!(!rate.admit(t0));
    }
}

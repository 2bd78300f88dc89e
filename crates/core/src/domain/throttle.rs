//! Leading-edge rate limiting for high-frequency notifications

use std::time::{Duration, Instant};

/// Lets one event through per interval; events arriving in between are dropped
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether an event happening now should be delivered
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_edge() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        let start = Instant::now();

        assert!(throttle.ready_at(start));
        assert!(!throttle.ready_at(start + Duration::from_millis(100)));
        assert!(!throttle.ready_at(start + Duration::from_millis(499)));
        assert!(throttle.ready_at(start + Duration::from_millis(500)));
        assert!(!throttle.ready_at(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_zero_interval_passes_everything() {
        let mut throttle = Throttle::new(Duration::ZERO);
        let now = Instant::now();
        assert!(throttle.ready_at(now));
        assert!(throttle.ready_at(now));
    }
}

//! Inbound message rate limiting
//!
//! Fixed one-second windows per peer. Messages past the limit are dropped
//! and reported as a violation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::anticheat::validator::CheatViolation;
use crate::game::state::PeerId;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct InboundRateLimiter {
    max_per_second: u32,
    windows: Mutex<HashMap<PeerId, Window>>,
}

impl InboundRateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, peer_id: PeerId) -> Result<(), CheatViolation> {
        self.check_at(Instant::now(), peer_id)
    }

    pub fn check_at(&self, now: Instant, peer_id: PeerId) -> Result<(), CheatViolation> {
        let mut windows = self.windows.lock();
        let window = windows.entry(peer_id).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= Duration::from_secs(1) {
            window.started = now;
            window.count = 0;
        }

        window.count += 1;
        if window.count > self.max_per_second {
            return Err(CheatViolation::RateExceeded(window.count));
        }
        Ok(())
    }

    pub fn forget(&self, peer_id: PeerId) {
        self.windows.lock().remove(&peer_id);
    }

    pub fn tracked_peers(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let limiter = InboundRateLimiter::new(3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at(now, 1).is_ok());
        }
        assert_eq!(
            limiter.check_at(now, 1),
            Err(CheatViolation::RateExceeded(4))
        );
        // Other peers unaffected
        assert!(limiter.check_at(now, 2).is_ok());
    }

    #[test]
    fn test_window_resets() {
        let limiter = InboundRateLimiter::new(1);
        let t0 = Instant::now();
        assert!(limiter.check_at(t0, 1).is_ok());
        assert!(limiter.check_at(t0, 1).is_err());
        assert!(limiter.check_at(t0 + Duration::from_secs(1), 1).is_ok());
    }

    #[test]
    fn test_forget() {
        let limiter = InboundRateLimiter::new(10);
        limiter.check(1).unwrap();
        limiter.forget(1);
        assert_eq!(limiter.tracked_peers(), 0);
    }
}

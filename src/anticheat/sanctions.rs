use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::anticheat::validator::CheatViolation;

/// Outcome of recording a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanction {
    /// Logged only
    None,
    /// Surface an alert to connected clients
    Alert,
    /// Disconnect the offender
    Kick,
    /// Disconnect and refuse the address until the ban expires
    Ban,
}

/// Violation counts at which each sanction applies
#[derive(Debug, Clone)]
pub struct SanctionPolicy {
    pub alert_after: u32,
    pub kick_after: u32,
    pub ban_after: u32,
    /// Violations older than this no longer count
    pub escalation_window: Duration,
    pub ban_duration: Duration,
}

impl Default for SanctionPolicy {
    fn default() -> Self {
        Self {
            alert_after: 2,
            kick_after: 5,
            ban_after: 8,
            escalation_window: Duration::from_secs(10 * 60),
            ban_duration: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BanRecord {
    pub reason: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl BanRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct TrackerState {
    /// Violation timestamps per address
    history: HashMap<IpAddr, Vec<Instant>>,
    bans: HashMap<IpAddr, BanRecord>,
}

/// Escalating sanctions keyed by client address, so reconnecting does not
/// reset the count.
pub struct ViolationTracker {
    policy: SanctionPolicy,
    state: Mutex<TrackerState>,
}

impl ViolationTracker {
    pub fn new(policy: SanctionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn record(&self, ip: IpAddr, violation: &CheatViolation) -> Sanction {
        self.record_at(Instant::now(), ip, violation)
    }

    pub fn record_at(&self, now: Instant, ip: IpAddr, violation: &CheatViolation) -> Sanction {
        let window = self.policy.escalation_window;
        let mut state = self.state.lock();

        let history = state.history.entry(ip).or_default();
        history.retain(|t| now.saturating_duration_since(*t) < window);
        history.push(now);
        let count = history.len() as u32;

        let sanction = if count >= self.policy.ban_after {
            let record = BanRecord {
                reason: violation.to_string(),
                created_at: now,
                expires_at: now + self.policy.ban_duration,
            };
            state.bans.insert(ip, record);
            Sanction::Ban
        } else if count >= self.policy.kick_after {
            Sanction::Kick
        } else if count >= self.policy.alert_after {
            Sanction::Alert
        } else {
            Sanction::None
        };

        tracing::debug!("Violation #{} from {}: {} -> {:?}", count, ip, violation, sanction);
        sanction
    }

    pub fn is_banned(&self, ip: IpAddr) -> Option<BanRecord> {
        self.is_banned_at(Instant::now(), ip)
    }

    pub fn is_banned_at(&self, now: Instant, ip: IpAddr) -> Option<BanRecord> {
        self.state
            .lock()
            .bans
            .get(&ip)
            .filter(|ban| !ban.is_expired(now))
            .cloned()
    }

    pub fn violation_count(&self, ip: IpAddr) -> u32 {
        self.state
            .lock()
            .history
            .get(&ip)
            .map_or(0, |h| h.len() as u32)
    }

    /// Drop expired bans and stale histories
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let window = self.policy.escalation_window;
        let mut state = self.state.lock();
        let before = state.bans.len();
        state.bans.retain(|_, ban| !ban.is_expired(now));
        state.history.retain(|_, h| {
            h.retain(|t| now.saturating_duration_since(*t) < window);
            !h.is_empty()
        });
        before - state.bans.len()
    }

    pub fn active_bans(&self) -> usize {
        self.state.lock().bans.len()
    }
}

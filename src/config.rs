use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::anticheat::sanctions::SanctionPolicy;
use crate::game::constants::{ai, items, net, tick};

/// Server configuration
///
/// Three rates drive the server: the outer tick (`tick_rate`), the AI pass
/// gate (`ai_tick_interval_ms`) and the dirty-state flush gate
/// (`sync_flush_interval_ms`). The gates are checked once per outer tick, so
/// `validate` requires `ai_tick_interval >= tick period` and
/// `sync_flush_interval <= ai_tick_interval`: every AI pass is flushed before
/// the next pass begins.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Maximum concurrent peer connections
    pub max_connections: usize,
    /// Outer loop rate in Hz
    pub tick_rate: u32,
    /// Minimum interval between AI registry passes
    pub ai_tick_interval_ms: u64,
    /// Interval between dirty-state flushes
    pub sync_flush_interval_ms: u64,
    /// Full transform snapshot every N flushes (0 disables)
    pub transform_snapshot_every: u32,
    /// Per-tick message ceiling for the outbound queue
    pub queue_max_messages: usize,
    /// Per-tick byte ceiling for the outbound queue
    pub queue_max_bytes: usize,
    /// Item transfer lock lifetime
    pub lock_timeout_ms: u64,
    /// World record autosave period (0 disables, shutdown still saves)
    pub autosave_interval_secs: u64,
    /// Metrics HTTP port (0 disables)
    pub metrics_port: u16,
    /// JSON catalog; an empty catalog is used when unset
    pub catalog_path: Option<PathBuf>,
    /// Directory for the world record; kept in memory when unset
    pub save_dir: Option<PathBuf>,
    /// Rule-based validation on/off
    pub anticheat: bool,
    pub alert_after_violations: u32,
    pub kick_after_violations: u32,
    pub ban_after_violations: u32,
    /// Inbound messages per peer per second
    pub max_messages_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7777,
            max_connections: 64,
            tick_rate: tick::TICK_RATE,
            ai_tick_interval_ms: ai::TICK_INTERVAL_MS,
            sync_flush_interval_ms: tick::SYNC_FLUSH_INTERVAL_MS,
            transform_snapshot_every: tick::TRANSFORM_SNAPSHOT_EVERY,
            queue_max_messages: tick::QUEUE_MAX_MESSAGES,
            queue_max_bytes: tick::QUEUE_MAX_BYTES,
            lock_timeout_ms: items::LOCK_TIMEOUT_MS,
            autosave_interval_secs: 60,
            metrics_port: 9090,
            catalog_path: None,
            save_dir: None,
            anticheat: true,
            alert_after_violations: 2,
            kick_after_violations: 5,
            ban_after_violations: 8,
            max_messages_per_second: net::MAX_MESSAGES_PER_SECOND,
        }
    }
}

/// Parse an env var, warning and keeping the default on bad input
fn env_value<T: FromStr>(name: &str, accept: impl Fn(&T) -> bool, rule: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if accept(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_value("BIND_ADDRESS", |_: &IpAddr| true, "an IP address") {
            config.bind_address = addr;
        }
        if let Some(port) = env_value("PORT", |p: &u16| *p > 0, "> 0") {
            config.port = port;
        }
        if let Some(max) = env_value("MAX_CONNECTIONS", |n: &usize| (1..=10_000).contains(n), "1-10000") {
            config.max_connections = max;
        }
        if let Some(rate) = env_value("TICK_RATE", |r: &u32| (1..=240).contains(r), "1-240") {
            config.tick_rate = rate;
        }
        if let Some(ms) = env_value("AI_TICK_INTERVAL_MS", |ms: &u64| *ms > 0, "> 0") {
            config.ai_tick_interval_ms = ms;
        }
        if let Some(ms) = env_value("SYNC_FLUSH_INTERVAL_MS", |ms: &u64| *ms > 0, "> 0") {
            config.sync_flush_interval_ms = ms;
        }
        if let Some(every) = env_value("TRANSFORM_SNAPSHOT_EVERY", |_: &u32| true, "a number") {
            config.transform_snapshot_every = every;
        }
        if let Some(max) = env_value("QUEUE_MAX_MESSAGES", |n: &usize| *n > 0, "> 0") {
            config.queue_max_messages = max;
        }
        if let Some(max) = env_value("QUEUE_MAX_BYTES", |n: &usize| *n >= 1024, ">= 1024") {
            config.queue_max_bytes = max;
        }
        if let Some(ms) = env_value("LOCK_TIMEOUT_MS", |ms: &u64| *ms > 0, "> 0") {
            config.lock_timeout_ms = ms;
        }
        if let Some(secs) = env_value("AUTOSAVE_INTERVAL_SECS", |_: &u64| true, "a number") {
            config.autosave_interval_secs = secs;
        }
        if let Some(port) = env_value("METRICS_PORT", |_: &u16| true, "a port") {
            config.metrics_port = port;
        }
        if let Ok(path) = std::env::var("CATALOG_PATH") {
            config.catalog_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("SAVE_DIR") {
            config.save_dir = Some(PathBuf::from(dir));
        }
        if let Some(enabled) = env_flag("ANTICHEAT") {
            config.anticheat = enabled;
        }
        if let Some(n) = env_value("ALERT_AFTER_VIOLATIONS", |n: &u32| *n > 0, "> 0") {
            config.alert_after_violations = n;
        }
        if let Some(n) = env_value("KICK_AFTER_VIOLATIONS", |n: &u32| *n > 0, "> 0") {
            config.kick_after_violations = n;
        }
        if let Some(n) = env_value("BAN_AFTER_VIOLATIONS", |n: &u32| *n > 0, "> 0") {
            config.ban_after_violations = n;
        }
        if let Some(n) = env_value("MAX_MESSAGES_PER_SECOND", |n: &u32| *n > 0, "> 0") {
            config.max_messages_per_second = n;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.ai_tick_interval() < self.tick_duration() {
            return Err(format!(
                "AI tick interval ({} ms) cannot be shorter than the tick period ({} ms)",
                self.ai_tick_interval_ms,
                self.tick_duration().as_millis()
            ));
        }
        if self.sync_flush_interval_ms > self.ai_tick_interval_ms {
            return Err(format!(
                "sync flush interval ({} ms) cannot exceed the AI tick interval ({} ms)",
                self.sync_flush_interval_ms, self.ai_tick_interval_ms
            ));
        }
        if !(self.alert_after_violations <= self.kick_after_violations
            && self.kick_after_violations <= self.ban_after_violations)
        {
            return Err("violation thresholds must be alert <= kick <= ban".to_string());
        }
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(1000 / self.tick_rate.max(1) as u64)
    }

    pub fn ai_tick_interval(&self) -> Duration {
        Duration::from_millis(self.ai_tick_interval_ms)
    }

    pub fn sync_flush_interval(&self) -> Duration {
        Duration::from_millis(self.sync_flush_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_secs > 0).then(|| Duration::from_secs(self.autosave_interval_secs))
    }

    pub fn sanction_policy(&self) -> SanctionPolicy {
        SanctionPolicy {
            alert_after: self.alert_after_violations,
            kick_after: self.kick_after_violations,
            ban_after: self.ban_after_violations,
            ..SanctionPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7777);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(
            config.tick_duration(),
            Duration::from_millis(tick::TICK_DURATION_MS)
        );
        assert_eq!(config.queue_max_messages, 100);
        assert_eq!(config.queue_max_bytes, 65536);
        assert_eq!(config.lock_timeout(), Duration::from_secs(2));
        assert!(config.anticheat);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_rate_relationship_enforced() {
        let config = ServerConfig {
            ai_tick_interval_ms: 10,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            sync_flush_interval_ms: 100,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_order_enforced() {
        let config = ServerConfig {
            kick_after_violations: 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanction_policy_from_config() {
        let config = ServerConfig {
            alert_after_violations: 3,
            ..ServerConfig::default()
        };
        assert_eq!(config.sanction_policy().alert_after, 3);
        assert_eq!(config.sanction_policy().ban_after, 8);
    }
}

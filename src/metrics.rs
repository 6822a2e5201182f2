//! Prometheus-compatible metrics endpoint
//!
//! Exposes server counters in Prometheus text format at `/metrics` and as
//! JSON at `/metrics/json`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::net::queue::DrainStats;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the server
#[derive(Debug)]
pub struct Metrics {
    // Peers
    pub connections_active: AtomicU64,
    pub players_alive: AtomicU64,

    // World
    pub loaded_scenes: AtomicU64,
    pub ai_entities: AtomicU64,
    pub containers: AtomicU64,
    pub transfer_locks: AtomicU64,
    pub locks_contended: AtomicU64,
    pub buildings: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Outbound queue and network
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_deferred: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub queue_depth: AtomicU64,

    // Delta flushes
    pub player_deltas: AtomicU64,
    pub ai_deltas: AtomicU64,

    // Anti-cheat
    pub violations: AtomicU64,
    pub kicks: AtomicU64,
    pub bans: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            players_alive: AtomicU64::new(0),
            loaded_scenes: AtomicU64::new(0),
            ai_entities: AtomicU64::new(0),
            containers: AtomicU64::new(0),
            transfer_locks: AtomicU64::new(0),
            locks_contended: AtomicU64::new(0),
            buildings: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_deferred: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            player_deltas: AtomicU64::new(0),
            ai_deltas: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
            bans: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record one tick's duration. Percentiles cover the last
    /// `TICK_HISTORY` ticks once at least ten are recorded.
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut window: Vec<u64> = {
            let mut history = self.tick_history.write();
            if history.len() == TICK_HISTORY {
                history.pop_front();
            }
            history.push_back(us);
            if history.len() < 10 {
                return;
            }
            history.iter().copied().collect()
        };
        window.sort_unstable();

        self.tick_time_p95_us
            .store(percentile(&window, 0.95), Ordering::Relaxed);
        self.tick_time_p99_us
            .store(percentile(&window, 0.99), Ordering::Relaxed);
        self.tick_time_max_us
            .store(percentile(&window, 1.0), Ordering::Relaxed);
    }

    /// Fold one queue drain into the network counters
    pub fn record_drain(&self, stats: &DrainStats, remaining: usize) {
        self.messages_sent.fetch_add(stats.sent as u64, Ordering::Relaxed);
        self.messages_dropped.fetch_add(stats.dropped as u64, Ordering::Relaxed);
        self.messages_deferred.fetch_add(stats.deferred as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes as u64, Ordering::Relaxed);
        self.queue_depth.store(remaining as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("coop_connections_active", "Connected peers", "gauge",
            Self::load(&self.connections_active));
        metric!("coop_players_alive", "Players with health above zero", "gauge",
            Self::load(&self.players_alive));

        metric!("coop_scenes_loaded", "Scenes with at least one player", "gauge",
            Self::load(&self.loaded_scenes));
        metric!("coop_ai_entities", "Live AI entities", "gauge",
            Self::load(&self.ai_entities));
        metric!("coop_loot_containers", "Loot containers", "gauge",
            Self::load(&self.containers));
        metric!("coop_transfer_locks", "Held item transfer locks", "gauge",
            Self::load(&self.transfer_locks));
        metric!("coop_locks_contended_total", "Pickups rejected because the slot was locked", "counter",
            Self::load(&self.locks_contended));
        metric!("coop_buildings", "Placed buildings", "gauge",
            Self::load(&self.buildings));

        metric!("coop_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            Self::load(&self.tick_time_us));
        metric!("coop_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            Self::load(&self.tick_time_p95_us));
        metric!("coop_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            Self::load(&self.tick_time_p99_us));
        metric!("coop_tick_time_max_microseconds", "Maximum tick time", "gauge",
            Self::load(&self.tick_time_max_us));
        metric!("coop_tick_count", "Total ticks processed", "counter",
            Self::load(&self.tick_count));

        metric!("coop_messages_sent_total", "Messages handed to the transport", "counter",
            Self::load(&self.messages_sent));
        metric!("coop_messages_dropped_total", "Messages dropped for disconnected peers", "counter",
            Self::load(&self.messages_dropped));
        metric!("coop_messages_deferred_total", "Messages carried over to a later tick", "counter",
            Self::load(&self.messages_deferred));
        metric!("coop_bytes_sent_total", "Total bytes sent", "counter",
            Self::load(&self.bytes_sent));
        metric!("coop_messages_received_total", "Total messages received", "counter",
            Self::load(&self.messages_received));
        metric!("coop_bytes_received_total", "Total bytes received", "counter",
            Self::load(&self.bytes_received));
        metric!("coop_queue_depth", "Messages waiting in the outbound queue", "gauge",
            Self::load(&self.queue_depth));

        metric!("coop_player_deltas_total", "Player deltas flushed", "counter",
            Self::load(&self.player_deltas));
        metric!("coop_ai_deltas_total", "AI deltas flushed", "counter",
            Self::load(&self.ai_deltas));

        metric!("coop_violations_total", "Anti-cheat violations recorded", "counter",
            Self::load(&self.violations));
        metric!("coop_kicks_total", "Peers kicked", "counter",
            Self::load(&self.kicks));
        metric!("coop_bans_total", "Addresses banned", "counter",
            Self::load(&self.bans));

        metric!("coop_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON metrics for direct API access
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "peers": {
                "connected": Self::load(&self.connections_active),
                "alive": Self::load(&self.players_alive),
            },
            "world": {
                "scenes": Self::load(&self.loaded_scenes),
                "ai_entities": Self::load(&self.ai_entities),
                "containers": Self::load(&self.containers),
                "locks": Self::load(&self.transfer_locks),
                "locks_contended": Self::load(&self.locks_contended),
                "buildings": Self::load(&self.buildings),
            },
            "performance": {
                "tick_time_us": Self::load(&self.tick_time_us),
                "tick_time_p95_us": Self::load(&self.tick_time_p95_us),
                "tick_time_p99_us": Self::load(&self.tick_time_p99_us),
                "tick_time_max_us": Self::load(&self.tick_time_max_us),
                "tick_count": Self::load(&self.tick_count),
            },
            "network": {
                "messages_sent": Self::load(&self.messages_sent),
                "messages_dropped": Self::load(&self.messages_dropped),
                "messages_deferred": Self::load(&self.messages_deferred),
                "bytes_sent": Self::load(&self.bytes_sent),
                "messages_received": Self::load(&self.messages_received),
                "bytes_received": Self::load(&self.bytes_received),
                "queue_depth": Self::load(&self.queue_depth),
            },
            "sync": {
                "player_deltas": Self::load(&self.player_deltas),
                "ai_deltas": Self::load(&self.ai_deltas),
            },
            "anticheat": {
                "violations": Self::load(&self.violations),
                "kicks": Self::load(&self.kicks),
                "bans": Self::load(&self.bans),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice
fn percentile(sorted: &[u64], q: f32) -> u64 {
    let rank = ((sorted.len() as f32 * q) as usize).min(sorted.len() - 1);
    sorted[rank]
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Response for one request line. Longest path first, since `/metrics` is a
/// prefix of `/metrics/json`.
fn route(metrics: &Metrics, request: &str) -> String {
    let (status, content_type, body) = if request.starts_with("GET /metrics/json") {
        ("200 OK", "application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("200 OK", "text/plain", "OK".to_string())
    } else {
        ("404 Not Found", "text/plain", String::new())
    };

    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

async fn serve(metrics: Arc<Metrics>, mut socket: TcpStream, peer: SocketAddr) {
    let mut buffer = [0u8; 1024];
    let n = match socket.read(&mut buffer).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            debug!("Metrics request from {} unreadable: {}", peer, e);
            return;
        }
    };

    let response = route(&metrics, &String::from_utf8_lossy(&buffer[..n]));
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!("Metrics response to {} failed: {}", peer, e);
    }
}

/// Serve metrics over plain HTTP until the listener fails
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Metrics available at http://{}/metrics", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(serve(metrics.clone(), socket, peer));
    }
}

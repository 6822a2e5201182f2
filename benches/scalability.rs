//! Scalability benchmarks for the co-op authority server
//!
//! Measures the per-tick cost of the AI pass, the outbound queue drain and a
//! full session tick at growing entity and peer counts.
//!
//! Run with: cargo bench --bench scalability

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use coop_authority_server::anticheat::validator::PermissiveValidator;
use coop_authority_server::catalog::StaticCatalog;
use coop_authority_server::config::ServerConfig;
use coop_authority_server::game::state::PlayerPosition;
use coop_authority_server::game::systems::ai_registry::{AiRegistry, SpawnPoint};
use coop_authority_server::metrics::Metrics;
use coop_authority_server::net::delta::DirtySet;
use coop_authority_server::net::game_session::{GameSession, SessionDeps};
use coop_authority_server::net::protocol::{ClientMessage, ServerMessage};
use coop_authority_server::net::queue::{MessageQueue, Priority};
use coop_authority_server::net::transport::{Delivery, LoopbackTransport, TransportEvent};
use coop_authority_server::persistence::{MemoryStore, WorldPersistence};
use coop_authority_server::util::vec3::Vec3;
use rand::Rng;

const AI_INTERVAL: Duration = Duration::from_millis(50);

/// Registry with `count` AI scattered over one scene
fn populated_registry(count: usize) -> AiRegistry {
    let registry = AiRegistry::new(AI_INTERVAL, Arc::new(DirtySet::new()));
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let point = SpawnPoint {
            id: format!("bench_{}", i),
            type_name: "raider".to_string(),
            category: Default::default(),
            behavior: Default::default(),
            position: Vec3::new(rng.gen_range(-200.0..200.0), 0.0, rng.gen_range(-200.0..200.0)),
            patrol_path: Vec::new(),
            stats: Default::default(),
            loot: Vec::new(),
        };
        registry.spawn("bench", &point);
    }
    registry
}

fn players_in_scene(count: usize) -> Vec<PlayerPosition> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| PlayerPosition {
            peer_id: i as u64 + 1,
            scene_id: "bench".to_string(),
            position: Vec3::new(rng.gen_range(-200.0..200.0), 0.0, rng.gen_range(-200.0..200.0)),
            alive: true,
        })
        .collect()
}

/// One AI pass at various entity counts, four players in the scene
fn bench_ai_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("ai_pass");
    group.sample_size(50);

    for count in [50, 200, 500, 1000] {
        let registry = populated_registry(count);
        let players = players_in_scene(4);
        let mut now = Instant::now();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("parallel", count), &count, |b, _| {
            b.iter(|| {
                now += AI_INTERVAL;
                black_box(registry.update_at(now, &players));
                registry.dirty().drain();
            })
        });
    }
    group.finish();
}

/// Draining a full tick's worth of mixed-priority messages
fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");
    group.sample_size(50);

    for peers in [2, 4, 8, 16] {
        let transport = LoopbackTransport::new();
        for peer_id in 1..=peers as u64 {
            transport.connect(peer_id);
        }
        let queue = MessageQueue::new(100, 65536);
        let message = ServerMessage::AiDespawn { ai_id: 7 };

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::new("broadcast", peers), &peers, |b, _| {
            b.iter(|| {
                for i in 0..100 {
                    let priority = match i % 3 {
                        0 => Priority::High,
                        1 => Priority::Normal,
                        _ => Priority::Low,
                    };
                    queue.broadcast(&message, Delivery::Reliable, priority);
                }
                black_box(queue.drain(&transport));
                transport.take_sent();
            })
        });
    }
    group.finish();
}

/// A full session tick with every peer streaming transforms
fn bench_session_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_tick");
    group.sample_size(30);

    for peers in [2, 4, 8] {
        let (events, rx) = crossbeam_channel::unbounded();
        let transport = Arc::new(LoopbackTransport::new());
        let mut session = GameSession::new(SessionDeps {
            config: ServerConfig {
                max_messages_per_second: 10_000,
                ..ServerConfig::default()
            },
            catalog: Arc::new(StaticCatalog::default()),
            persistence: Arc::new(
                WorldPersistence::load(Arc::new(MemoryStore::new())).expect("memory store"),
            ),
            validator: Arc::new(PermissiveValidator),
            transport: transport.clone(),
            events: rx,
            metrics: Arc::new(Metrics::new()),
        });

        for peer_id in 1..=peers as u64 {
            transport.connect(peer_id);
            events
                .send(TransportEvent::Connected {
                    peer_id,
                    endpoint: SocketAddr::from(([10, 0, 0, peer_id as u8], 5000)),
                })
                .expect("session alive");
        }
        let mut now = Instant::now();
        session.tick_at(now);

        let mut step = 0.0f32;
        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::new("transforms", peers), &peers, |b, _| {
            b.iter(|| {
                step += 0.1;
                for peer_id in 1..=peers as u64 {
                    let message = ClientMessage::PlayerTransform {
                        position: Vec3::new(step, 0.0, peer_id as f32),
                        rotation: 0.0,
                        velocity: Vec3::ZERO,
                    };
                    let payload = serde_json::to_vec(&message).expect("encodable");
                    events
                        .send(TransportEvent::Data { peer_id, payload })
                        .expect("session alive");
                }
                now += Duration::from_millis(34);
                black_box(session.tick_at(now));
                transport.take_sent();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ai_pass, bench_queue_drain, bench_session_tick);

criterion_main!(benches);

//! Game session - routes transport events into the sync managers and runs
//! the fixed-rate tick loop.
//!
//! Per tick, in order: inbound events are applied, pending pickups are
//! confirmed, the AI registry runs (if its gate elapsed), extractions and
//! lock expiry are processed, dirty state is flushed (if its gate elapsed)
//! and the outbound queue is drained.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::anticheat::rate_limiter::InboundRateLimiter;
use crate::anticheat::sanctions::{Sanction, ViolationTracker};
use crate::anticheat::validator::{ActionContext, ActionKind, ActionValidator, CheatViolation};
use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::game::constants::items::PICKUP_REACH;
use crate::game::state::{ContainerId, Equipment, ItemStack, PeerId};
use crate::game::systems::ai::AiEvent;
use crate::game::systems::ai_registry::AiRegistry;
use crate::game::systems::items::{ItemAuthority, ItemError};
use crate::metrics::Metrics;
use crate::net::delta::DirtySet;
use crate::net::protocol::{decode, encode, ClientMessage, Killer, ServerMessage};
use crate::net::queue::{DrainStats, MessageQueue, Priority};
use crate::net::transport::{Delivery, Transport, TransportEvent};
use crate::persistence::WorldPersistence;
use crate::sync::building::BuildingSync;
use crate::sync::combat::CombatSync;
use crate::sync::death::DeathSync;
use crate::sync::player::{FlushStats, PlayerSync};
use crate::sync::world::WorldSync;
use crate::sync::SyncError;
use crate::util::vec3::Vec3;

/// Stats are logged every this many seconds
const STATS_LOG_SECS: u64 = 30;

/// Externally constructed collaborators
pub struct SessionDeps {
    pub config: ServerConfig,
    pub catalog: Arc<dyn Catalog>,
    pub persistence: Arc<WorldPersistence>,
    pub validator: Arc<dyn ActionValidator>,
    pub transport: Arc<dyn Transport>,
    pub events: Receiver<TransportEvent>,
    pub metrics: Arc<Metrics>,
}

/// A pickup that passed validation and holds its lock until the confirm phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingPickup {
    peer_id: PeerId,
    container_id: ContainerId,
    slot: u32,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub tick: u64,
    pub events: usize,
    pub pickups_confirmed: usize,
    pub ai_pass: bool,
    pub flush: Option<FlushStats>,
    pub drain: DrainStats,
}

pub struct GameSession {
    transport: Arc<dyn Transport>,
    events: Receiver<TransportEvent>,
    catalog: Arc<dyn Catalog>,
    validator: Arc<dyn ActionValidator>,
    queue: Arc<MessageQueue>,
    registry: Arc<AiRegistry>,
    items: Arc<ItemAuthority>,
    players: Arc<PlayerSync>,
    buildings: Arc<BuildingSync>,
    combat: CombatSync,
    world: WorldSync,
    deaths: DeathSync,
    persistence: Arc<WorldPersistence>,
    rate_limiter: InboundRateLimiter,
    sanctions: ViolationTracker,
    metrics: Arc<Metrics>,
    pending_pickups: Vec<PendingPickup>,
    tick: u64,
    flush_interval: Duration,
    last_flush: Option<Instant>,
    autosave_interval: Option<Duration>,
    last_save: Instant,
}

impl GameSession {
    pub fn new(deps: SessionDeps) -> Self {
        let SessionDeps {
            config,
            catalog,
            persistence,
            validator,
            transport,
            events,
            metrics,
        } = deps;

        let queue = Arc::new(MessageQueue::new(
            config.queue_max_messages,
            config.queue_max_bytes,
        ));
        let registry = Arc::new(AiRegistry::new(
            config.ai_tick_interval(),
            Arc::new(DirtySet::new()),
        ));
        let items = Arc::new(ItemAuthority::new(queue.clone(), config.lock_timeout()));
        let players = Arc::new(PlayerSync::new(
            queue.clone(),
            catalog.clone(),
            validator.clone(),
            config.tick_rate,
            config.transform_snapshot_every,
        ));
        let buildings = Arc::new(BuildingSync::new(
            players.clone(),
            catalog.clone(),
            validator.clone(),
            persistence.clone(),
            queue.clone(),
        ));
        let combat = CombatSync::new(
            registry.clone(),
            players.clone(),
            catalog.clone(),
            validator.clone(),
            queue.clone(),
        );
        let world = WorldSync::new(
            catalog.clone(),
            registry.clone(),
            items.clone(),
            players.clone(),
            buildings.clone(),
            persistence.clone(),
            validator.clone(),
            queue.clone(),
        );
        let deaths = DeathSync::new(
            players.clone(),
            registry.clone(),
            items.clone(),
            catalog.clone(),
            queue.clone(),
        );

        info!(
            "Game session ready: {} Hz tick, AI every {} ms, flush every {} ms, validator '{}'",
            config.tick_rate,
            config.ai_tick_interval_ms,
            config.sync_flush_interval_ms,
            validator.name()
        );

        Self {
            transport,
            events,
            catalog,
            validator,
            queue,
            registry,
            items,
            players,
            buildings,
            combat,
            world,
            deaths,
            persistence,
            rate_limiter: InboundRateLimiter::new(config.max_messages_per_second),
            sanctions: ViolationTracker::new(config.sanction_policy()),
            metrics,
            pending_pickups: Vec::new(),
            tick: 0,
            flush_interval: config.sync_flush_interval(),
            last_flush: None,
            autosave_interval: config.autosave_interval(),
            last_save: Instant::now(),
        }
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Run one tick as of `now`
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..Default::default()
        };

        // 1. Player input
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(now, event);
            report.events += 1;
        }
        report.pickups_confirmed = self.confirm_pending_pickups(now);

        // 2. AI perception sees this tick's applied input
        let positions = self.players.positions();
        if let Some(events) = self.registry.update_at(now, &positions) {
            report.ai_pass = true;
            self.route_ai_events(events);
        }

        // 3. Timers
        self.world.tick_extractions(now);
        let expired = self.items.purge_expired(now);
        if expired > 0 {
            debug!("Purged {} expired transfer locks", expired);
        }
        if self.tick % 300 == 0 {
            self.sanctions.cleanup_expired(now);
        }

        // 4. Dirty-state flush
        let flush_due = self
            .last_flush
            .map_or(true, |last| now.saturating_duration_since(last) >= self.flush_interval);
        if flush_due {
            let stats = self.players.flush(self.tick, &self.registry);
            self.metrics
                .player_deltas
                .fetch_add(stats.players as u64, Ordering::Relaxed);
            self.metrics
                .ai_deltas
                .fetch_add(stats.ai as u64, Ordering::Relaxed);
            self.last_flush = Some(now);
            report.flush = Some(stats);
        }

        // 5. Outbound
        report.drain = self.queue.drain(self.transport.as_ref());
        self.metrics.record_drain(&report.drain, self.queue.len());

        if let Some(interval) = self.autosave_interval {
            if now.saturating_duration_since(self.last_save) >= interval {
                self.save();
                self.last_save = now;
            }
        }

        self.update_gauges();
        self.metrics.record_tick_time(started.elapsed());
        report
    }

    fn handle_event(&mut self, now: Instant, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer_id, endpoint } => {
                if let Some(ban) = self.sanctions.is_banned_at(now, endpoint.ip()) {
                    warn!("Refusing peer {} from banned address {}", peer_id, endpoint.ip());
                    self.kick(peer_id, &format!("banned: {}", ban.reason));
                    return;
                }
                info!("Peer {} connected from {}", peer_id, endpoint);
                self.players.connect(peer_id, endpoint);
            }
            TransportEvent::Disconnected { peer_id, reason } => {
                self.remove_peer(peer_id, &reason);
            }
            TransportEvent::Data { peer_id, payload } => {
                self.metrics.record_received(payload.len());
                if self.players.get(peer_id).is_none() {
                    debug!("Data from unknown peer {} ignored", peer_id);
                    return;
                }
                if let Err(violation) = self.rate_limiter.check_at(now, peer_id) {
                    self.violation(now, peer_id, violation);
                    return;
                }
                match decode::<ClientMessage>(&payload) {
                    Ok(message) => self.handle_message(now, peer_id, message),
                    Err(e) => {
                        debug!("Peer {}: {}", peer_id, e);
                        self.send_rejection(peer_id, "unknown", "malformed message");
                    }
                }
            }
        }
    }

    /// Release everything a peer holds. Safe to call more than once.
    fn remove_peer(&mut self, peer_id: PeerId, reason: &str) {
        let released = self.items.release_locks_for(peer_id);
        self.pending_pickups.retain(|p| p.peer_id != peer_id);
        self.world.leave_scene(peer_id);
        self.rate_limiter.forget(peer_id);

        if let Some(session) = self.players.disconnect(peer_id) {
            info!(
                "Peer {} ({}) disconnected: {} ({} locks released)",
                peer_id, session.name, reason, released
            );
        }
    }

    fn handle_message(&mut self, now: Instant, peer_id: PeerId, message: ClientMessage) {
        let action = message.action();
        let result = match message {
            ClientMessage::Join { name } => self.players.join(peer_id, &name).map(|_| ()),
            ClientMessage::Ping {
                timestamp,
                latency_ms,
            } => {
                self.players.ping(peer_id, timestamp, latency_ms);
                Ok(())
            }
            ClientMessage::PlayerTransform {
                position,
                rotation,
                velocity,
            } => self
                .players
                .apply_transform_at(now, peer_id, position, rotation, velocity),
            ClientMessage::PlayerAnimation { state } => self.players.apply_animation(peer_id, &state),
            ClientMessage::PlayerEquipment {
                weapon,
                armor,
                helmet,
                hotbar,
            } => self.players.apply_equipment(
                peer_id,
                Equipment {
                    weapon,
                    armor,
                    helmet,
                },
                hotbar,
            ),
            ClientMessage::PlayerHealth { current } => {
                self.players.report_health(peer_id, current).map(|outcome| {
                    if outcome.died {
                        self.player_died(peer_id, Killer::Environment);
                    }
                })
            }
            ClientMessage::SceneChange { scene_id } => {
                self.pending_pickups.retain(|p| p.peer_id != peer_id);
                self.items.release_locks_for(peer_id);
                self.world.enter_scene(peer_id, &scene_id)
            }
            ClientMessage::AiDamage {
                ai_id,
                weapon_id,
                damage,
            } => self
                .combat
                .player_hit(peer_id, ai_id, &weapon_id, damage)
                .map(|events| self.route_ai_events(events)),
            ClientMessage::ItemPickup { container_id, slot } => {
                self.request_pickup(now, peer_id, container_id, slot);
                Ok(())
            }
            ClientMessage::ItemDrop { item, position } => self.drop_item(peer_id, item, position),
            ClientMessage::OpenContainer { container_id } => {
                self.world.open_container(peer_id, container_id)
            }
            ClientMessage::BuildingPlace {
                building_type,
                position,
                rotation,
            } => self
                .buildings
                .place(peer_id, &building_type, position, rotation)
                .map(|_| ()),
            ClientMessage::BuildingDestroy { building_id } => {
                self.buildings.destroy(peer_id, building_id)
            }
            ClientMessage::BuildingUpgrade { building_id } => {
                self.buildings.upgrade(peer_id, building_id).map(|_| ())
            }
            ClientMessage::Respawn => self.deaths.respawn(peer_id),
            ClientMessage::ExtractStart { extract_id } => {
                self.world.start_extraction_at(now, peer_id, &extract_id)
            }
            ClientMessage::ExtractCancel => {
                if self.world.cancel_extraction(peer_id, "cancelled") {
                    Ok(())
                } else {
                    Err(SyncError::NotPermitted("not extracting"))
                }
            }
        };

        if let Err(e) = result {
            self.reject(now, peer_id, action, e);
        }
    }

    fn reject(&mut self, now: Instant, peer_id: PeerId, action: &str, error: SyncError) {
        debug!("Peer {} {} rejected: {}", peer_id, action, error);
        let reason = error.reason();
        if let SyncError::Violation(violation) = error {
            self.violation(now, peer_id, violation);
        }
        self.send_rejection(peer_id, action, &reason);
    }

    fn send_rejection(&self, peer_id: PeerId, action: &str, reason: &str) {
        self.queue.to_peer(
            peer_id,
            &ServerMessage::ActionRejected {
                action: action.to_string(),
                reason: reason.to_string(),
            },
            Delivery::Reliable,
            Priority::High,
        );
    }

    /// First phase of a pickup: reach check and lock. Confirmation happens
    /// after every inbound event of the tick has been applied.
    fn request_pickup(&mut self, now: Instant, peer_id: PeerId, container_id: ContainerId, slot: u32) {
        if let Err(e) = self
            .world
            .check_container_reach(peer_id, container_id, ActionKind::Pickup)
        {
            let reason = e.reason();
            if let SyncError::Violation(violation) = e {
                self.violation(now, peer_id, violation);
            }
            self.items.reject_pickup(peer_id, container_id, slot, &reason);
            return;
        }

        match self.items.validate_pickup_at(now, peer_id, container_id, slot) {
            Ok(()) => {
                let pending = PendingPickup {
                    peer_id,
                    container_id,
                    slot,
                };
                if !self.pending_pickups.contains(&pending) {
                    self.pending_pickups.push(pending);
                }
            }
            Err(e) => {
                if let ItemError::Locked { holder, .. } = e {
                    debug!(
                        "Pickup contention on {}:{} between {} and {}",
                        container_id, slot, holder, peer_id
                    );
                    self.metrics.locks_contended.fetch_add(1, Ordering::Relaxed);
                }
                self.items.reject_pickup(peer_id, container_id, slot, e.reason());
            }
        }
    }

    fn confirm_pending_pickups(&mut self, now: Instant) -> usize {
        let mut confirmed = 0;
        for pending in std::mem::take(&mut self.pending_pickups) {
            let PendingPickup {
                peer_id,
                container_id,
                slot,
            } = pending;
            match self.items.confirm_pickup_at(now, peer_id, container_id, slot) {
                Ok(outcome) => {
                    self.world.record_pickup(&outcome);
                    confirmed += 1;
                }
                Err(e) => self.items.reject_pickup(peer_id, container_id, slot, e.reason()),
            }
        }
        confirmed
    }

    fn drop_item(&self, peer_id: PeerId, item: ItemStack, position: Vec3) -> Result<(), SyncError> {
        if !position.is_finite() {
            return Err(CheatViolation::InvalidFloats.into());
        }
        if item.count == 0 {
            return Err(SyncError::NotPermitted("empty stack"));
        }
        if !self.catalog.knows_item(&item.item_type) {
            return Err(SyncError::unknown("item", &item.item_type));
        }
        let player = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        let scene_id = player
            .scene_id
            .as_deref()
            .ok_or(SyncError::NotPermitted("not in a scene"))?;

        self.validator.validate_action(
            peer_id,
            &ActionContext {
                kind: ActionKind::Pickup,
                distance: player.position.distance_to(position),
                max_distance: PICKUP_REACH,
            },
        )?;

        self.items.drop_item(peer_id, scene_id, position, item);
        Ok(())
    }

    fn route_ai_events(&mut self, events: Vec<AiEvent>) {
        for event in events {
            match event {
                AiEvent::StateChanged { ai_id, from, to } => {
                    debug!("AI {} {:?} -> {:?}", ai_id, from, to);
                }
                AiEvent::Attack {
                    ai_id,
                    target,
                    damage,
                } => {
                    if let Some(outcome) = self.combat.ai_attack(ai_id, target, damage) {
                        if outcome.died {
                            self.player_died(target, Killer::Ai(ai_id));
                        }
                    }
                }
                AiEvent::Died { ai_id, killer } => {
                    self.deaths.ai_died(ai_id, killer);
                }
            }
        }
    }

    fn player_died(&mut self, peer_id: PeerId, killer: Killer) {
        self.world.cancel_extraction(peer_id, "died");
        self.pending_pickups.retain(|p| p.peer_id != peer_id);
        self.items.release_locks_for(peer_id);
        self.deaths.player_died(peer_id, killer);
    }

    /// Count a violation against the peer's address and apply the sanction
    fn violation(&mut self, now: Instant, peer_id: PeerId, violation: CheatViolation) {
        self.metrics.violations.fetch_add(1, Ordering::Relaxed);
        let Some(session) = self.players.get(peer_id) else {
            return;
        };
        let ip = session.endpoint.ip();
        let sanction = self.sanctions.record_at(now, ip, &violation);
        warn!(
            "Violation by peer {} ({}): {} -> {:?}",
            peer_id, ip, violation, sanction
        );

        match sanction {
            Sanction::None => {}
            Sanction::Alert => {
                self.queue.broadcast(
                    &ServerMessage::Alert {
                        peer_id,
                        violation: violation.to_string(),
                    },
                    Delivery::Reliable,
                    Priority::High,
                );
            }
            Sanction::Kick => {
                self.kick(peer_id, "too many violations");
                self.remove_peer(peer_id, "kicked");
            }
            Sanction::Ban => {
                self.metrics.bans.fetch_add(1, Ordering::Relaxed);
                self.kick(peer_id, "banned");
                self.remove_peer(peer_id, "banned");
            }
        }
    }

    /// Tell a peer why and close its connection, bypassing the queue
    fn kick(&self, peer_id: PeerId, reason: &str) {
        self.metrics.kicks.fetch_add(1, Ordering::Relaxed);
        match encode(&ServerMessage::Kicked {
            reason: reason.to_string(),
        }) {
            Ok(payload) => {
                if let Err(e) = self.transport.send(peer_id, &payload, Delivery::Reliable) {
                    debug!("Kick notice to {} not sent: {}", peer_id, e);
                }
            }
            Err(e) => warn!("Failed to encode kick notice: {}", e),
        }
        self.transport.disconnect(peer_id, reason);
    }

    fn save(&self) {
        match self.persistence.save() {
            Ok(true) => debug!("World record saved"),
            Ok(false) => {}
            Err(e) => warn!("World save failed: {}", e),
        }
    }

    /// Final save before exit
    pub fn shutdown(&mut self) {
        let drained = self.queue.drain(self.transport.as_ref());
        debug!("Shutdown drain sent {} messages", drained.sent);
        self.save();
        info!(
            "Game session stopped after {} ticks ({} peers, {} buildings)",
            self.tick,
            self.players.count(),
            self.buildings.count()
        );
    }

    fn update_gauges(&self) {
        let m = &self.metrics;
        let alive = self
            .players
            .positions()
            .iter()
            .filter(|p| p.alive)
            .count();
        m.connections_active
            .store(self.players.count() as u64, Ordering::Relaxed);
        m.players_alive.store(alive as u64, Ordering::Relaxed);
        m.loaded_scenes
            .store(self.world.loaded_scenes() as u64, Ordering::Relaxed);
        m.ai_entities.store(self.registry.len() as u64, Ordering::Relaxed);
        m.containers
            .store(self.items.container_count() as u64, Ordering::Relaxed);
        m.transfer_locks
            .store(self.items.lock_count() as u64, Ordering::Relaxed);
        m.buildings.store(self.buildings.count() as u64, Ordering::Relaxed);
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn peer_count(&self) -> usize {
        self.players.count()
    }
}

/// Start the game loop background task
pub fn start_game_loop(
    session: Arc<Mutex<GameSession>>,
    tick_duration: Duration,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let ticks_per_log = (STATS_LOG_SECS * 1000 / tick_duration.as_millis().max(1) as u64).max(1);
        info!("Game loop started, tick every {} ms", tick_duration.as_millis());
        let start = Instant::now();

        loop {
            ticker.tick().await;
            let report = session.lock().tick();

            if report.tick % ticks_per_log == 0 {
                info!(
                    "Game: {}s, tick {}, {} peers, {} AI, {} containers, {} locks | sent {} msgs, queue {} | tick p95 {}us",
                    start.elapsed().as_secs(),
                    report.tick,
                    metrics.connections_active.load(Ordering::Relaxed),
                    metrics.ai_entities.load(Ordering::Relaxed),
                    metrics.containers.load(Ordering::Relaxed),
                    metrics.transfer_locks.load(Ordering::Relaxed),
                    metrics.messages_sent.load(Ordering::Relaxed),
                    metrics.queue_depth.load(Ordering::Relaxed),
                    metrics.tick_time_p95_us.load(Ordering::Relaxed),
                );
            }
        }
    })
}

//! Player state sync
//!
//! Owns every [`PlayerSession`], applies validated client reports, and runs
//! the dirty flush that turns marked players and AI entities into
//! `delta_sync` packets.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::anticheat::validator::{ActionValidator, CheatViolation};
use crate::catalog::Catalog;
use crate::game::constants::player::{HOTBAR_SLOTS, MAX_NAME_LEN};
use crate::game::state::{Equipment, Hotbar, ItemStack, PeerId, PlayerPosition, PlayerSession};
use crate::game::systems::ai_registry::AiRegistry;
use crate::net::delta::{fields, transform_changed, DirtySet};
use crate::net::protocol::{PlayerDelta, ServerMessage, TransformEntry};
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::sync::SyncError;
use crate::util::vec3::Vec3;

const MAX_ANIMATION_LEN: usize = 64;

/// Delta carrying only the fields in `mask`
pub fn player_delta(session: &PlayerSession, mask: u8) -> PlayerDelta {
    let has = |bit: u8| mask & bit != 0;
    PlayerDelta {
        peer_id: session.peer_id,
        position: has(fields::TRANSFORM).then_some(session.position),
        rotation: has(fields::TRANSFORM).then_some(session.rotation),
        velocity: has(fields::TRANSFORM).then_some(session.velocity),
        health: has(fields::HEALTH).then_some(session.health),
        max_health: has(fields::HEALTH).then_some(session.max_health),
        equipment: has(fields::EQUIPMENT).then(|| session.equipment.clone()),
        hotbar: has(fields::EQUIPMENT).then(|| session.hotbar.to_vec()),
        animation: has(fields::ANIMATION).then(|| session.animation.clone()),
        scene_id: if has(fields::SCENE) {
            session.scene_id.clone()
        } else {
            None
        },
    }
}

fn transform_entry(session: &PlayerSession) -> TransformEntry {
    TransformEntry {
        peer_id: session.peer_id,
        position: session.position,
        rotation: session.rotation,
        velocity: session.velocity,
    }
}

/// Damage applied to a player by the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageOutcome {
    pub health: f32,
    /// This hit took the player from alive to dead
    pub died: bool,
}

/// What a dead player leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct Remains {
    pub scene_id: Option<String>,
    pub position: Vec3,
    pub items: Vec<ItemStack>,
}

/// Counts from one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub players: usize,
    pub ai: usize,
    pub snapshot: bool,
}

pub struct PlayerSync {
    sessions: Mutex<BTreeMap<PeerId, PlayerSession>>,
    dirty: DirtySet<PeerId>,
    queue: Arc<MessageQueue>,
    catalog: Arc<dyn Catalog>,
    validator: Arc<dyn ActionValidator>,
    tick_rate: u32,
    snapshot_every: u32,
    flushes: AtomicU32,
}

impl PlayerSync {
    pub fn new(
        queue: Arc<MessageQueue>,
        catalog: Arc<dyn Catalog>,
        validator: Arc<dyn ActionValidator>,
        tick_rate: u32,
        snapshot_every: u32,
    ) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            dirty: DirtySet::new(),
            queue,
            catalog,
            validator,
            tick_rate,
            snapshot_every,
            flushes: AtomicU32::new(0),
        }
    }

    pub fn connect(&self, peer_id: PeerId, endpoint: SocketAddr) {
        self.sessions
            .lock()
            .insert(peer_id, PlayerSession::new(peer_id, endpoint));

        self.queue.to_peer(
            peer_id,
            &ServerMessage::Welcome {
                peer_id,
                tick_rate: self.tick_rate,
            },
            Delivery::Reliable,
            Priority::High,
        );
    }

    /// Set the display name and announce the player to everyone else
    pub fn join(&self, peer_id: PeerId, name: &str) -> Result<String, SyncError> {
        let cleaned: String = name
            .trim()
            .chars()
            .filter(|c| !c.is_control())
            .take(MAX_NAME_LEN)
            .collect();

        let name = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            if !cleaned.is_empty() {
                session.name = cleaned;
            }
            session.name.clone()
        };

        tracing::info!("Peer {} joined as '{}'", peer_id, name);
        self.queue.broadcast_except(
            peer_id,
            &ServerMessage::PlayerJoined {
                peer_id,
                name: name.clone(),
            },
            Delivery::Reliable,
            Priority::High,
        );
        Ok(name)
    }

    pub fn disconnect(&self, peer_id: PeerId) -> Option<PlayerSession> {
        let session = self.sessions.lock().remove(&peer_id)?;
        self.dirty.clear(&peer_id);
        self.validator.forget(peer_id);

        self.queue.broadcast_except(
            peer_id,
            &ServerMessage::PlayerLeft {
                peer_id,
                name: session.name.clone(),
            },
            Delivery::Reliable,
            Priority::High,
        );
        Some(session)
    }

    pub fn ping(&self, peer_id: PeerId, timestamp: u64, latency_ms: Option<u32>) {
        if let Some(latency) = latency_ms {
            if let Some(session) = self.sessions.lock().get_mut(&peer_id) {
                session.latency_ms = latency;
            }
        }

        let server_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.queue.to_peer(
            peer_id,
            &ServerMessage::Pong {
                client_timestamp: timestamp,
                server_timestamp,
            },
            Delivery::Reliable,
            Priority::Normal,
        );
    }

    pub fn apply_transform(
        &self,
        peer_id: PeerId,
        position: Vec3,
        rotation: f32,
        velocity: Vec3,
    ) -> Result<(), SyncError> {
        self.apply_transform_at(Instant::now(), peer_id, position, rotation, velocity)
    }

    /// Validate and apply a movement report. A rejected report sends the
    /// authoritative position back to the reporter.
    pub fn apply_transform_at(
        &self,
        now: Instant,
        peer_id: PeerId,
        position: Vec3,
        rotation: f32,
        velocity: Vec3,
    ) -> Result<(), SyncError> {
        if !position.is_finite() || !velocity.is_finite() || !rotation.is_finite() {
            return Err(CheatViolation::InvalidFloats.into());
        }

        let (dt, current, alive) = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            (
                now.saturating_duration_since(session.last_update).as_secs_f32(),
                session.position,
                session.is_alive(),
            )
        };

        if !alive {
            return Err(SyncError::NotPermitted("player is dead"));
        }

        if !self.validator.validate_position(peer_id, position, dt) {
            self.queue.to_peer(
                peer_id,
                &ServerMessage::PositionCorrection { position: current },
                Delivery::Reliable,
                Priority::High,
            );
            return Err(CheatViolation::MovementRejected.into());
        }

        let changed = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            let changed = transform_changed(
                session.position,
                position,
                session.rotation,
                rotation,
                session.velocity,
                velocity,
            );
            if changed {
                session.position = position;
                session.rotation = rotation;
                session.velocity = velocity;
            }
            session.last_update = now;
            changed
        };

        if changed {
            self.dirty.mark(peer_id, fields::TRANSFORM);
        }
        Ok(())
    }

    pub fn apply_animation(&self, peer_id: PeerId, state: &str) -> Result<(), SyncError> {
        if state.len() > MAX_ANIMATION_LEN {
            return Err(SyncError::NotPermitted("animation name too long"));
        }

        let changed = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            let changed = session.animation != state;
            session.animation = state.to_string();
            changed
        };

        if changed {
            self.dirty.mark(peer_id, fields::ANIMATION);
        }
        Ok(())
    }

    /// Apply reported gear. Every id must exist in the catalog.
    pub fn apply_equipment(
        &self,
        peer_id: PeerId,
        equipment: Equipment,
        hotbar: Vec<Option<String>>,
    ) -> Result<(), SyncError> {
        if hotbar.len() > HOTBAR_SLOTS {
            return Err(SyncError::NotPermitted("hotbar too large"));
        }
        if let Some(weapon) = &equipment.weapon {
            if self.catalog.weapon(weapon).is_none() {
                return Err(SyncError::unknown("weapon", weapon));
            }
        }
        let worn = [&equipment.armor, &equipment.helmet];
        for id in worn.into_iter().chain(hotbar.iter()).flatten() {
            if !self.catalog.knows_item(id) {
                return Err(SyncError::unknown("item", id));
            }
        }

        let changed = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            let hotbar: Hotbar = hotbar.into_iter().collect();
            let changed = session.equipment != equipment || session.hotbar != hotbar;
            session.equipment = equipment;
            session.hotbar = hotbar;
            changed
        };

        if changed {
            self.dirty.mark(peer_id, fields::EQUIPMENT);
        }
        Ok(())
    }

    /// Self-reported health. Only decreases are accepted. Returns the
    /// outcome so the caller can route a death.
    pub fn report_health(&self, peer_id: PeerId, current: f32) -> Result<DamageOutcome, SyncError> {
        if !current.is_finite() {
            return Err(CheatViolation::InvalidFloats.into());
        }

        let outcome = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            if !session.is_alive() {
                return Err(SyncError::NotPermitted("player is dead"));
            }
            if current > session.health {
                return Err(SyncError::NotPermitted("health increase"));
            }
            session.health = current.max(0.0);
            DamageOutcome {
                health: session.health,
                died: !session.is_alive(),
            }
        };

        self.dirty.mark(peer_id, fields::HEALTH);
        Ok(outcome)
    }

    /// Server-authoritative damage. `None` for unknown or already dead players.
    pub fn apply_damage(&self, peer_id: PeerId, amount: f32) -> Option<DamageOutcome> {
        if !(amount > 0.0) {
            return None;
        }

        let outcome = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&peer_id)?;
            if !session.is_alive() {
                return None;
            }
            session.health = (session.health - amount).max(0.0);
            DamageOutcome {
                health: session.health,
                died: !session.is_alive(),
            }
        };

        self.dirty.mark(peer_id, fields::HEALTH);
        Some(outcome)
    }

    /// Put a player into a scene at a position. Returns the previous scene.
    pub fn enter_scene(
        &self,
        peer_id: PeerId,
        scene_id: &str,
        position: Vec3,
    ) -> Result<Option<String>, SyncError> {
        let previous = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            let previous = session.scene_id.replace(scene_id.to_string());
            session.position = position;
            session.velocity = Vec3::ZERO;
            session.last_update = Instant::now();
            previous
        };

        self.validator.reset_position(peer_id, position);
        self.dirty.mark(peer_id, fields::SCENE | fields::TRANSFORM);
        Ok(previous)
    }

    /// Take a player out of any scene. Returns the scene left.
    pub fn leave_scene(&self, peer_id: PeerId) -> Option<String> {
        let previous = self.sessions.lock().get_mut(&peer_id)?.scene_id.take();
        if previous.is_some() {
            self.dirty.mark(peer_id, fields::SCENE);
        }
        previous
    }

    /// Restore a dead player at `position` with full health
    pub fn respawn(&self, peer_id: PeerId, position: Vec3) -> Result<f32, SyncError> {
        let health = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&peer_id)
                .ok_or(SyncError::UnknownPeer(peer_id))?;
            if session.is_alive() {
                return Err(SyncError::NotPermitted("player is alive"));
            }
            session.health = session.max_health;
            session.position = position;
            session.velocity = Vec3::ZERO;
            session.last_update = Instant::now();
            session.health
        };

        self.validator.reset_position(peer_id, position);
        self.dirty.mark(peer_id, fields::HEALTH | fields::TRANSFORM);
        Ok(health)
    }

    /// Empty a player's equipment and hotbar, returning what was carried
    pub fn strip_carried(&self, peer_id: PeerId) -> Option<Remains> {
        let remains = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&peer_id)?;
            let items = session.carried_items();
            session.equipment = Equipment::default();
            session.hotbar.clear();
            Remains {
                scene_id: session.scene_id.clone(),
                position: session.position,
                items,
            }
        };

        self.dirty.mark(peer_id, fields::EQUIPMENT);
        Some(remains)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<PlayerSession> {
        self.sessions.lock().get(&peer_id).cloned()
    }

    pub fn name(&self, peer_id: PeerId) -> Option<String> {
        self.sessions.lock().get(&peer_id).map(|s| s.name.clone())
    }

    /// Perception input for the AI registry
    pub fn positions(&self) -> Vec<PlayerPosition> {
        self.sessions
            .lock()
            .values()
            .filter_map(PlayerSession::position_snapshot)
            .collect()
    }

    pub fn peers_in_scene(&self, scene_id: &str) -> Vec<PeerId> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.scene_id.as_deref() == Some(scene_id))
            .map(|s| s.peer_id)
            .collect()
    }

    pub fn transforms_in_scene(&self, scene_id: &str) -> Vec<TransformEntry> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.scene_id.as_deref() == Some(scene_id))
            .map(transform_entry)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn dirty(&self) -> &DirtySet<PeerId> {
        &self.dirty
    }

    /// Drain both dirty sets into one `delta_sync` broadcast. Every Nth flush
    /// also enqueues a full transform snapshot at low priority.
    pub fn flush(&self, tick: u64, registry: &AiRegistry) -> FlushStats {
        let player_dirty = self.dirty.drain();
        let ai_dirty = registry.dirty().drain();

        let players: Vec<PlayerDelta> = {
            let sessions = self.sessions.lock();
            player_dirty
                .iter()
                .filter_map(|(peer_id, mask)| match sessions.get(peer_id) {
                    Some(session) => Some(player_delta(session, *mask)),
                    None => {
                        tracing::warn!("Dirty mark for unknown peer {} skipped", peer_id);
                        None
                    }
                })
                .collect()
        };
        let ai = registry.deltas(&ai_dirty);

        let mut stats = FlushStats {
            players: players.len(),
            ai: ai.len(),
            snapshot: false,
        };

        if !players.is_empty() || !ai.is_empty() {
            self.queue.broadcast(
                &ServerMessage::DeltaSync { tick, players, ai },
                Delivery::Reliable,
                Priority::Normal,
            );
        }

        let flushes = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        if self.snapshot_every > 0 && flushes % self.snapshot_every == 0 {
            let players: Vec<TransformEntry> = self
                .sessions
                .lock()
                .values()
                .filter(|s| s.scene_id.is_some())
                .map(transform_entry)
                .collect();
            if !players.is_empty() {
                self.queue.broadcast(
                    &ServerMessage::PlayerTransformSnapshot { tick, players },
                    Delivery::Unreliable,
                    Priority::Low,
                );
                stats.snapshot = true;
            }
        }

        stats
    }
}

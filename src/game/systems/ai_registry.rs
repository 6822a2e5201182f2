//! AI entity registry
//!
//! Owns every live AI entity and its controller. A full pass runs at most once
//! per AI tick interval; controllers are advanced in parallel with rayon and
//! the resulting dirty marks are applied after the registry lock is released.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::game::constants::ai::MAX_STEP_SECONDS;
use crate::game::state::{AiId, ItemStack, PeerId, PlayerPosition};
use crate::game::systems::ai::{
    AiCategory, AiController, AiEvent, AiState, AiStats, BehaviorType, Perception,
};
use crate::net::delta::{fields, pose_changed, DirtySet};
use crate::net::protocol::{AiDelta, AiSnapshot};
use crate::util::vec3::Vec3;

/// Static description of where and what to spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    pub id: String,
    pub type_name: String,
    #[serde(default)]
    pub category: AiCategory,
    #[serde(default)]
    pub behavior: BehaviorType,
    pub position: Vec3,
    #[serde(default)]
    pub patrol_path: Vec<Vec3>,
    #[serde(default)]
    pub stats: AiStats,
    /// Dropped as dead loot when killed
    #[serde(default)]
    pub loot: Vec<ItemStack>,
}

/// Stable id derived from spawn point id and position
pub fn ai_id_for(spawn_id: &str, position: Vec3) -> AiId {
    let mut hasher = FxHasher::default();
    spawn_id.hash(&mut hasher);
    position.x.to_bits().hash(&mut hasher);
    position.y.to_bits().hash(&mut hasher);
    position.z.to_bits().hash(&mut hasher);
    hasher.finish()
}

/// Registry view of one AI entity, mirrored from its controller after every update
#[derive(Debug, Clone, PartialEq)]
pub struct AiEntity {
    pub id: AiId,
    pub type_name: String,
    pub category: AiCategory,
    pub scene_id: String,
    pub position: Vec3,
    pub forward: Vec3,
    pub health: f32,
    pub max_health: f32,
    pub state: AiState,
    pub loot: Vec<ItemStack>,
    pub spawned_at: Instant,
}

impl AiEntity {
    pub fn snapshot(&self) -> AiSnapshot {
        AiSnapshot {
            ai_id: self.id,
            type_name: self.type_name.clone(),
            category: self.category,
            position: self.position,
            forward: self.forward,
            health: self.health,
            max_health: self.max_health,
            state: self.state,
        }
    }

    /// Delta carrying only the fields in `mask`
    pub fn delta(&self, mask: u8) -> AiDelta {
        let has = |bit: u8| mask & bit != 0;
        AiDelta {
            ai_id: self.id,
            position: has(fields::TRANSFORM).then_some(self.position),
            forward: has(fields::TRANSFORM).then_some(self.forward),
            health: has(fields::HEALTH).then_some(self.health),
            state: has(fields::STATE).then_some(self.state),
        }
    }

    fn mirror(&mut self, controller: &AiController) -> u8 {
        let mut mask = 0;
        // Pose is the last value sent; it only moves once the change is visible
        if pose_changed(
            self.position,
            controller.position(),
            self.forward,
            controller.forward(),
        ) {
            self.position = controller.position();
            self.forward = controller.forward();
            mask |= fields::TRANSFORM;
        }
        if self.health != controller.health() {
            mask |= fields::HEALTH;
        }
        if self.state != controller.state() {
            mask |= fields::STATE;
        }

        self.health = controller.health();
        self.state = controller.state();
        mask
    }
}

struct AiSlot {
    entity: AiEntity,
    controller: AiController,
}

struct RegistryInner {
    slots: HashMap<AiId, AiSlot>,
    last_pass: Option<Instant>,
}

pub struct AiRegistry {
    inner: Mutex<RegistryInner>,
    dirty: Arc<DirtySet<AiId>>,
    tick_interval: Duration,
}

impl AiRegistry {
    pub fn new(tick_interval: Duration, dirty: Arc<DirtySet<AiId>>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: HashMap::new(),
                last_pass: None,
            }),
            dirty,
            tick_interval,
        }
    }

    pub fn dirty(&self) -> &Arc<DirtySet<AiId>> {
        &self.dirty
    }

    /// Spawn an entity from a spawn point. On id collision with a different
    /// live entity the id is bumped until free.
    pub fn spawn(&self, scene_id: &str, point: &SpawnPoint) -> AiEntity {
        let mut id = ai_id_for(&point.id, point.position);

        let entity = {
            let mut inner = self.inner.lock();
            while inner.slots.contains_key(&id) {
                tracing::debug!("AI id collision for spawn point {}", point.id);
                id = id.wrapping_add(1);
            }

            let controller = AiController::new(
                id,
                point.behavior,
                point.stats.clone(),
                point.position,
                point.patrol_path.clone(),
            );
            let entity = AiEntity {
                id,
                type_name: point.type_name.clone(),
                category: point.category,
                scene_id: scene_id.to_string(),
                position: controller.position(),
                forward: controller.forward(),
                health: controller.health(),
                max_health: controller.max_health(),
                state: controller.state(),
                loot: point.loot.clone(),
                spawned_at: Instant::now(),
            };
            inner.slots.insert(
                id,
                AiSlot {
                    entity: entity.clone(),
                    controller,
                },
            );
            entity
        };

        self.dirty.mark(id, fields::ALL);
        entity
    }

    pub fn update(&self, players: &[PlayerPosition]) -> Option<Vec<AiEvent>> {
        self.update_at(Instant::now(), players)
    }

    /// Run one pass if the AI tick interval has elapsed since the last one.
    /// Returns `None` when gated, otherwise every event the pass produced.
    pub fn update_at(&self, now: Instant, players: &[PlayerPosition]) -> Option<Vec<AiEvent>> {
        let mut by_scene: HashMap<&str, Vec<&PlayerPosition>> = HashMap::new();
        for player in players.iter().filter(|p| p.alive) {
            by_scene
                .entry(player.scene_id.as_str())
                .or_default()
                .push(player);
        }

        let results: Vec<(AiId, u8, Vec<AiEvent>)> = {
            let mut inner = self.inner.lock();
            let dt = match inner.last_pass {
                Some(last) => {
                    let elapsed = now.saturating_duration_since(last);
                    if elapsed < self.tick_interval {
                        return None;
                    }
                    elapsed
                }
                None => self.tick_interval,
            };
            inner.last_pass = Some(now);
            let dt = dt.as_secs_f32().min(MAX_STEP_SECONDS);

            inner
                .slots
                .par_iter_mut()
                .filter(|(_, slot)| !slot.controller.is_dead())
                .map(|(&id, slot)| {
                    let nearest = by_scene
                        .get(slot.entity.scene_id.as_str())
                        .and_then(|candidates| {
                            nearest_player(slot.controller.position(), candidates)
                        });
                    slot.controller.update(dt, nearest);
                    let mask = slot.entity.mirror(&slot.controller);
                    (id, mask, slot.controller.take_events())
                })
                .collect()
        };

        let mut events = Vec::new();
        for (id, mask, mut produced) in results {
            self.dirty.mark(id, mask);
            events.append(&mut produced);
        }
        Some(events)
    }

    /// Apply damage to an entity. Returns `None` for unknown ids.
    pub fn apply_damage(
        &self,
        id: AiId,
        amount: f32,
        attacker: Option<PeerId>,
    ) -> Option<(AiEntity, Vec<AiEvent>)> {
        let (entity, mask, events) = {
            let mut inner = self.inner.lock();
            let slot = inner.slots.get_mut(&id)?;
            slot.controller.apply_damage(amount, attacker);
            let mask = slot.entity.mirror(&slot.controller);
            (slot.entity.clone(), mask, slot.controller.take_events())
        };

        self.dirty.mark(id, mask);
        Some((entity, events))
    }

    pub fn stun(&self, id: AiId) -> Option<Vec<AiEvent>> {
        let (mask, events) = {
            let mut inner = self.inner.lock();
            let slot = inner.slots.get_mut(&id)?;
            slot.controller.stun();
            let mask = slot.entity.mirror(&slot.controller);
            (mask, slot.controller.take_events())
        };

        self.dirty.mark(id, mask);
        Some(events)
    }

    pub fn remove(&self, id: AiId) -> Option<AiEntity> {
        let removed = self.inner.lock().slots.remove(&id).map(|slot| slot.entity);
        if removed.is_some() {
            self.dirty.clear(&id);
        }
        removed
    }

    /// Remove every entity in a scene
    pub fn remove_scene(&self, scene_id: &str) -> Vec<AiEntity> {
        let removed: Vec<AiEntity> = {
            let mut inner = self.inner.lock();
            let ids: Vec<AiId> = inner
                .slots
                .iter()
                .filter(|(_, slot)| slot.entity.scene_id == scene_id)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.slots.remove(&id))
                .map(|slot| slot.entity)
                .collect()
        };

        for entity in &removed {
            self.dirty.clear(&entity.id);
        }
        removed
    }

    pub fn get(&self, id: AiId) -> Option<AiEntity> {
        self.inner.lock().slots.get(&id).map(|slot| slot.entity.clone())
    }

    pub fn in_scene(&self, scene_id: &str) -> Vec<AiEntity> {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.entity.scene_id == scene_id)
            .map(|slot| slot.entity.clone())
            .collect()
    }

    /// Build deltas for drained dirty entries. Ids no longer registered are
    /// skipped with a warning.
    pub fn deltas(&self, dirty: &[(AiId, u8)]) -> Vec<AiDelta> {
        let inner = self.inner.lock();
        dirty
            .iter()
            .filter_map(|(id, mask)| match inner.slots.get(id) {
                Some(slot) => Some(slot.entity.delta(*mask)),
                None => {
                    tracing::warn!("Dirty mark for unknown AI {} skipped", id);
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn nearest_player(from: Vec3, candidates: &[&PlayerPosition]) -> Option<Perception> {
    candidates
        .iter()
        .map(|p| (p, from.distance_sq_to(p.position)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(p, _)| Perception {
            peer_id: p.peer_id,
            position: p.position,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn registry() -> AiRegistry {
        AiRegistry::new(INTERVAL, Arc::new(DirtySet::new()))
    }

    fn point(id: &str, position: Vec3) -> SpawnPoint {
        SpawnPoint {
            id: id.to_string(),
            type_name: "raider".to_string(),
            category: AiCategory::Normal,
            behavior: BehaviorType::Defensive,
            position,
            patrol_path: Vec::new(),
            stats: AiStats::default(),
            loot: vec![ItemStack::new("ammo_9mm", 30)],
        }
    }

    fn player(peer_id: u64, scene: &str, position: Vec3) -> PlayerPosition {
        PlayerPosition {
            peer_id,
            scene_id: scene.to_string(),
            position,
            alive: true,
        }
    }

    #[test]
    fn test_ai_id_is_stable() {
        let a = ai_id_for("farm_guard", Vec3::new(1.0, 0.0, 2.0));
        let b = ai_id_for("farm_guard", Vec3::new(1.0, 0.0, 2.0));
        let c = ai_id_for("farm_guard", Vec3::new(1.0, 0.0, 3.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_spawn_marks_dirty_and_tolerates_collision() {
        let reg = registry();
        let first = reg.spawn("farm", &point("guard", Vec3::ZERO));
        let second = reg.spawn("farm", &point("guard", Vec3::ZERO));

        assert_ne!(first.id, second.id);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.dirty().mask(&first.id), Some(fields::ALL));
    }

    #[test]
    fn test_update_is_gated_by_interval() {
        let reg = registry();
        reg.spawn("farm", &point("guard", Vec3::ZERO));
        let t0 = Instant::now();

        assert!(reg.update_at(t0, &[]).is_some());
        assert!(reg.update_at(t0 + Duration::from_millis(20), &[]).is_none());
        assert!(reg.update_at(t0 + Duration::from_millis(49), &[]).is_none());
        assert!(reg.update_at(t0 + Duration::from_millis(50), &[]).is_some());
    }

    #[test]
    fn test_only_players_in_same_scene_are_perceived() {
        let reg = registry();
        let ai = reg.spawn("farm", &point("guard", Vec3::ZERO));
        reg.dirty().drain();
        let t0 = Instant::now();

        let elsewhere = [player(1, "bunker", Vec3::new(3.0, 0.0, 0.0))];
        let events = reg.update_at(t0, &elsewhere).unwrap();
        assert!(events.is_empty());
        assert_eq!(reg.get(ai.id).unwrap().state, AiState::Idle);

        let here = [player(1, "farm", Vec3::new(10.0, 0.0, 0.0))];
        let events = reg.update_at(t0 + INTERVAL, &here).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            AiEvent::StateChanged { to: AiState::Alert, .. }
        )));
        assert_eq!(reg.get(ai.id).unwrap().state, AiState::Alert);
        let mask = reg.dirty().mask(&ai.id).unwrap();
        assert!(mask & fields::STATE != 0);
    }

    #[test]
    fn test_dead_players_are_ignored() {
        let reg = registry();
        let ai = reg.spawn("farm", &point("guard", Vec3::ZERO));
        let mut corpse = player(1, "farm", Vec3::new(2.0, 0.0, 0.0));
        corpse.alive = false;

        reg.update_at(Instant::now(), &[corpse]).unwrap();
        assert_eq!(reg.get(ai.id).unwrap().state, AiState::Idle);
    }

    #[test]
    fn test_apply_damage_mirrors_health_and_reports_death() {
        let reg = registry();
        let ai = reg.spawn("farm", &point("guard", Vec3::ZERO));
        reg.dirty().drain();

        let (entity, _) = reg.apply_damage(ai.id, 30.0, Some(4)).unwrap();
        assert_eq!(entity.health, 70.0);
        assert!(reg.dirty().mask(&ai.id).unwrap() & fields::HEALTH != 0);

        let (entity, events) = reg.apply_damage(ai.id, 500.0, Some(4)).unwrap();
        assert_eq!(entity.state, AiState::Dead);
        assert!(events.contains(&AiEvent::Died {
            ai_id: ai.id,
            killer: Some(4)
        }));

        assert!(reg.apply_damage(12345, 10.0, None).is_none());
    }

    #[test]
    fn test_remove_clears_dirty() {
        let reg = registry();
        let ai = reg.spawn("farm", &point("guard", Vec3::ZERO));
        let removed = reg.remove(ai.id).unwrap();
        assert_eq!(removed.loot, vec![ItemStack::new("ammo_9mm", 30)]);
        assert!(reg.dirty().mask(&ai.id).is_none());
        assert!(reg.remove(ai.id).is_none());
    }

    #[test]
    fn test_remove_scene_only_touches_that_scene() {
        let reg = registry();
        reg.spawn("farm", &point("a", Vec3::ZERO));
        reg.spawn("farm", &point("b", Vec3::new(5.0, 0.0, 0.0)));
        let keep = reg.spawn("bunker", &point("c", Vec3::ZERO));

        let removed = reg.remove_scene("farm");
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(keep.id).is_some());
    }

    #[test]
    fn test_deltas_skip_removed_entities() {
        let reg = registry();
        let a = reg.spawn("farm", &point("a", Vec3::ZERO));
        let b = reg.spawn("farm", &point("b", Vec3::new(5.0, 0.0, 0.0)));
        let drained = reg.dirty().drain();
        reg.remove(b.id);

        let deltas = reg.deltas(&drained);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].ai_id, a.id);
        assert_eq!(deltas[0].health, Some(100.0));
    }

    #[test]
    fn test_slow_movement_is_eventually_sent() {
        let reg = registry();
        let mut spawn = point("crawler", Vec3::ZERO);
        spawn.patrol_path = vec![Vec3::new(100.0, 0.0, 0.0)];
        spawn.stats.move_speed = 0.1;
        let ai = reg.spawn("farm", &spawn);
        reg.dirty().drain();

        let t0 = Instant::now();
        let passes = 40;
        let mut sent_x = 0.0;
        let mut transform_marks = 0;
        for k in 0..passes {
            reg.update_at(t0 + INTERVAL * k, &[]).unwrap();
            let drained = reg.dirty().drain();
            for delta in reg.deltas(&drained) {
                if let Some(position) = delta.position {
                    sent_x = position.x;
                    transform_marks += 1;
                }
            }
        }

        // Each pass moves 0.005, below the send threshold
        let true_x = 0.1 * INTERVAL.as_secs_f32() * passes as f32;
        assert!(transform_marks > 1);
        assert!((true_x - sent_x).abs() <= 0.01 + 1e-4);
        assert_eq!(reg.get(ai.id).unwrap().state, AiState::Patrol);
    }

    #[test]
    fn test_deltas_for_unknown_id_are_empty() {
        let reg = registry();
        reg.spawn("farm", &point("guard", Vec3::ZERO));
        assert!(reg.deltas(&[(424242, fields::ALL)]).is_empty());
    }

    #[test]
    fn test_entity_delta_respects_mask() {
        let reg = registry();
        let ai = reg.spawn("farm", &point("guard", Vec3::ZERO));
        let delta = ai.delta(fields::HEALTH);
        assert_eq!(delta.health, Some(100.0));
        assert!(delta.position.is_none());
        assert!(delta.state.is_none());
    }
}

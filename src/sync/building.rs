//! Building sync
//!
//! Player-placed structures. Ownership is by display name so it survives a
//! reconnect; the list is written back to the world record on every change.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::anticheat::validator::{ActionContext, ActionKind, ActionValidator, CheatViolation};
use crate::catalog::Catalog;
use crate::game::constants::building::{BUILD_REACH, FIRST_BUILDING_ID};
use crate::game::state::{BuildingId, PeerId};
use crate::net::protocol::{BuildingSnapshot, ServerMessage};
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::persistence::{BuildingRecord, WorldPersistence};
use crate::sync::player::PlayerSync;
use crate::sync::SyncError;
use crate::util::vec3::Vec3;

fn snapshot(building_id: BuildingId, record: &BuildingRecord) -> BuildingSnapshot {
    BuildingSnapshot {
        building_id,
        building_type: record.building_type.clone(),
        owner_name: record.owner_name.clone(),
        scene_id: record.scene_id.clone(),
        position: record.position,
        rotation: record.rotation,
        level: record.level,
    }
}

struct BuildingState {
    buildings: BTreeMap<BuildingId, BuildingRecord>,
    next_id: BuildingId,
}

impl BuildingState {
    fn insert(&mut self, record: BuildingRecord) -> BuildingId {
        let id = self.next_id;
        self.next_id += 1;
        self.buildings.insert(id, record);
        id
    }
}

pub struct BuildingSync {
    state: Mutex<BuildingState>,
    players: Arc<PlayerSync>,
    catalog: Arc<dyn Catalog>,
    validator: Arc<dyn ActionValidator>,
    persistence: Arc<WorldPersistence>,
    queue: Arc<MessageQueue>,
}

impl BuildingSync {
    /// Build the manager from the buildings stored in the world record
    pub fn new(
        players: Arc<PlayerSync>,
        catalog: Arc<dyn Catalog>,
        validator: Arc<dyn ActionValidator>,
        persistence: Arc<WorldPersistence>,
        queue: Arc<MessageQueue>,
    ) -> Self {
        let mut state = BuildingState {
            buildings: BTreeMap::new(),
            next_id: FIRST_BUILDING_ID,
        };
        for record in persistence.buildings() {
            if catalog.building(&record.building_type).is_none() {
                tracing::warn!(
                    "Persisted building '{}' not in catalog, skipped",
                    record.building_type
                );
                continue;
            }
            state.insert(record);
        }
        if !state.buildings.is_empty() {
            tracing::info!("Restored {} buildings", state.buildings.len());
        }

        Self {
            state: Mutex::new(state),
            players,
            catalog,
            validator,
            persistence,
            queue,
        }
    }

    pub fn place(
        &self,
        peer_id: PeerId,
        building_type: &str,
        position: Vec3,
        rotation: f32,
    ) -> Result<BuildingId, SyncError> {
        if !position.is_finite() || !rotation.is_finite() {
            return Err(CheatViolation::InvalidFloats.into());
        }
        if self.catalog.building(building_type).is_none() {
            return Err(SyncError::unknown("building", building_type));
        }

        let player = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        if !player.is_alive() {
            return Err(SyncError::NotPermitted("player is dead"));
        }
        let scene_id = player
            .scene_id
            .clone()
            .ok_or(SyncError::NotPermitted("not in a scene"))?;

        self.validator.validate_action(
            peer_id,
            &ActionContext {
                kind: ActionKind::Build,
                distance: player.position.distance_to(position),
                max_distance: BUILD_REACH,
            },
        )?;

        let record = BuildingRecord {
            building_type: building_type.to_string(),
            owner_name: player.name,
            scene_id,
            position,
            rotation,
            level: 1,
        };
        let building = {
            let mut state = self.state.lock();
            let id = state.insert(record.clone());
            snapshot(id, &record)
        };
        self.persist();

        tracing::info!(
            "Peer {} placed {} #{} in {}",
            peer_id,
            building.building_type,
            building.building_id,
            building.scene_id
        );
        let building_id = building.building_id;
        self.queue.broadcast(
            &ServerMessage::BuildingPlaced { building },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(building_id)
    }

    pub fn destroy(&self, peer_id: PeerId, building_id: BuildingId) -> Result<(), SyncError> {
        let owner = self
            .players
            .name(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        {
            let mut state = self.state.lock();
            let building = state
                .buildings
                .get(&building_id)
                .ok_or_else(|| SyncError::unknown("building", building_id))?;
            if building.owner_name != owner {
                return Err(SyncError::NotPermitted("not the owner"));
            }
            state.buildings.remove(&building_id);
        }
        self.persist();

        self.queue.broadcast(
            &ServerMessage::BuildingDestroyed {
                building_id,
                by: peer_id,
            },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(())
    }

    /// Raise a building one level, up to the catalog maximum
    pub fn upgrade(&self, peer_id: PeerId, building_id: BuildingId) -> Result<u32, SyncError> {
        let owner = self
            .players
            .name(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        let level = {
            let mut state = self.state.lock();
            let building = state
                .buildings
                .get_mut(&building_id)
                .ok_or_else(|| SyncError::unknown("building", building_id))?;
            if building.owner_name != owner {
                return Err(SyncError::NotPermitted("not the owner"));
            }
            let max_level = self
                .catalog
                .building(&building.building_type)
                .map_or(1, |def| def.max_level);
            if building.level >= max_level {
                return Err(SyncError::NotPermitted("already at max level"));
            }
            building.level += 1;
            building.level
        };
        self.persist();

        self.queue.broadcast(
            &ServerMessage::BuildingUpgraded { building_id, level },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(level)
    }

    pub fn in_scene(&self, scene_id: &str) -> Vec<BuildingSnapshot> {
        self.state
            .lock()
            .buildings
            .iter()
            .filter(|(_, b)| b.scene_id == scene_id)
            .map(|(&id, b)| snapshot(id, b))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.state.lock().buildings.len()
    }

    fn persist(&self) {
        let records: Vec<BuildingRecord> = self.state.lock().buildings.values().cloned().collect();
        self.persistence.set_buildings(records);
    }
}

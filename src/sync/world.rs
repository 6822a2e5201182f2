//! World sync
//!
//! Scene lifecycle, container inspection and extraction. A scene is loaded
//! when its first player enters (AI spawn points and loot spawns are
//! instantiated) and unloaded when its last player leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::anticheat::validator::{ActionContext, ActionKind, ActionValidator};
use crate::catalog::{Catalog, SceneDef};
use crate::game::constants::items::PICKUP_REACH;
use crate::game::state::{ContainerId, PeerId};
use crate::game::systems::ai_registry::AiRegistry;
use crate::game::systems::items::{ContainerOrigin, ItemAuthority, ItemError, PickupOutcome};
use crate::net::protocol::ServerMessage;
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::persistence::WorldPersistence;
use crate::sync::building::BuildingSync;
use crate::sync::player::PlayerSync;
use crate::sync::SyncError;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone, Copy)]
struct LoadedScene {
    loaded_at: Instant,
}

/// An extraction in progress
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub extract_id: String,
    pub scene_id: String,
    pub position: Vec3,
    pub radius: f32,
    pub duration: Duration,
    pub started_at: Instant,
}

enum ExtractionStep {
    Complete(PeerId, Extraction),
    Cancel(PeerId, &'static str),
}

pub struct WorldSync {
    catalog: Arc<dyn Catalog>,
    registry: Arc<AiRegistry>,
    items: Arc<ItemAuthority>,
    players: Arc<PlayerSync>,
    buildings: Arc<BuildingSync>,
    persistence: Arc<WorldPersistence>,
    validator: Arc<dyn ActionValidator>,
    queue: Arc<MessageQueue>,
    scenes: Mutex<HashMap<String, LoadedScene>>,
    extractions: Mutex<HashMap<PeerId, Extraction>>,
}

impl WorldSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        registry: Arc<AiRegistry>,
        items: Arc<ItemAuthority>,
        players: Arc<PlayerSync>,
        buildings: Arc<BuildingSync>,
        persistence: Arc<WorldPersistence>,
        validator: Arc<dyn ActionValidator>,
        queue: Arc<MessageQueue>,
    ) -> Self {
        Self {
            catalog,
            registry,
            items,
            players,
            buildings,
            persistence,
            validator,
            queue,
            scenes: Mutex::new(HashMap::new()),
            extractions: Mutex::new(HashMap::new()),
        }
    }

    /// Move a player into a scene, loading it if nobody is there yet, and
    /// send them the scene snapshot.
    pub fn enter_scene(&self, peer_id: PeerId, scene_id: &str) -> Result<(), SyncError> {
        let def = self
            .catalog
            .scene(scene_id)
            .ok_or_else(|| SyncError::unknown("scene", scene_id))?;
        if self.players.get(peer_id).is_none() {
            return Err(SyncError::UnknownPeer(peer_id));
        }

        // Claim the load before spawning so a second entry does not load twice
        let first_entry = {
            let mut scenes = self.scenes.lock();
            if scenes.contains_key(scene_id) {
                false
            } else {
                scenes.insert(
                    scene_id.to_string(),
                    LoadedScene {
                        loaded_at: Instant::now(),
                    },
                );
                true
            }
        };
        if first_entry {
            self.load_scene(def);
        }

        self.cancel_extraction(peer_id, "changed scene");
        let previous = self.players.enter_scene(peer_id, scene_id, def.spawn_position)?;

        self.queue.to_peer(
            peer_id,
            &ServerMessage::SceneSnapshot {
                scene_id: scene_id.to_string(),
                players: self.players.transforms_in_scene(scene_id),
                ai: self
                    .registry
                    .in_scene(scene_id)
                    .iter()
                    .map(|e| e.snapshot())
                    .collect(),
                containers: self
                    .items
                    .in_scene(scene_id)
                    .iter()
                    .map(|c| c.snapshot())
                    .collect(),
                buildings: self.buildings.in_scene(scene_id),
            },
            Delivery::Reliable,
            Priority::High,
        );
        self.persistence.set_current_scene(Some(scene_id.to_string()));

        if let Some(previous) = previous.filter(|p| p != scene_id) {
            self.maybe_unload(&previous);
        }
        Ok(())
    }

    /// Take a player out of their scene (disconnect, extraction)
    pub fn leave_scene(&self, peer_id: PeerId) {
        self.cancel_extraction(peer_id, "left scene");
        if let Some(scene_id) = self.players.leave_scene(peer_id) {
            self.maybe_unload(&scene_id);
        }
    }

    fn load_scene(&self, def: &SceneDef) {
        for point in &def.ai_spawns {
            self.registry.spawn(&def.id, point);
        }

        let mut containers = 0;
        for spawn in &def.loot_spawns {
            if self.persistence.is_looted(&spawn.id) {
                continue;
            }
            self.items.spawn_container(
                &def.id,
                &spawn.kind,
                spawn.position,
                spawn.items.clone(),
                ContainerOrigin::Scene {
                    spawn_id: spawn.id.clone(),
                },
            );
            containers += 1;
        }

        tracing::info!(
            "Scene {} loaded: {} AI, {} containers",
            def.id,
            def.ai_spawns.len(),
            containers
        );
    }

    /// Unload a scene nobody is in any more
    fn maybe_unload(&self, scene_id: &str) -> bool {
        if !self.players.peers_in_scene(scene_id).is_empty() {
            return false;
        }
        let Some(loaded) = self.scenes.lock().remove(scene_id) else {
            return false;
        };

        let ai = self.registry.remove_scene(scene_id).len();
        let containers = self.items.remove_scene(scene_id);
        tracing::info!(
            "Scene {} unloaded after {:.0}s: removed {} AI, {} containers",
            scene_id,
            loaded.loaded_at.elapsed().as_secs_f32(),
            ai,
            containers
        );
        true
    }

    pub fn is_loaded(&self, scene_id: &str) -> bool {
        self.scenes.lock().contains_key(scene_id)
    }

    pub fn loaded_scenes(&self) -> usize {
        self.scenes.lock().len()
    }

    /// Reach and scene check for interacting with a container
    pub fn check_container_reach(
        &self,
        peer_id: PeerId,
        container_id: ContainerId,
        kind: ActionKind,
    ) -> Result<(), SyncError> {
        let player = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        if !player.is_alive() {
            return Err(SyncError::NotPermitted("player is dead"));
        }
        let container = self
            .items
            .container(container_id)
            .ok_or(ItemError::UnknownContainer(container_id))?;
        if player.scene_id.as_deref() != Some(container.scene_id.as_str()) {
            return Err(SyncError::NotPermitted("container not in player's scene"));
        }

        self.validator.validate_action(
            peer_id,
            &ActionContext {
                kind,
                distance: player.position.distance_to(container.position),
                max_distance: PICKUP_REACH,
            },
        )?;
        Ok(())
    }

    /// Send a container's slots to the requester
    pub fn open_container(&self, peer_id: PeerId, container_id: ContainerId) -> Result<(), SyncError> {
        self.check_container_reach(peer_id, container_id, ActionKind::Inspect)?;
        let container = self
            .items
            .container(container_id)
            .ok_or(ItemError::UnknownContainer(container_id))?;

        self.queue.to_peer(
            peer_id,
            &ServerMessage::ContainerContents {
                container_id,
                slots: container.slot_entries(),
            },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(())
    }

    /// Persist a scene loot spawn as looted once its container is emptied
    pub fn record_pickup(&self, outcome: &PickupOutcome) {
        if let (true, ContainerOrigin::Scene { spawn_id }) = (outcome.emptied, &outcome.origin) {
            tracing::debug!("Loot spawn {} emptied", spawn_id);
            self.persistence.mark_looted(spawn_id);
        }
    }

    pub fn start_extraction(&self, peer_id: PeerId, extract_id: &str) -> Result<(), SyncError> {
        self.start_extraction_at(Instant::now(), peer_id, extract_id)
    }

    pub fn start_extraction_at(
        &self,
        now: Instant,
        peer_id: PeerId,
        extract_id: &str,
    ) -> Result<(), SyncError> {
        let def = self
            .catalog
            .extract_point(extract_id)
            .ok_or_else(|| SyncError::unknown("extract point", extract_id))?;
        let player = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        if !player.is_alive() {
            return Err(SyncError::NotPermitted("player is dead"));
        }
        if player.scene_id.as_deref() != Some(def.scene_id.as_str()) {
            return Err(SyncError::NotPermitted("extract point not in player's scene"));
        }

        let duration = Duration::try_from_secs_f32(def.duration_secs.max(0.0))
            .map_err(|_| SyncError::NotPermitted("invalid extract duration"))?;

        self.validator.validate_action(
            peer_id,
            &ActionContext {
                kind: ActionKind::Extract,
                distance: player.position.distance_to(def.position),
                max_distance: def.radius,
            },
        )?;

        {
            let mut extractions = self.extractions.lock();
            if extractions.contains_key(&peer_id) {
                return Err(SyncError::NotPermitted("already extracting"));
            }
            extractions.insert(
                peer_id,
                Extraction {
                    extract_id: def.id.clone(),
                    scene_id: def.scene_id.clone(),
                    position: def.position,
                    radius: def.radius,
                    duration,
                    started_at: now,
                },
            );
        }

        tracing::info!("Peer {} started extraction at {}", peer_id, def.id);
        self.queue.broadcast(
            &ServerMessage::ExtractStart {
                peer_id,
                extract_id: def.id.clone(),
                duration_secs: def.duration_secs,
            },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(())
    }

    /// Stop a peer's extraction, if any. Returns whether one was cancelled.
    pub fn cancel_extraction(&self, peer_id: PeerId, reason: &str) -> bool {
        let Some(extraction) = self.extractions.lock().remove(&peer_id) else {
            return false;
        };

        tracing::debug!("Peer {} extraction cancelled: {}", peer_id, reason);
        self.queue.broadcast(
            &ServerMessage::ExtractCancel {
                peer_id,
                extract_id: extraction.extract_id,
                reason: reason.to_string(),
            },
            Delivery::Reliable,
            Priority::Normal,
        );
        true
    }

    pub fn is_extracting(&self, peer_id: PeerId) -> bool {
        self.extractions.lock().contains_key(&peer_id)
    }

    /// Progress every extraction. Returns the peers that extracted.
    pub fn tick_extractions(&self, now: Instant) -> Vec<PeerId> {
        let active: Vec<(PeerId, Extraction)> = self
            .extractions
            .lock()
            .iter()
            .map(|(&peer, e)| (peer, e.clone()))
            .collect();
        if active.is_empty() {
            return Vec::new();
        }

        let steps: Vec<ExtractionStep> = active
            .into_iter()
            .filter_map(|(peer_id, extraction)| {
                let Some(player) = self.players.get(peer_id) else {
                    return Some(ExtractionStep::Cancel(peer_id, "disconnected"));
                };
                if !player.is_alive() {
                    return Some(ExtractionStep::Cancel(peer_id, "died"));
                }
                if player.scene_id.as_deref() != Some(extraction.scene_id.as_str())
                    || player.position.distance_to(extraction.position) > extraction.radius
                {
                    return Some(ExtractionStep::Cancel(peer_id, "left extraction area"));
                }
                if now.saturating_duration_since(extraction.started_at) >= extraction.duration {
                    return Some(ExtractionStep::Complete(peer_id, extraction));
                }
                None
            })
            .collect();

        let mut completed = Vec::new();
        for step in steps {
            match step {
                ExtractionStep::Cancel(peer_id, reason) => {
                    self.cancel_extraction(peer_id, reason);
                }
                ExtractionStep::Complete(peer_id, extraction) => {
                    if self.extractions.lock().remove(&peer_id).is_none() {
                        continue;
                    }
                    tracing::info!("Peer {} extracted at {}", peer_id, extraction.extract_id);
                    self.queue.broadcast(
                        &ServerMessage::ExtractComplete {
                            peer_id,
                            extract_id: extraction.extract_id,
                        },
                        Delivery::Reliable,
                        Priority::High,
                    );
                    if let Some(scene_id) = self.players.leave_scene(peer_id) {
                        self.maybe_unload(&scene_id);
                    }
                    completed.push(peer_id);
                }
            }
        }
        completed
    }
}

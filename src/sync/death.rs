//! Death and respawn
//!
//! Player deaths drop everything carried into a dead-loot container; AI
//! deaths remove the entity and drop its loot table.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::game::state::{AiId, ContainerId, PeerId};
use crate::game::systems::ai_registry::AiRegistry;
use crate::game::systems::items::ItemAuthority;
use crate::net::protocol::{Killer, LootSource, ServerMessage};
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::sync::player::PlayerSync;
use crate::sync::SyncError;
use crate::util::vec3::Vec3;

pub struct DeathSync {
    players: Arc<PlayerSync>,
    registry: Arc<AiRegistry>,
    items: Arc<ItemAuthority>,
    catalog: Arc<dyn Catalog>,
    queue: Arc<MessageQueue>,
}

impl DeathSync {
    pub fn new(
        players: Arc<PlayerSync>,
        registry: Arc<AiRegistry>,
        items: Arc<ItemAuthority>,
        catalog: Arc<dyn Catalog>,
        queue: Arc<MessageQueue>,
    ) -> Self {
        Self {
            players,
            registry,
            items,
            catalog,
            queue,
        }
    }

    /// A player's health reached zero. Returns the dead-loot container, if any.
    pub fn player_died(&self, peer_id: PeerId, killer: Killer) -> Option<ContainerId> {
        let remains = self.players.strip_carried(peer_id)?;

        let loot_container = match &remains.scene_id {
            Some(scene_id) => self.items.spawn_dead_loot(
                scene_id,
                remains.position,
                remains.items,
                LootSource::Player(peer_id),
            ),
            None => None,
        };

        tracing::info!("Peer {} died ({:?})", peer_id, killer);
        self.queue.broadcast(
            &ServerMessage::PlayerDeath {
                peer_id,
                killer,
                loot_container,
            },
            Delivery::Reliable,
            Priority::High,
        );
        loot_container
    }

    /// Bring a dead player back at their scene's spawn position
    pub fn respawn(&self, peer_id: PeerId) -> Result<(), SyncError> {
        let session = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        let position = session
            .scene_id
            .as_deref()
            .and_then(|scene_id| self.catalog.scene(scene_id))
            .map_or(Vec3::ZERO, |scene| scene.spawn_position);

        let health = self.players.respawn(peer_id, position)?;

        self.queue.broadcast(
            &ServerMessage::PlayerRespawn {
                peer_id,
                position,
                health,
            },
            Delivery::Reliable,
            Priority::High,
        );
        Ok(())
    }

    /// An AI died: remove it, drop its loot, announce the despawn
    pub fn ai_died(&self, ai_id: AiId, killer: Option<PeerId>) -> Option<ContainerId> {
        let Some(entity) = self.registry.remove(ai_id) else {
            tracing::warn!("Death of unknown AI {} skipped", ai_id);
            return None;
        };

        tracing::info!(
            "AI {} ({}) killed by {:?} in {}",
            ai_id,
            entity.type_name,
            killer,
            entity.scene_id
        );

        let loot = self.items.spawn_dead_loot(
            &entity.scene_id,
            entity.position,
            entity.loot,
            LootSource::Ai(ai_id),
        );
        self.queue.broadcast(
            &ServerMessage::AiDespawn { ai_id },
            Delivery::Reliable,
            Priority::Normal,
        );
        loot
    }
}

//! Combat sync
//!
//! Validates player hits on AI entities before applying them, and applies AI
//! attacks to players authoritatively.

use std::sync::Arc;

use crate::anticheat::validator::{ActionValidator, CheatViolation};
use crate::catalog::Catalog;
use crate::game::state::{AiId, PeerId};
use crate::game::systems::ai::AiEvent;
use crate::game::systems::ai_registry::AiRegistry;
use crate::net::protocol::ServerMessage;
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::sync::player::{DamageOutcome, PlayerSync};
use crate::sync::SyncError;

pub struct CombatSync {
    registry: Arc<AiRegistry>,
    players: Arc<PlayerSync>,
    catalog: Arc<dyn Catalog>,
    validator: Arc<dyn ActionValidator>,
    queue: Arc<MessageQueue>,
}

impl CombatSync {
    pub fn new(
        registry: Arc<AiRegistry>,
        players: Arc<PlayerSync>,
        catalog: Arc<dyn Catalog>,
        validator: Arc<dyn ActionValidator>,
        queue: Arc<MessageQueue>,
    ) -> Self {
        Self {
            registry,
            players,
            catalog,
            validator,
            queue,
        }
    }

    /// Apply a player's reported hit on an AI. Returns the controller events
    /// (a death among them) for the caller to route.
    pub fn player_hit(
        &self,
        peer_id: PeerId,
        ai_id: AiId,
        weapon_id: &str,
        damage: f32,
    ) -> Result<Vec<AiEvent>, SyncError> {
        let player = self
            .players
            .get(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;
        if !player.is_alive() {
            return Err(SyncError::NotPermitted("player is dead"));
        }

        let weapon = self
            .catalog
            .weapon(weapon_id)
            .ok_or_else(|| SyncError::unknown("weapon", weapon_id))?;
        let target = self
            .registry
            .get(ai_id)
            .ok_or_else(|| SyncError::unknown("ai", ai_id))?;
        if player.scene_id.as_deref() != Some(target.scene_id.as_str()) {
            return Err(SyncError::NotPermitted("target not in player's scene"));
        }

        let distance = player.position.distance_to(target.position);
        if !self
            .validator
            .validate_damage(peer_id, damage, weapon.damage, distance, weapon.range)
        {
            return Err(CheatViolation::DamageRejected(damage).into());
        }

        let (entity, events) = self
            .registry
            .apply_damage(ai_id, damage, Some(peer_id))
            .ok_or_else(|| SyncError::unknown("ai", ai_id))?;

        self.queue.broadcast(
            &ServerMessage::AiHit {
                ai_id,
                attacker: peer_id,
                damage,
                health: entity.health,
            },
            Delivery::Reliable,
            Priority::Normal,
        );
        Ok(events)
    }

    /// Apply an AI attack to its target. `None` if the target is gone or
    /// already dead.
    pub fn ai_attack(&self, ai_id: AiId, target: PeerId, damage: f32) -> Option<DamageOutcome> {
        let outcome = self.players.apply_damage(target, damage)?;

        self.queue.broadcast(
            &ServerMessage::AiAttack {
                ai_id,
                target,
                damage,
                target_health: outcome.health,
            },
            Delivery::Reliable,
            Priority::High,
        );
        Some(outcome)
    }
}

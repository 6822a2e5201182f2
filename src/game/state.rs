//! Shared identifiers and per-player session state
//!
//! Player sessions live from transport connect to disconnect. Everything a
//! client reports about itself lands here after validation; the player sync
//! manager owns the map of sessions.

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::constants::player::{DEFAULT_MAX_HEALTH, HOTBAR_SLOTS};
use crate::util::vec3::Vec3;

/// Connection-scoped peer identifier (never reused while connected)
pub type PeerId = u64;

/// AI entity identifier (stable hash of spawn point + position)
pub type AiId = u64;

/// Server-assigned loot container identifier
pub type ContainerId = u32;

/// Server-assigned building instance identifier
pub type BuildingId = u32;

/// Hotbar contents, kept inline for the common case
pub type Hotbar = SmallVec<[Option<String>; HOTBAR_SLOTS]>;

/// A stack of one item type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_type: String,
    pub count: u32,
}

impl ItemStack {
    pub fn new(item_type: impl Into<String>, count: u32) -> Self {
        Self {
            item_type: item_type.into(),
            count,
        }
    }
}

/// Equipped gear ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub weapon: Option<String>,
    pub armor: Option<String>,
    pub helmet: Option<String>,
}

/// Server-side record of one connected player
#[derive(Debug, Clone)]
pub struct PlayerSession {
    pub peer_id: PeerId,
    pub endpoint: SocketAddr,
    pub name: String,
    pub scene_id: Option<String>,
    pub position: Vec3,
    /// Yaw in radians
    pub rotation: f32,
    pub velocity: Vec3,
    pub health: f32,
    pub max_health: f32,
    pub equipment: Equipment,
    pub hotbar: Hotbar,
    pub animation: String,
    pub last_update: Instant,
    /// Round-trip latency in milliseconds
    pub latency_ms: u32,
}

impl PlayerSession {
    pub fn new(peer_id: PeerId, endpoint: SocketAddr) -> Self {
        Self {
            peer_id,
            endpoint,
            name: format!("Player{}", peer_id),
            scene_id: None,
            position: Vec3::ZERO,
            rotation: 0.0,
            velocity: Vec3::ZERO,
            health: DEFAULT_MAX_HEALTH,
            max_health: DEFAULT_MAX_HEALTH,
            equipment: Equipment::default(),
            hotbar: Hotbar::new(),
            animation: "idle".to_string(),
            last_update: Instant::now(),
            latency_ms: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0.0
    }

    /// Everything the player carries that drops as loot on death
    pub fn carried_items(&self) -> Vec<ItemStack> {
        let equipped = [
            &self.equipment.weapon,
            &self.equipment.armor,
            &self.equipment.helmet,
        ];
        equipped
            .into_iter()
            .chain(self.hotbar.iter())
            .flatten()
            .map(|id| ItemStack::new(id.clone(), 1))
            .collect()
    }

    pub fn position_snapshot(&self) -> Option<PlayerPosition> {
        self.scene_id.as_ref().map(|scene| PlayerPosition {
            peer_id: self.peer_id,
            scene_id: scene.clone(),
            position: self.position,
            alive: self.is_alive(),
        })
    }
}

/// Minimal view of a player that AI perception works from
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerPosition {
    pub peer_id: PeerId,
    pub scene_id: String,
    pub position: Vec3,
    pub alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_new_session_defaults() {
        let session = PlayerSession::new(7, endpoint());
        assert_eq!(session.peer_id, 7);
        assert!(session.is_alive());
        assert!(session.scene_id.is_none());
        assert!(session.position_snapshot().is_none());
    }

    #[test]
    fn test_carried_items_collects_equipment_and_hotbar() {
        let mut session = PlayerSession::new(1, endpoint());
        session.equipment.weapon = Some("ak47".to_string());
        session.equipment.helmet = Some("helmet_1".to_string());
        session.hotbar.push(Some("med_bandage".to_string()));
        session.hotbar.push(None);

        let items = session.carried_items();
        assert_eq!(items.len(), 3);
        assert!(items.contains(&ItemStack::new("ak47", 1)));
        assert!(items.contains(&ItemStack::new("med_bandage", 1)));
    }

    #[test]
    fn test_position_snapshot_requires_scene() {
        let mut session = PlayerSession::new(3, endpoint());
        session.scene_id = Some("farm".to_string());
        session.position = Vec3::new(1.0, 0.0, 2.0);

        let snap = session.position_snapshot().unwrap();
        assert_eq!(snap.scene_id, "farm");
        assert_eq!(snap.position, Vec3::new(1.0, 0.0, 2.0));
        assert!(snap.alive);
    }
}

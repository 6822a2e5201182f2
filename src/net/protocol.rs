//! Wire messages
//!
//! Every message is a JSON object carrying a `type` discriminator. Messages
//! are decoded once at the transport boundary into these enums; nothing past
//! the session layer sees raw bytes.

use serde::{Deserialize, Serialize};

use crate::game::state::{AiId, BuildingId, ContainerId, Equipment, ItemStack, PeerId};
use crate::game::systems::ai::{AiCategory, AiState};
use crate::util::vec3::Vec3;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Set display name after connecting
    Join { name: String },
    /// Latency probe; carries the client's last measured round trip
    Ping {
        timestamp: u64,
        #[serde(default)]
        latency_ms: Option<u32>,
    },
    PlayerTransform {
        position: Vec3,
        rotation: f32,
        #[serde(default)]
        velocity: Vec3,
    },
    PlayerAnimation { state: String },
    PlayerEquipment {
        #[serde(default)]
        weapon: Option<String>,
        #[serde(default)]
        armor: Option<String>,
        #[serde(default)]
        helmet: Option<String>,
        #[serde(default)]
        hotbar: Vec<Option<String>>,
    },
    /// Self-reported health (environmental damage the server does not simulate)
    PlayerHealth { current: f32 },
    SceneChange { scene_id: String },
    /// Player hit an AI entity
    AiDamage {
        ai_id: AiId,
        weapon_id: String,
        damage: f32,
    },
    ItemPickup { container_id: ContainerId, slot: u32 },
    ItemDrop { item: ItemStack, position: Vec3 },
    OpenContainer { container_id: ContainerId },
    BuildingPlace {
        building_type: String,
        position: Vec3,
        #[serde(default)]
        rotation: f32,
    },
    BuildingDestroy { building_id: BuildingId },
    BuildingUpgrade { building_id: BuildingId },
    Respawn,
    ExtractStart { extract_id: String },
    ExtractCancel,
}

impl ClientMessage {
    /// Short action name used in rejections and logs
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::PlayerTransform { .. } => "playerTransform",
            ClientMessage::PlayerAnimation { .. } => "playerAnimation",
            ClientMessage::PlayerEquipment { .. } => "playerEquipment",
            ClientMessage::PlayerHealth { .. } => "playerHealth",
            ClientMessage::SceneChange { .. } => "sceneChange",
            ClientMessage::AiDamage { .. } => "aiDamage",
            ClientMessage::ItemPickup { .. } => "itemPickup",
            ClientMessage::ItemDrop { .. } => "itemDrop",
            ClientMessage::OpenContainer { .. } => "openContainer",
            ClientMessage::BuildingPlace { .. } => "buildingPlace",
            ClientMessage::BuildingDestroy { .. } => "buildingDestroy",
            ClientMessage::BuildingUpgrade { .. } => "buildingUpgrade",
            ClientMessage::Respawn => "respawn",
            ClientMessage::ExtractStart { .. } => "extractStart",
            ClientMessage::ExtractCancel => "extractCancel",
        }
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Welcome {
        peer_id: PeerId,
        tick_rate: u32,
    },
    PlayerJoined {
        peer_id: PeerId,
        name: String,
    },
    PlayerLeft {
        peer_id: PeerId,
        name: String,
    },
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
    /// Full positions of every player (periodic resync)
    #[serde(rename = "player_transform_snapshot")]
    PlayerTransformSnapshot {
        tick: u64,
        players: Vec<TransformEntry>,
    },
    /// Dirty-only player and AI deltas
    #[serde(rename = "delta_sync")]
    DeltaSync {
        tick: u64,
        players: Vec<PlayerDelta>,
        ai: Vec<AiDelta>,
    },
    /// Everything a peer needs on entering a scene
    #[serde(rename = "scene_snapshot")]
    SceneSnapshot {
        scene_id: String,
        players: Vec<TransformEntry>,
        ai: Vec<AiSnapshot>,
        containers: Vec<ContainerSnapshot>,
        buildings: Vec<BuildingSnapshot>,
    },
    /// Authoritative position after a rejected movement report
    PositionCorrection { position: Vec3 },
    ItemPickupConfirm {
        peer_id: PeerId,
        container_id: ContainerId,
        slot: u32,
        item: ItemStack,
    },
    ItemPickupReject {
        container_id: ContainerId,
        slot: u32,
        reason: String,
    },
    ItemDropConfirm {
        peer_id: PeerId,
        container_id: ContainerId,
        position: Vec3,
        item: ItemStack,
    },
    ContainerContents {
        container_id: ContainerId,
        slots: Vec<SlotEntry>,
    },
    DeadLootSpawn {
        container_id: ContainerId,
        position: Vec3,
        items: Vec<ItemStack>,
        source: LootSource,
    },
    AiHit {
        ai_id: AiId,
        attacker: PeerId,
        damage: f32,
        health: f32,
    },
    AiAttack {
        ai_id: AiId,
        target: PeerId,
        damage: f32,
        target_health: f32,
    },
    AiDespawn { ai_id: AiId },
    BuildingPlaced { building: BuildingSnapshot },
    BuildingDestroyed {
        building_id: BuildingId,
        by: PeerId,
    },
    BuildingUpgraded {
        building_id: BuildingId,
        level: u32,
    },
    PlayerDeath {
        peer_id: PeerId,
        killer: Killer,
        loot_container: Option<ContainerId>,
    },
    PlayerRespawn {
        peer_id: PeerId,
        position: Vec3,
        health: f32,
    },
    ExtractStart {
        peer_id: PeerId,
        extract_id: String,
        duration_secs: f32,
    },
    ExtractComplete {
        peer_id: PeerId,
        extract_id: String,
    },
    ExtractCancel {
        peer_id: PeerId,
        extract_id: String,
        reason: String,
    },
    /// Request referenced something that does not exist or was not allowed
    ActionRejected { action: String, reason: String },
    /// Anti-cheat alert surfaced to all clients
    Alert { peer_id: PeerId, violation: String },
    Kicked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformEntry {
    pub peer_id: PeerId,
    pub position: Vec3,
    pub rotation: f32,
    pub velocity: Vec3,
}

/// Delta for a single player; only dirty fields are present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerDelta {
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<Equipment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotbar: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
}

/// Delta for a single AI entity; only dirty fields are present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiDelta {
    pub ai_id: AiId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AiState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSnapshot {
    pub ai_id: AiId,
    pub type_name: String,
    pub category: AiCategory,
    pub position: Vec3,
    pub forward: Vec3,
    pub health: f32,
    pub max_health: f32,
    pub state: AiState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub slot: u32,
    pub item: ItemStack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub container_id: ContainerId,
    pub kind: String,
    pub position: Vec3,
    pub slots: Vec<SlotEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingSnapshot {
    pub building_id: BuildingId,
    pub building_type: String,
    pub owner_name: String,
    pub scene_id: String,
    pub position: Vec3,
    pub rotation: f32,
    pub level: u32,
}

/// Who produced a dead-loot container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum LootSource {
    Player(PeerId),
    Ai(AiId),
}

/// What killed a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Killer {
    Ai(AiId),
    Player(PeerId),
    Environment,
}

/// Encode a message as JSON bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message from JSON bytes
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

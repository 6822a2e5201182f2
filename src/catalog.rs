//! Read-only game data: weapons, items, scenes, extraction points, buildings
//!
//! The server only needs lookups by id. [`StaticCatalog`] indexes a JSON file
//! loaded once at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::game::state::ItemStack;
use crate::game::systems::ai_registry::SpawnPoint;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponDef {
    pub id: String,
    pub damage: f32,
    pub range: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDef {
    pub id: String,
    #[serde(default = "default_stack")]
    pub max_stack: u32,
}

fn default_stack() -> u32 {
    1
}

/// Catalog-placed loot container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootSpawn {
    pub id: String,
    #[serde(default = "default_loot_kind")]
    pub kind: String,
    pub position: Vec3,
    pub items: Vec<ItemStack>,
}

fn default_loot_kind() -> String {
    "crate".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDef {
    pub id: String,
    #[serde(default)]
    pub spawn_position: Vec3,
    #[serde(default)]
    pub ai_spawns: Vec<SpawnPoint>,
    #[serde(default)]
    pub loot_spawns: Vec<LootSpawn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPointDef {
    pub id: String,
    pub scene_id: String,
    pub position: Vec3,
    pub radius: f32,
    /// Seconds the player must stay inside the radius
    pub duration_secs: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingDef {
    pub id: String,
    #[serde(default = "default_max_level")]
    pub max_level: u32,
}

fn default_max_level() -> u32 {
    3
}

/// Lookup interface over static game data
pub trait Catalog: Send + Sync {
    fn weapon(&self, id: &str) -> Option<&WeaponDef>;
    fn item(&self, id: &str) -> Option<&ItemDef>;
    fn scene(&self, id: &str) -> Option<&SceneDef>;
    fn extract_point(&self, id: &str) -> Option<&ExtractPointDef>;
    fn building(&self, id: &str) -> Option<&BuildingDef>;

    /// Anything a player can carry: plain items and weapons
    fn knows_item(&self, id: &str) -> bool {
        self.item(id).is_some() || self.weapon(id).is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate {kind} id '{id}'")]
    Duplicate { kind: &'static str, id: String },
}

/// On-disk catalog layout
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub weapons: Vec<WeaponDef>,
    #[serde(default)]
    pub items: Vec<ItemDef>,
    #[serde(default)]
    pub scenes: Vec<SceneDef>,
    #[serde(default)]
    pub extract_points: Vec<ExtractPointDef>,
    #[serde(default)]
    pub buildings: Vec<BuildingDef>,
}

#[derive(Debug, Default)]
pub struct StaticCatalog {
    weapons: HashMap<String, WeaponDef>,
    items: HashMap<String, ItemDef>,
    scenes: HashMap<String, SceneDef>,
    extract_points: HashMap<String, ExtractPointDef>,
    buildings: HashMap<String, BuildingDef>,
}

fn index<T>(
    kind: &'static str,
    entries: Vec<T>,
    id: impl Fn(&T) -> &str,
) -> Result<HashMap<String, T>, CatalogError> {
    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        let key = id(&entry).to_string();
        if map.contains_key(&key) {
            return Err(CatalogError::Duplicate { kind, id: key });
        }
        map.insert(key, entry);
    }
    Ok(map)
}

impl StaticCatalog {
    pub fn from_file_data(file: CatalogFile) -> Result<Self, CatalogError> {
        Ok(Self {
            weapons: index("weapon", file.weapons, |w| w.id.as_str())?,
            items: index("item", file.items, |i| i.id.as_str())?,
            scenes: index("scene", file.scenes, |s| s.id.as_str())?,
            extract_points: index("extract point", file.extract_points, |e| e.id.as_str())?,
            buildings: index("building", file.buildings, |b| b.id.as_str())?,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Self::from_file_data(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(
            "Catalog loaded from {}: {} weapons, {} items, {} scenes, {} extract points, {} buildings",
            path.display(),
            catalog.weapons.len(),
            catalog.items.len(),
            catalog.scenes.len(),
            catalog.extract_points.len(),
            catalog.buildings.len()
        );
        Ok(catalog)
    }
}

impl Catalog for StaticCatalog {
    fn weapon(&self, id: &str) -> Option<&WeaponDef> {
        self.weapons.get(id)
    }

    fn item(&self, id: &str) -> Option<&ItemDef> {
        self.items.get(id)
    }

    fn scene(&self, id: &str) -> Option<&SceneDef> {
        self.scenes.get(id)
    }

    fn extract_point(&self, id: &str) -> Option<&ExtractPointDef> {
        self.extract_points.get(id)
    }

    fn building(&self, id: &str) -> Option<&BuildingDef> {
        self.buildings.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "weapons": [{ "id": "ak47", "damage": 35.0, "range": 60.0 }],
        "items": [{ "id": "med_bandage", "max_stack": 5 }, { "id": "ammo_9mm" }],
        "scenes": [{
            "id": "farm",
            "spawn_position": { "x": 0.0, "y": 0.0, "z": 0.0 },
            "ai_spawns": [{
                "id": "farm_guard",
                "type_name": "raider",
                "position": { "x": 10.0, "y": 0.0, "z": 5.0 }
            }],
            "loot_spawns": [{
                "id": "farm_crate_1",
                "position": { "x": 2.0, "y": 0.0, "z": 2.0 },
                "items": [{ "item_type": "ammo_9mm", "count": 30 }]
            }]
        }],
        "extract_points": [{
            "id": "farm_gate", "scene_id": "farm",
            "position": { "x": 50.0, "y": 0.0, "z": 0.0 },
            "radius": 5.0, "duration_secs": 10.0
        }],
        "buildings": [{ "id": "wall_wood" }]
    }"#;

    #[test]
    fn test_parse_sample() {
        let catalog = StaticCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.weapon("ak47").unwrap().damage, 35.0);
        assert_eq!(catalog.item("ammo_9mm").unwrap().max_stack, 1);
        assert_eq!(catalog.building("wall_wood").unwrap().max_level, 3);

        let farm = catalog.scene("farm").unwrap();
        assert_eq!(farm.ai_spawns.len(), 1);
        assert_eq!(farm.ai_spawns[0].stats.max_health, 100.0);
        assert_eq!(farm.loot_spawns[0].kind, "crate");

        assert!(catalog.extract_point("farm_gate").is_some());
        assert!(catalog.scene("bunker").is_none());
    }

    #[test]
    fn test_knows_item_includes_weapons() {
        let catalog = StaticCatalog::from_json(SAMPLE).unwrap();
        assert!(catalog.knows_item("ak47"));
        assert!(catalog.knows_item("med_bandage"));
        assert!(!catalog.knows_item("railgun"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{ "items": [{ "id": "a" }, { "id": "a" }] }"#;
        assert!(matches!(
            StaticCatalog::from_json(json),
            Err(CatalogError::Duplicate { kind: "item", .. })
        ));
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = StaticCatalog::from_json("{}").unwrap();
        assert!(catalog.weapon("ak47").is_none());
    }
}

//! Static content definitions
//!
//! Read-only lookup tables loaded from JSON before the tick loop starts.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PersistenceError;

/// A definition keyed by a numeric id
pub trait Definition: DeserializeOwned {
    fn id(&self) -> u16;
}

/// Id to definition lookup
#[derive(Debug, Clone)]
pub struct DefinitionTable<T> {
    entries: HashMap<u16, T>,
}

impl<T> Default for DefinitionTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Definition> DefinitionTable<T> {
    pub fn from_definitions(definitions: impl IntoIterator<Item = T>) -> Self {
        let entries = definitions.into_iter().map(|d| (d.id(), d)).collect();
        Self { entries }
    }

    /// Load a JSON array of definitions. A missing file gives an empty table.
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Definition file missing, using empty table");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let definitions: Vec<T> = serde_json::from_str(&contents)?;
        Ok(Self::from_definitions(definitions))
    }

    pub fn lookup(&self, id: u16) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn default_size() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcDefinition {
    pub id: u16,
    pub name: String,
    #[serde(default = "default_size")]
    pub size: u8,
    #[serde(default)]
    pub combat_level: u16,
}

impl Definition for NpcDefinition {
    fn id(&self) -> u16 {
        self.id
    }
}

/// Combat stats for npcs that can fight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcCombatDefinition {
    pub id: u16,
    pub respawn_ticks: u16,
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub poisonous: bool,
    pub level: u16,
    pub hitpoints: u16,
    pub maximum_hit: u16,
    pub attack_speed: u8,
    pub attack_animation: u16,
    pub defence_animation: u16,
    pub death_animation: u16,
    /// attack, strength, defence, ranged, magic
    #[serde(default)]
    pub skills: [u16; 5],
    #[serde(default)]
    pub bonuses: Vec<i16>,
}

impl Definition for NpcCombatDefinition {
    fn id(&self) -> u16 {
        self.id
    }
}

/// Every table the world consults
#[derive(Debug, Clone, Default)]
pub struct ContentDefinitions {
    pub npcs: DefinitionTable<NpcDefinition>,
    pub npc_combat: DefinitionTable<NpcCombatDefinition>,
}

impl ContentDefinitions {
    /// Load all tables from `directory`
    pub fn load(directory: &Path) -> Result<Self, PersistenceError> {
        let content = Self {
            npcs: DefinitionTable::load(&directory.join("npc_definitions.json"))?,
            npc_combat: DefinitionTable::load(&directory.join("npc_combat_definitions.json"))?,
        };
        info!(
            npcs = content.npcs.len(),
            npc_combat = content.npc_combat.len(),
            "Content definitions loaded"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;
    use uuid::Uuid;

    #[test]
    fn test_lookup() {
        let table = DefinitionTable::from_definitions(vec![NpcDefinition {
            id: 2,
            name: "Man".into(),
            size: 1,
            combat_level: 2,
        }]);
        assert_eq!(table.lookup(2).map(|d| d.name.as_str()), Some("Man"));
        assert!(table.lookup(3).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let dir = temp_dir().join(format!("realm_defs_{}", Uuid::new_v4()));
        let content = ContentDefinitions::load(&dir).unwrap();
        assert!(content.npcs.is_empty());
        assert!(content.npc_combat.is_empty());
    }

    #[test]
    fn test_load_json_array() {
        let dir = temp_dir().join(format!("realm_defs_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("npc_definitions.json"),
            r#"[{"id": 50, "name": "King Black Dragon", "size": 5, "combat_level": 276},
                {"id": 1, "name": "Man"}]"#,
        )
        .unwrap();

        let content = ContentDefinitions::load(&dir).unwrap();
        let dragon = content.npcs.lookup(50).unwrap();
        assert_eq!(dragon.size, 5);
        assert_eq!(content.npcs.lookup(1).unwrap().size, 1);
        let _ = fs::remove_dir_all(&dir);
    }
}

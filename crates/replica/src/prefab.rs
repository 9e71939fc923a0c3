use std::fmt;

use serde::{Deserialize, Serialize};

use crate::behaviour::ReplicatedBehaviour;
use crate::object::ReplicatedObject;
use crate::wire::WireError;

/// Which template an object was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefabRef {
    Networked(u16),
    Player,
    /// Baked into a scene file; both sides build it from the scene, never
    /// from a spawn.
    SceneInstance,
}

impl PrefabRef {
    pub const PLAYER_INDEX: i32 = -1;
    pub const SCENE_INSTANCE_INDEX: i32 = -2;

    pub fn to_wire(self) -> i32 {
        match self {
            PrefabRef::Networked(index) => i32::from(index),
            PrefabRef::Player => Self::PLAYER_INDEX,
            PrefabRef::SceneInstance => Self::SCENE_INSTANCE_INDEX,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self, WireError> {
        match value {
            Self::PLAYER_INDEX => Ok(PrefabRef::Player),
            Self::SCENE_INSTANCE_INDEX => Ok(PrefabRef::SceneInstance),
            index => u16::try_from(index)
                .map(PrefabRef::Networked)
                .map_err(|_| WireError::InvalidValue {
                    field: "prefab_index",
                    value: i64::from(index),
                }),
        }
    }
}

impl fmt::Display for PrefabRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefabRef::Networked(index) => write!(f, "prefab {index}"),
            PrefabRef::Player => f.write_str("player prefab"),
            PrefabRef::SceneInstance => f.write_str("scene instance"),
        }
    }
}

/// Builds a fresh, unstarted behaviour list. The list order is the slot
/// order and must be the same on every node.
pub type PrefabFactory = Box<dyn Fn() -> Vec<Box<dyn ReplicatedBehaviour>>>;

struct PrefabEntry {
    name: String,
    factory: PrefabFactory,
}

/// Index → template table, plus the one player template.
#[derive(Default)]
pub struct PrefabTable {
    networked: Vec<PrefabEntry>,
    player: Option<PrefabFactory>,
}

impl PrefabTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_player<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<Box<dyn ReplicatedBehaviour>> + 'static,
    {
        self.player = Some(Box::new(factory));
        self
    }

    pub fn with_prefab<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Vec<Box<dyn ReplicatedBehaviour>> + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Appends a networked prefab and returns its index.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> u16
    where
        F: Fn() -> Vec<Box<dyn ReplicatedBehaviour>> + 'static,
    {
        let index = u16::try_from(self.networked.len()).unwrap_or(u16::MAX);
        self.networked.push(PrefabEntry {
            name: name.into(),
            factory: Box::new(factory),
        });
        index
    }

    pub fn len(&self) -> usize {
        self.networked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networked.is_empty()
    }

    pub fn name(&self, index: u16) -> Option<&str> {
        self.networked
            .get(usize::from(index))
            .map(|entry| entry.name.as_str())
    }

    pub fn has_player(&self) -> bool {
        self.player.is_some()
    }

    /// First construction phase: builds the behaviours without starting them.
    /// Scene instances are built through [`PrefabTable::construct_scene_object`].
    pub fn construct(&self, prefab: PrefabRef) -> Option<ReplicatedObject> {
        let behaviours = match prefab {
            PrefabRef::Networked(index) => (self.networked.get(usize::from(index))?.factory)(),
            PrefabRef::Player => (self.player.as_ref()?)(),
            PrefabRef::SceneInstance => return None,
        };
        Some(ReplicatedObject::new(prefab, behaviours))
    }

    pub fn construct_scene_object(&self, template: u16) -> Option<ReplicatedObject> {
        let entry = self.networked.get(usize::from(template))?;
        Some(ReplicatedObject::new(
            PrefabRef::SceneInstance,
            (entry.factory)(),
        ))
    }
}

impl fmt::Debug for PrefabTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefabTable")
            .field(
                "networked",
                &self
                    .networked
                    .iter()
                    .map(|entry| entry.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("player", &self.player.is_some())
            .finish()
    }
}

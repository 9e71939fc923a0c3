use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneIndex(pub u16);

impl fmt::Display for SceneIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene {}", self.0)
    }
}

/// An object baked into a scene: a pre-assigned scene-space id and the
/// networked prefab that supplies its behaviours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneObject {
    pub id: NetworkId,
    pub template: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedScene {
    pub index: SceneIndex,
    pub objects: Vec<SceneObject>,
}

/// Loads scene content for a role. Loading may take several pump cycles;
/// the role polls until the scene is ready.
pub trait SceneLoader {
    fn begin_load(&mut self, scene: SceneIndex);

    fn poll_loaded(&mut self) -> Option<LoadedScene>;
}

/// In-memory scene catalogue. `latency` is the number of polls a load takes
/// before it completes.
#[derive(Debug, Clone, Default)]
pub struct StaticScenes {
    scenes: HashMap<SceneIndex, Vec<SceneObject>>,
    latency: u32,
    pending: Option<(SceneIndex, u32)>,
}

impl StaticScenes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scene(mut self, index: SceneIndex, objects: Vec<SceneObject>) -> Self {
        self.scenes.insert(index, objects);
        self
    }

    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }
}

impl SceneLoader for StaticScenes {
    fn begin_load(&mut self, scene: SceneIndex) {
        if !self.scenes.contains_key(&scene) {
            log::warn!("{scene} is not in the catalogue; loading it empty");
        }
        self.pending = Some((scene, self.latency));
    }

    fn poll_loaded(&mut self) -> Option<LoadedScene> {
        let (scene, remaining) = self.pending.as_mut()?;
        if *remaining > 0 {
            *remaining -= 1;
            return None;
        }
        let index = *scene;
        self.pending = None;
        Some(LoadedScene {
            index,
            objects: self.scenes.get(&index).cloned().unwrap_or_default(),
        })
    }
}

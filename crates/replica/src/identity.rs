use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network-wide object id. Positive ids live in the scene space, negative
/// ids in the persistent space; zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub i32);

impl NetworkId {
    pub fn get(self) -> i32 {
        self.0
    }

    pub fn space(self) -> Option<IdSpace> {
        match self.0 {
            0 => None,
            id if id > 0 => Some(IdSpace::Scene),
            _ => Some(IdSpace::Persistent),
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdSpace {
    /// Reset on every scene change.
    Scene,
    /// Survives scene changes.
    Persistent,
}

/// Opaque identity of a participant, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(pub u64);

impl PeerIdentity {
    pub fn random() -> Self {
        Self(fastrand::u64(1..))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("{space:?} id space is exhausted")]
    Exhausted { space: IdSpace },
    #[error("network id 0 is reserved")]
    ZeroId,
}

/// The two id spaces and the objects registered in them.
///
/// Counters hold the last id handed out: the scene counter climbs from 0, the
/// persistent counter falls from 0. Only the host reserves; clients register
/// whatever the host told them.
#[derive(Debug)]
pub struct IdentityDirectory<T> {
    scene: HashMap<NetworkId, T>,
    persistent: HashMap<NetworkId, T>,
    last_scene: i32,
    last_persistent: i32,
    scene_exhausted: bool,
    persistent_exhausted: bool,
}

impl<T> Default for IdentityDirectory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdentityDirectory<T> {
    pub fn new() -> Self {
        Self {
            scene: HashMap::new(),
            persistent: HashMap::new(),
            last_scene: 0,
            last_persistent: 0,
            scene_exhausted: false,
            persistent_exhausted: false,
        }
    }

    pub fn reserve(&mut self, space: IdSpace) -> Result<NetworkId, DirectoryError> {
        match space {
            IdSpace::Scene => {
                if self.scene_exhausted || self.last_scene == i32::MAX {
                    if !self.scene_exhausted {
                        log::error!("scene id space exhausted; refusing further scene spawns");
                    }
                    self.scene_exhausted = true;
                    return Err(DirectoryError::Exhausted { space });
                }
                self.last_scene += 1;
                Ok(NetworkId(self.last_scene))
            }
            IdSpace::Persistent => {
                if self.persistent_exhausted || self.last_persistent == i32::MIN {
                    if !self.persistent_exhausted {
                        log::error!(
                            "persistent id space exhausted; refusing further persistent spawns"
                        );
                    }
                    self.persistent_exhausted = true;
                    return Err(DirectoryError::Exhausted { space });
                }
                self.last_persistent -= 1;
                Ok(NetworkId(self.last_persistent))
            }
        }
    }

    /// Inserts `object` under `id`. A duplicate id overwrites the existing
    /// entry, which is handed back so the caller can tear it down.
    pub fn register(&mut self, id: NetworkId, object: T) -> Result<Option<T>, DirectoryError> {
        let space = id.space().ok_or(DirectoryError::ZeroId)?;
        let table = match space {
            IdSpace::Scene => {
                self.last_scene = self.last_scene.max(id.0);
                &mut self.scene
            }
            IdSpace::Persistent => {
                self.last_persistent = self.last_persistent.min(id.0);
                &mut self.persistent
            }
        };

        let displaced = table.insert(id, object);
        if displaced.is_some() {
            log::warn!("duplicate registration of {id}; last write wins");
        }
        Ok(displaced)
    }

    pub fn unregister(&mut self, id: NetworkId) -> Option<T> {
        match id.space()? {
            IdSpace::Scene => self.scene.remove(&id),
            IdSpace::Persistent => self.persistent.remove(&id),
        }
    }

    pub fn lookup(&self, id: NetworkId) -> Option<&T> {
        match id.space()? {
            IdSpace::Scene => self.scene.get(&id),
            IdSpace::Persistent => self.persistent.get(&id),
        }
    }

    pub fn lookup_mut(&mut self, id: NetworkId) -> Option<&mut T> {
        match id.space()? {
            IdSpace::Scene => self.scene.get_mut(&id),
            IdSpace::Persistent => self.persistent.get_mut(&id),
        }
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.lookup(id).is_some()
    }

    pub fn reset_scene_counter(&mut self) {
        self.last_scene = 0;
        self.scene_exhausted = false;
    }

    /// Ids in allocation order: scene ids ascending, persistent ids from -1 down.
    pub fn ids(&self, space: IdSpace) -> Vec<NetworkId> {
        let mut ids: Vec<NetworkId> = match space {
            IdSpace::Scene => self.scene.keys().copied().collect(),
            IdSpace::Persistent => self.persistent.keys().copied().collect(),
        };
        ids.sort_by_key(|id| id.0.unsigned_abs());
        ids
    }

    /// Persistent objects first, then scene objects, each in allocation order.
    pub fn all_ids(&self) -> Vec<NetworkId> {
        let mut ids = self.ids(IdSpace::Persistent);
        ids.extend(self.ids(IdSpace::Scene));
        ids
    }

    pub fn drain_scene(&mut self) -> Vec<(NetworkId, T)> {
        let mut drained: Vec<(NetworkId, T)> = self.scene.drain().collect();
        drained.sort_by_key(|(id, _)| id.0);
        drained
    }

    pub fn drain_all(&mut self) -> Vec<(NetworkId, T)> {
        let mut drained: Vec<(NetworkId, T)> = self.persistent.drain().collect();
        drained.extend(self.scene.drain());
        drained
    }

    pub fn len(&self) -> usize {
        self.scene.len() + self.persistent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

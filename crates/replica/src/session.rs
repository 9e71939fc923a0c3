//! State shared by both roles: registry, id directory, prefabs, tick
//! scheduler and the event queue. Each role owns exactly one.

use std::collections::VecDeque;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::identity::{IdSpace, IdentityDirectory, NetworkId, PeerIdentity};
use crate::message::{AnyMessage, Role};
use crate::net::Frame;
use crate::object::{Outbound, ReplicatedObject};
use crate::prefab::{PrefabRef, PrefabTable};
use crate::registry::{Address, Decoded, Delivery, MessageRegistry};
use crate::scene::{LoadedScene, SceneIndex};
use crate::tick::TickScheduler;

#[derive(Debug)]
pub struct SessionContext {
    pub(crate) config: SessionConfig,
    pub(crate) role: Role,
    pub(crate) registry: MessageRegistry,
    pub(crate) directory: IdentityDirectory<ReplicatedObject>,
    pub(crate) prefabs: PrefabTable,
    pub(crate) scheduler: TickScheduler,
    pub(crate) events: VecDeque<SessionEvent>,
    pub(crate) scene: Option<SceneIndex>,
}

impl SessionContext {
    pub fn new(
        config: SessionConfig,
        role: Role,
        registry: MessageRegistry,
        prefabs: PrefabTable,
    ) -> Self {
        let scheduler = TickScheduler::new(config.tick_rate);
        Self {
            config,
            role,
            registry,
            directory: IdentityDirectory::new(),
            prefabs,
            scheduler,
            events: VecDeque::new(),
            scene: None,
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.config.identity
    }

    /// Builds `prefab`, starts it under `id` and registers it.
    pub(crate) fn instantiate(
        &mut self,
        prefab: PrefabRef,
        id: NetworkId,
        owner: PeerIdentity,
    ) -> Result<()> {
        let object = self
            .prefabs
            .construct(prefab)
            .ok_or(SessionError::UnknownPrefab(prefab))?;
        self.activate_and_register(object, id, owner)
    }

    /// Reserves an id in `space` and instantiates `prefab` under it.
    pub(crate) fn spawn_new(
        &mut self,
        prefab: PrefabRef,
        space: IdSpace,
        owner: PeerIdentity,
    ) -> Result<NetworkId> {
        let object = self
            .prefabs
            .construct(prefab)
            .ok_or(SessionError::UnknownPrefab(prefab))?;
        let id = self.directory.reserve(space)?;
        self.activate_and_register(object, id, owner)?;
        Ok(id)
    }

    pub(crate) fn activate_and_register(
        &mut self,
        mut object: ReplicatedObject,
        id: NetworkId,
        owner: PeerIdentity,
    ) -> Result<()> {
        if id.space().is_none() {
            return Err(crate::identity::DirectoryError::ZeroId.into());
        }
        let prefab = object.prefab();
        object.begin_registration();
        let local = object.activate(id, owner, self.identity());

        if let Some(mut displaced) = self.directory.register(id, object)? {
            displaced.destroy();
        }
        log::debug!("{id} active: {prefab}, owner {owner}");

        self.events.push_back(SessionEvent::ObjectSpawned {
            network_id: id,
            prefab,
            owner,
        });
        if local {
            self.events
                .push_back(SessionEvent::LocalOwnershipEstablished { network_id: id });
        }
        Ok(())
    }

    /// Tears the object down. Returns `false` if it was not live.
    pub(crate) fn destroy_local(&mut self, id: NetworkId) -> bool {
        let Some(mut object) = self.directory.unregister(id) else {
            log::debug!("destroy for absent {id}; ignoring");
            return false;
        };
        object.destroy();
        log::debug!("{id} destroyed");
        self.events
            .push_back(SessionEvent::ObjectDestroyed { network_id: id });
        true
    }

    pub(crate) fn destroy_all(&mut self) {
        for (id, mut object) in self.directory.drain_all() {
            object.destroy();
            self.events
                .push_back(SessionEvent::ObjectDestroyed { network_id: id });
        }
        self.directory.reset_scene_counter();
    }

    /// Drops every scene-space object and restarts scene id allocation.
    pub(crate) fn unload_scene_objects(&mut self) {
        let unloaded = self.directory.drain_scene();
        if !unloaded.is_empty() {
            log::debug!("unloading {} scene objects", unloaded.len());
        }
        for (id, mut object) in unloaded {
            object.destroy();
            self.events
                .push_back(SessionEvent::ObjectDestroyed { network_id: id });
        }
        self.directory.reset_scene_counter();
    }

    /// Registers the scene's baked objects, owned by `owner`.
    pub(crate) fn load_scene_objects(&mut self, loaded: &LoadedScene, owner: PeerIdentity) {
        for baked in &loaded.objects {
            if baked.id.space() != Some(IdSpace::Scene) {
                log::warn!("{}: baked object {} is not a scene id; skipped", loaded.index, baked.id);
                continue;
            }
            let Some(object) = self.prefabs.construct_scene_object(baked.template) else {
                log::warn!(
                    "{}: baked object {} uses unknown prefab {}; skipped",
                    loaded.index,
                    baked.id,
                    baked.template
                );
                continue;
            };
            if let Err(e) = self.activate_and_register(object, baked.id, owner) {
                log::warn!("{}: could not register {}: {e}", loaded.index, baked.id);
            }
        }
        self.scene = Some(loaded.index);
        log::info!("{} loaded with {} baked objects", loaded.index, loaded.objects.len());
    }

    pub(crate) fn snapshot_of(&self, id: NetworkId) -> Vec<Outbound> {
        self.directory
            .lookup(id)
            .map(ReplicatedObject::snapshot)
            .unwrap_or_default()
    }

    /// Persistent objects first, then scene objects.
    pub(crate) fn full_snapshot(&self) -> Vec<Outbound> {
        self.directory
            .all_ids()
            .into_iter()
            .flat_map(|id| self.snapshot_of(id))
            .collect()
    }

    /// Hands an addressed message to its behaviour. Unknown objects and
    /// slots drop the message.
    pub(crate) fn apply_update(&mut self, address: Address, message: &dyn AnyMessage) -> bool {
        let Some(object) = self.directory.lookup_mut(address.network_id) else {
            log::trace!("{} for unknown object {address}; dropped", message.name());
            return false;
        };
        if !object.apply_update(address.behaviour, message) {
            log::debug!("{} not accepted by {address}; dropped", message.name());
            return false;
        }
        true
    }

    pub(crate) fn collect_owned_updates(&mut self) -> Vec<Outbound> {
        let mut updates = Vec::new();
        for id in self.directory.all_ids() {
            if let Some(object) = self.directory.lookup_mut(id) {
                updates.extend(object.collect_updates());
            }
        }
        updates
    }

    pub(crate) fn owner_of(&self, id: NetworkId) -> Option<PeerIdentity> {
        self.directory.lookup(id).and_then(ReplicatedObject::owner)
    }

    pub(crate) fn owned_by(&self, owner: PeerIdentity) -> Vec<NetworkId> {
        self.directory
            .all_ids()
            .into_iter()
            .filter(|id| self.owner_of(*id) == Some(owner))
            .collect()
    }

    /// Checks that this node may act on `id` as its owner.
    pub(crate) fn require_local_owner(&self, id: NetworkId) -> Result<()> {
        match self.owner_of(id) {
            None => Err(SessionError::UnknownObject(id)),
            Some(owner) if owner != self.identity() => Err(SessionError::NotOwner { object: id, owner }),
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn encode(&self, outbound: &Outbound) -> Result<(Frame, Delivery)> {
        let encoded = self
            .registry
            .encode(outbound.address, outbound.message.as_ref())?;
        Ok((Frame::new(encoded.bytes), encoded.delivery))
    }

    /// Surfaces an application message if its scope admits this role.
    pub(crate) fn dispatch_to_app(&mut self, from: PeerIdentity, decoded: Decoded) {
        if !decoded.delivery.scope.admits(self.role) {
            log::trace!(
                "{} from {from} is out of scope for {:?}; dropped",
                decoded.message.name(),
                self.role
            );
            return;
        }
        self.events.push_back(SessionEvent::Message {
            from,
            message: decoded.message,
        });
    }

    pub fn object(&self, id: NetworkId) -> Option<&ReplicatedObject> {
        self.directory.lookup(id)
    }

    pub fn object_mut(&mut self, id: NetworkId) -> Option<&mut ReplicatedObject> {
        self.directory.lookup_mut(id)
    }

    pub fn object_ids(&self) -> Vec<NetworkId> {
        self.directory.all_ids()
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    pub fn scene(&self) -> Option<SceneIndex> {
        self.scene
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }
}

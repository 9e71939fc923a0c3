use std::fmt;

use crate::behaviour::{ReplicatedBehaviour, Slot};
use crate::identity::{NetworkId, PeerIdentity};
use crate::message::AnyMessage;
use crate::prefab::PrefabRef;
use crate::registry::Address;
use crate::system::Spawn;

/// Behaviour indices travel as a `u8`.
pub const MAX_BEHAVIOURS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unregistered,
    Registering,
    Active,
    Destroyed,
}

/// A message on its way out, with the behaviour it is addressed to if any.
#[derive(Debug)]
pub struct Outbound {
    pub address: Option<Address>,
    pub message: Box<dyn AnyMessage>,
}

impl Outbound {
    pub fn system(message: impl AnyMessage + 'static) -> Self {
        Self {
            address: None,
            message: Box::new(message),
        }
    }

    pub fn addressed(address: Address, message: Box<dyn AnyMessage>) -> Self {
        Self {
            address: Some(address),
            message,
        }
    }
}

pub struct ReplicatedObject {
    prefab: PrefabRef,
    behaviours: Vec<Box<dyn ReplicatedBehaviour>>,
    lifecycle: Lifecycle,
    network_id: Option<NetworkId>,
    owner: Option<PeerIdentity>,
    locally_owned: bool,
}

impl ReplicatedObject {
    pub fn new(prefab: PrefabRef, mut behaviours: Vec<Box<dyn ReplicatedBehaviour>>) -> Self {
        if behaviours.len() > MAX_BEHAVIOURS {
            log::error!(
                "{prefab} has {} behaviours; only the first {MAX_BEHAVIOURS} are addressable",
                behaviours.len()
            );
            behaviours.truncate(MAX_BEHAVIOURS);
        }
        Self {
            prefab,
            behaviours,
            lifecycle: Lifecycle::Unregistered,
            network_id: None,
            owner: None,
            locally_owned: false,
        }
    }

    pub fn begin_registration(&mut self) {
        if self.lifecycle == Lifecycle::Unregistered {
            self.lifecycle = Lifecycle::Registering;
        }
    }

    /// Binds id and owner and starts every behaviour in index order.
    /// Returns `true` if ownership resolved to the local node.
    pub fn activate(&mut self, id: NetworkId, owner: PeerIdentity, local: PeerIdentity) -> bool {
        if matches!(self.lifecycle, Lifecycle::Active | Lifecycle::Destroyed) {
            log::warn!("{id} activated twice; ignoring");
            return false;
        }

        self.network_id = Some(id);
        self.owner = Some(owner);
        self.locally_owned = owner == local;
        self.lifecycle = Lifecycle::Active;

        let is_local_owner = self.locally_owned;
        for (index, behaviour) in self.behaviours.iter_mut().enumerate() {
            let slot = Slot {
                network_id: id,
                index: index as u8,
                is_local_owner,
            };
            behaviour.start(&slot);
        }
        if is_local_owner {
            for behaviour in &mut self.behaviours {
                behaviour.on_local_ownership();
            }
        }
        is_local_owner
    }

    pub fn destroy(&mut self) {
        self.behaviours.clear();
        self.lifecycle = Lifecycle::Destroyed;
    }

    pub fn prefab(&self) -> PrefabRef {
        self.prefab
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn network_id(&self) -> Option<NetworkId> {
        self.network_id
    }

    pub fn owner(&self) -> Option<PeerIdentity> {
        self.owner
    }

    pub fn is_locally_owned(&self) -> bool {
        self.locally_owned
    }

    pub fn behaviour_count(&self) -> usize {
        self.behaviours.len()
    }

    pub fn behaviour_as<B: ReplicatedBehaviour>(&self, index: u8) -> Option<&B> {
        self.behaviours
            .get(usize::from(index))?
            .as_any()
            .downcast_ref::<B>()
    }

    pub fn behaviour_as_mut<B: ReplicatedBehaviour>(&mut self, index: u8) -> Option<&mut B> {
        self.behaviours
            .get_mut(usize::from(index))?
            .as_any_mut()
            .downcast_mut::<B>()
    }

    /// First behaviour of type `B`, with its slot index.
    pub fn find<B: ReplicatedBehaviour>(&self) -> Option<(u8, &B)> {
        self.behaviours
            .iter()
            .enumerate()
            .find_map(|(index, behaviour)| {
                behaviour
                    .as_any()
                    .downcast_ref::<B>()
                    .map(|found| (index as u8, found))
            })
    }

    pub fn find_mut<B: ReplicatedBehaviour>(&mut self) -> Option<(u8, &mut B)> {
        self.behaviours
            .iter_mut()
            .enumerate()
            .find_map(|(index, behaviour)| {
                behaviour
                    .as_any_mut()
                    .downcast_mut::<B>()
                    .map(|found| (index as u8, found))
            })
    }

    pub fn spawn_message(&self) -> Option<Spawn> {
        if self.lifecycle != Lifecycle::Active {
            return None;
        }
        Some(Spawn {
            network_id: self.network_id?,
            prefab: self.prefab,
            owner: self.owner?,
        })
    }

    /// Spawn, then every behaviour's snapshot in index order.
    pub fn snapshot(&self) -> Vec<Outbound> {
        let Some(spawn) = self.spawn_message() else {
            return Vec::new();
        };
        let id = spawn.network_id;

        let mut messages = vec![Outbound::system(spawn)];
        for (index, behaviour) in self.behaviours.iter().enumerate() {
            let address = Address::new(id, index as u8);
            messages.extend(
                behaviour
                    .produce_snapshot()
                    .into_iter()
                    .map(|message| Outbound::addressed(address, message)),
            );
        }
        messages
    }

    /// Returns `false` when the slot does not exist or rejects the message.
    pub fn apply_update(&mut self, index: u8, message: &dyn AnyMessage) -> bool {
        if self.lifecycle != Lifecycle::Active {
            return false;
        }
        match self.behaviours.get_mut(usize::from(index)) {
            Some(behaviour) => behaviour.apply_update(message),
            None => false,
        }
    }

    pub fn collect_updates(&mut self) -> Vec<Outbound> {
        let Some(id) = self.network_id else {
            return Vec::new();
        };
        if !self.locally_owned || self.lifecycle != Lifecycle::Active {
            return Vec::new();
        }

        let mut updates = Vec::new();
        for (index, behaviour) in self.behaviours.iter_mut().enumerate() {
            let address = Address::new(id, index as u8);
            updates.extend(
                behaviour
                    .produce_updates()
                    .into_iter()
                    .map(|message| Outbound::addressed(address, message)),
            );
        }
        updates
    }
}

impl fmt::Debug for ReplicatedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedObject")
            .field("prefab", &self.prefab)
            .field("lifecycle", &self.lifecycle)
            .field("network_id", &self.network_id)
            .field("owner", &self.owner)
            .field("behaviours", &self.behaviours.len())
            .finish()
    }
}

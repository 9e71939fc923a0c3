use std::any::Any;

use crate::identity::NetworkId;
use crate::message::AnyMessage;

/// Where a started behaviour sits: its object, its index in the prefab's
/// behaviour list, and whether this node owns the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub network_id: NetworkId,
    pub index: u8,
    pub is_local_owner: bool,
}

/// One component of a replicated object.
///
/// Construction happens in the prefab factory and must not touch the
/// network. The owning role calls [`ReplicatedBehaviour::start`] once the
/// object has an id, in index order.
pub trait ReplicatedBehaviour: Any {
    fn start(&mut self, slot: &Slot) {
        let _ = slot;
    }

    /// Messages that, replayed on a freshly started copy of this behaviour,
    /// reproduce its externally visible state.
    fn produce_snapshot(&self) -> Vec<Box<dyn AnyMessage>>;

    /// Applies one addressed message. Returns `false` if the type is not one
    /// this behaviour understands. Must be idempotent.
    fn apply_update(&mut self, message: &dyn AnyMessage) -> bool;

    /// Polled on broadcast ticks, only where this node owns the object.
    fn produce_updates(&mut self) -> Vec<Box<dyn AnyMessage>> {
        Vec::new()
    }

    fn on_local_ownership(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

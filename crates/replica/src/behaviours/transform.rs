use std::any::Any;

use glam::{Quat, Vec3};

use crate::behaviour::{ReplicatedBehaviour, Slot};
use crate::message::{AnyMessage, Message, Reliability};
use crate::wire::{WireError, WireReader, WireWriter};

/// Layout: position `3 x f32`, rotation `4 x f32` (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdate {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Message for TransformUpdate {
    const NAME: &'static str = "replica.TransformUpdate";
    const RELIABILITY: Reliability = Reliability::Unreliable;

    fn encode(&self, writer: &mut WireWriter) {
        for value in self.position.to_array() {
            writer.write_f32(value);
        }
        for value in self.rotation.to_array() {
            writer.write_f32(value);
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let position = Vec3::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?);
        let quat = [
            reader.read_f32()?,
            reader.read_f32()?,
            reader.read_f32()?,
            reader.read_f32()?,
        ];
        let rotation = Quat::from_array(quat);
        Ok(Self {
            position,
            rotation: if rotation.length_squared() > 0.0 {
                rotation.normalize()
            } else {
                Quat::IDENTITY
            },
        })
    }
}

/// Broadcast ticks a change keeps being re-sent for.
const SETTLE_TICKS: u8 = 4;

/// An unchanged transform is still sent every this many broadcast ticks.
const KEYFRAME_TICKS: u32 = 30;

/// Replicates a position and orientation from the owner to everyone else.
///
/// The owner writes through [`TransformSync::set`]; a changed transform goes
/// out on the next few broadcast ticks, and a keyframe of the current state
/// follows at a fixed interval so a lost datagram is always repaired. Remote
/// copies take whatever the owner last sent and ignore updates while this
/// node is the owner.
#[derive(Debug, Clone)]
pub struct TransformSync {
    position: Vec3,
    rotation: Quat,
    slot: Option<Slot>,
    pending: u8,
    since_sent: u32,
}

impl Default for TransformSync {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

impl TransformSync {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            slot: None,
            pending: 0,
            since_sent: 0,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn slot(&self) -> Option<&Slot> {
        self.slot.as_ref()
    }

    pub fn is_local_owner(&self) -> bool {
        self.slot.is_some_and(|slot| slot.is_local_owner)
    }

    pub fn set(&mut self, position: Vec3, rotation: Quat) {
        if position != self.position || rotation != self.rotation {
            self.position = position;
            self.rotation = rotation;
            self.pending = SETTLE_TICKS;
        }
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.set(self.position + offset, self.rotation);
    }

    fn state(&self) -> TransformUpdate {
        TransformUpdate {
            position: self.position,
            rotation: self.rotation,
        }
    }
}

impl ReplicatedBehaviour for TransformSync {
    fn start(&mut self, slot: &Slot) {
        self.slot = Some(*slot);
    }

    fn produce_snapshot(&self) -> Vec<Box<dyn AnyMessage>> {
        vec![Box::new(self.state())]
    }

    fn apply_update(&mut self, message: &dyn AnyMessage) -> bool {
        let Some(update) = message.downcast_ref::<TransformUpdate>() else {
            return false;
        };
        if self.is_local_owner() {
            return true;
        }
        self.position = update.position;
        self.rotation = update.rotation;
        true
    }

    fn produce_updates(&mut self) -> Vec<Box<dyn AnyMessage>> {
        self.since_sent += 1;
        if self.pending == 0 && self.since_sent < KEYFRAME_TICKS {
            return Vec::new();
        }
        self.pending = self.pending.saturating_sub(1);
        self.since_sent = 0;
        vec![Box::new(self.state())]
    }

    fn on_local_ownership(&mut self) {
        self.pending = SETTLE_TICKS;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

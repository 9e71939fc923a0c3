//! Content shared by the `replica-host` and `replica-client` binaries. Both
//! sides must build the registry, prefabs and scenes identically.

use std::any::Any;

use glam::Vec3;
use replica::{
    AnyMessage, Message, MessageRegistry, NetworkId, PrefabTable, RegistryError,
    ReplicatedBehaviour, Routing, SceneIndex, SceneObject, StaticScenes, TransformSync,
    TransformUpdate, WireError, WireReader, WireWriter,
};

pub const LOBBY: SceneIndex = SceneIndex(0);
pub const ARENA: SceneIndex = SceneIndex(1);

/// Index of the beacon prefab in [`prefabs`].
pub const BEACON: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub text: String,
}

impl Message for Chat {
    const NAME: &'static str = "demo.Chat";

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_str(&self.text);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            text: reader.read_string()?,
        })
    }
}

/// Sent straight to every other client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u32,
}

impl Message for Ping {
    const NAME: &'static str = "demo.Ping";
    const ROUTING: Routing = Routing::PeerToPeer;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.nonce);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            nonce: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconColor(pub u32);

impl Message for BeaconColor {
    const NAME: &'static str = "demo.BeaconColor";

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(reader.read_u32()?))
    }
}

/// A coloured marker; the owner recolours it and everyone else follows.
#[derive(Debug, Default)]
pub struct Beacon {
    color: u32,
    dirty: bool,
}

impl Beacon {
    pub fn color(&self) -> u32 {
        self.color
    }

    pub fn set_color(&mut self, color: u32) {
        if color != self.color {
            self.color = color;
            self.dirty = true;
        }
    }
}

impl ReplicatedBehaviour for Beacon {
    fn produce_snapshot(&self) -> Vec<Box<dyn AnyMessage>> {
        vec![Box::new(BeaconColor(self.color))]
    }

    fn apply_update(&mut self, message: &dyn AnyMessage) -> bool {
        match message.downcast_ref::<BeaconColor>() {
            Some(BeaconColor(color)) => {
                self.color = *color;
                true
            }
            None => false,
        }
    }

    fn produce_updates(&mut self) -> Vec<Box<dyn AnyMessage>> {
        if !self.dirty {
            return Vec::new();
        }
        self.dirty = false;
        vec![Box::new(BeaconColor(self.color))]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn registry() -> Result<MessageRegistry, RegistryError> {
    MessageRegistry::builder()
        .behaviour_message::<TransformUpdate>()
        .behaviour_message::<BeaconColor>()
        .message::<Chat>()
        .message::<Ping>()
        .build()
}

pub fn prefabs() -> PrefabTable {
    PrefabTable::new()
        .with_player(|| vec![Box::new(TransformSync::default()) as Box<dyn ReplicatedBehaviour>])
        .with_prefab("beacon", || {
            vec![
                Box::new(TransformSync::default()) as Box<dyn ReplicatedBehaviour>,
                Box::new(Beacon::default()),
            ]
        })
}

/// The lobby has two baked beacons; the arena starts empty. Loads take a few
/// pump cycles so the scene-change wait is visible in the logs.
pub fn scenes() -> StaticScenes {
    StaticScenes::new()
        .with_scene(
            LOBBY,
            vec![
                SceneObject {
                    id: NetworkId(1),
                    template: BEACON,
                },
                SceneObject {
                    id: NetworkId(2),
                    template: BEACON,
                },
            ],
        )
        .with_scene(ARENA, Vec::new())
        .with_latency(3)
}

/// A point on a horizontal circle, `seconds` into one revolution every four
/// seconds.
pub fn orbit(seconds: f32, radius: f32) -> Vec3 {
    let angle = seconds * std::f32::consts::FRAC_PI_2;
    Vec3::new(angle.cos() * radius, 0.0, angle.sin() * radius)
}

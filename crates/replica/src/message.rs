use std::any::{Any, TypeId};
use std::fmt::Debug;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::wire::{WireError, WireReader, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    /// Exactly once, in order with other reliable messages on the connection.
    Reliable,
    /// At most once, any order. Only for state that the next update supersedes.
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Routing {
    /// A client's broadcast goes to the host, which relays it.
    ViaHost,
    /// A client's broadcast goes straight to every known peer.
    PeerToPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Client,
}

bitflags! {
    /// Which roles may hand a message to application logic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Scope: u8 {
        const HOST = 1 << 0;
        const CLIENT = 1 << 1;
        const ALL = Self::HOST.bits() | Self::CLIENT.bits();
    }
}

impl Scope {
    pub const HOST_ONLY: Scope = Scope::HOST;
    pub const CLIENT_ONLY: Scope = Scope::CLIENT;

    pub fn admits(self, role: Role) -> bool {
        match role {
            Role::Host => self.contains(Scope::HOST),
            Role::Client => self.contains(Scope::CLIENT),
        }
    }
}

/// A payload type that can travel on the wire.
///
/// `NAME` must be unique across the registry and identical on every build
/// that talks to each other; it feeds the registry fingerprint. `encode` and
/// `decode` must mirror each other field for field.
pub trait Message: Any + Debug {
    const NAME: &'static str;
    const RELIABILITY: Reliability = Reliability::Reliable;
    const SCOPE: Scope = Scope::ALL;
    const ROUTING: Routing = Routing::ViaHost;

    fn encode(&self, writer: &mut WireWriter);

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError>
    where
        Self: Sized;
}

/// Object-safe view of a [`Message`], used once the concrete type is erased.
pub trait AnyMessage: Debug {
    fn name(&self) -> &'static str;
    fn message_type(&self) -> TypeId;
    fn encode_payload(&self, writer: &mut WireWriter);
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<M: Message> AnyMessage for M {
    fn name(&self) -> &'static str {
        M::NAME
    }

    fn message_type(&self) -> TypeId {
        TypeId::of::<M>()
    }

    fn encode_payload(&self, writer: &mut WireWriter) {
        self.encode(writer);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn AnyMessage + '_ {
    pub fn is<M: Message>(&self) -> bool {
        self.message_type() == TypeId::of::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    pub fn downcast<M: Message>(self: Box<Self>) -> Result<Box<M>, Box<dyn Any>> {
        self.into_any().downcast::<M>()
    }
}

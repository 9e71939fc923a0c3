//! Type ↔ id table for every message that can cross the wire.
//!
//! Ids come from declaration order, so host and client must declare the same
//! types in the same order. The registry fingerprint is exchanged during the
//! handshake to catch builds that disagree.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::identity::NetworkId;
use crate::message::{AnyMessage, Message, Reliability, Routing, Scope};
use crate::system::{Destroy, PeerList, SceneChange, SceneLoaded, Spawn};
use crate::wire::{WireError, WireReader, WireWriter};

pub type MessageId = u8;

/// Ids `0..=254` are assignable; `0xFF` stays reserved.
pub const MAX_MESSAGE_TYPES: usize = 255;
/// Spawn, Destroy, SceneChange, SceneLoaded and PeerList hold ids `0..5`.
pub const SYSTEM_MESSAGES: usize = 5;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("message registry holds at most {max} types, {declared} declared")]
    CapacityExceeded { max: usize, declared: usize },
    #[error("message type `{name}` declared twice")]
    DuplicateType { name: &'static str },
    #[error("message name `{name}` used by two types")]
    DuplicateName { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message type `{name}` is not registered")]
    Unregistered { name: &'static str },
    #[error("unknown message id {0}")]
    UnknownId(MessageId),
    #[error("empty frame")]
    Empty,
    #[error("message `{name}` is addressed to a behaviour and needs a target")]
    MissingAddress { name: &'static str },
    #[error("message `{name}` is not a behaviour message")]
    UnexpectedAddress { name: &'static str },
    #[error("malformed `{name}` payload: {source}")]
    Malformed {
        name: &'static str,
        #[source]
        source: WireError,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// `(object, behaviour slot)` target of a behaviour message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub network_id: NetworkId,
    pub behaviour: u8,
}

impl Address {
    pub fn new(network_id: NetworkId, behaviour: u8) -> Self {
        Self {
            network_id,
            behaviour,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_id, self.behaviour)
    }
}

/// Per-type delivery contract declared by the message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub reliability: Reliability,
    pub scope: Scope,
    pub routing: Routing,
}

type DecodeFn = fn(&mut WireReader<'_>) -> Result<Box<dyn AnyMessage>, WireError>;

fn decode_erased<M: Message>(reader: &mut WireReader<'_>) -> Result<Box<dyn AnyMessage>, WireError> {
    Ok(Box::new(M::decode(reader)?))
}

#[derive(Clone)]
pub struct MessageDescriptor {
    pub id: MessageId,
    pub name: &'static str,
    pub delivery: Delivery,
    /// Carries an [`Address`] between the id and the payload.
    pub addressed: bool,
    decode: DecodeFn,
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("delivery", &self.delivery)
            .field("addressed", &self.addressed)
            .finish()
    }
}

/// A decoded frame, detached from the registry.
#[derive(Debug)]
pub struct Decoded {
    pub id: MessageId,
    pub delivery: Delivery,
    pub address: Option<Address>,
    pub message: Box<dyn AnyMessage>,
}

#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub delivery: Delivery,
}

struct Declaration {
    type_id: TypeId,
    name: &'static str,
    delivery: Delivery,
    addressed: bool,
    decode: DecodeFn,
}

/// Declares message types in wire order. Mistakes are collected and
/// reported by [`RegistryBuilder::build`].
pub struct RegistryBuilder {
    declarations: Vec<Declaration>,
    error: Option<RegistryError>,
}

impl RegistryBuilder {
    fn new() -> Self {
        Self {
            declarations: Vec::new(),
            error: None,
        }
        .message::<Spawn>()
        .message::<Destroy>()
        .message::<SceneChange>()
        .message::<SceneLoaded>()
        .message::<PeerList>()
    }

    /// Declares a message routed to application logic.
    pub fn message<M: Message>(self) -> Self {
        self.declare::<M>(false)
    }

    /// Declares a message addressed to a behaviour slot.
    pub fn behaviour_message<M: Message>(self) -> Self {
        self.declare::<M>(true)
    }

    fn declare<M: Message>(mut self, addressed: bool) -> Self {
        let type_id = TypeId::of::<M>();
        if self.declarations.iter().any(|d| d.type_id == type_id) {
            self.error
                .get_or_insert(RegistryError::DuplicateType { name: M::NAME });
            return self;
        }
        if self.declarations.iter().any(|d| d.name == M::NAME) {
            self.error
                .get_or_insert(RegistryError::DuplicateName { name: M::NAME });
            return self;
        }
        self.declarations.push(Declaration {
            type_id,
            name: M::NAME,
            delivery: Delivery {
                reliability: M::RELIABILITY,
                scope: M::SCOPE,
                routing: M::ROUTING,
            },
            addressed,
            decode: decode_erased::<M>,
        });
        self
    }

    pub fn build(self) -> Result<MessageRegistry, RegistryError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.declarations.len() > MAX_MESSAGE_TYPES {
            return Err(RegistryError::CapacityExceeded {
                max: MAX_MESSAGE_TYPES,
                declared: self.declarations.len(),
            });
        }

        let declared = self.declarations.len();
        let mut descriptors = Vec::with_capacity(declared);
        let mut by_type = HashMap::with_capacity(declared);
        for (index, declaration) in self.declarations.into_iter().enumerate() {
            let id = MessageId::try_from(index).map_err(|_| RegistryError::CapacityExceeded {
                max: MAX_MESSAGE_TYPES,
                declared,
            })?;
            by_type.insert(declaration.type_id, id);
            descriptors.push(MessageDescriptor {
                id,
                name: declaration.name,
                delivery: declaration.delivery,
                addressed: declaration.addressed,
                decode: declaration.decode,
            });
        }

        let fingerprint = fingerprint(&descriptors);
        log::debug!(
            "message registry built: {} types, fingerprint {fingerprint:016x}",
            descriptors.len()
        );

        Ok(MessageRegistry {
            descriptors,
            by_type,
            fingerprint,
        })
    }
}

fn fingerprint(descriptors: &[MessageDescriptor]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for descriptor in descriptors {
        feed(descriptor.name.as_bytes());
        feed(&[
            0,
            descriptor.delivery.reliability as u8,
            descriptor.delivery.scope.bits(),
            descriptor.delivery.routing as u8,
            u8::from(descriptor.addressed),
        ]);
    }
    hash
}

#[derive(Debug)]
pub struct MessageRegistry {
    descriptors: Vec<MessageDescriptor>,
    by_type: HashMap<TypeId, MessageId>,
    fingerprint: u64,
}

impl MessageRegistry {
    /// Starts a declaration with the system messages already in place.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn encode_id<M: Message>(&self) -> Option<MessageId> {
        self.by_type.get(&TypeId::of::<M>()).copied()
    }

    pub fn decode_id(&self, id: MessageId) -> Option<&MessageDescriptor> {
        self.descriptors.get(usize::from(id))
    }

    pub fn is_system(&self, id: MessageId) -> bool {
        usize::from(id) < SYSTEM_MESSAGES
    }

    pub fn descriptor_of(&self, message: &dyn AnyMessage) -> Option<&MessageDescriptor> {
        let id = self.by_type.get(&message.message_type())?;
        self.decode_id(*id)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageDescriptor> {
        self.descriptors.iter()
    }

    /// Encodes `[id][address?][payload]`.
    pub fn encode(
        &self,
        address: Option<Address>,
        message: &dyn AnyMessage,
    ) -> Result<Encoded, CodecError> {
        let descriptor = self
            .descriptor_of(message)
            .ok_or(CodecError::Unregistered {
                name: message.name(),
            })?;

        let mut writer = WireWriter::with_capacity(16);
        writer.write_u8(descriptor.id);
        match (descriptor.addressed, address) {
            (true, Some(address)) => {
                writer.write_i32(address.network_id.get());
                writer.write_u8(address.behaviour);
            }
            (true, None) => {
                return Err(CodecError::MissingAddress {
                    name: descriptor.name,
                });
            }
            (false, Some(_)) => {
                return Err(CodecError::UnexpectedAddress {
                    name: descriptor.name,
                });
            }
            (false, None) => {}
        }
        message.encode_payload(&mut writer);

        Ok(Encoded {
            bytes: writer.finish()?,
            delivery: descriptor.delivery,
        })
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded, CodecError> {
        let mut reader = WireReader::new(bytes);
        let id = reader.read_u8().map_err(|_| CodecError::Empty)?;
        let descriptor = self.decode_id(id).ok_or(CodecError::UnknownId(id))?;
        let malformed = |source| CodecError::Malformed {
            name: descriptor.name,
            source,
        };

        let address = if descriptor.addressed {
            Some(Address {
                network_id: NetworkId(reader.read_i32().map_err(malformed)?),
                behaviour: reader.read_u8().map_err(malformed)?,
            })
        } else {
            None
        };
        let message = (descriptor.decode)(&mut reader).map_err(malformed)?;
        reader.finish().map_err(malformed)?;

        Ok(Decoded {
            id,
            delivery: descriptor.delivery,
            address,
            message,
        })
    }
}

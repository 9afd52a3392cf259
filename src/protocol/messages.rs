use std::sync::Arc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use crate::protocol::codec::BitCodec;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::enums::EnumDef;
use crate::protocol::field_type::FieldType;
use crate::protocol::frame::{self, HEADER_SIZE_BYTES, PROTOCOL};
use crate::protocol::packet::Packet;
use crate::protocol::schema::{MultiReply, Schema};
use crate::protocol::value::Value;

/// Message types every device speaks, independent of product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CoreMessage {
    GetService = 2,
    StateService = 3,
    Acknowledgement = 45,
    EchoRequest = 58,
    EchoResponse = 59,
}

impl CoreMessage {
    pub fn id(self) -> u16 {
        self.into()
    }
}

pub fn service_enum() -> Arc<EnumDef> {
    EnumDef::new("Service", &[
        ("UDP", 1),
        ("RESERVED1", 2),
        ("RESERVED2", 3),
        ("RESERVED3", 4),
        ("RESERVED4", 5),
    ])
}

fn core_payloads() -> CodecResult<Vec<Arc<Schema>>> {
    Ok(vec![
        Schema::builder("GetService")
            .message_type(CoreMessage::GetService.id())
            .multi(MultiReply::Unbounded)
            .responds_with(&[CoreMessage::StateService.id()])
            .build()?,
        Schema::builder("StateService")
            .message_type(CoreMessage::StateService.id())
            .field("service", FieldType::uint8().enum_of(service_enum()).allow_unknown())
            .field("port", FieldType::uint32())
            .build()?,
        Schema::builder("Acknowledgement")
            .message_type(CoreMessage::Acknowledgement.id())
            .build()?,
        Schema::builder("EchoRequest")
            .message_type(CoreMessage::EchoRequest.id())
            .responds_with(&[CoreMessage::EchoResponse.id()])
            .field("echoing", FieldType::bytes(64 * 8))
            .build()?,
        Schema::builder("EchoResponse")
            .message_type(CoreMessage::EchoResponse.id())
            .field("echoing", FieldType::bytes(64 * 8))
            .build()?,
    ])
}

/// Knows the schema for every registered message type, and decodes inbound bytes with the right one
pub struct MessageRegistry {
    parent: Arc<Schema>,
    by_type: FxHashMap<u16, Arc<Schema>>,
}

impl MessageRegistry {
    /// A registry that knows no message types: everything decodes with an opaque payload
    pub fn empty() -> CodecResult<MessageRegistry> {
        Ok(MessageRegistry {
            parent: frame::parent_schema()?,
            by_type: FxHashMap::default(),
        })
    }

    pub fn with_core_messages() -> CodecResult<MessageRegistry> {
        let mut result = Self::empty()?;
        for payload in core_payloads()? {
            result.register(&payload)?;
        }
        Ok(result)
    }

    /// Registers a payload schema, returning the full message schema (header + payload)
    pub fn register(&mut self, payload: &Arc<Schema>) -> CodecResult<Arc<Schema>> {
        if self.by_type.contains_key(&payload.message_type()) {
            return Err(CodecError::schema(payload.name(), format!("message type {} is already registered", payload.message_type())));
        }
        let schema = frame::message_schema(payload)?;
        self.by_type.insert(payload.message_type(), schema.clone());
        Ok(schema)
    }

    pub fn parent(&self) -> &Arc<Schema> {
        &self.parent
    }

    pub fn schema(&self, message_type: u16) -> Option<&Arc<Schema>> {
        self.by_type.get(&message_type)
    }

    /// A new packet of a registered message type with the given fields set
    pub fn create(&self, message_type: u16, fields: &[(&str, Value)]) -> CodecResult<Packet> {
        let schema = self.schema(message_type)
            .ok_or_else(|| CodecError::schema("registry", format!("unknown message type {}", message_type)))?;
        let mut packet = Packet::new(schema.clone());
        for (name, value) in fields {
            packet.set(name, value.clone())?;
        }
        Ok(packet)
    }

    /// Decodes with the schema of the message type in the header, falling back to an opaque payload
    ///  for unknown message types or protocols
    pub fn decode(&self, codec: &BitCodec, bytes: &[u8]) -> CodecResult<Packet> {
        if bytes.len() < HEADER_SIZE_BYTES {
            return Err(CodecError::Truncated {
                field: "header".to_string(),
                needed: HEADER_SIZE_BYTES * 8,
                available: bytes.len() * 8,
            });
        }

        let protocol = u16::from_le_bytes([bytes[2], bytes[3]]) & 0x0fff;
        let pkt_type = u16::from_le_bytes([bytes[32], bytes[33]]);

        match self.by_type.get(&pkt_type) {
            Some(schema) if protocol == PROTOCOL => codec.decode_bytes(schema, bytes),
            _ => codec.decode_bytes(&self.parent, bytes),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::enums::EnumMember;
    use crate::protocol::frame::FrameExt;

    fn state_service(registry: &MessageRegistry) -> Packet {
        let mut p = registry.create(CoreMessage::StateService.id(), &[
            ("service", Value::Str("UDP".into())),
            ("port", Value::Uint(56700)),
        ]).unwrap();
        p.set("source", 77u32).unwrap();
        p.set("sequence", 3u8).unwrap();
        p.set("target", "d073d5000001").unwrap();
        p
    }

    #[test]
    fn test_decode_known_message() {
        let registry = MessageRegistry::with_core_messages().unwrap();
        let codec = BitCodec::new(64);
        let bytes = codec.encode_bytes(&state_service(&registry)).unwrap();
        assert_eq!(bytes.len(), 41);
        assert_eq!(bytes[0], 41);

        let decoded = registry.decode(&codec, &bytes).unwrap();
        assert_eq!(decoded.schema().name(), "StateService");
        assert_eq!(decoded.pkt_type().unwrap(), 3);
        assert_eq!(decoded.source().unwrap(), 77);
        assert_eq!(decoded.sequence().unwrap(), 3);
        assert_eq!(decoded.serial().unwrap().to_string(), "d073d5000001");
        assert_eq!(decoded.get("service").unwrap(), Value::Enum(EnumMember::Known { name: "UDP".into(), value: 1 }));
        assert_eq!(decoded.get("port").unwrap(), Value::Uint(56700));
    }

    #[test]
    fn test_unknown_message_type_is_opaque() {
        let registry = MessageRegistry::with_core_messages().unwrap();
        let codec = BitCodec::new(64);
        let mut bytes = codec.encode_bytes(&state_service(&registry)).unwrap().to_vec();
        bytes[32] = 200;

        let decoded = registry.decode(&codec, &bytes).unwrap();
        assert_eq!(decoded.schema().name(), "LIFXPacket");
        assert_eq!(decoded.pkt_type().unwrap(), 200);
        assert_eq!(decoded.payload_bytes().unwrap(), bytes[36..].to_vec());
        assert_eq!(codec.encode_bytes(&decoded).unwrap().to_vec(), bytes);
    }

    #[test]
    fn test_wrong_identity_for_requested_schema() {
        let registry = MessageRegistry::with_core_messages().unwrap();
        let codec = BitCodec::new(64);
        let bytes = codec.encode_bytes(&state_service(&registry)).unwrap();

        let echo = registry.schema(CoreMessage::EchoResponse.id()).unwrap();
        let result = codec.decode_bytes(echo, &bytes);
        assert!(matches!(result, Err(CodecError::Truncated { .. }) | Err(CodecError::WrongIdentity { .. })));

        let ack = registry.schema(CoreMessage::Acknowledgement.id()).unwrap();
        assert!(matches!(codec.decode_bytes(ack, &bytes), Err(CodecError::WrongIdentity { .. })));
    }

    #[test]
    fn test_truncated_header() {
        let registry = MessageRegistry::with_core_messages().unwrap();
        let result = registry.decode(&BitCodec::new(64), &[0; 20]);
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = MessageRegistry::with_core_messages().unwrap();
        let again = Schema::builder("Again").message_type(CoreMessage::GetService.id()).build().unwrap();
        assert!(registry.register(&again).is_err());
    }

    #[test]
    fn test_core_message_ids() {
        assert_eq!(CoreMessage::try_from(45u16).unwrap(), CoreMessage::Acknowledgement);
        assert!(CoreMessage::try_from(46u16).is_err());
    }
}

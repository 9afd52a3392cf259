//! The fixed 36 byte header every packet starts with. All multi-byte fields are little-endian, and
//!  sub-byte fields are packed LSB first:
//!
//! ```ascii
//!  0: size (u16)
//!  2: protocol (12 bits) | addressable (1 bit) | tagged (1 bit) | reserved (2 bits)
//!  4: source (u32)
//!  8: target (6 byte serial + 2 bytes padding)
//! 16: reserved (6 bytes)
//! 22: res_required (1 bit) | ack_required (1 bit) | reserved (6 bits)
//! 23: sequence (u8)
//! 24: reserved timestamp (8 bytes)
//! 32: pkt_type (u16)
//! 34: reserved (u16)
//! 36: payload
//! ```

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::convert::hex_digit;
use crate::protocol::field_type::FieldType;
use crate::protocol::packet::Packet;
use crate::protocol::schema::Schema;
use crate::protocol::value::Value;

pub const PROTOCOL: u16 = 1024;
pub const HEADER_SIZE_BYTES: usize = 36;

/// The 8 byte target field, i.e. a serial with padding
pub type Target = [u8; 8];

/// The target of a broadcast
pub const BLANK_TARGET: Target = [0; 8];

/// A device's identity: its 6 byte address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Serial(pub [u8; 6]);

impl Serial {
    pub fn from_target(target: &[u8]) -> Serial {
        let mut serial = [0u8; 6];
        let n = target.len().min(6);
        serial[..n].copy_from_slice(&target[..n]);
        Serial(serial)
    }

    pub fn target(&self) -> Target {
        let mut target = BLANK_TARGET;
        target[..6].copy_from_slice(&self.0);
        target
    }

    pub fn is_blank(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self)
    }
}

impl FromStr for Serial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.as_bytes().iter()
            .map(|&b| hex_digit(b))
            .collect::<Option<Vec<u8>>>();
        let Some(digits) = digits.filter(|d| d.len() == 12) else {
            anyhow::bail!("serial must be 12 hex digits: {:?}", s);
        };

        let mut serial = [0u8; 6];
        for (b, pair) in serial.iter_mut().zip(digits.chunks(2)) {
            *b = (pair[0] << 4) | pair[1];
        }
        Ok(Serial(serial))
    }
}

fn frame_header(is_child: bool) -> CodecResult<Arc<Schema>> {
    let protocol = FieldType::uint16().size_bits(12);
    let protocol = if is_child { protocol.identity(PROTOCOL) } else { protocol.default(PROTOCOL) };

    Schema::builder("frame_header")
        .field("size", FieldType::uint16()
            .default_fn(|p| Ok(Value::Uint((p.size_bits()? / 8) as u64))))
        .field("protocol", protocol)
        .field("addressable", FieldType::bool().default(true))
        .field("tagged", FieldType::bool()
            .default_fn(|p| Ok(Value::Bool(p.target()? == BLANK_TARGET))))
        .field("reserved1", FieldType::reserved(2))
        .field("source", FieldType::uint32())
        .build()
}

fn frame_address() -> CodecResult<Arc<Schema>> {
    Schema::builder("frame_address")
        .field("target", FieldType::bytes(64).default(Value::Bytes(BLANK_TARGET.to_vec())))
        .field("reserved2", FieldType::reserved(48))
        .field("res_required", FieldType::bool().default(true))
        .field("ack_required", FieldType::bool().default(true))
        .field("reserved3", FieldType::reserved(6))
        .field("sequence", FieldType::uint8())
        .build()
}

fn protocol_header(message_type: Option<u16>) -> CodecResult<Arc<Schema>> {
    let pkt_type = match message_type {
        Some(t) => FieldType::uint16().identity(t),
        None => FieldType::uint16(),
    };
    Schema::builder("protocol_header")
        .field("reserved4", FieldType::reserved(64))
        .field("pkt_type", pkt_type)
        .field("reserved5", FieldType::reserved(16))
        .build()
}

/// The header followed by an opaque payload: any packet decodes with this schema
pub fn parent_schema() -> CodecResult<Arc<Schema>> {
    Schema::builder("LIFXPacket")
        .group("frame_header", frame_header(false)?)
        .group("frame_address", frame_address()?)
        .group("protocol_header", protocol_header(None)?)
        .group("payload", Schema::placeholder("payload"))
        .build()
}

/// Specializes the header for one message type, whose fields follow the header
pub fn message_schema(payload: &Arc<Schema>) -> CodecResult<Arc<Schema>> {
    if payload.message_type() == 0 {
        return Err(CodecError::schema(payload.name(), "a message needs a nonzero message type"));
    }
    Schema::builder(payload.name())
        .message_type(payload.message_type())
        .multi(payload.multi().clone())
        .responds_with(payload.responds_with())
        .group("frame_header", frame_header(true)?)
        .group("frame_address", frame_address()?)
        .group("protocol_header", protocol_header(Some(payload.message_type()))?)
        .group("payload", payload.clone())
        .build()
}

/// Typed access to the header fields
pub trait FrameExt {
    fn protocol(&self) -> CodecResult<u16>;
    fn pkt_type(&self) -> CodecResult<u16>;
    fn source(&self) -> CodecResult<u32>;
    fn sequence(&self) -> CodecResult<u8>;
    fn target(&self) -> CodecResult<Target>;
    fn serial(&self) -> CodecResult<Serial>;
    fn ack_required(&self) -> CodecResult<bool>;
    fn res_required(&self) -> CodecResult<bool>;
}

fn header_uint(packet: &Packet, field: &str, max: u64) -> CodecResult<u64> {
    let value = packet.get_untransformed(field)?;
    value.as_u64()
        .filter(|v| *v <= max)
        .ok_or_else(|| CodecError::bad_conversion(field, format!("{} is not a valid header value", value)))
}

impl FrameExt for Packet {
    fn protocol(&self) -> CodecResult<u16> {
        Ok(header_uint(self, "protocol", 0xfff)? as u16)
    }

    fn pkt_type(&self) -> CodecResult<u16> {
        Ok(header_uint(self, "pkt_type", u16::MAX as u64)? as u16)
    }

    fn source(&self) -> CodecResult<u32> {
        Ok(header_uint(self, "source", u32::MAX as u64)? as u32)
    }

    fn sequence(&self) -> CodecResult<u8> {
        Ok(header_uint(self, "sequence", u8::MAX as u64)? as u8)
    }

    fn target(&self) -> CodecResult<Target> {
        let bits = self.get_bits("target")?;
        let mut target = BLANK_TARGET;
        target.copy_from_slice(&bits.as_bytes()[..8]);
        Ok(target)
    }

    fn serial(&self) -> CodecResult<Serial> {
        Ok(Serial::from_target(&self.target()?))
    }

    fn ack_required(&self) -> CodecResult<bool> {
        self.get_untransformed("ack_required")?.as_bool()
            .ok_or_else(|| CodecError::bad_conversion("ack_required", "not a boolean"))
    }

    fn res_required(&self) -> CodecResult<bool> {
        self.get_untransformed("res_required")?.as_bool()
            .ok_or_else(|| CodecError::bad_conversion("res_required", "not a boolean"))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::codec::BitCodec;

    #[test]
    fn test_header_size() {
        let schema = parent_schema().unwrap();
        assert_eq!(schema.fixed_prefix_bits(), HEADER_SIZE_BYTES * 8);
        assert!(schema.is_parent());
    }

    #[test]
    fn test_header_layout() {
        let schema = parent_schema().unwrap();
        let mut p = Packet::new(schema);
        p.set("source", 0x01020304u32).unwrap();
        p.set("sequence", 9u8).unwrap();
        p.set("pkt_type", 2u16).unwrap();
        p.set("ack_required", false).unwrap();

        let bytes = BitCodec::new(16).encode_bytes(&p).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE_BYTES);
        assert_eq!(&bytes[0..2], &[36, 0]);
        // protocol 1024, addressable, tagged
        assert_eq!(&bytes[2..4], &[0x00, 0x34]);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
        assert_eq!(&bytes[8..16], &[0; 8]);
        assert_eq!(bytes[22], 0x01);
        assert_eq!(bytes[23], 9);
        assert_eq!(&bytes[32..34], &[2, 0]);
    }

    #[test]
    fn test_targeted_header_is_not_tagged() {
        let mut p = Packet::new(parent_schema().unwrap());
        p.set("target", "d073d5001337").unwrap();
        p.set("source", 1u32).unwrap();
        p.set("sequence", 0u8).unwrap();
        p.set("pkt_type", 2u16).unwrap();

        let bytes = BitCodec::new(16).encode_bytes(&p).unwrap();
        assert_eq!(&bytes[2..4], &[0x00, 0x14]);
        assert_eq!(&bytes[8..16], &[0xd0, 0x73, 0xd5, 0x00, 0x13, 0x37, 0, 0]);
        assert_eq!(p.serial().unwrap().to_string(), "d073d5001337");
    }

    #[test]
    fn test_serial_parse() {
        let serial: Serial = "d073d5001337".parse().unwrap();
        assert_eq!(serial.target(), [0xd0, 0x73, 0xd5, 0x00, 0x13, 0x37, 0, 0]);
        assert_eq!("D073D5001337".parse::<Serial>().unwrap(), serial);
        assert!(Serial::default().is_blank());
    }

    #[rstest::rstest]
    #[case::too_short("d073d5")]
    #[case::too_long("d073d500133700")]
    #[case::not_hex("zz73d5001337")]
    #[case::non_ascii("aéaaaaaaaaa")]
    #[case::signs("+f+f+f+f+f+f")]
    #[case::whitespace(" d073d50013 ")]
    fn test_serial_parse_rejects(#[case] s: &str) {
        assert!(s.parse::<Serial>().is_err());
    }

    #[test]
    fn test_message_type_zero_rejected() {
        let payload = Schema::builder("Nothing").build().unwrap();
        assert!(message_schema(&payload).is_err());
    }
}

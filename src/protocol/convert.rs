//! Pure conversions between the three representations of a field value: bits, untransformed
//!  (wire-adjacent) and transformed (ergonomic).

use std::sync::Arc;
use crate::protocol::bits::BitBuf;
use crate::protocol::codec;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::conversion_cache::ConversionCache;
use crate::protocol::field_type::{FieldKind, FieldType, Mapping, Primitive};
use crate::protocol::packet::Packet;
use crate::protocol::schema::Schema;
use crate::protocol::value::Value;

/// The field being converted, and the packet that owns it (for computed sizes, enums and schemas)
pub(crate) struct FieldCtx<'a> {
    pub name: &'a str,
    pub typ: &'a FieldType,
    pub packet: &'a Packet,
}

impl FieldCtx<'_> {
    fn bad(&self, reason: impl Into<String>) -> CodecError {
        CodecError::bad_conversion(self.name, reason)
    }

    fn nested_schema(&self) -> CodecResult<Option<Arc<Schema>>> {
        if let FieldKind::Nested(schema) = &self.typ.kind {
            return Ok(Some(schema.clone()));
        }
        match &self.typ.dynamic {
            Some(f) => Ok(Some(f(self.packet)?)),
            None => Ok(None),
        }
    }

    /// `None` for a field taking whatever bits remain
    pub fn size_bits(&self) -> CodecResult<Option<usize>> {
        self.typ.size_in(self.packet)
    }

    fn sized(&self, bits: BitBuf) -> CodecResult<BitBuf> {
        Ok(match self.size_bits()? {
            Some(size) => bits.sized(size, self.typ.left_cut),
            None => bits,
        })
    }
}

/// Normalizes a value for a primitive into its 64 bit little-endian form, checking its range
pub(crate) fn primitive_canonical(field: &str, p: Primitive, value: &Value, allow_float: bool) -> CodecResult<u64> {
    let bad = |reason: String| CodecError::bad_conversion(field, reason);

    match p {
        Primitive::Bool | Primitive::BoolInt => value.as_bool()
            .map(|b| b as u64)
            .ok_or_else(|| bad(format!("{} is not a boolean", value))),
        Primitive::Float32 => value.as_f64()
            .map(|f| (f as f32).to_bits() as u64)
            .ok_or_else(|| bad(format!("{} is not a number", value))),
        Primitive::Float64 => value.as_f64()
            .map(f64::to_bits)
            .ok_or_else(|| bad(format!("{} is not a number", value))),
        _ => {
            let n: i128 = match value {
                Value::Uint(v) => *v as i128,
                Value::Int(v) => *v as i128,
                Value::Bool(b) => *b as i128,
                Value::Enum(m) => m.value() as i128,
                Value::Float(f) if allow_float => f.round() as i128,
                Value::Float(f) => return Err(bad(format!("float {} not allowed", f))),
                other => return Err(bad(format!("{} is not an integer", other.kind_name()))),
            };

            let bits = p.natural_bits() as u32;
            let (min, max) = if p.is_signed() {
                (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
            }
            else {
                (0, (1i128 << bits) - 1)
            };
            if n < min || n > max {
                return Err(bad(format!("{} is out of range for {:?}", n, p)));
            }
            Ok(n as i64 as u64)
        }
    }
}

pub(crate) fn primitive_bits(p: Primitive, canonical: u64) -> BitBuf {
    let num_bits = p.natural_bits();
    BitBuf::from_bytes(&canonical.to_le_bytes()[..num_bits.div_ceil(8)])
        .sized(num_bits, false)
}

pub(crate) fn primitive_value(p: Primitive, raw: u64) -> Value {
    let num_bits = p.natural_bits() as u32;
    match p {
        Primitive::Bool | Primitive::BoolInt => Value::Bool(raw != 0),
        Primitive::Float32 => Value::Float(f32::from_bits(raw as u32) as f64),
        Primitive::Float64 => Value::Float(f64::from_bits(raw)),
        p if p.is_signed() => {
            let shift = 64 - num_bits;
            Value::Int(((raw << shift) as i64) >> shift)
        }
        _ => Value::Uint(raw),
    }
}

fn parse_hex(field: &str, s: &str) -> CodecResult<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(CodecError::bad_conversion(field, format!("odd length hex string {:?}", s)));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(CodecError::bad_conversion(field, format!("invalid hex string {:?}", s))),
        })
        .collect()
}

pub(crate) fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn cut_at_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

fn struct_to_bits(schema: &Arc<Schema>, value: &Value, cache: Option<&mut ConversionCache>, ctx: &FieldCtx) -> CodecResult<BitBuf> {
    let Value::Struct(entries) = value else {
        return Err(ctx.bad(format!("expected a struct for {}, got {}", schema.name(), value.kind_name())));
    };
    let mut nested = Packet::new(schema.clone());
    for (name, v) in entries {
        nested.set(name, v.clone())?;
    }
    codec::encode_packet(&nested, cache)
}

/// Transformed -> untransformed: apply the pack transform, then the enum / bitmask / version mapping
pub(crate) fn to_untransformed(ctx: &FieldCtx, value: &Value) -> CodecResult<Value> {
    let value = match &ctx.typ.transform {
        Some(t) => (t.pack)(value)?,
        None => value.clone(),
    };

    match &ctx.typ.mapping {
        Mapping::Plain => match (&ctx.typ.kind, value) {
            (FieldKind::Bytes | FieldKind::Reserved, Value::Str(s)) => Ok(Value::Bytes(parse_hex(ctx.name, &s)?)),
            (_, value) => Ok(value),
        },
        Mapping::Enum { source, allow_unknown } => {
            let def = source.resolve(ctx.packet)?;
            Ok(Value::Uint(def.resolve(ctx.name, &value, *allow_unknown)?.value()))
        }
        Mapping::Bitmask(source) => {
            let def = source.resolve(ctx.packet)?;
            Ok(Value::Uint(def.pack_bitmask(ctx.name, &value)?))
        }
        Mapping::VersionNumber => match &value {
            Value::Str(s) => {
                let (major, minor) = s.split_once('.')
                    .ok_or_else(|| ctx.bad(format!("version {:?} is not major.minor", s)))?;
                let major: u64 = major.parse().map_err(|_| ctx.bad(format!("invalid major version in {:?}", s)))?;
                let minor: u64 = minor.parse().map_err(|_| ctx.bad(format!("invalid minor version in {:?}", s)))?;
                if major > 0xffff || minor > 0xffff {
                    return Err(ctx.bad(format!("version {:?} out of range", s)));
                }
                Ok(Value::Uint((major << 16) + minor))
            }
            other => other.as_u64()
                .map(Value::Uint)
                .ok_or_else(|| ctx.bad(format!("{} is not a version number", other.kind_name()))),
        },
    }
}

/// Untransformed -> transformed: the inverse of [to_untransformed]
pub(crate) fn to_transformed(ctx: &FieldCtx, value: &Value) -> CodecResult<Value> {
    let mapped = match &ctx.typ.mapping {
        Mapping::Plain => match (ctx.typ.dynamic.is_some(), value) {
            (true, Value::Bytes(bytes)) => match ctx.nested_schema()? {
                Some(schema) => {
                    let nested = codec::decode_packet(&schema, &BitBuf::from_bytes(bytes), None)?;
                    Value::Struct(nested.values()?)
                }
                None => value.clone(),
            },
            _ => value.clone(),
        },
        Mapping::Enum { source, allow_unknown } => {
            let def = source.resolve(ctx.packet)?;
            Value::Enum(def.resolve(ctx.name, value, *allow_unknown)?)
        }
        Mapping::Bitmask(source) => {
            let def = source.resolve(ctx.packet)?;
            let raw = value.as_u64()
                .ok_or_else(|| ctx.bad(format!("{} is not a bitmask", value.kind_name())))?;
            Value::Bitmask(def.unpack_bitmask(raw)?)
        }
        Mapping::VersionNumber => {
            let raw = value.as_u64()
                .ok_or_else(|| ctx.bad(format!("{} is not a version number", value.kind_name())))?;
            Value::Str(format!("{}.{}", raw >> 16, raw & 0xffff))
        }
    };

    match &ctx.typ.transform {
        Some(t) => (t.unpack)(&mapped),
        None => Ok(mapped),
    }
}

/// Untransformed -> bits, sized to exactly the field's declared width
pub(crate) fn to_bits(ctx: &FieldCtx, value: &Value, cache: Option<&mut ConversionCache>) -> CodecResult<BitBuf> {
    let bits = match &ctx.typ.kind {
        FieldKind::Primitive(p) => {
            let canonical = primitive_canonical(ctx.name, *p, value, ctx.typ.allow_float)?;
            match cache {
                Some(cache) => cache.pack((*p, canonical), || primitive_bits(*p, canonical)),
                None => primitive_bits(*p, canonical),
            }
        }
        FieldKind::Bytes | FieldKind::Reserved => match value {
            Value::Bytes(b) => BitBuf::from_bytes(b),
            Value::Str(s) => BitBuf::from_bytes(&parse_hex(ctx.name, s)?),
            Value::Struct(_) => match ctx.nested_schema()? {
                Some(schema) => struct_to_bits(&schema, value, cache, ctx)?,
                None => return Err(ctx.bad("struct value for a field without a schema")),
            },
            other => return Err(ctx.bad(format!("{} is not bytes", other.kind_name()))),
        },
        FieldKind::String => match value {
            Value::Str(s) => BitBuf::from_bytes(s.as_bytes()),
            Value::Bytes(b) => BitBuf::from_bytes(b),
            other => return Err(ctx.bad(format!("{} is not a string", other.kind_name()))),
        },
        FieldKind::Csv => match value {
            Value::List(items) => BitBuf::from_bytes(items.join(",").as_bytes()),
            Value::Str(s) => BitBuf::from_bytes(s.as_bytes()),
            other => return Err(ctx.bad(format!("{} is not a list", other.kind_name()))),
        },
        FieldKind::Nested(schema) => struct_to_bits(schema, value, cache, ctx)?,
    };
    ctx.sized(bits)
}

/// Bits -> untransformed
pub(crate) fn from_bits(ctx: &FieldCtx, bits: &BitBuf, cache: Option<&mut ConversionCache>) -> CodecResult<Value> {
    Ok(match &ctx.typ.kind {
        FieldKind::Primitive(p) => {
            let raw = bits.sized(p.natural_bits(), false).to_u64();
            match cache {
                Some(cache) => cache.unpack((*p, raw), || primitive_value(*p, raw)),
                None => primitive_value(*p, raw),
            }
        }
        FieldKind::Bytes | FieldKind::Reserved => Value::Bytes(bits.as_bytes().to_vec()),
        FieldKind::String => Value::Str(String::from_utf8_lossy(cut_at_nul(bits.as_bytes())).into_owned()),
        FieldKind::Csv => {
            let s = String::from_utf8_lossy(cut_at_nul(bits.as_bytes())).into_owned();
            if s.is_empty() {
                Value::List(Vec::new())
            }
            else {
                Value::List(s.split(',').map(str::to_string).collect())
            }
        }
        FieldKind::Nested(schema) => {
            let nested = codec::decode_packet(schema, bits, cache)?;
            Value::Struct(nested.values()?)
        }
    })
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::uint8_max(Primitive::Uint8, Value::Uint(255), Some(255))]
    #[case::uint8_overflow(Primitive::Uint8, Value::Uint(256), None)]
    #[case::uint16_negative(Primitive::Uint16, Value::Int(-1), None)]
    #[case::int8_negative(Primitive::Int8, Value::Int(-1), Some(u64::MAX))]
    #[case::int8_underflow(Primitive::Int8, Value::Int(-129), None)]
    #[case::bool_from_int(Primitive::Bool, Value::Uint(1), Some(1))]
    #[case::bool_from_two(Primitive::Bool, Value::Uint(2), None)]
    #[case::float_into_int(Primitive::Uint16, Value::Float(1.5), None)]
    #[case::string_into_int(Primitive::Uint16, Value::Str("1".into()), None)]
    fn test_primitive_canonical(#[case] p: Primitive, #[case] value: Value, #[case] expected: Option<u64>) {
        assert_eq!(primitive_canonical("f", p, &value, false).ok(), expected);
    }

    #[test]
    fn test_allow_float_rounds() {
        assert_eq!(primitive_canonical("f", Primitive::Uint16, &Value::Float(1.6), true).unwrap(), 2);
    }

    #[rstest]
    #[case::uint16(Primitive::Uint16, 0x0400, &[0x00, 0x04])]
    #[case::int16_negative(Primitive::Int16, (-2i64) as u64, &[0xfe, 0xff])]
    #[case::bool_int(Primitive::BoolInt, 1, &[0x01])]
    fn test_primitive_bits_little_endian(#[case] p: Primitive, #[case] canonical: u64, #[case] expected: &[u8]) {
        assert_eq!(primitive_bits(p, canonical).as_bytes(), expected);
    }

    #[rstest]
    #[case::int8(Primitive::Int8, 0xff, Value::Int(-1))]
    #[case::int32(Primitive::Int32, 0x8000_0000, Value::Int(i32::MIN as i64))]
    #[case::uint32(Primitive::Uint32, 0x8000_0000, Value::Uint(0x8000_0000))]
    #[case::float32(Primitive::Float32, 1.5f32.to_bits() as u64, Value::Float(1.5))]
    #[case::bool(Primitive::Bool, 1, Value::Bool(true))]
    fn test_primitive_value(#[case] p: Primitive, #[case] raw: u64, #[case] expected: Value) {
        assert_eq!(primitive_value(p, raw), expected);
    }

    #[rstest]
    #[case::plain("d073d5000001", Some(vec![0xd0, 0x73, 0xd5, 0, 0, 1]))]
    #[case::odd("d07", None)]
    #[case::invalid("zz", None)]
    #[case::uppercase("D073", Some(vec![0xd0, 0x73]))]
    #[case::non_ascii("aéa", None)]
    #[case::sign("+f", None)]
    fn test_parse_hex(#[case] s: &str, #[case] expected: Option<Vec<u8>>) {
        assert_eq!(parse_hex("f", s).ok(), expected);
    }

    #[test]
    fn test_cut_at_nul() {
        assert_eq!(cut_at_nul(b"abc\0def"), b"abc");
        assert_eq!(cut_at_nul(b"abc"), b"abc");
    }
}

use std::sync::{Arc, Mutex, PoisonError};
use bytes::Bytes;
use tracing::trace;
use crate::protocol::bits::BitBuf;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::conversion_cache::ConversionCache;
use crate::protocol::convert;
use crate::protocol::field_type::FieldKind;
use crate::protocol::packet::{FieldValue, Packet};
use crate::protocol::schema::Schema;

/// Converts between [Packet]s and their exact bit representation.
///
/// Each codec owns its conversion cache; there is no process-wide cache.
pub struct BitCodec {
    cache: Mutex<ConversionCache>,
}

impl BitCodec {
    pub fn new(cache_capacity: usize) -> BitCodec {
        BitCodec {
            cache: Mutex::new(ConversionCache::new(cache_capacity)),
        }
    }

    pub fn encode(&self, packet: &Packet) -> CodecResult<BitBuf> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        encode_packet(packet, Some(&mut cache))
    }

    pub fn encode_bytes(&self, packet: &Packet) -> CodecResult<Bytes> {
        Ok(Bytes::from(self.encode(packet)?.into_bytes()))
    }

    pub fn decode(&self, schema: &Arc<Schema>, bits: &BitBuf) -> CodecResult<Packet> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        decode_packet(schema, bits, Some(&mut cache))
    }

    pub fn decode_bytes(&self, schema: &Arc<Schema>, bytes: &[u8]) -> CodecResult<Packet> {
        self.decode(schema, &BitBuf::from_bytes(bytes))
    }

    /// (hits, misses) of the conversion cache
    pub fn cache_stats(&self) -> (u64, u64) {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        (cache.hits(), cache.misses())
    }
}

/// Concatenates every field's bits in schema order. A parent packet's payload is appended as is.
pub(crate) fn encode_packet(packet: &Packet, mut cache: Option<&mut ConversionCache>) -> CodecResult<BitBuf> {
    let mut result = BitBuf::with_capacity(packet.schema().fixed_prefix_bits());
    for idx in 0..packet.schema().fields().len() {
        result.extend(&packet.field_bits(idx, cache.as_deref_mut())?);
    }
    Ok(result)
}

pub(crate) fn decode_packet(schema: &Arc<Schema>, bits: &BitBuf, mut cache: Option<&mut ConversionCache>) -> CodecResult<Packet> {
    let mut packet = Packet::new(schema.clone());
    let mut pos = 0;

    for (idx, field) in schema.fields().iter().enumerate() {
        let Some(size) = field.typ.size_in(&packet)? else {
            packet.set_decoded(idx, vec![FieldValue::Raw(bits.slice(pos, bits.len()))]);
            pos = bits.len();
            continue;
        };

        let count = packet.element_count(idx)?;
        let needed = size * count;
        if pos + needed > bits.len() {
            return Err(CodecError::Truncated {
                field: field.name.clone(),
                needed: pos + needed,
                available: bits.len(),
            });
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let chunk = bits.slice(pos, pos + size);
            pos += size;

            // primitives go through the cache right away, everything else is converted on demand
            values.push(match (&field.typ.kind, cache.as_deref_mut()) {
                (FieldKind::Primitive(_), Some(cache)) => {
                    FieldValue::Untransformed(convert::from_bits(&packet.ctx(idx), &chunk, Some(cache))?)
                }
                _ => FieldValue::Raw(chunk),
            });
        }
        packet.set_decoded(idx, values);

        if field.typ.identity {
            check_identity(&packet, &field.name, &bits.slice(pos - needed, pos))?;
        }
    }

    if pos < bits.len() {
        trace!("{} trailing bits after decoding {:?}", bits.len() - pos, schema);
    }
    Ok(packet)
}

fn check_identity(packet: &Packet, field: &str, decoded: &BitBuf) -> CodecResult<()> {
    let expected = packet.get_bits(field)?;
    if &expected != decoded {
        let as_value = |bits: &BitBuf| format!("{:?}", bits);
        return Err(CodecError::WrongIdentity {
            field: field.to_string(),
            expected: as_value(&expected),
            got: as_value(decoded),
        });
    }
    Ok(())
}

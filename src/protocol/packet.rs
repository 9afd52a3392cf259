use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use crate::protocol::bits::BitBuf;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::conversion_cache::ConversionCache;
use crate::protocol::convert::{self, FieldCtx};
use crate::protocol::field_type::{FieldKind, Mapping};
use crate::protocol::schema::Schema;
use crate::protocol::value::Value;

/// The authoritative representation of one field instance. The other representations are derived
///  from it on demand by pure conversions; writing a new representation replaces it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Unset,
    Raw(BitBuf),
    Untransformed(Value),
    Transformed(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Single(FieldValue),
    /// elements past the end of the vec are unset
    Multiple(Vec<FieldValue>),
}

/// A message instance: one value per field of its schema. Cloning is a deep copy.
#[derive(Clone)]
pub struct Packet {
    schema: Arc<Schema>,
    slots: Vec<Slot>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.schema.name())?;
        for (i, field) in self.schema.fields().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.get(&field.name) {
                Ok(v) => write!(f, "{}={}", field.name, v)?,
                Err(_) => write!(f, "{}=?", field.name)?,
            }
        }
        write!(f, ")")
    }
}

/// Packets are equal if they have the same schema and their fields have the same values, regardless
///  of which representation is authoritative
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        if self.schema.name() != other.schema.name() || self.schema.message_type() != other.schema.message_type() {
            return false;
        }
        match (self.values(), other.values()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Packet {
    pub fn new(schema: Arc<Schema>) -> Packet {
        let slots = schema.fields().iter()
            .map(|f| if f.typ.is_multiple() {
                Slot::Multiple(Vec::new())
            }
            else {
                Slot::Single(FieldValue::Unset)
            })
            .collect();
        Packet { schema, slots }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn index_of(&self, name: &str) -> CodecResult<usize> {
        self.schema.field_index(name)
            .ok_or_else(|| CodecError::UnknownField(name.to_string()))
    }

    pub(crate) fn ctx(&self, idx: usize) -> FieldCtx<'_> {
        let field = &self.schema.fields()[idx];
        FieldCtx { name: &field.name, typ: &field.typ, packet: self }
    }

    pub(crate) fn element_count(&self, idx: usize) -> CodecResult<usize> {
        self.schema.fields()[idx].typ.count_in(self)
    }

    fn elements(&self, idx: usize) -> CodecResult<Vec<FieldValue>> {
        match &self.slots[idx] {
            Slot::Single(fv) => Ok(vec![fv.clone()]),
            Slot::Multiple(values) => {
                let mut result = values.clone();
                result.resize(self.element_count(idx)?, FieldValue::Unset);
                Ok(result)
            }
        }
    }

    /// The transformed value that stands in for an unset or overridden field, or `None` if the field
    ///  falls back to zeros
    fn fallback(&self, idx: usize, fv: &FieldValue, is_element: bool) -> CodecResult<Option<FieldValue>> {
        let field = &self.schema.fields()[idx];
        if let Some(o) = &field.typ.override_value {
            return Ok(Some(FieldValue::Transformed(o.resolve(self)?)));
        }
        if fv != &FieldValue::Unset {
            return Ok(Some(fv.clone()));
        }
        if let Some(d) = &field.typ.default {
            return Ok(Some(FieldValue::Transformed(d.resolve(self)?)));
        }
        if field.typ.optional || is_element || field.is_payload || matches!(field.typ.kind, FieldKind::Reserved) {
            return Ok(None);
        }
        Err(CodecError::Unspecified { field: field.name.clone() })
    }

    fn zeros(&self, idx: usize) -> CodecResult<BitBuf> {
        Ok(BitBuf::zeros(self.ctx(idx).size_bits()?.unwrap_or(0)))
    }

    pub(crate) fn element_untransformed(&self, idx: usize, fv: &FieldValue, is_element: bool, cache: Option<&mut ConversionCache>) -> CodecResult<Value> {
        let ctx = self.ctx(idx);
        match self.fallback(idx, fv, is_element)? {
            None => convert::from_bits(&ctx, &self.zeros(idx)?, cache),
            Some(FieldValue::Raw(bits)) => convert::from_bits(&ctx, &bits, cache),
            Some(FieldValue::Untransformed(v)) => Ok(v),
            Some(FieldValue::Transformed(v)) => convert::to_untransformed(&ctx, &v),
            Some(FieldValue::Unset) => Err(CodecError::Unspecified { field: ctx.name.to_string() }),
        }
    }

    fn element_transformed(&self, idx: usize, fv: &FieldValue, is_element: bool) -> CodecResult<Value> {
        let typ = &self.schema.fields()[idx].typ;
        if let Some(FieldValue::Transformed(v)) = self.fallback(idx, fv, is_element)? {
            // mapped values are normalized, e.g. a member name to the enum member
            if matches!(typ.mapping, Mapping::Plain) {
                return Ok(v);
            }
        }
        let untransformed = self.element_untransformed(idx, fv, is_element, None)?;
        convert::to_transformed(&self.ctx(idx), &untransformed)
    }

    pub(crate) fn element_bits(&self, idx: usize, fv: &FieldValue, is_element: bool, mut cache: Option<&mut ConversionCache>) -> CodecResult<BitBuf> {
        let ctx = self.ctx(idx);
        match self.fallback(idx, fv, is_element)? {
            None => self.zeros(idx),
            Some(FieldValue::Raw(bits)) => Ok(match ctx.size_bits()? {
                Some(size) => bits.sized(size, ctx.typ.left_cut),
                None => bits,
            }),
            Some(other) => {
                let untransformed = self.element_untransformed(idx, &other, is_element, cache.as_deref_mut())?;
                convert::to_bits(&ctx, &untransformed, cache)
            }
        }
    }

    /// The bits of a field (all elements concatenated for a repeated field)
    pub(crate) fn field_bits(&self, idx: usize, mut cache: Option<&mut ConversionCache>) -> CodecResult<BitBuf> {
        let is_multiple = self.schema.fields()[idx].typ.is_multiple();
        let mut result = BitBuf::new();
        for fv in self.elements(idx)? {
            result.extend(&self.element_bits(idx, &fv, is_multiple, cache.as_deref_mut())?);
        }
        Ok(result)
    }

    /// The ergonomic value of a field, or a `Struct` of all fields of a group
    pub fn get(&self, name: &str) -> CodecResult<Value> {
        if let Some(indices) = self.schema.group_indices(name) {
            let mut entries = Vec::new();
            for &idx in indices {
                let field_name = &self.schema.fields()[idx].name;
                entries.push((field_name.clone(), self.get(field_name)?));
            }
            return Ok(Value::Struct(entries));
        }

        let idx = self.index_of(name)?;
        match &self.slots[idx] {
            Slot::Single(fv) => self.element_transformed(idx, fv, false),
            Slot::Multiple(_) => {
                let items = self.elements(idx)?.iter()
                    .map(|fv| self.element_transformed(idx, fv, true))
                    .collect::<CodecResult<Vec<_>>>()?;
                Ok(Value::Array(items))
            }
        }
    }

    /// The wire-adjacent value of a field, e.g. an integer instead of an enum member
    pub fn get_untransformed(&self, name: &str) -> CodecResult<Value> {
        let idx = self.index_of(name)?;
        match &self.slots[idx] {
            Slot::Single(fv) => self.element_untransformed(idx, fv, false, None),
            Slot::Multiple(_) => {
                let items = self.elements(idx)?.iter()
                    .map(|fv| self.element_untransformed(idx, fv, true, None))
                    .collect::<CodecResult<Vec<_>>>()?;
                Ok(Value::Array(items))
            }
        }
    }

    pub fn get_bits(&self, name: &str) -> CodecResult<BitBuf> {
        let idx = self.index_of(name)?;
        self.field_bits(idx, None)
    }

    pub fn is_set(&self, name: &str) -> bool {
        match self.schema.field_index(name) {
            Some(idx) => match &self.slots[idx] {
                Slot::Single(fv) => fv != &FieldValue::Unset,
                Slot::Multiple(values) => values.iter().any(|fv| fv != &FieldValue::Unset),
            },
            None => false,
        }
    }

    fn set_slot(&mut self, name: &str, value: Value, wrap: fn(Value) -> FieldValue) -> CodecResult<()> {
        if self.schema.group_indices(name).is_some() {
            let Value::Struct(entries) = value else {
                return Err(CodecError::bad_conversion(name, "a group can only be set from a struct"));
            };
            for (field_name, v) in entries {
                self.set_slot(&field_name, v, wrap)?;
            }
            return Ok(());
        }

        let idx = self.index_of(name)?;
        if !self.schema.fields()[idx].typ.is_multiple() {
            self.slots[idx] = Slot::Single(wrap(value));
            return Ok(());
        }

        let Value::Array(items) = value else {
            return Err(CodecError::bad_conversion(name, "a repeated field can only be set from an array"));
        };
        let expected = self.element_count(idx)?;
        if items.len() > expected {
            return Err(CodecError::WrongCount { field: name.to_string(), expected, got: items.len() });
        }
        self.slots[idx] = Slot::Multiple(items.into_iter().map(wrap).collect());
        Ok(())
    }

    /// Sets the ergonomic value of a field (or of every field in a group, from a `Struct`)
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> CodecResult<()> {
        self.set_slot(name, value.into(), FieldValue::Transformed)
    }

    pub fn set_untransformed(&mut self, name: &str, value: impl Into<Value>) -> CodecResult<()> {
        self.set_slot(name, value.into(), FieldValue::Untransformed)
    }

    pub fn set_bits(&mut self, name: &str, bits: BitBuf) -> CodecResult<()> {
        let idx = self.index_of(name)?;
        if self.schema.fields()[idx].typ.is_multiple() {
            return Err(CodecError::bad_conversion(name, "bits of a repeated field must be set per element"));
        }
        self.slots[idx] = Slot::Single(FieldValue::Raw(bits));
        Ok(())
    }

    pub fn unset(&mut self, name: &str) -> CodecResult<()> {
        let idx = self.index_of(name)?;
        self.slots[idx] = match self.slots[idx] {
            Slot::Single(_) => Slot::Single(FieldValue::Unset),
            Slot::Multiple(_) => Slot::Multiple(Vec::new()),
        };
        Ok(())
    }

    /// Builder-style [Packet::set]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> CodecResult<Packet> {
        self.set(name, value)?;
        Ok(self)
    }

    pub(crate) fn set_decoded(&mut self, idx: usize, values: Vec<FieldValue>) {
        self.slots[idx] = if self.schema.fields()[idx].typ.is_multiple() {
            Slot::Multiple(values)
        }
        else {
            Slot::Single(values.into_iter().next().unwrap_or_default())
        };
    }

    /// The transformed values of all fields, in schema order
    pub fn values(&self) -> CodecResult<Vec<(String, Value)>> {
        self.schema.fields().iter()
            .map(|f| Ok((f.name.clone(), self.get(&f.name)?)))
            .collect()
    }

    /// The size this packet encodes to
    pub fn size_bits(&self) -> CodecResult<usize> {
        let mut result = 0;
        for (idx, field) in self.schema.fields().iter().enumerate() {
            result += match field.typ.size_in(self)? {
                Some(size) => size * self.element_count(idx)?,
                None => self.field_bits(idx, None)?.len(),
            };
        }
        Ok(result)
    }

    /// The opaque trailing payload of a parent packet
    pub fn payload_bytes(&self) -> CodecResult<Vec<u8>> {
        match self.schema.fields().last() {
            Some(f) if f.is_payload => {
                let idx = self.schema.fields().len() - 1;
                Ok(self.field_bits(idx, None)?.into_bytes())
            }
            _ => Err(CodecError::bad_conversion(self.schema.name(), "not a parent schema")),
        }
    }
}

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::enums::EnumDef;
use crate::protocol::packet::Packet;
use crate::protocol::schema::Schema;
use crate::protocol::value::Value;

/// A function evaluated against the packet that owns a field, e.g. to derive a length from an
///  earlier 'count' field
pub type PacketFn<T> = Arc<dyn Fn(&Packet) -> CodecResult<T> + Send + Sync>;

pub type ValueFn = Arc<dyn Fn(&Value) -> CodecResult<Value> + Send + Sync>;

/// Fixed-width numeric wire shapes, all little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// a single bit
    Bool,
    /// a full byte holding 0 or 1
    BoolInt,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl Primitive {
    pub fn natural_bits(&self) -> usize {
        match self {
            Primitive::Bool => 1,
            Primitive::BoolInt | Primitive::Int8 | Primitive::Uint8 => 8,
            Primitive::Int16 | Primitive::Uint16 => 16,
            Primitive::Int32 | Primitive::Uint32 | Primitive::Float32 => 32,
            Primitive::Int64 | Primitive::Uint64 | Primitive::Float64 => 64,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Primitive::Bool | Primitive::BoolInt | Primitive::Float32 | Primitive::Float64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64)
    }
}

#[derive(Clone)]
pub enum FieldKind {
    Primitive(Primitive),
    Bytes,
    /// padding, zero unless explicitly set
    Reserved,
    /// utf-8 text, NUL-padded on the wire
    String,
    /// a comma-separated list of strings
    Csv,
    /// an element of a repeated nested structure
    Nested(Arc<Schema>),
}

impl Debug for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Primitive(p) => write!(f, "{:?}", p),
            FieldKind::Bytes => write!(f, "Bytes"),
            FieldKind::Reserved => write!(f, "Reserved"),
            FieldKind::String => write!(f, "String"),
            FieldKind::Csv => write!(f, "Csv"),
            FieldKind::Nested(schema) => write!(f, "Nested({})", schema.name()),
        }
    }
}

#[derive(Clone)]
pub enum FieldSize {
    Fixed(usize),
    Computed(PacketFn<usize>),
    /// whatever is left of the buffer - only valid for the last field of a schema
    Remaining,
}

#[derive(Clone)]
pub enum Repeat {
    Fixed(usize),
    Computed(PacketFn<usize>),
}

#[derive(Clone)]
pub enum EnumSource {
    Static(Arc<EnumDef>),
    Computed(PacketFn<Arc<EnumDef>>),
}

impl EnumSource {
    pub fn resolve(&self, packet: &Packet) -> CodecResult<Arc<EnumDef>> {
        match self {
            EnumSource::Static(def) => Ok(def.clone()),
            EnumSource::Computed(f) => f(packet),
        }
    }
}

#[derive(Clone)]
pub enum Mapping {
    Plain,
    Enum { source: EnumSource, allow_unknown: bool },
    Bitmask(EnumSource),
    /// `"major.minor"` <-> `(major << 16) + minor`
    VersionNumber,
}

#[derive(Clone)]
pub enum ValueSource {
    Value(Value),
    Computed(PacketFn<Value>),
}

impl ValueSource {
    pub fn resolve(&self, packet: &Packet) -> CodecResult<Value> {
        match self {
            ValueSource::Value(v) => Ok(v.clone()),
            ValueSource::Computed(f) => f(packet),
        }
    }
}

#[derive(Clone)]
pub struct Transform {
    pub pack: ValueFn,
    pub unpack: ValueFn,
}

/// Immutable description of one field's wire shape and value semantics. Variants are derived by
///  the builder-style methods, which consume and return a modified copy.
#[derive(Clone)]
pub struct FieldType {
    pub(crate) kind: FieldKind,
    pub(crate) size: FieldSize,
    pub(crate) left_cut: bool,
    pub(crate) default: Option<ValueSource>,
    pub(crate) override_value: Option<ValueSource>,
    pub(crate) identity: bool,
    pub(crate) optional: bool,
    pub(crate) transform: Option<Transform>,
    pub(crate) mapping: Mapping,
    pub(crate) mapping_conflict: bool,
    pub(crate) dynamic: Option<PacketFn<Arc<Schema>>>,
    pub(crate) multiple: Option<Repeat>,
    pub(crate) allow_float: bool,
}

impl Debug for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldType({:?}", self.kind)?;
        if let FieldSize::Fixed(bits) = self.size {
            write!(f, ", {} bits", bits)?;
        }
        write!(f, ")")
    }
}

impl FieldType {
    fn of(kind: FieldKind, size: FieldSize) -> FieldType {
        FieldType {
            kind,
            size,
            left_cut: false,
            default: None,
            override_value: None,
            identity: false,
            optional: false,
            transform: None,
            mapping: Mapping::Plain,
            mapping_conflict: false,
            dynamic: None,
            multiple: None,
            allow_float: false,
        }
    }

    pub fn primitive(p: Primitive) -> FieldType {
        Self::of(FieldKind::Primitive(p), FieldSize::Fixed(p.natural_bits()))
    }

    pub fn bool() -> FieldType { Self::primitive(Primitive::Bool) }
    pub fn bool_int() -> FieldType { Self::primitive(Primitive::BoolInt) }
    pub fn int8() -> FieldType { Self::primitive(Primitive::Int8) }
    pub fn uint8() -> FieldType { Self::primitive(Primitive::Uint8) }
    pub fn int16() -> FieldType { Self::primitive(Primitive::Int16) }
    pub fn uint16() -> FieldType { Self::primitive(Primitive::Uint16) }
    pub fn int32() -> FieldType { Self::primitive(Primitive::Int32) }
    pub fn uint32() -> FieldType { Self::primitive(Primitive::Uint32) }
    pub fn int64() -> FieldType { Self::primitive(Primitive::Int64) }
    pub fn uint64() -> FieldType { Self::primitive(Primitive::Uint64) }
    pub fn float32() -> FieldType { Self::primitive(Primitive::Float32) }
    pub fn float64() -> FieldType { Self::primitive(Primitive::Float64) }

    pub fn bytes(size_bits: usize) -> FieldType {
        Self::of(FieldKind::Bytes, FieldSize::Fixed(size_bits))
    }

    pub fn bytes_remaining() -> FieldType {
        Self::of(FieldKind::Bytes, FieldSize::Remaining)
    }

    pub fn reserved(size_bits: usize) -> FieldType {
        Self::of(FieldKind::Reserved, FieldSize::Fixed(size_bits))
    }

    pub fn string(size_bits: usize) -> FieldType {
        Self::of(FieldKind::String, FieldSize::Fixed(size_bits))
    }

    pub fn csv(size_bits: usize) -> FieldType {
        Self::of(FieldKind::Csv, FieldSize::Fixed(size_bits))
    }

    /// A nested structure, typically combined with [FieldType::multiple]
    pub fn nested(schema: Arc<Schema>) -> FieldType {
        let size = match schema.fixed_size_bits() {
            Some(bits) => FieldSize::Fixed(bits),
            None => {
                let s = schema.clone();
                FieldSize::Computed(Arc::new(move |_| s.fixed_size_bits()
                    .ok_or_else(|| CodecError::schema(s.name(), "nested schema must have a fixed size"))))
            }
        };
        Self::of(FieldKind::Nested(schema), size)
    }

    pub fn size_bits(mut self, size_bits: usize) -> FieldType {
        self.size = FieldSize::Fixed(size_bits);
        self
    }

    pub fn size_fn(mut self, f: impl Fn(&Packet) -> CodecResult<usize> + Send + Sync + 'static) -> FieldType {
        self.size = FieldSize::Computed(Arc::new(f));
        self
    }

    /// Truncation drops leading bits and padding is prepended
    pub fn left_cut(mut self) -> FieldType {
        self.left_cut = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> FieldType {
        self.default = Some(ValueSource::Value(value.into()));
        self
    }

    pub fn default_fn(mut self, f: impl Fn(&Packet) -> CodecResult<Value> + Send + Sync + 'static) -> FieldType {
        self.default = Some(ValueSource::Computed(Arc::new(f)));
        self
    }

    /// The field always has this value, regardless of what was set
    pub fn override_value(mut self, value: impl Into<Value>) -> FieldType {
        self.override_value = Some(ValueSource::Value(value.into()));
        self
    }

    pub fn override_fn(mut self, f: impl Fn(&Packet) -> CodecResult<Value> + Send + Sync + 'static) -> FieldType {
        self.override_value = Some(ValueSource::Computed(Arc::new(f)));
        self
    }

    /// An override that decoding verifies: a buffer with a different value in this field does
    ///  not belong to the schema.
    pub fn identity(self, value: impl Into<Value>) -> FieldType {
        let mut result = self.override_value(value);
        result.identity = true;
        result
    }

    /// An unset optional field is encoded as zeros
    pub fn optional(mut self) -> FieldType {
        self.optional = true;
        self
    }

    pub fn transform(
        mut self,
        pack: impl Fn(&Value) -> CodecResult<Value> + Send + Sync + 'static,
        unpack: impl Fn(&Value) -> CodecResult<Value> + Send + Sync + 'static,
    ) -> FieldType {
        self.transform = Some(Transform { pack: Arc::new(pack), unpack: Arc::new(unpack) });
        self
    }

    fn with_mapping(mut self, mapping: Mapping) -> FieldType {
        if !matches!(self.mapping, Mapping::Plain) {
            self.mapping_conflict = true;
        }
        self.mapping = mapping;
        self
    }

    pub fn enum_of(self, def: Arc<EnumDef>) -> FieldType {
        self.with_mapping(Mapping::Enum { source: EnumSource::Static(def), allow_unknown: false })
    }

    pub fn enum_fn(self, f: impl Fn(&Packet) -> CodecResult<Arc<EnumDef>> + Send + Sync + 'static) -> FieldType {
        self.with_mapping(Mapping::Enum { source: EnumSource::Computed(Arc::new(f)), allow_unknown: false })
    }

    /// Values outside the enum decode to [crate::protocol::enums::EnumMember::Unknown] instead of
    ///  failing. Must follow `enum_of` / `enum_fn`.
    pub fn allow_unknown(mut self) -> FieldType {
        if let Mapping::Enum { allow_unknown, .. } = &mut self.mapping {
            *allow_unknown = true;
        }
        self
    }

    pub fn bitmask(self, def: Arc<EnumDef>) -> FieldType {
        self.with_mapping(Mapping::Bitmask(EnumSource::Static(def)))
    }

    pub fn version_number(self) -> FieldType {
        self.with_mapping(Mapping::VersionNumber)
    }

    /// The field's bytes are a structure whose schema depends on the packet
    pub fn dynamic(mut self, f: impl Fn(&Packet) -> CodecResult<Arc<Schema>> + Send + Sync + 'static) -> FieldType {
        self.dynamic = Some(Arc::new(f));
        self
    }

    pub fn multiple(mut self, count: usize) -> FieldType {
        self.multiple = Some(Repeat::Fixed(count));
        self
    }

    pub fn multiple_fn(mut self, f: impl Fn(&Packet) -> CodecResult<usize> + Send + Sync + 'static) -> FieldType {
        self.multiple = Some(Repeat::Computed(Arc::new(f)));
        self
    }

    /// Integer fields accept floats, rounding them
    pub fn allow_float(mut self) -> FieldType {
        self.allow_float = true;
        self
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_remaining(&self) -> bool {
        matches!(self.size, FieldSize::Remaining)
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple.is_some()
    }

    pub fn fixed_size_bits(&self) -> Option<usize> {
        match (&self.size, &self.multiple) {
            (FieldSize::Fixed(bits), None) => Some(*bits),
            (FieldSize::Fixed(bits), Some(Repeat::Fixed(n))) => Some(*bits * *n),
            _ => None,
        }
    }

    /// The size of a single instance of this field within `packet`
    pub fn size_in(&self, packet: &Packet) -> CodecResult<Option<usize>> {
        match &self.size {
            FieldSize::Fixed(bits) => Ok(Some(*bits)),
            FieldSize::Computed(f) => Ok(Some(f(packet)?)),
            FieldSize::Remaining => Ok(None),
        }
    }

    pub fn count_in(&self, packet: &Packet) -> CodecResult<usize> {
        match &self.multiple {
            None => Ok(1),
            Some(Repeat::Fixed(n)) => Ok(*n),
            Some(Repeat::Computed(f)) => f(packet),
        }
    }

    /// Registration-time checks, run when a schema containing this type is built
    pub(crate) fn validate(&self, field: &str) -> Result<(), String> {
        if self.mapping_conflict {
            return Err(format!("field {} has more than one of enum / bitmask / version number", field));
        }

        let integer = matches!(self.kind, FieldKind::Primitive(p) if p.is_integer());
        match &self.mapping {
            Mapping::Plain => {}
            Mapping::VersionNumber => {
                if !matches!(self.kind, FieldKind::Primitive(Primitive::Uint32)) {
                    return Err(format!("version number field {} must be a uint32", field));
                }
            }
            Mapping::Enum { .. } => {
                if !integer {
                    return Err(format!("enum field {} must be an integer", field));
                }
            }
            Mapping::Bitmask(source) => {
                if !integer {
                    return Err(format!("bitmask field {} must be an integer", field));
                }
                if let EnumSource::Static(def) = source {
                    def.check_bitmask().map_err(|e| e.to_string())?;
                }
            }
        }

        if self.allow_float && !integer {
            return Err(format!("allow_float on non-integer field {}", field));
        }
        if self.is_remaining() && self.multiple.is_some() {
            return Err(format!("field {} can not both repeat and take the remaining bytes", field));
        }
        if self.dynamic.is_some() && !matches!(self.kind, FieldKind::Bytes) {
            return Err(format!("dynamic field {} must be a bytes field", field));
        }
        Ok(())
    }
}

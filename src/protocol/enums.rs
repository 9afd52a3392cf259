use std::fmt::{Display, Formatter};
use std::sync::Arc;
use rustc_hash::FxHashSet;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::value::Value;

/// A member of an [EnumDef], or a raw value that is not a member (only produced for fields that
///  allow unknown values)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnumMember {
    Known { name: String, value: u64 },
    Unknown(u64),
}

impl EnumMember {
    pub fn value(&self) -> u64 {
        match self {
            EnumMember::Known { value, .. } => *value,
            EnumMember::Unknown(value) => *value,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EnumMember::Known { name, .. } => Some(name),
            EnumMember::Unknown(_) => None,
        }
    }
}

impl Display for EnumMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EnumMember::Known { name, .. } => write!(f, "{}", name),
            EnumMember::Unknown(value) => write!(f, "<UNKNOWN: {}>", value),
        }
    }
}

/// A named set of integer constants that an integer field can be mapped to, either as a single
///  value (enum) or as a set of flags (bitmask).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    name: String,
    members: Vec<(String, u64)>,
}

impl EnumDef {
    pub fn new(name: &str, members: &[(&str, u64)]) -> Arc<EnumDef> {
        Arc::new(EnumDef {
            name: name.to_string(),
            members: members.iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> impl Iterator<Item = EnumMember> + '_ {
        self.members.iter()
            .map(|(name, value)| EnumMember::Known { name: name.clone(), value: *value })
    }

    pub fn by_name(&self, name: &str) -> Option<EnumMember> {
        self.members.iter()
            .find(|(n, _)| n == name)
            .map(|(name, value)| EnumMember::Known { name: name.clone(), value: *value })
    }

    pub fn by_value(&self, value: u64) -> Option<EnumMember> {
        self.members.iter()
            .find(|(_, v)| *v == value)
            .map(|(name, value)| EnumMember::Known { name: name.clone(), value: *value })
    }

    /// The canonical representation of a member, e.g. `Service.UDP`
    pub fn repr(&self, member_name: &str) -> String {
        format!("{}.{}", self.name, member_name)
    }

    fn by_repr(&self, repr: &str) -> Option<EnumMember> {
        repr.strip_prefix(&self.name)
            .and_then(|s| s.strip_prefix('.'))
            .and_then(|member_name| self.by_name(member_name))
    }

    fn parse_unknown(s: &str) -> Option<u64> {
        s.strip_prefix("<UNKNOWN: ")
            .and_then(|s| s.strip_suffix('>'))
            .and_then(|s| s.parse().ok())
    }

    /// Matches a value against this enum: by member name first, then by canonical repr, then
    ///  by raw value.
    pub fn resolve(&self, field: &str, value: &Value, allow_unknown: bool) -> CodecResult<EnumMember> {
        let found = match value {
            Value::Enum(EnumMember::Known { name, value: v }) => self.by_name(name)
                .filter(|m| m.value() == *v)
                .or_else(|| self.by_value(*v)),
            Value::Enum(EnumMember::Unknown(v)) => self.by_value(*v),
            Value::Str(s) => self.by_name(s)
                .or_else(|| self.by_repr(s)),
            other => other.as_u64().and_then(|v| self.by_value(v)),
        };
        if let Some(member) = found {
            return Ok(member);
        }

        if allow_unknown {
            let raw = match value {
                Value::Enum(EnumMember::Unknown(v)) => Some(*v),
                Value::Str(s) => Self::parse_unknown(s),
                Value::Enum(_) => None,
                other => other.as_u64(),
            };
            if let Some(raw) = raw {
                return Ok(EnumMember::Unknown(raw));
            }
        }

        Err(CodecError::UnknownEnumValue {
            field: field.to_string(),
            enum_name: self.name.clone(),
            value: value.to_string(),
        })
    }

    /// Bitmask enums need every member to be a distinguishable set bit pattern, zero being reserved
    ///  for 'no bits set'
    pub fn check_bitmask(&self) -> CodecResult<()> {
        if let Some((name, _)) = self.members.iter().find(|(_, v)| *v == 0) {
            return Err(CodecError::schema(&self.name, format!("bitmask member {} has value 0", name)));
        }
        Ok(())
    }

    /// Sums the distinct members of a bitmask value. Accepts a set of members, a list of member
    ///  names or reprs, an array of values, or an already-summed raw number.
    pub fn pack_bitmask(&self, field: &str, value: &Value) -> CodecResult<u64> {
        self.check_bitmask()?;

        let members: Vec<Value> = match value {
            Value::Uint(_) | Value::Int(_) => return value.as_u64()
                .ok_or_else(|| CodecError::bad_conversion(field, "negative bitmask")),
            Value::Bitmask(members) => members.iter().cloned().map(Value::Enum).collect(),
            Value::List(names) => names.iter().cloned().map(Value::Str).collect(),
            Value::Array(values) => values.clone(),
            Value::Enum(_) | Value::Str(_) => vec![value.clone()],
            other => return Err(CodecError::bad_conversion(field, format!("{} is not a bitmask", other.kind_name()))),
        };

        let mut seen = FxHashSet::default();
        let mut result = 0u64;
        for m in members {
            let member = self.resolve(field, &m, false)?;
            if seen.insert(member.value()) {
                result += member.value();
            }
        }
        Ok(result)
    }

    pub fn unpack_bitmask(&self, raw: u64) -> CodecResult<Vec<EnumMember>> {
        self.check_bitmask()?;
        Ok(self.members()
            .filter(|m| raw & m.value() == m.value())
            .collect())
    }
}

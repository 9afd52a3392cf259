use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use rustc_hash::FxHashMap;
use crate::protocol::codec_error::{CodecError, CodecResult};
use crate::protocol::field_type::FieldType;
use crate::protocol::packet::Packet;

/// How many response packets a request of some message type should expect
#[derive(Clone, Default)]
pub enum MultiReply {
    #[default]
    Single,
    Unbounded,
    Count(usize),
    /// Derived from the first response of `response_type`, e.g. from a 'total' field. The
    ///  function is called with the request and that response.
    FromResponse {
        response_type: u16,
        count: Arc<dyn Fn(&Packet, &Packet) -> CodecResult<usize> + Send + Sync>,
    },
}

impl Debug for MultiReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MultiReply::Single => write!(f, "Single"),
            MultiReply::Unbounded => write!(f, "Unbounded"),
            MultiReply::Count(n) => write!(f, "Count({})", n),
            MultiReply::FromResponse { response_type, .. } => write!(f, "FromResponse({})", response_type),
        }
    }
}

pub enum SchemaEntry {
    Field(FieldType),
    Group(Arc<Schema>),
}

/// Collects an explicit ordered list of fields and nested groups, and validates them into a
///  [Schema] in [SchemaBuilder::build].
pub struct SchemaBuilder {
    name: String,
    message_type: u16,
    entries: Vec<(String, SchemaEntry)>,
    multi: MultiReply,
    responds_with: Vec<u16>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: &str, typ: FieldType) -> SchemaBuilder {
        self.entries.push((name.to_string(), SchemaEntry::Field(typ)));
        self
    }

    pub fn group(mut self, name: &str, schema: Arc<Schema>) -> SchemaBuilder {
        self.entries.push((name.to_string(), SchemaEntry::Group(schema)));
        self
    }

    /// A nonzero discriminant identifies a concrete payload shape
    pub fn message_type(mut self, message_type: u16) -> SchemaBuilder {
        self.message_type = message_type;
        self
    }

    pub fn multi(mut self, multi: MultiReply) -> SchemaBuilder {
        self.multi = multi;
        self
    }

    pub fn responds_with(mut self, message_types: &[u16]) -> SchemaBuilder {
        self.responds_with = message_types.to_vec();
        self
    }

    pub fn build(self) -> CodecResult<Arc<Schema>> {
        let mut fields: Vec<ResolvedField> = Vec::new();
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();

        for (name, entry) in self.entries {
            match entry {
                SchemaEntry::Field(typ) => {
                    typ.validate(&name)
                        .map_err(|reason| CodecError::schema(&self.name, reason))?;
                    fields.push(ResolvedField { name, typ, group: None, is_payload: false });
                }
                SchemaEntry::Group(nested) if nested.is_placeholder() => {
                    fields.push(ResolvedField {
                        name,
                        typ: FieldType::bytes_remaining(),
                        group: None,
                        is_payload: true,
                    });
                }
                SchemaEntry::Group(nested) => {
                    let offset = fields.len();
                    for f in nested.fields.iter() {
                        fields.push(ResolvedField {
                            name: f.name.clone(),
                            typ: f.typ.clone(),
                            group: Some(name.clone()),
                            is_payload: f.is_payload,
                        });
                    }
                    groups.push((name, (offset..fields.len()).collect()));
                    // groups of the nested schema stay addressable, relative to their new position
                    for (inner, indices) in &nested.groups {
                        groups.push((inner.clone(), indices.iter().map(|i| i + offset).collect()));
                    }
                }
            }
        }

        let mut index = FxHashMap::default();
        for (i, f) in fields.iter().enumerate() {
            if index.insert(f.name.clone(), i).is_some() {
                return Err(CodecError::schema(&self.name, format!("duplicate field name {}", f.name)));
            }
        }
        for (i, (group_name, _)) in groups.iter().enumerate() {
            if index.contains_key(group_name) {
                return Err(CodecError::schema(&self.name, format!("group {} clashes with a field name", group_name)));
            }
            if groups[..i].iter().any(|(n, _)| n == group_name) {
                return Err(CodecError::schema(&self.name, format!("duplicate group name {}", group_name)));
            }
        }
        if let Some(pos) = fields.iter().position(|f| f.typ.is_remaining()) {
            if pos + 1 != fields.len() {
                return Err(CodecError::schema(&self.name, format!("field {} takes the remaining bytes but is not last", fields[pos].name)));
            }
        }

        Ok(Arc::new(Schema {
            name: self.name,
            message_type: self.message_type,
            fields,
            index,
            groups,
            multi: self.multi,
            responds_with: self.responds_with,
        }))
    }
}

#[derive(Clone)]
pub struct ResolvedField {
    pub name: String,
    pub typ: FieldType,
    pub group: Option<String>,
    /// the trailing opaque payload of a parent schema
    pub is_payload: bool,
}

/// A validated, flattened message layout. Fields of nested groups are promoted into the flat field
///  list, remembering the group they belong to.
pub struct Schema {
    name: String,
    message_type: u16,
    fields: Vec<ResolvedField>,
    index: FxHashMap<String, usize>,
    groups: Vec<(String, Vec<usize>)>,
    multi: MultiReply,
    responds_with: Vec<u16>,
}

impl Debug for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Schema({}", self.name)?;
        if self.message_type != 0 {
            write!(f, ":{}", self.message_type)?;
        }
        write!(f, ")")
    }
}

impl Schema {
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: name.to_string(),
            message_type: 0,
            entries: Vec::new(),
            multi: MultiReply::Single,
            responds_with: Vec::new(),
        }
    }

    /// A schema with no fields and no discriminant, which stands in for 'some payload' when used
    ///  as a group
    pub fn placeholder(name: &str) -> Arc<Schema> {
        Arc::new(Schema {
            name: name.to_string(),
            message_type: 0,
            fields: Vec::new(),
            index: FxHashMap::default(),
            groups: Vec::new(),
            multi: MultiReply::Single,
            responds_with: Vec::new(),
        })
    }

    pub fn is_placeholder(&self) -> bool {
        self.fields.is_empty() && self.message_type == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    pub fn multi(&self) -> &MultiReply {
        &self.multi
    }

    pub fn responds_with(&self) -> &[u16] {
        &self.responds_with
    }

    pub fn fields(&self) -> &[ResolvedField] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    pub fn group_indices(&self, name: &str) -> Option<&[usize]> {
        self.groups.iter()
            .find(|(n, _)| n == name)
            .map(|(_, indices)| indices.as_slice())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(n, _)| n.as_str())
    }

    /// A parent schema ends in an opaque payload that carries a child schema's bytes
    pub fn is_parent(&self) -> bool {
        self.fields.last().map(|f| f.is_payload).unwrap_or(false)
    }

    /// Total size if it does not depend on packet contents
    pub fn fixed_size_bits(&self) -> Option<usize> {
        self.fields.iter()
            .map(|f| f.typ.fixed_size_bits())
            .sum()
    }

    /// Bits of every field before the first one whose size depends on the packet
    pub fn fixed_prefix_bits(&self) -> usize {
        self.fields.iter()
            .map_while(|f| f.typ.fixed_size_bits())
            .sum()
    }
}

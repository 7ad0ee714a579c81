//! In-memory model of the PDL intermediate representation.
//!
//! The PDL surface parser exports a JSON document; this module deserializes
//! it into typed declarations and fields, builds the name scopes, and
//! validates the structural invariants code generation relies on.
//! Declarations never hold owning back-references: scopes are index maps
//! into the declaration list, and every query takes the [`File`] explicitly.
use std::collections::{HashMap, HashSet};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::IrError;

mod normalize;
pub use normalize::normalize;

/// Implicit identifier carried by payload fields.
pub const PAYLOAD_ID: &str = "_payload_";
/// Implicit identifier carried by body fields.
pub const BODY_ID: &str = "_body_";

//==================================================================================LITERALS
// IR numeric literals are JSON numbers or `0x`-prefixed strings.

fn parse_literal(text: &str) -> Option<u64> {
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Literal {
    Number(u64),
    Text(String),
}

impl Literal {
    fn value<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Literal::Number(n) => Ok(n),
            Literal::Text(text) => parse_literal(&text)
                .ok_or_else(|| E::custom(format!("invalid numeric literal `{text}`"))),
        }
    }
}

fn literal<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Literal::deserialize(de)?.value()
}

fn opt_literal<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    match Option::<Literal>::deserialize(de)? {
        Some(lit) => lit.value().map(Some),
        None => Ok(None),
    }
}

fn width<'de, D: Deserializer<'de>>(de: D) -> Result<usize, D::Error> {
    let value = literal(de)?;
    usize::try_from(value).map_err(|_| D::Error::custom(format!("width {value} out of range")))
}

fn opt_width<'de, D: Deserializer<'de>>(de: D) -> Result<Option<usize>, D::Error> {
    match opt_literal(de)? {
        Some(value) => usize::try_from(value)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("width {value} out of range"))),
        None => Ok(None),
    }
}

/// Parse a `_size_` modifier string (`"2"`, `"+2"`, `"0x10"`) to octets.
pub fn parse_size_modifier(text: &str) -> Option<u64> {
    parse_literal(text)
}

//==================================================================================FILE

/// File endianness as declared by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Endianness {
    #[serde(rename = "little_endian")]
    LittleEndian,
    #[serde(rename = "big_endian")]
    BigEndian,
}

impl Endianness {
    pub fn is_little(self) -> bool {
        self == Endianness::LittleEndian
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndiannessDeclaration {
    pub value: Endianness,
}

/// Root of the intermediate representation: the endianness marker, the
/// ordered declaration list, and the three name scopes indexing it.
#[derive(Debug, Deserialize)]
pub struct File {
    pub endianness: EndiannessDeclaration,
    pub declarations: Vec<Declaration>,
    #[serde(skip)]
    pub packet_scope: HashMap<String, usize>,
    #[serde(skip)]
    pub typedef_scope: HashMap<String, usize>,
    #[serde(skip)]
    pub group_scope: HashMap<String, usize>,
}

impl File {
    /// Import a file exported as JSON by the PDL parser and build its scopes.
    pub fn from_json(value: serde_json::Value) -> Result<File, IrError> {
        let mut file: File = serde_json::from_value(value)?;
        file.index()?;
        Ok(file)
    }

    pub fn byteorder(&self) -> Endianness {
        self.endianness.value
    }

    /// Rebuild the scope indexes and validate structural invariants.
    /// Called once after import and again after normalization.
    pub fn index(&mut self) -> Result<(), IrError> {
        self.packet_scope.clear();
        self.typedef_scope.clear();
        self.group_scope.clear();

        for (index, decl) in self.declarations.iter().enumerate() {
            let (scope, id) = match decl {
                Declaration::Packet(p) => (&mut self.packet_scope, p.id.clone()),
                Declaration::Group(g) => (&mut self.group_scope, g.id.clone()),
                Declaration::Struct(s) => (&mut self.typedef_scope, s.id.clone()),
                Declaration::Enum(e) => (&mut self.typedef_scope, e.id.clone()),
                Declaration::CustomField(c) => (&mut self.typedef_scope, c.id.clone()),
                Declaration::Checksum(c) => (&mut self.typedef_scope, c.id.clone()),
                // The root endianness object is authoritative; stray
                // endianness declarations carry no name.
                Declaration::Endianness(_) => continue,
            };
            if scope.insert(id.clone(), index).is_some() {
                return Err(IrError::DuplicateDeclaration { id });
            }
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), IrError> {
        for decl in &self.declarations {
            match decl {
                Declaration::Packet(p) => {
                    self.check_parent(&p.id, p.parent_id.as_deref(), &self.packet_scope)?;
                    self.check_fields(&p.id, &p.fields)?;
                }
                Declaration::Struct(s) => {
                    self.check_parent(&s.id, s.parent_id.as_deref(), &self.typedef_scope)?;
                    self.check_fields(&s.id, &s.fields)?;
                }
                Declaration::Group(g) => self.check_fields(&g.id, &g.fields)?,
                Declaration::Enum(e) => check_tags(e)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn check_parent(
        &self,
        id: &str,
        parent_id: Option<&str>,
        scope: &HashMap<String, usize>,
    ) -> Result<(), IrError> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        // Walk to the root, failing on unresolved links and cycles.
        let mut visited = HashSet::new();
        visited.insert(id.to_string());
        let mut current = parent_id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(IrError::ParentCycle { id: id.to_string() });
            }
            let index = scope.get(&current).ok_or_else(|| IrError::UnknownParent {
                id: id.to_string(),
                parent_id: current.clone(),
            })?;
            match self.declarations[*index].parent_id() {
                Some(next) => current = next.to_string(),
                None => return Ok(()),
            }
        }
    }

    fn check_fields(&self, decl_id: &str, fields: &[Field]) -> Result<(), IrError> {
        let unknown = |type_id: &str| IrError::UnknownType {
            decl: decl_id.to_string(),
            type_id: type_id.to_string(),
        };
        for field in fields {
            match field {
                Field::Typedef(f) => {
                    if !self.typedef_scope.contains_key(&f.type_id) {
                        return Err(unknown(&f.type_id));
                    }
                }
                Field::Array(f) => {
                    if let Some(type_id) = &f.type_id {
                        if !self.typedef_scope.contains_key(type_id) {
                            return Err(unknown(type_id));
                        }
                    }
                }
                Field::Fixed(f) => match (&f.width, &f.value, &f.enum_id, &f.tag_id) {
                    (Some(_), Some(_), None, None) => {}
                    (None, None, Some(enum_id), Some(_)) => {
                        if !self.typedef_scope.contains_key(enum_id) {
                            return Err(unknown(enum_id));
                        }
                    }
                    _ => {
                        return Err(IrError::MalformedFixedField {
                            decl: decl_id.to_string(),
                        })
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    pub fn packet(&self, id: &str) -> Option<&Declaration> {
        self.packet_scope.get(id).map(|i| &self.declarations[*i])
    }

    pub fn typedef(&self, id: &str) -> Option<&Declaration> {
        self.typedef_scope.get(id).map(|i| &self.declarations[*i])
    }

    pub fn group(&self, id: &str) -> Option<&Declaration> {
        self.group_scope.get(id).map(|i| &self.declarations[*i])
    }

    /// Names of the user-supplied types the generated code will call into:
    /// custom field parsers and checksum functions.
    pub fn required_custom_types(&self) -> Vec<&str> {
        self.declarations
            .iter()
            .filter_map(|d| match d {
                Declaration::CustomField(c) => Some(c.id.as_str()),
                Declaration::Checksum(c) => Some(c.id.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn check_tags(decl: &EnumDeclaration) -> Result<(), IrError> {
    let mut seen = HashSet::new();
    let mut ranges: Vec<(&Tag, u64, u64)> = Vec::new();
    collect_tags(&decl.tags, &mut seen, &mut ranges, &decl.id)?;
    for (tag, start, end) in &ranges {
        if seen.iter().any(|v| *start <= *v && *v <= *end) {
            return Err(IrError::TagOverlap {
                decl: decl.id.clone(),
                tag: tag.id.clone(),
            });
        }
    }
    Ok(())
}

fn collect_tags<'a>(
    tags: &'a [Tag],
    seen: &mut HashSet<u64>,
    ranges: &mut Vec<(&'a Tag, u64, u64)>,
    decl_id: &str,
) -> Result<(), IrError> {
    for tag in tags {
        if let Some(value) = tag.value {
            if !seen.insert(value) {
                return Err(IrError::DuplicateTag {
                    decl: decl_id.to_string(),
                    tag: tag.id.clone(),
                });
            }
        }
        if let Some(range) = &tag.range {
            ranges.push((tag, range.start, range.end));
        }
        if let Some(nested) = &tag.tags {
            collect_tags(nested, seen, ranges, decl_id)?;
        }
    }
    Ok(())
}

//==================================================================================DECLARATIONS

/// A top-level declaration, discriminated by its `kind` tag in the IR.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Declaration {
    #[serde(rename = "enum_declaration")]
    Enum(EnumDeclaration),
    #[serde(rename = "packet_declaration")]
    Packet(PacketDeclaration),
    #[serde(rename = "struct_declaration")]
    Struct(StructDeclaration),
    #[serde(rename = "group_declaration")]
    Group(GroupDeclaration),
    #[serde(rename = "custom_field_declaration")]
    CustomField(CustomFieldDeclaration),
    #[serde(rename = "checksum_declaration")]
    Checksum(ChecksumDeclaration),
    #[serde(rename = "endianness_declaration")]
    Endianness(EndiannessDeclaration),
}

impl Declaration {
    pub fn id(&self) -> Option<&str> {
        match self {
            Declaration::Enum(d) => Some(&d.id),
            Declaration::Packet(d) => Some(&d.id),
            Declaration::Struct(d) => Some(&d.id),
            Declaration::Group(d) => Some(&d.id),
            Declaration::CustomField(d) => Some(&d.id),
            Declaration::Checksum(d) => Some(&d.id),
            Declaration::Endianness(_) => None,
        }
    }

    pub fn fields(&self) -> &[Field] {
        match self {
            Declaration::Packet(d) => &d.fields,
            Declaration::Struct(d) => &d.fields,
            Declaration::Group(d) => &d.fields,
            _ => &[],
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Declaration::Packet(d) => d.parent_id.as_deref(),
            Declaration::Struct(d) => d.parent_id.as_deref(),
            _ => None,
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        match self {
            Declaration::Packet(d) => &d.constraints,
            Declaration::Struct(d) => &d.constraints,
            _ => &[],
        }
    }

    /// Intrinsic bit width for enum, custom-field, and checksum declarations.
    pub fn width(&self) -> Option<usize> {
        match self {
            Declaration::Enum(d) => Some(d.width),
            Declaration::CustomField(d) => d.width,
            Declaration::Checksum(d) => Some(d.width),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Declaration::Enum(_) => "enum_declaration",
            Declaration::Packet(_) => "packet_declaration",
            Declaration::Struct(_) => "struct_declaration",
            Declaration::Group(_) => "group_declaration",
            Declaration::CustomField(_) => "custom_field_declaration",
            Declaration::Checksum(_) => "checksum_declaration",
            Declaration::Endianness(_) => "endianness_declaration",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumDeclaration {
    pub id: String,
    #[serde(deserialize_with = "width")]
    pub width: usize,
    pub tags: Vec<Tag>,
}

impl EnumDeclaration {
    /// Find a named tag, looking through tag subgroups.
    pub fn tag(&self, id: &str) -> Option<&Tag> {
        fn find<'a>(tags: &'a [Tag], id: &str) -> Option<&'a Tag> {
            for tag in tags {
                if tag.id == id {
                    return Some(tag);
                }
                if let Some(nested) = &tag.tags {
                    if let Some(found) = find(nested, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        find(&self.tags, id)
    }

    /// All named tag values in declaration order, subgroups flattened.
    pub fn named_values(&self) -> Vec<(&str, u64)> {
        fn collect<'a>(tags: &'a [Tag], out: &mut Vec<(&'a str, u64)>) {
            for tag in tags {
                if let Some(value) = tag.value {
                    out.push((&tag.id, value));
                }
                if let Some(nested) = &tag.tags {
                    collect(nested, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.tags, &mut out);
        out
    }

    /// An enum is open when it declares reserved ranges; undeclared values
    /// inside a range parse to a raw integer instead of failing.
    pub fn is_open(&self) -> bool {
        fn has_range(tags: &[Tag]) -> bool {
            tags.iter()
                .any(|t| t.range.is_some() || t.tags.as_deref().map(has_range).unwrap_or(false))
        }
        has_range(&self.tags)
    }

    /// Whether a wire value belongs to the enum's closed set or ranges.
    pub fn contains(&self, value: u64) -> bool {
        fn check(tags: &[Tag], value: u64) -> bool {
            tags.iter().any(|t| {
                t.value == Some(value)
                    || t.range
                        .as_ref()
                        .is_some_and(|r| r.start <= value && value <= r.end)
                    || t.tags.as_deref().is_some_and(|nested| check(nested, value))
            })
        }
        check(&self.tags, value)
    }
}

/// An enum tag: a named value, a reserved range, or a named subgroup.
#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(default, deserialize_with = "opt_literal")]
    pub value: Option<u64>,
    #[serde(default)]
    pub range: Option<TagRange>,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRange {
    #[serde(deserialize_with = "literal")]
    pub start: u64,
    #[serde(deserialize_with = "literal")]
    pub end: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketDeclaration {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructDeclaration {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Reusable field sequence, inlined at each reference site by normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDeclaration {
    pub id: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Opaque user type with a parse/serialize function pair. Constant-width
/// custom fields may take part in bit chunks; variable-width ones cannot.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomFieldDeclaration {
    pub id: String,
    pub function: String,
    #[serde(default, deserialize_with = "opt_width")]
    pub width: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumDeclaration {
    pub id: String,
    pub function: String,
    #[serde(deserialize_with = "width")]
    pub width: usize,
}

/// A `name = literal` or `name = tag` assertion restricting a parent field.
#[derive(Debug, Clone, Deserialize)]
pub struct Constraint {
    pub id: String,
    #[serde(default, deserialize_with = "opt_literal")]
    pub value: Option<u64>,
    #[serde(default)]
    pub tag_id: Option<String>,
}

//==================================================================================FIELDS

/// A packet or struct member, discriminated by its `kind` tag in the IR.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Field {
    #[serde(rename = "scalar_field")]
    Scalar(ScalarField),
    #[serde(rename = "typedef_field")]
    Typedef(TypedefField),
    #[serde(rename = "array_field")]
    Array(ArrayField),
    #[serde(rename = "size_field")]
    Size(SizeField),
    #[serde(rename = "count_field")]
    Count(CountField),
    #[serde(rename = "body_field")]
    Body(BodyField),
    #[serde(rename = "payload_field")]
    Payload(PayloadField),
    #[serde(rename = "fixed_field")]
    Fixed(FixedField),
    #[serde(rename = "reserved_field")]
    Reserved(ReservedField),
    #[serde(rename = "padding_field")]
    Padding(PaddingField),
    #[serde(rename = "checksum_field")]
    Checksum(ChecksumField),
    #[serde(rename = "group_field")]
    Group(GroupField),
}

impl Field {
    /// The identifier other fields reference this one by.
    /// Payload and body fields answer to their implicit names.
    pub fn id(&self) -> Option<&str> {
        match self {
            Field::Scalar(f) => Some(&f.id),
            Field::Typedef(f) => Some(&f.id),
            Field::Array(f) => Some(&f.id),
            Field::Payload(_) => Some(PAYLOAD_ID),
            Field::Body(_) => Some(BODY_ID),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Field::Scalar(_) => "scalar_field",
            Field::Typedef(_) => "typedef_field",
            Field::Array(_) => "array_field",
            Field::Size(_) => "size_field",
            Field::Count(_) => "count_field",
            Field::Body(_) => "body_field",
            Field::Payload(_) => "payload_field",
            Field::Fixed(_) => "fixed_field",
            Field::Reserved(_) => "reserved_field",
            Field::Padding(_) => "padding_field",
            Field::Checksum(_) => "checksum_field",
            Field::Group(_) => "group_field",
        }
    }
}

/// Unsigned integer of `width` bits.
#[derive(Debug, Clone, Deserialize)]
pub struct ScalarField {
    pub id: String,
    #[serde(deserialize_with = "width")]
    pub width: usize,
}

/// Nested enum, struct, custom, or checksum value.
#[derive(Debug, Clone, Deserialize)]
pub struct TypedefField {
    pub id: String,
    pub type_id: String,
}

/// Repeated element region. Either `width` (scalar elements) or `type_id`
/// (typedef elements) is set. `size` is a compile-time element count;
/// `padded_size` is written by normalization when a padding field follows.
#[derive(Debug, Clone, Deserialize)]
pub struct ArrayField {
    pub id: String,
    #[serde(default, deserialize_with = "opt_width")]
    pub width: Option<usize>,
    #[serde(default)]
    pub type_id: Option<String>,
    #[serde(default)]
    pub size_modifier: Option<String>,
    #[serde(default, deserialize_with = "opt_width")]
    pub size: Option<usize>,
    #[serde(skip)]
    pub padded_size: Option<usize>,
}

impl ArrayField {
    /// Size modifier in octets; `None` when the modifier string is invalid.
    pub fn modifier_octets(&self) -> Option<u64> {
        match &self.size_modifier {
            None => Some(0),
            Some(text) => parse_size_modifier(text),
        }
    }
}

/// Integer holding the octet size of the referenced field.
#[derive(Debug, Clone, Deserialize)]
pub struct SizeField {
    pub field_id: String,
    #[serde(deserialize_with = "width")]
    pub width: usize,
}

/// Integer holding the element count of the referenced array.
#[derive(Debug, Clone, Deserialize)]
pub struct CountField {
    pub field_id: String,
    #[serde(deserialize_with = "width")]
    pub width: usize,
}

/// Variable-length region holding a derived packet's serialized bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct BodyField {}

/// Variable-length region of free-form bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadField {
    #[serde(default)]
    pub size_modifier: Option<String>,
}

impl PayloadField {
    pub fn modifier_octets(&self) -> Option<u64> {
        match &self.size_modifier {
            None => Some(0),
            Some(text) => parse_size_modifier(text),
        }
    }
}

/// Constant that must appear verbatim on the wire: a scalar literal
/// (`width` + `value`) or an enum tag (`enum_id` + `tag_id`).
#[derive(Debug, Clone, Deserialize)]
pub struct FixedField {
    #[serde(default, deserialize_with = "opt_width")]
    pub width: Option<usize>,
    #[serde(default, deserialize_with = "opt_literal")]
    pub value: Option<u64>,
    #[serde(default)]
    pub enum_id: Option<String>,
    #[serde(default)]
    pub tag_id: Option<String>,
}

/// Bits written as zero and discarded on parse.
#[derive(Debug, Clone, Deserialize)]
pub struct ReservedField {
    #[serde(deserialize_with = "width")]
    pub width: usize,
}

/// Pads the preceding array to `size` octets. After normalization the
/// field survives only as the link: the array carries `padded_size`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddingField {
    #[serde(deserialize_with = "width")]
    pub size: usize,
}

/// Zero-width marker: the checksum carried by `field_id` covers the bytes
/// from this point up to the checksum value field.
#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumField {
    pub field_id: String,
}

/// Reference to a group declaration, expanded away by normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupField {
    pub group_id: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

//! Static layout queries over the canonical IR.
//!
//! Every function is a pure read: it takes the [`File`] and the node it
//! inspects, and answers `None` when the quantity is not statically
//! decidable (dynamically sized arrays, payloads, variable offsets).
//! The planners and the vector generator are built entirely on top of
//! these queries.
use crate::ir::{
    ArrayField, Constraint, CountField, Declaration, Field, File, SizeField,
};

/// Size of a field in bits, when statically known.
///
/// With `skip_payload` set, payload and body fields count as zero instead
/// of being dynamically sized; this is how a parent's fixed header is
/// measured when sizing a derived declaration.
pub fn field_size(file: &File, field: &Field, skip_payload: bool) -> Option<usize> {
    match field {
        Field::Scalar(f) => Some(f.width),
        Field::Size(f) => Some(f.width),
        Field::Count(f) => Some(f.width),
        Field::Reserved(f) => Some(f.width),

        Field::Fixed(f) => f
            .width
            .or_else(|| f.enum_id.as_deref().and_then(|id| file.typedef(id)?.width())),

        // Padding width is accounted for by the padded array.
        Field::Padding(_) => Some(0),

        Field::Array(f) if f.padded_size.is_some() => f.padded_size.map(|octets| octets * 8),
        Field::Array(f) if f.size.is_some() => {
            let count = f.size?;
            element_size(file, f).map(|width| width * count)
        }

        Field::Typedef(f) => {
            let decl = file.typedef(&f.type_id)?;
            declaration_size(file, decl, false)
        }

        Field::Checksum(_) => Some(0),

        Field::Payload(_) | Field::Body(_) if skip_payload => Some(0),

        _ => None,
    }
}

/// Size of a declaration in bits, when statically known.
/// Parents contribute their payload-free size.
pub fn declaration_size(file: &File, decl: &Declaration, skip_payload: bool) -> Option<usize> {
    match decl {
        Declaration::Enum(_) | Declaration::CustomField(_) | Declaration::Checksum(_) => {
            decl.width()
        }
        Declaration::Packet(_) | Declaration::Struct(_) => {
            let mut size = match parent_of(file, decl) {
                Some(parent) => declaration_size(file, parent, true)?,
                None => 0,
            };
            for field in decl.fields() {
                size += field_size(file, field, skip_payload)?;
            }
            Some(size)
        }
        _ => None,
    }
}

/// What decides an array's extent.
#[derive(Debug)]
pub enum ArraySize<'a> {
    /// Compile-time element count.
    Static(usize),
    /// Octet size carried by a size field of the same declaration.
    Size(&'a SizeField),
    /// Element count carried by a count field of the same declaration.
    Count(&'a CountField),
    /// Nothing bounds the array; it runs to the end of its span.
    Unbounded,
}

pub fn array_size_source<'a>(decl: &'a Declaration, array: &ArrayField) -> ArraySize<'a> {
    if let Some(count) = array.size {
        return ArraySize::Static(count);
    }
    for field in decl.fields() {
        match field {
            Field::Size(f) if f.field_id == array.id => return ArraySize::Size(f),
            Field::Count(f) if f.field_id == array.id => return ArraySize::Count(f),
            _ => {}
        }
    }
    ArraySize::Unbounded
}

/// The size field driving a payload or body, if any.
pub fn payload_size_source<'a>(decl: &'a Declaration, payload_id: &str) -> Option<&'a SizeField> {
    decl.fields().iter().find_map(|field| match field {
        Field::Size(f) if f.field_id == payload_id => Some(f),
        _ => None,
    })
}

/// Array element width in bits, when statically known.
pub fn element_size(file: &File, array: &ArrayField) -> Option<usize> {
    array.width.or_else(|| {
        let decl = file.typedef(array.type_id.as_deref()?)?;
        declaration_size(file, decl, false)
    })
}

/// Bit offset of `decl.fields()[index]` from the start of the declaration.
pub fn offset_from_start(file: &File, decl: &Declaration, index: usize) -> Option<usize> {
    let mut offset = 0;
    for field in &decl.fields()[..index] {
        offset += field_size(file, field, false)?;
    }
    Some(offset)
}

/// Bit offset from the end of the declaration to the end of
/// `decl.fields()[index]`. The field itself is not counted.
pub fn offset_from_end(file: &File, decl: &Declaration, index: usize) -> Option<usize> {
    let mut offset = 0;
    for field in &decl.fields()[index + 1..] {
        offset += field_size(file, field, false)?;
    }
    Some(offset)
}

/// Fields with bit granularity compose into shared bit chunks; every other
/// field must start on a byte boundary.
pub fn is_bit_field(file: &File, field: &Field) -> bool {
    match field {
        Field::Scalar(_)
        | Field::Size(_)
        | Field::Count(_)
        | Field::Fixed(_)
        | Field::Reserved(_) => true,
        Field::Typedef(f) => matches!(file.typedef(&f.type_id), Some(Declaration::Enum(_))),
        _ => false,
    }
}

/// Bit shift of the payload or body field inside the parent declaration.
///
/// When packet derivation splits a bit chunk, the child's body starts at a
/// fractional bit offset; the incomplete byte is included in the body so
/// the child can finish the chunk. Parents that are plain payload aliases
/// are collapsed. Fields without a constant size are assumed to start on a
/// byte boundary and measure whole octets, so the count restarts there.
pub fn packet_shift(file: &File, decl: &Declaration) -> usize {
    let mut parent = parent_of(file, decl);
    while let Some(p) = parent {
        if p.fields().len() == 1 {
            parent = parent_of(file, p);
        } else {
            break;
        }
    }
    let Some(parent) = parent else {
        return 0;
    };

    let mut shift = 0;
    for field in parent.fields() {
        match field {
            Field::Payload(_) | Field::Body(_) => {
                return if shift % 8 == 0 { 0 } else { shift };
            }
            _ => {
                shift = match field_size(file, field, false) {
                    Some(size) => shift + size,
                    None => 0,
                };
            }
        }
    }
    // No payload in the parent; later planning stages report the error.
    0
}

/// Immediate parent declaration, resolved in the matching scope.
pub fn parent_of<'a>(file: &'a File, decl: &Declaration) -> Option<&'a Declaration> {
    match decl {
        Declaration::Packet(p) => file.packet(p.parent_id.as_deref()?),
        Declaration::Struct(s) => file.typedef(s.parent_id.as_deref()?),
        _ => None,
    }
}

/// Root ancestor of a packet or struct. Parent chains are validated to be
/// acyclic at import, so plain recursion is safe.
pub fn ancestor<'a>(file: &'a File, decl: &'a Declaration) -> &'a Declaration {
    match parent_of(file, decl) {
        Some(parent) => ancestor(file, parent),
        None => decl,
    }
}

/// Packets or structs that immediately derive from `decl`, with their
/// accumulated constraints. Aliases (declarations whose only field is a
/// payload or body) are traversed and their constraints merged.
pub fn derived_packets<'a>(
    file: &'a File,
    decl: &Declaration,
) -> Vec<(Vec<Constraint>, &'a Declaration)> {
    let mut children = Vec::new();
    let Some(decl_id) = decl.id() else {
        return children;
    };
    for candidate in &file.declarations {
        let same_kind = matches!(
            (decl, candidate),
            (Declaration::Packet(_), Declaration::Packet(_))
                | (Declaration::Struct(_), Declaration::Struct(_))
        );
        if !same_kind || candidate.parent_id() != Some(decl_id) {
            continue;
        }
        let fields = candidate.fields();
        if fields.len() == 1 && matches!(fields[0], Field::Payload(_) | Field::Body(_)) {
            for (sub_constraints, sub_child) in derived_packets(file, candidate) {
                let mut constraints = candidate.constraints().to_vec();
                constraints.extend(sub_constraints);
                children.push((constraints, sub_child));
            }
        } else {
            children.push((candidate.constraints().to_vec(), candidate));
        }
    }
    children
}

/// Resolve a field id in the declaration or its ancestors.
pub fn packet_field<'a>(file: &'a File, decl: &'a Declaration, id: &str) -> Option<&'a Field> {
    for field in decl.fields() {
        if field.id() == Some(id) {
            return Some(field);
        }
    }
    packet_field(file, parent_of(file, decl)?, id)
}

/// Constraints accumulated along the whole parent chain, in child-to-root
/// order. Derived-packet builders force these values.
pub fn inherited_constraints(file: &File, decl: &Declaration) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    let mut current = decl;
    while current.parent_id().is_some() {
        constraints.extend(current.constraints().iter().cloned());
        match parent_of(file, current) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    constraints
}

/// One symbolic contribution to an instance's runtime size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeTerm {
    /// Octet length of the payload or body.
    PayloadLen,
    /// Runtime size of a dynamically sized typedef field.
    TypedefSize { id: String },
    /// Sum of the element sizes of a dynamic-element array.
    ArrayElementSum { id: String },
    /// Element count times a fixed element width.
    ArrayLen { id: String, element_octets: usize },
}

/// Runtime size of an instance: a constant octet part plus symbolic terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeTerms {
    pub const_octets: usize,
    pub variable: Vec<SizeTerm>,
}

/// Decompose the declaration's serialized size for backends that emit a
/// size getter. `None` when a field's size cannot be expressed.
pub fn size_terms(file: &File, decl: &Declaration) -> Option<SizeTerms> {
    let mut const_bits = 0;
    let mut variable = Vec::new();
    for field in decl.fields() {
        if let Some(size) = field_size(file, field, false) {
            const_bits += size;
            continue;
        }
        match field {
            Field::Payload(_) | Field::Body(_) => variable.push(SizeTerm::PayloadLen),
            Field::Typedef(f) => variable.push(SizeTerm::TypedefSize { id: f.id.clone() }),
            Field::Array(f) => match element_size(file, f) {
                Some(width) if width % 8 == 0 => variable.push(SizeTerm::ArrayLen {
                    id: f.id.clone(),
                    element_octets: width / 8,
                }),
                Some(_) => return None,
                None => variable.push(SizeTerm::ArrayElementSum { id: f.id.clone() }),
            },
            _ => return None,
        }
    }
    Some(SizeTerms {
        const_octets: const_bits / 8,
        variable,
    })
}

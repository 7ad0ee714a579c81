//! Shared test doubles: IR fixtures and a small plan interpreter.
//!
//! The interpreter executes parse and serialize programs against real
//! byte buffers, standing in for a rendered backend so round-trip,
//! guard, checksum, and specialization behavior can be observed.
use std::collections::{BTreeMap, HashMap};

use pdl_backend::ir::{normalize, Declaration, Endianness, Field, File};
use pdl_backend::layout;
use pdl_backend::plan::{
    plan_all, ArrayElement, ArrayExtent, ChecksumRegion, ChunkSource, ChunkTarget,
    DeclarationPlans, GuardValue, Length, ParseStep, PayloadExtent, SerializeStep, SizeSource,
};

/// Import and normalize an IR document built around a declaration list.
#[allow(dead_code)]
pub fn load(declarations: serde_json::Value) -> File {
    load_endian(declarations, "little_endian")
}

#[allow(dead_code)]
pub fn load_endian(declarations: serde_json::Value, endianness: &str) -> File {
    let mut file = File::from_json(serde_json::json!({
        "endianness": { "kind": "endianness_declaration", "value": endianness },
        "declarations": declarations,
    }))
    .expect("valid IR");
    normalize(&mut file).expect("normalizes");
    file
}

/// Runtime value produced by the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int(u64),
    Bytes(Vec<u8>),
    List(Vec<Val>),
    Obj(Fields),
}

pub type Fields = BTreeMap<String, Val>;

/// Convert an unpacked vector tree into interpreter fields.
#[allow(dead_code)]
pub fn fields_from_json(value: &serde_json::Value) -> Fields {
    let mut fields = Fields::new();
    let Some(object) = value.as_object() else {
        return fields;
    };
    for (key, value) in object {
        let val = if key == "payload" {
            Val::Bytes(
                value
                    .as_array()
                    .map(|items| items.iter().map(|v| v.as_u64().unwrap_or(0) as u8).collect())
                    .unwrap_or_default(),
            )
        } else {
            json_to_val(value)
        };
        fields.insert(key.clone(), val);
    }
    fields
}

fn json_to_val(value: &serde_json::Value) -> Val {
    match value {
        serde_json::Value::Number(n) => Val::Int(n.as_u64().unwrap_or(0)),
        serde_json::Value::Array(items) => Val::List(items.iter().map(json_to_val).collect()),
        serde_json::Value::Object(_) => Val::Obj(fields_from_json(value)),
        _ => Val::Int(0),
    }
}

/// Convert interpreter fields back into a comparable JSON tree.
#[allow(dead_code)]
pub fn fields_to_json(fields: &Fields) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (key, val) in fields {
        object.insert(key.clone(), val_to_json(val));
    }
    serde_json::Value::Object(object)
}

fn val_to_json(val: &Val) -> serde_json::Value {
    match val {
        Val::Int(v) => serde_json::Value::from(*v),
        Val::Bytes(bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
        Val::List(items) => serde_json::Value::Array(items.iter().map(val_to_json).collect()),
        Val::Obj(fields) => fields_to_json(fields),
    }
}

fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Plan interpreter over a canonical file.
pub struct Runtime<'a> {
    pub file: &'a File,
    plans: HashMap<String, DeclarationPlans>,
}

impl<'a> Runtime<'a> {
    pub fn new(file: &'a File) -> Runtime<'a> {
        let plans = plan_all(file)
            .expect("plannable file")
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Runtime { file, plans }
    }

    fn little(&self) -> bool {
        self.file.byteorder() == Endianness::LittleEndian
    }

    fn uint(&self, bytes: &[u8]) -> u128 {
        let mut value: u128 = 0;
        if self.little() {
            for (index, byte) in bytes.iter().enumerate() {
                value |= (*byte as u128) << (8 * index);
            }
        } else {
            for byte in bytes {
                value = (value << 8) | *byte as u128;
            }
        }
        value
    }

    fn uint_bytes(&self, value: u128, octets: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(octets);
        if self.little() {
            for index in 0..octets {
                out.push((value >> (8 * index)) as u8);
            }
        } else {
            for index in (0..octets).rev() {
                out.push((value >> (8 * index)) as u8);
            }
        }
        out
    }

    /// The user-supplied checksum functions of the test corpus: a plain
    /// byte sum modulo 256 regardless of the declared name.
    fn checksum(&self, _function: &str, bytes: &[u8]) -> u64 {
        bytes.iter().map(|b| u64::from(*b)).sum::<u64>() % 256
    }

    fn enum_ok(&self, type_id: &str, value: u64) -> bool {
        match self.file.typedef(type_id) {
            Some(Declaration::Enum(decl)) => decl.contains(value),
            _ => false,
        }
    }

    //==============================================================PARSE

    /// Parse a full packet; fails on trailing bytes.
    pub fn parse(&self, id: &str, bytes: &[u8]) -> Result<(String, Fields), String> {
        let (packet, fields, rest) = self.exec_parse(id, bytes, Fields::new())?;
        if !rest.is_empty() {
            return Err(format!("{} trailing bytes after {packet}", rest.len()));
        }
        Ok((packet, fields))
    }

    fn exec_parse<'s>(
        &self,
        id: &str,
        mut span: &'s [u8],
        inherited: Fields,
    ) -> Result<(String, Fields, &'s [u8]), String> {
        let plan = &self
            .plans
            .get(id)
            .ok_or_else(|| format!("no plan for {id}"))?
            .parse;

        for guard in &plan.constraints {
            let expected = match &guard.value {
                GuardValue::Scalar(value) => *value,
                GuardValue::Enum { value, .. } => *value,
            };
            match inherited.get(&guard.id) {
                Some(Val::Int(value)) if *value == expected => {}
                _ => return Err(format!("constraint {} failed", guard.id)),
            }
        }

        let mut fields = inherited;
        let mut sizes: HashMap<String, u64> = HashMap::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut saved: Vec<&'s [u8]> = Vec::new();
        let mut payload: Option<Vec<u8>> = None;

        fn eval(
            length: &Length,
            sizes: &HashMap<String, u64>,
            counts: &HashMap<String, u64>,
            span: &[u8],
        ) -> Result<usize, String> {
            Ok(match length {
                Length::Const(n) => *n,
                Length::SizeOf { field_id } => {
                    *sizes.get(field_id).ok_or("missing size local")? as usize
                }
                Length::CountOf { field_id } => {
                    *counts.get(field_id).ok_or("missing count local")? as usize
                }
                Length::CountTimes {
                    field_id,
                    element_octets,
                } => *counts.get(field_id).ok_or("missing count local")? as usize * element_octets,
                Length::Remaining => span.len(),
            })
        }

        for step in &plan.steps {
            match step {
                ParseStep::CheckSize { bytes } => {
                    let wanted = eval(bytes, &sizes, &counts, span)?;
                    if span.len() < wanted {
                        return Err(format!("{id}: span too short for {wanted}"));
                    }
                }
                ParseStep::ReadChunk {
                    offset,
                    width_octets,
                    extract,
                } => {
                    let end = offset + width_octets;
                    if span.len() < end {
                        return Err(format!("{id}: chunk past span"));
                    }
                    let backing = self.uint(&span[*offset..end]);
                    for entry in extract {
                        let value = ((backing >> entry.shift) & mask(entry.width) as u128) as u64;
                        match &entry.target {
                            ChunkTarget::Scalar { id } => {
                                fields.insert(id.clone(), Val::Int(value));
                            }
                            ChunkTarget::Enum { id, type_id } => {
                                if !self.enum_ok(type_id, value) {
                                    return Err(format!("invalid {type_id} value {value}"));
                                }
                                fields.insert(id.clone(), Val::Int(value));
                            }
                            ChunkTarget::SizeLocal { field_id } => {
                                sizes.insert(field_id.clone(), value);
                            }
                            ChunkTarget::CountLocal { field_id } => {
                                counts.insert(field_id.clone(), value);
                            }
                            ChunkTarget::FixedScalar { value: expected } => {
                                if value != *expected {
                                    return Err(format!("fixed mismatch {value}"));
                                }
                            }
                            ChunkTarget::FixedEnum {
                                value: expected, ..
                            } => {
                                if value != *expected {
                                    return Err(format!("fixed enum mismatch {value}"));
                                }
                            }
                        }
                    }
                }
                ParseStep::Consume { octets } => {
                    if span.len() < *octets {
                        return Err("consume past span".into());
                    }
                    span = &span[*octets..];
                }
                ParseStep::AdjustSize { field_id, octets } => {
                    let entry = sizes.get_mut(field_id).ok_or("missing size local")?;
                    *entry = entry
                        .checked_sub(*octets)
                        .ok_or("size smaller than its modifier")?;
                }
                ParseStep::ReadTypedef {
                    id: field_id,
                    type_id,
                    offset,
                    width_octets,
                } => {
                    let end = offset + width_octets;
                    if span.len() < end {
                        return Err("typedef past span".into());
                    }
                    let window = &span[*offset..end];
                    let value = match self.file.typedef(type_id) {
                        Some(Declaration::Struct(_)) => {
                            let (_, inner, rest) =
                                self.exec_parse(type_id, window, Fields::new())?;
                            if !rest.is_empty() {
                                return Err("struct leftover".into());
                            }
                            Val::Obj(inner)
                        }
                        // Constant-width custom fields parse as raw integers.
                        _ => Val::Int(self.uint(window) as u64),
                    };
                    fields.insert(field_id.clone(), value);
                }
                ParseStep::DelegateTypedef {
                    id: field_id,
                    type_id,
                } => {
                    let (_, inner, rest) = self.exec_parse(type_id, span, Fields::new())?;
                    fields.insert(field_id.clone(), Val::Obj(inner));
                    span = rest;
                }
                ParseStep::BeginPadded { octets } => {
                    if span.len() < *octets {
                        return Err("padding past span".into());
                    }
                    saved.push(&span[*octets..]);
                    span = &span[..*octets];
                }
                ParseStep::EndPadded => {
                    span = saved.pop().ok_or("unbalanced padding")?;
                }
                ParseStep::CheckSizeMultiple {
                    size,
                    element_octets,
                } => {
                    let total = eval(size, &sizes, &counts, span)?;
                    if total % element_octets != 0 {
                        return Err("size not a multiple of the element size".into());
                    }
                }
                ParseStep::ReadByteArray { id: field_id, size } => {
                    let n = match size {
                        Some(length) => eval(length, &sizes, &counts, span)?,
                        None => span.len(),
                    };
                    if span.len() < n {
                        return Err("byte array past span".into());
                    }
                    fields.insert(field_id.clone(), Val::Bytes(span[..n].to_vec()));
                    span = &span[n..];
                }
                ParseStep::ReadArray {
                    id: field_id,
                    element,
                    extent,
                } => {
                    let value = match element {
                        ArrayElement::Scalar { width_octets }
                        | ArrayElement::Enum { width_octets, .. } => {
                            let count = match extent {
                                ArrayExtent::Count(c) => eval(c, &sizes, &counts, span)?,
                                ArrayExtent::Bytes(s) => {
                                    eval(s, &sizes, &counts, span)? / width_octets
                                }
                                ArrayExtent::Remaining => span.len() / width_octets,
                            };
                            let mut items = Vec::with_capacity(count);
                            for index in 0..count {
                                let start = index * width_octets;
                                let end = start + width_octets;
                                if span.len() < end {
                                    return Err("array past span".into());
                                }
                                let value = self.uint(&span[start..end]) as u64;
                                if let ArrayElement::Enum { type_id, .. } = element {
                                    if !self.enum_ok(type_id, value) {
                                        return Err(format!("invalid {type_id} value {value}"));
                                    }
                                }
                                items.push(Val::Int(value));
                            }
                            span = &span[count * width_octets..];
                            Val::List(items)
                        }
                        ArrayElement::Typedef {
                            type_id,
                            width_octets: Some(width_octets),
                        } => {
                            let count = match extent {
                                ArrayExtent::Count(c) => eval(c, &sizes, &counts, span)?,
                                ArrayExtent::Bytes(s) => {
                                    eval(s, &sizes, &counts, span)? / width_octets
                                }
                                ArrayExtent::Remaining => span.len() / width_octets,
                            };
                            let mut items = Vec::with_capacity(count);
                            for index in 0..count {
                                let start = index * width_octets;
                                let end = start + width_octets;
                                if span.len() < end {
                                    return Err("array past span".into());
                                }
                                let (_, inner, rest) =
                                    self.exec_parse(type_id, &span[start..end], Fields::new())?;
                                if !rest.is_empty() {
                                    return Err("array element leftover".into());
                                }
                                items.push(Val::Obj(inner));
                            }
                            span = &span[count * width_octets..];
                            Val::List(items)
                        }
                        ArrayElement::Typedef {
                            type_id,
                            width_octets: None,
                        } => {
                            let mut items = Vec::new();
                            match extent {
                                ArrayExtent::Count(c) => {
                                    let count = eval(c, &sizes, &counts, span)?;
                                    for _ in 0..count {
                                        let (_, inner, rest) =
                                            self.exec_parse(type_id, span, Fields::new())?;
                                        items.push(Val::Obj(inner));
                                        span = rest;
                                    }
                                }
                                ArrayExtent::Bytes(s) => {
                                    let total = eval(s, &sizes, &counts, span)?;
                                    if span.len() < total {
                                        return Err("array past span".into());
                                    }
                                    let mut sub = &span[..total];
                                    while !sub.is_empty() {
                                        let (_, inner, rest) =
                                            self.exec_parse(type_id, sub, Fields::new())?;
                                        items.push(Val::Obj(inner));
                                        sub = rest;
                                    }
                                    span = &span[total..];
                                }
                                ArrayExtent::Remaining => {
                                    while !span.is_empty() {
                                        let (_, inner, rest) =
                                            self.exec_parse(type_id, span, Fields::new())?;
                                        items.push(Val::Obj(inner));
                                        span = rest;
                                    }
                                }
                            }
                            Val::List(items)
                        }
                    };
                    fields.insert(field_id.clone(), value);
                }
                ParseStep::ReadPayload { extent } => match extent {
                    PayloadExtent::Sized { field_id } => {
                        let n = *sizes.get(field_id).ok_or("missing payload size")? as usize;
                        if span.len() < n {
                            return Err("payload past span".into());
                        }
                        payload = Some(span[..n].to_vec());
                        span = &span[n..];
                    }
                    PayloadExtent::Trailing => {
                        payload = Some(span.to_vec());
                        span = &span[span.len()..];
                    }
                    PayloadExtent::SuffixDelimited { suffix_octets } => {
                        if span.len() < *suffix_octets {
                            return Err("suffix past span".into());
                        }
                        let cut = span.len() - suffix_octets;
                        payload = Some(span[..cut].to_vec());
                        span = &span[cut..];
                    }
                },
                ParseStep::VerifyChecksum {
                    field_id,
                    function,
                    width_octets,
                    region,
                } => {
                    let (covered, value) = match region {
                        ChecksumRegion::FromStart { prefix_octets } => {
                            let end = prefix_octets + width_octets;
                            if span.len() < end {
                                return Err("checksum past span".into());
                            }
                            (
                                &span[..*prefix_octets],
                                self.uint(&span[*prefix_octets..end]) as u64,
                            )
                        }
                        ChecksumRegion::FromEnd { suffix_octets } => {
                            if span.len() < *suffix_octets {
                                return Err("checksum past span".into());
                            }
                            let start = span.len() - suffix_octets;
                            (
                                &span[..start],
                                self.uint(&span[start..start + width_octets]) as u64,
                            )
                        }
                    };
                    let computed = self.checksum(function, covered);
                    if computed != value {
                        return Err(format!("checksum mismatch {computed} != {value}"));
                    }
                    fields.insert(field_id.clone(), Val::Int(value));
                }
            }
        }

        // Specialize to the first derived packet that accepts the payload.
        for child in &plan.children {
            let mut child_fields = fields.clone();
            child_fields.remove("payload");
            let payload_bytes = payload.clone().unwrap_or_default();
            if let Ok((packet, parsed, _rest)) =
                self.exec_parse(child, &payload_bytes, child_fields)
            {
                return Ok((packet, parsed, span));
            }
        }

        if let Some(bytes) = payload {
            fields.insert("payload".to_string(), Val::Bytes(bytes));
        }
        Ok((plan.packet.clone(), fields, span))
    }

    //==============================================================SERIALIZE

    /// Serialize an instance built through the given declaration,
    /// forcing inherited constraint values the way a builder would.
    pub fn serialize(&self, id: &str, fields: &Fields) -> Result<Vec<u8>, String> {
        let decl = self
            .file
            .packet(id)
            .or_else(|| self.file.typedef(id))
            .ok_or("unknown declaration")?;
        let mut fields = fields.clone();
        for constraint in layout::inherited_constraints(self.file, decl) {
            if fields.contains_key(&constraint.id) {
                continue;
            }
            let value = match constraint.value {
                Some(value) => value,
                None => {
                    let tag_id = constraint.tag_id.clone().unwrap_or_default();
                    let Some(Field::Typedef(typedef)) =
                        layout::packet_field(self.file, decl, &constraint.id)
                    else {
                        return Err("constraint target missing".into());
                    };
                    match self.file.typedef(&typedef.type_id) {
                        Some(Declaration::Enum(e)) => e
                            .tag(&tag_id)
                            .and_then(|t| t.value)
                            .ok_or("constraint tag missing")?,
                        _ => return Err("constraint target is not an enum".into()),
                    }
                }
            };
            fields.insert(constraint.id.clone(), Val::Int(value));
        }
        self.exec_serialize(id, &fields, None)
    }

    fn exec_serialize(
        &self,
        id: &str,
        fields: &Fields,
        payload_override: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, String> {
        let plans = self
            .plans
            .get(id)
            .ok_or_else(|| format!("no plan for {id}"))?;
        let plan = &plans.serialize;
        let mut fields = fields.clone();
        let payload: Vec<u8> = payload_override
            .or_else(|| match fields.get("payload") {
                Some(Val::Bytes(bytes)) => Some(bytes.clone()),
                Some(Val::List(items)) => Some(
                    items
                        .iter()
                        .map(|v| match v {
                            Val::Int(b) => *b as u8,
                            _ => 0,
                        })
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default();

        fn int_field(fields: &Fields, id: &str) -> Result<u64, String> {
            match fields.get(id) {
                Some(Val::Int(value)) => Ok(*value),
                _ => Err(format!("missing field {id}")),
            }
        }
        fn list_len(fields: &Fields, id: &str) -> Result<usize, String> {
            match fields.get(id) {
                Some(Val::List(items)) => Ok(items.len()),
                Some(Val::Bytes(bytes)) => Ok(bytes.len()),
                _ => Err(format!("missing array {id}")),
            }
        }

        let mut out: Vec<u8> = Vec::new();
        let mut checksum_start = 0usize;
        let mut array_starts: HashMap<String, usize> = HashMap::new();

        for step in &plan.steps {
            match step {
                SerializeStep::CheckScalarMax { id, width } => {
                    let value = int_field(&fields, id)?;
                    if value > mask(*width) {
                        fields.insert(id.clone(), Val::Int(value & mask(*width)));
                    }
                }
                SerializeStep::CheckCountMax { field_id, width } => {
                    let limit = mask(*width) as usize;
                    if let Some(Val::List(items)) = fields.get_mut(field_id) {
                        if items.len() > limit {
                            items.truncate(limit);
                        }
                    }
                }
                SerializeStep::CheckPayloadMax {
                    width, modifier, ..
                } => {
                    if payload.len() as u64 + modifier > mask(*width) {
                        return Err("payload overflows its size field".into());
                    }
                }
                SerializeStep::CheckPayloadMin { octets } => {
                    if payload.len() < *octets {
                        return Err("payload shorter than the shared byte".into());
                    }
                }
                SerializeStep::WriteChunk {
                    width_octets,
                    parts,
                } => {
                    let mut backing: u128 = 0;
                    for part in parts {
                        let value: u64 = match &part.source {
                            ChunkSource::Scalar { id } | ChunkSource::EnumField { id, .. } => {
                                int_field(&fields, id)?
                            }
                            ChunkSource::FixedScalar { value } => *value,
                            ChunkSource::FixedEnum { value, .. } => *value,
                            ChunkSource::Count { field_id } => list_len(&fields, field_id)? as u64,
                            ChunkSource::Size {
                                field_id,
                                source,
                                modifier,
                            } => {
                                let base = match source {
                                    SizeSource::Payload => payload.len() as u64,
                                    SizeSource::FixedElementArray { element_octets } => {
                                        (list_len(&fields, field_id)? * element_octets) as u64
                                    }
                                    SizeSource::DynamicElementArray => {
                                        self.dynamic_array_size(id, field_id, &fields)?
                                    }
                                };
                                base + modifier
                            }
                            ChunkSource::PayloadResidue { rounded_octets } => {
                                (self.uint(&payload[..*rounded_octets]) >> part.shift) as u64
                            }
                        };
                        backing |= (value as u128) << part.shift;
                    }
                    out.extend(self.uint_bytes(backing, *width_octets));
                }
                SerializeStep::WriteByteArray { id } => match fields.get(id) {
                    Some(Val::Bytes(bytes)) => out.extend(bytes),
                    Some(Val::List(items)) => {
                        for item in items {
                            match item {
                                Val::Int(value) => out.push(*value as u8),
                                _ => return Err("byte array holds non-integers".into()),
                            }
                        }
                    }
                    _ => return Err(format!("missing array {id}")),
                },
                SerializeStep::WriteScalarArray { id, element_octets }
                | SerializeStep::WriteEnumArray {
                    id, element_octets, ..
                } => {
                    let Some(Val::List(items)) = fields.get(id) else {
                        return Err(format!("missing array {id}"));
                    };
                    for item in items.clone() {
                        match item {
                            Val::Int(value) => {
                                out.extend(self.uint_bytes(value as u128, *element_octets))
                            }
                            _ => return Err("scalar array holds non-integers".into()),
                        }
                    }
                }
                SerializeStep::WriteTypedefArray { id, type_id } => {
                    let Some(Val::List(items)) = fields.get(id) else {
                        return Err(format!("missing array {id}"));
                    };
                    for item in items.clone() {
                        match item {
                            Val::Obj(inner) => {
                                out.extend(self.exec_serialize(type_id, &inner, None)?)
                            }
                            _ => return Err("typedef array holds non-objects".into()),
                        }
                    }
                }
                SerializeStep::MarkArrayStart { id } => {
                    array_starts.insert(id.clone(), out.len());
                }
                SerializeStep::PadToSize { id, padded_octets } => {
                    let start = *array_starts.get(id).ok_or("missing array start")?;
                    let written = out.len() - start;
                    if written > *padded_octets {
                        return Err("array overflows its padding".into());
                    }
                    out.extend(std::iter::repeat(0u8).take(padded_octets - written));
                }
                SerializeStep::WriteTypedef { id, type_id } => match fields.get(id) {
                    Some(Val::Obj(inner)) => {
                        let inner = inner.clone();
                        out.extend(self.exec_serialize(type_id, &inner, None)?)
                    }
                    // Constant-width custom fields serialize as raw integers.
                    Some(Val::Int(value)) => {
                        let width = self
                            .file
                            .typedef(type_id)
                            .and_then(|d| d.width())
                            .ok_or("unsized custom value")?;
                        out.extend(self.uint_bytes(*value as u128, width / 8));
                    }
                    _ => return Err(format!("missing field {id}")),
                },
                SerializeStep::MarkChecksumStart => checksum_start = out.len(),
                SerializeStep::WriteChecksum {
                    function,
                    width_octets,
                    ..
                } => {
                    let value = self.checksum(function, &out[checksum_start..]);
                    out.extend(self.uint_bytes(value as u128, *width_octets));
                }
                SerializeStep::WritePayload => out.extend(&payload),
                SerializeStep::WritePayloadTail { skip_octets } => {
                    out.extend(&payload[*skip_octets..]);
                }
            }
        }

        if let Some(parent) = &plan.parent {
            return self.exec_serialize(parent, &fields, Some(out));
        }
        Ok(out)
    }

    /// Octet size of a dynamic-element array, measured by serializing
    /// each element.
    fn dynamic_array_size(
        &self,
        packet: &str,
        field_id: &str,
        fields: &Fields,
    ) -> Result<u64, String> {
        let decl = self
            .file
            .packet(packet)
            .or_else(|| self.file.typedef(packet))
            .ok_or("unknown declaration")?;
        let Some(Field::Array(array)) = layout::packet_field(self.file, decl, field_id) else {
            return Err(format!("missing array {field_id}"));
        };
        let type_id = array.type_id.clone().ok_or("array has no element type")?;
        let Some(Val::List(items)) = fields.get(field_id) else {
            return Err(format!("missing array {field_id}"));
        };
        let mut total = 0u64;
        for item in items {
            match item {
                Val::Obj(inner) => total += self.exec_serialize(&type_id, inner, None)?.len() as u64,
                _ => return Err("typedef array holds non-objects".into()),
            }
        }
        Ok(total)
    }
}

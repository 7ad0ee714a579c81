//! Reference test-vector generation.
//!
//! For every packet without derived packets, a bounded Cartesian product
//! of per-field values is synthesized, cross-field dependencies (sizes,
//! counts, padding, checksums) are resolved in a finalize pass, and each
//! combination is serialized into a `(packed bytes, unpacked tree)` pair.
//! Vectors are grouped under the root ancestor so a generated backend can
//! parse every vector through the root and compare the specialization.
use serde::Serialize;

use crate::error::VectorError;
use crate::ir::{
    ArrayField, Constraint, Declaration, Endianness, Field, File,
};
use crate::layout;

mod bits;
pub use bits::{BitSink, Filler};

/// Hard byte bound for generated typedef arrays.
pub const MAX_ARRAY_SIZE: usize = 256;
/// Hard element bound for generated typedef arrays.
pub const MAX_ARRAY_COUNT: usize = 32;
/// Element count for arrays nothing bounds.
pub const DEFAULT_ARRAY_COUNT: usize = 3;
/// Octet count for payloads nothing bounds.
pub const DEFAULT_PAYLOAD_SIZE: usize = 5;
/// Cap on the per-packet Cartesian product.
const PRODUCT_CAP: usize = 32;
/// Size and count fields wider than this cannot be exhausted by value
/// generation without blowing the working set.
const MAX_EXHAUSTIVE_WIDTH: usize = 16;

/// Vectors of one root packet.
#[derive(Debug, Clone, Serialize)]
pub struct PacketVectors {
    pub packet: String,
    pub tests: Vec<TestVector>,
}

/// One `(packed, unpacked)` pair. `packet` names the derived declaration
/// the vector was built through, when it differs from the root.
#[derive(Debug, Clone, Serialize)]
pub struct TestVector {
    pub packed: String,
    pub unpacked: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<String>,
}

/// Generate vectors for every packet of a canonical file that has no
/// derived packets. An empty `filter` selects all packets; a failing
/// packet is logged and skipped without aborting the run.
pub fn generate(file: &File, filter: &[String]) -> Vec<PacketVectors> {
    let mut groups: Vec<PacketVectors> = Vec::new();
    let mut generator = Generator {
        file,
        filler: Filler::new(),
    };

    for decl in &file.declarations {
        let Declaration::Packet(packet) = decl else {
            continue;
        };
        if !layout::derived_packets(file, decl).is_empty() {
            continue;
        }
        if !filter.is_empty() && !filter.iter().any(|id| id == &packet.id) {
            continue;
        }

        match generator.packet_vectors(decl) {
            Ok((root_id, tests)) => {
                match groups.iter().position(|g| g.packet == root_id) {
                    Some(index) => groups[index].tests.extend(tests),
                    None => groups.push(PacketVectors {
                        packet: root_id,
                        tests,
                    }),
                }
            }
            Err(error) => {
                tracing::warn!(packet = %packet.id, %error, "skipping packet");
            }
        }
    }
    groups
}

//==================================================================================VALUES

fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[derive(Debug, Clone)]
enum Width {
    Bits(usize),
    /// Padding width resolved from the padded field during finalize:
    /// `bits - width(field_id)`.
    PadTo { field_id: String, bits: usize },
}

#[derive(Debug, Clone)]
enum Data {
    Int(u64),
    Seq(Vec<Value>),
    Packet(PacketValue),
    /// Octet size of the referenced sibling, plus its size modifier.
    DeferredSize { field_id: String },
    /// Element count of the referenced sibling array.
    DeferredCount { field_id: String },
    /// Reference checksum over the siblings between marker and value.
    DeferredChecksum { field_id: String },
}

#[derive(Debug, Clone)]
struct Value {
    width: Width,
    data: Data,
}

impl Value {
    fn int(value: u64, width: usize) -> Value {
        Value {
            width: Width::Bits(width),
            data: Data::Int(value),
        }
    }

    fn seq(items: Vec<Value>, packet: &str) -> Result<Value, VectorError> {
        let mut width = 0;
        for item in &items {
            width += item.width_bits(packet)?;
        }
        Ok(Value {
            width: Width::Bits(width),
            data: Data::Seq(items),
        })
    }

    /// Wrap a nested packet, finalizing it so its width is known.
    fn packet(
        mut inner: PacketValue,
        order: Endianness,
        packet: &str,
    ) -> Result<Value, VectorError> {
        inner.finalize(order)?;
        let width = inner.width_bits(packet)?;
        Ok(Value {
            width: Width::Bits(width),
            data: Data::Packet(inner),
        })
    }

    fn width_bits(&self, packet: &str) -> Result<usize, VectorError> {
        match self.width {
            Width::Bits(width) => Ok(width),
            Width::PadTo { .. } => Err(VectorError::UnresolvedValue {
                packet: packet.to_string(),
            }),
        }
    }

    fn serialize_into(&self, sink: &mut BitSink, packet: &str) -> Result<(), VectorError> {
        match &self.data {
            Data::Int(value) => sink.push(*value, self.width_bits(packet)?, packet),
            Data::Seq(items) => {
                for item in items {
                    item.serialize_into(sink, packet)?;
                }
                Ok(())
            }
            Data::Packet(inner) => inner.serialize_into(sink),
            _ => Err(VectorError::UnresolvedValue {
                packet: packet.to_string(),
            }),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match &self.data {
            Data::Int(value) => serde_json::Value::from(*value),
            Data::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Data::Packet(inner) => inner.to_json(),
            _ => serde_json::Value::Null,
        }
    }
}

/// How a field surfaces in the unpacked tree.
#[derive(Debug, Clone)]
enum JsonKey {
    Field(String),
    Payload,
    Skip,
}

#[derive(Debug, Clone)]
struct FieldMeta {
    /// Identifier siblings reference this field by, when it has one.
    id: Option<String>,
    json: JsonKey,
    /// Size modifier octets added to this field's reported size.
    modifier: u64,
    /// Set on checksum markers: the value field the coverage ends at.
    marker_for: Option<String>,
}

#[derive(Debug, Clone)]
struct FieldValue {
    meta: FieldMeta,
    value: Value,
}

#[derive(Debug, Clone)]
struct PacketValue {
    decl_id: String,
    fields: Vec<FieldValue>,
}

impl PacketValue {
    fn width_bits(&self, packet: &str) -> Result<usize, VectorError> {
        let mut width = 0;
        for field in &self.fields {
            width += field.value.width_bits(packet)?;
        }
        Ok(width)
    }

    /// Resolve deferred widths and values in field order. Fields read
    /// only siblings that precede them or have static widths, so a single
    /// ordered pass suffices.
    fn finalize(&mut self, order: Endianness) -> Result<(), VectorError> {
        for index in 0..self.fields.len() {
            let new_width = match &self.fields[index].value.width {
                Width::PadTo { field_id, bits } => {
                    let target_bits = self.lookup_width(field_id)?;
                    if target_bits % 8 != 0 {
                        return Err(VectorError::NonOctetWidth {
                            packet: self.decl_id.clone(),
                            field_id: field_id.clone(),
                        });
                    }
                    if target_bits > *bits {
                        return Err(VectorError::UnsatisfiableArray {
                            packet: self.decl_id.clone(),
                            field_id: field_id.clone(),
                        });
                    }
                    Some(Width::Bits(bits - target_bits))
                }
                Width::Bits(_) => None,
            };
            if let Some(width) = new_width {
                self.fields[index].value.width = width;
            }

            let new_data = match &self.fields[index].value.data {
                Data::DeferredSize { field_id } => {
                    let target = self.lookup(field_id)?;
                    let bits = target.value.width_bits(&self.decl_id)?;
                    if bits % 8 != 0 {
                        return Err(VectorError::NonOctetWidth {
                            packet: self.decl_id.clone(),
                            field_id: field_id.clone(),
                        });
                    }
                    Some(Data::Int(bits as u64 / 8 + target.meta.modifier))
                }
                Data::DeferredCount { field_id } => {
                    let target = self.lookup(field_id)?;
                    let Data::Seq(items) = &target.value.data else {
                        return Err(VectorError::MissingField {
                            packet: self.decl_id.clone(),
                            field_id: field_id.clone(),
                        });
                    };
                    Some(Data::Int(items.len() as u64))
                }
                Data::DeferredChecksum { field_id } => {
                    if self.fields[index].value.width_bits(&self.decl_id)? != 8 {
                        return Err(VectorError::UnsupportedChecksumWidth {
                            packet: self.decl_id.clone(),
                            field_id: field_id.clone(),
                        });
                    }
                    let field_id = field_id.clone();
                    Some(Data::Int(self.compute_checksum(&field_id, order)?))
                }
                _ => None,
            };
            if let Some(data) = new_data {
                self.fields[index].value.data = data;
            }

            match &mut self.fields[index].value.data {
                Data::Packet(inner) => inner.finalize(order)?,
                Data::Seq(items) => {
                    for item in items {
                        if let Data::Packet(inner) = &mut item.data {
                            inner.finalize(order)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn lookup(&self, field_id: &str) -> Result<&FieldValue, VectorError> {
        self.fields
            .iter()
            .find(|f| f.meta.id.as_deref() == Some(field_id))
            .ok_or_else(|| VectorError::MissingField {
                packet: self.decl_id.clone(),
                field_id: field_id.to_string(),
            })
    }

    fn lookup_width(&self, field_id: &str) -> Result<usize, VectorError> {
        self.lookup(field_id)?.value.width_bits(&self.decl_id)
    }

    /// Reference checksum: byte sum of the fields between the marker and
    /// the value field, modulo 256.
    fn compute_checksum(&self, field_id: &str, order: Endianness) -> Result<u64, VectorError> {
        let malformed = || VectorError::MalformedChecksum {
            packet: self.decl_id.clone(),
            field_id: field_id.to_string(),
        };
        let mut sink: Option<BitSink> = None;
        for field in &self.fields {
            if field.meta.marker_for.as_deref() == Some(field_id) {
                sink = Some(BitSink::new(order));
            } else if field.meta.id.as_deref() == Some(field_id) {
                let sink = sink.ok_or_else(malformed)?;
                return Ok(sink.bytes().iter().map(|b| u64::from(*b)).sum::<u64>() % 256);
            } else if let Some(sink) = sink.as_mut() {
                field.value.serialize_into(sink, &self.decl_id)?;
            }
        }
        Err(malformed())
    }

    fn serialize_into(&self, sink: &mut BitSink) -> Result<(), VectorError> {
        for field in &self.fields {
            field.value.serialize_into(sink, &self.decl_id)?;
        }
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for field in &self.fields {
            match &field.meta.json {
                JsonKey::Payload => {
                    if let Data::Packet(inner) = &field.value.data {
                        if let serde_json::Value::Object(entries) = inner.to_json() {
                            object.extend(entries);
                        }
                    } else {
                        object.insert("payload".to_string(), field.value.to_json());
                    }
                }
                JsonKey::Field(id) => {
                    object.insert(id.clone(), field.value.to_json());
                }
                JsonKey::Skip => {}
            }
        }
        serde_json::Value::Object(object)
    }
}

//==================================================================================PRODUCT

/// Cartesian product of per-field value options, capped at
/// [`PRODUCT_CAP`]. Past the cap, `max_len + 1` samples are taken picking
/// `option[i mod len]` per field, so every value appears at least once.
fn product(options: &[Vec<FieldValue>]) -> Vec<Vec<FieldValue>> {
    let count = options
        .iter()
        .fold(1usize, |acc, o| acc.saturating_mul(o.len()));
    if count <= PRODUCT_CAP {
        return cartesian(options);
    }
    let max_len = options.iter().map(Vec::len).max().unwrap_or(0);
    (0..=max_len)
        .map(|index| {
            options
                .iter()
                .map(|o| o[index % o.len()].clone())
                .collect()
        })
        .collect()
}

fn cartesian(options: &[Vec<FieldValue>]) -> Vec<Vec<FieldValue>> {
    let Some((head, rest)) = options.split_first() else {
        return vec![Vec::new()];
    };
    let tails = cartesian(rest);
    let mut out = Vec::new();
    for item in head {
        for tail in &tails {
            let mut combo = Vec::with_capacity(1 + tail.len());
            combo.push(item.clone());
            combo.extend(tail.iter().cloned());
            out.push(combo);
        }
    }
    out
}

//==================================================================================GENERATOR

struct Generator<'a> {
    file: &'a File,
    filler: Filler,
}

impl<'a> Generator<'a> {
    /// Vectors for one leaf declaration, keyed by its root ancestor.
    fn packet_vectors(
        &mut self,
        decl: &Declaration,
    ) -> Result<(String, Vec<TestVector>), VectorError> {
        let options = self.fields_recursive(decl, Vec::new(), None)?;
        let root_id = layout::ancestor(self.file, decl)
            .id()
            .unwrap_or_default()
            .to_string();
        let leaf_id = decl.id().unwrap_or_default().to_string();
        let derived = decl.parent_id().is_some();
        let order = self.file.byteorder();

        let mut tests = Vec::new();
        for combo in product(&options) {
            let mut value = PacketValue {
                decl_id: root_id.clone(),
                fields: combo,
            };
            value.finalize(order)?;
            let mut sink = BitSink::new(order);
            value.serialize_into(&mut sink)?;
            if sink.pending_bits() != 0 {
                return Err(VectorError::NonOctetPacket {
                    packet: root_id.clone(),
                });
            }
            let packed: String = sink
                .into_bytes()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect();
            tests.push(TestVector {
                packed,
                unpacked: value.to_json(),
                packet: derived.then(|| leaf_id.clone()),
            });
        }
        Ok((root_id, tests))
    }

    /// Walk from a leaf declaration up to its root, wrapping each level's
    /// combinations as the parent's payload values, and return the root's
    /// per-field options.
    fn fields_recursive(
        &mut self,
        decl: &Declaration,
        constraints: Vec<Constraint>,
        payload: Option<Vec<PacketValue>>,
    ) -> Result<Vec<Vec<FieldValue>>, VectorError> {
        let options = self.fields_options(decl, &constraints, payload.as_deref())?;
        let Some(parent_id) = decl.parent_id() else {
            return Ok(options);
        };
        let decl_id = decl.id().unwrap_or_default().to_string();

        let packets: Vec<PacketValue> = product(&options)
            .into_iter()
            .map(|fields| PacketValue {
                decl_id: decl_id.clone(),
                fields,
            })
            .collect();

        let parent = match decl {
            Declaration::Packet(_) => self.file.packet(parent_id),
            _ => self.file.typedef(parent_id),
        }
        .ok_or_else(|| VectorError::MissingField {
            packet: decl_id,
            field_id: parent_id.to_string(),
        })?;

        let mut merged = constraints;
        merged.extend(decl.constraints().iter().cloned());
        self.fields_recursive(parent, merged, Some(packets))
    }

    /// Per-field value options for one declaration level.
    fn fields_options(
        &mut self,
        decl: &Declaration,
        constraints: &[Constraint],
        payload: Option<&[PacketValue]>,
    ) -> Result<Vec<Vec<FieldValue>>, VectorError> {
        let packet = decl.id().unwrap_or_default().to_string();
        let mut options = Vec::with_capacity(decl.fields().len());
        for (index, field) in decl.fields().iter().enumerate() {
            let meta = self.field_meta(&packet, field)?;
            let values = self.field_values(decl, &packet, index, field, constraints, payload)?;
            options.push(
                values
                    .into_iter()
                    .map(|value| FieldValue {
                        meta: meta.clone(),
                        value,
                    })
                    .collect(),
            );
        }
        Ok(options)
    }

    fn field_meta(&self, packet: &str, field: &Field) -> Result<FieldMeta, VectorError> {
        let plain = |id: &str, modifier: u64| FieldMeta {
            id: Some(id.to_string()),
            json: JsonKey::Field(id.to_string()),
            modifier,
            marker_for: None,
        };
        let hidden = FieldMeta {
            id: None,
            json: JsonKey::Skip,
            modifier: 0,
            marker_for: None,
        };
        Ok(match field {
            Field::Scalar(f) => plain(&f.id, 0),
            Field::Typedef(f) => plain(&f.id, 0),
            Field::Array(f) => plain(&f.id, self.modifier_octets(packet, f)?),
            Field::Payload(f) => FieldMeta {
                id: field.id().map(str::to_string),
                json: JsonKey::Payload,
                modifier: f.modifier_octets().ok_or_else(|| {
                    VectorError::InvalidSizeModifier {
                        packet: packet.to_string(),
                        field_id: crate::ir::PAYLOAD_ID.to_string(),
                    }
                })?,
                marker_for: None,
            },
            Field::Body(_) => FieldMeta {
                id: field.id().map(str::to_string),
                json: JsonKey::Payload,
                modifier: 0,
                marker_for: None,
            },
            Field::Checksum(f) => FieldMeta {
                id: None,
                json: JsonKey::Skip,
                modifier: 0,
                marker_for: Some(f.field_id.clone()),
            },
            _ => hidden,
        })
    }

    fn modifier_octets(&self, packet: &str, array: &ArrayField) -> Result<u64, VectorError> {
        array
            .modifier_octets()
            .ok_or_else(|| VectorError::InvalidSizeModifier {
                packet: packet.to_string(),
                field_id: array.id.clone(),
            })
    }

    fn field_values(
        &mut self,
        decl: &Declaration,
        packet: &str,
        index: usize,
        field: &Field,
        constraints: &[Constraint],
        payload: Option<&[PacketValue]>,
    ) -> Result<Vec<Value>, VectorError> {
        let order = self.file.byteorder();
        match field {
            // Markers contribute nothing to the byte stream themselves.
            Field::Checksum(_) => Ok(vec![Value::int(0, 0)]),

            Field::Padding(padding) => {
                let target = decl.fields()[..index]
                    .last()
                    .and_then(Field::id)
                    .ok_or_else(|| VectorError::MissingField {
                        packet: packet.to_string(),
                        field_id: "padding".to_string(),
                    })?;
                Ok(vec![Value {
                    width: Width::PadTo {
                        field_id: target.to_string(),
                        bits: padding.size * 8,
                    },
                    data: Data::Int(0),
                }])
            }

            Field::Size(f) => Ok(vec![Value {
                width: Width::Bits(f.width),
                data: Data::DeferredSize {
                    field_id: f.field_id.clone(),
                },
            }]),

            Field::Count(f) => Ok(vec![Value {
                width: Width::Bits(f.width),
                data: Data::DeferredCount {
                    field_id: f.field_id.clone(),
                },
            }]),

            Field::Payload(_) | Field::Body(_) => match payload {
                Some(packets) => packets
                    .iter()
                    .map(|p| Value::packet(p.clone(), order, packet))
                    .collect(),
                None => self.payload_values(decl, packet, field),
            },

            Field::Fixed(f) => {
                if let (Some(width), Some(value)) = (f.width, f.value) {
                    Ok(vec![Value::int(value, width)])
                } else {
                    let enum_id = f.enum_id.clone().unwrap_or_default();
                    let tag_id = f.tag_id.clone().unwrap_or_default();
                    let Some(Declaration::Enum(decl)) = self.file.typedef(&enum_id) else {
                        return Err(VectorError::UnknownTag {
                            packet: packet.to_string(),
                            enum_id,
                            tag_id,
                        });
                    };
                    let value = decl.tag(&tag_id).and_then(|t| t.value).ok_or_else(|| {
                        VectorError::UnknownTag {
                            packet: packet.to_string(),
                            enum_id: enum_id.clone(),
                            tag_id: tag_id.clone(),
                        }
                    })?;
                    Ok(vec![Value::int(value, decl.width)])
                }
            }

            Field::Reserved(f) => Ok(vec![Value::int(0, f.width)]),

            Field::Array(array) => {
                if array.width.is_some() {
                    self.scalar_array_values(decl, packet, array)
                } else {
                    self.typedef_array_values(decl, packet, array)
                }
            }

            Field::Scalar(f) => {
                for constraint in constraints {
                    if constraint.id == f.id {
                        let value = constraint.value.unwrap_or(0);
                        return Ok(vec![Value::int(value, f.width)]);
                    }
                }
                if f.width > 64 {
                    return Err(VectorError::WidthOverflow {
                        packet: packet.to_string(),
                        field_id: f.id.clone(),
                    });
                }
                Ok(vec![
                    Value::int(0, f.width),
                    Value::int(mask(f.width), f.width),
                    Value::int(self.filler.next_bits(f.width), f.width),
                ])
            }

            Field::Typedef(f) => self.typedef_field_values(packet, &f.id, &f.type_id, constraints),

            Field::Group(_) => Err(VectorError::UnexpectedGroup {
                packet: packet.to_string(),
            }),
        }
    }

    /// `{empty, max-capacity}` for sized payloads, a default-size filler
    /// payload otherwise.
    fn payload_values(
        &mut self,
        decl: &Declaration,
        packet: &str,
        field: &Field,
    ) -> Result<Vec<Value>, VectorError> {
        let payload_id = field.id().unwrap_or_default();
        let modifier = match field {
            Field::Payload(f) => {
                f.modifier_octets()
                    .ok_or_else(|| VectorError::InvalidSizeModifier {
                        packet: packet.to_string(),
                        field_id: payload_id.to_string(),
                    })?
            }
            _ => 0,
        };

        let max_size = match layout::payload_size_source(decl, payload_id) {
            Some(size_field) => {
                if size_field.width > MAX_EXHAUSTIVE_WIDTH {
                    return Err(VectorError::WidthOverflow {
                        packet: packet.to_string(),
                        field_id: payload_id.to_string(),
                    });
                }
                mask(size_field.width) as usize
            }
            None => DEFAULT_PAYLOAD_SIZE,
        };
        let max_size = max_size
            .checked_sub(modifier as usize)
            .filter(|n| *n > 0)
            .ok_or_else(|| VectorError::UnsatisfiableArray {
                packet: packet.to_string(),
                field_id: payload_id.to_string(),
            })?;

        let filler: Vec<Value> = (0..max_size)
            .map(|_| Value::int(self.filler.next_bits(8), 8))
            .collect();
        Ok(vec![
            Value::seq(Vec::new(), packet)?,
            Value::seq(filler, packet)?,
        ])
    }

    fn gen_list(&mut self, width: usize, count: usize) -> Vec<Value> {
        (0..count)
            .map(|_| Value::int(self.filler.next_bits(width), width))
            .collect()
    }

    fn scalar_array_values(
        &mut self,
        decl: &Declaration,
        packet: &str,
        array: &ArrayField,
    ) -> Result<Vec<Value>, VectorError> {
        let width = array.width.unwrap_or(0);
        if width % 8 != 0 {
            return Err(VectorError::NonOctetWidth {
                packet: packet.to_string(),
                field_id: array.id.clone(),
            });
        }
        if width > 64 {
            return Err(VectorError::WidthOverflow {
                packet: packet.to_string(),
                field_id: array.id.clone(),
            });
        }
        let element_octets = width / 8;
        let modifier = self.modifier_octets(packet, array)?;

        let too_wide = |w: usize| w > MAX_EXHAUSTIVE_WIDTH;
        let overflow = || VectorError::WidthOverflow {
            packet: packet.to_string(),
            field_id: array.id.clone(),
        };

        match layout::array_size_source(decl, array) {
            layout::ArraySize::Static(count) => {
                Ok(vec![Value::seq(self.gen_list(width, count), packet)?])
            }
            layout::ArraySize::Count(count_field) => {
                if too_wide(count_field.width) {
                    return Err(overflow());
                }
                let max_count = mask(count_field.width) as usize;
                Ok(vec![
                    Value::seq(Vec::new(), packet)?,
                    Value::seq(self.gen_list(width, max_count), packet)?,
                ])
            }
            layout::ArraySize::Size(size_field) => {
                if too_wide(size_field.width) {
                    return Err(overflow());
                }
                let max_size = (mask(size_field.width) as usize)
                    .checked_sub(modifier as usize)
                    .ok_or_else(|| VectorError::UnsatisfiableArray {
                        packet: packet.to_string(),
                        field_id: array.id.clone(),
                    })?;
                let max_count = max_size / element_octets;
                Ok(vec![
                    Value::seq(Vec::new(), packet)?,
                    Value::seq(self.gen_list(width, max_count), packet)?,
                ])
            }
            layout::ArraySize::Unbounded => Ok(vec![
                Value::seq(Vec::new(), packet)?,
                Value::seq(self.gen_list(width, DEFAULT_ARRAY_COUNT), packet)?,
            ]),
        }
    }

    /// Pack enumerated element values into chunks shaped by the array
    /// bounds, plus an empty array when the bounds allow one.
    fn typedef_array_values(
        &mut self,
        decl: &Declaration,
        packet: &str,
        array: &ArrayField,
    ) -> Result<Vec<Value>, VectorError> {
        let type_id = array.type_id.clone().unwrap_or_default();
        let type_decl =
            self.file
                .typedef(&type_id)
                .cloned()
                .ok_or_else(|| VectorError::MissingField {
                    packet: packet.to_string(),
                    field_id: type_id.clone(),
                })?;
        let modifier = self.modifier_octets(packet, array)?;

        let mut min_count = 0usize;
        let mut max_count = MAX_ARRAY_COUNT;
        let mut max_size = array.padded_size.unwrap_or(MAX_ARRAY_SIZE);

        match layout::array_size_source(decl, array) {
            layout::ArraySize::Size(size_field) => {
                if size_field.width > MAX_EXHAUSTIVE_WIDTH {
                    return Err(VectorError::WidthOverflow {
                        packet: packet.to_string(),
                        field_id: array.id.clone(),
                    });
                }
                max_size = (mask(size_field.width) as usize)
                    .checked_sub(modifier as usize)
                    .ok_or_else(|| VectorError::UnsatisfiableArray {
                        packet: packet.to_string(),
                        field_id: array.id.clone(),
                    })?;
            }
            layout::ArraySize::Count(count_field) => {
                if count_field.width > MAX_EXHAUSTIVE_WIDTH {
                    return Err(VectorError::WidthOverflow {
                        packet: packet.to_string(),
                        field_id: array.id.clone(),
                    });
                }
                max_count = mask(count_field.width) as usize;
            }
            layout::ArraySize::Static(count) => {
                min_count = count;
                max_count = count;
            }
            layout::ArraySize::Unbounded => {}
        }

        let unsatisfiable = || VectorError::UnsatisfiableArray {
            packet: packet.to_string(),
            field_id: array.id.clone(),
        };

        let mut values = Vec::new();
        let mut chunk: Vec<Value> = Vec::new();
        let mut chunk_size = 0usize;
        let mut rounds = 0;
        while values.is_empty() {
            rounds += 1;
            if rounds > 64 {
                return Err(unsatisfiable());
            }
            let element_values = self.typedef_values(&type_decl, packet)?;
            if element_values.is_empty() {
                return Err(unsatisfiable());
            }
            for element in element_values {
                let bits = element.width_bits(packet)?;
                if bits % 8 != 0 {
                    return Err(VectorError::NonOctetWidth {
                        packet: packet.to_string(),
                        field_id: array.id.clone(),
                    });
                }
                let element_size = bits / 8;
                if chunk.len() >= max_count || chunk_size + element_size > max_size {
                    if chunk.len() < min_count {
                        return Err(unsatisfiable());
                    }
                    values.push(Value::seq(std::mem::take(&mut chunk), packet)?);
                    chunk_size = 0;
                }
                chunk.push(element);
                chunk_size += element_size;
            }
        }

        if min_count == 0 {
            values.push(Value::seq(Vec::new(), packet)?);
        }
        Ok(values)
    }

    fn typedef_field_values(
        &mut self,
        packet: &str,
        field_id: &str,
        type_id: &str,
        constraints: &[Constraint],
    ) -> Result<Vec<Value>, VectorError> {
        let type_decl =
            self.file
                .typedef(type_id)
                .cloned()
                .ok_or_else(|| VectorError::MissingField {
                    packet: packet.to_string(),
                    field_id: type_id.to_string(),
                })?;

        if let Declaration::Enum(enum_decl) = &type_decl {
            for constraint in constraints {
                if constraint.id == field_id {
                    let tag_id = constraint.tag_id.clone().unwrap_or_default();
                    let value =
                        enum_decl
                            .tag(&tag_id)
                            .and_then(|t| t.value)
                            .ok_or_else(|| VectorError::UnknownTag {
                                packet: packet.to_string(),
                                enum_id: type_id.to_string(),
                                tag_id,
                            })?;
                    return Ok(vec![Value::int(value, enum_decl.width)]);
                }
            }
        }

        if matches!(type_decl, Declaration::Checksum(_)) {
            let width = type_decl.width().unwrap_or(0);
            return Ok(vec![Value {
                width: Width::Bits(width),
                data: Data::DeferredChecksum {
                    field_id: field_id.to_string(),
                },
            }]);
        }

        self.typedef_values(&type_decl, packet)
    }

    /// Every value a typedef declaration can take: all enum tags, or all
    /// struct combinations.
    fn typedef_values(
        &mut self,
        decl: &Declaration,
        packet: &str,
    ) -> Result<Vec<Value>, VectorError> {
        let order = self.file.byteorder();
        match decl {
            Declaration::Enum(e) => Ok(e
                .named_values()
                .into_iter()
                .map(|(_, value)| Value::int(value, e.width))
                .collect()),
            Declaration::Struct(_) => {
                let packets = self.struct_values(decl)?;
                packets
                    .into_iter()
                    .map(|p| Value::packet(p, order, packet))
                    .collect()
            }
            Declaration::CustomField(c) => Err(VectorError::UnsupportedCustomField {
                type_id: c.id.clone(),
            }),
            _ => Err(VectorError::UnsupportedCustomField {
                type_id: decl.id().unwrap_or_default().to_string(),
            }),
        }
    }

    fn struct_values(&mut self, decl: &Declaration) -> Result<Vec<PacketValue>, VectorError> {
        let decl_id = decl.id().unwrap_or_default().to_string();
        let options = self.fields_recursive(decl, Vec::new(), None)?;
        Ok(product(&options)
            .into_iter()
            .map(|fields| PacketValue {
                decl_id: decl_id.clone(),
                fields,
            })
            .collect())
    }
}

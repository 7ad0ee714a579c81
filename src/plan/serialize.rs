//! Serialize planner: the write-side mirror of the parse planner.
//!
//! Bit fields accumulate as `(expression, shift)` parts of an open chunk
//! that is or-combined and written when a byte boundary is reached.
//! Derived declarations serialize their own fields into a buffer and hand
//! it to the parent as its payload.
use crate::error::PlanError;
use crate::ir::{Declaration, Field, File};
use crate::layout;
use crate::plan::parse::enum_tag_value;
use crate::plan::{
    ChunkPart, ChunkSource, SerializePlan, SerializeStep, SizeSource,
};

/// Build the serialize program for a packet or struct declaration.
pub fn plan_serialize(file: &File, decl: &Declaration) -> Result<SerializePlan, PlanError> {
    if !matches!(decl, Declaration::Packet(_) | Declaration::Struct(_)) {
        return Err(PlanError::NotAPacket {
            id: decl.id().unwrap_or_default().to_string(),
        });
    }
    let decl_id = decl.id().unwrap_or_default().to_string();

    let shift = layout::packet_shift(file, decl);
    if shift != 0 && !file.byteorder().is_little() {
        return Err(PlanError::BigEndianShiftedBody {
            decl: decl_id.clone(),
        });
    }

    let mut planner = Planner {
        file,
        decl,
        decl_id: decl_id.clone(),
        shift,
        parts: Vec::new(),
        steps: Vec::new(),
    };
    for field in decl.fields() {
        planner.plan_field(field)?;
    }
    if planner.shift % 8 != 0 {
        return Err(PlanError::TrailingBits { decl: decl_id });
    }

    Ok(SerializePlan {
        packet: decl_id,
        shift,
        steps: planner.steps,
        parent: decl.parent_id().map(str::to_string),
    })
}

struct Planner<'a> {
    file: &'a File,
    decl: &'a Declaration,
    decl_id: String,
    /// Bits accumulated in the open chunk.
    shift: usize,
    /// Pending chunk contributions.
    parts: Vec<ChunkPart>,
    steps: Vec<SerializeStep>,
}

impl<'a> Planner<'a> {
    fn unaligned(&self, field: &Field) -> PlanError {
        PlanError::UnalignedField {
            decl: self.decl_id.clone(),
            field: field.id().unwrap_or(field.kind_name()).to_string(),
        }
    }

    /// Append a chunk contribution, writing the chunk out when it reaches
    /// a byte boundary.
    fn push_part(&mut self, width: usize, source: Option<ChunkSource>) {
        if let Some(source) = source {
            self.parts.push(ChunkPart {
                shift: self.shift,
                width,
                source,
            });
        }
        self.shift += width;
        if self.shift % 8 == 0 {
            self.pack_chunk();
        }
    }

    fn pack_chunk(&mut self) {
        debug_assert_eq!(self.shift % 8, 0);
        self.steps.push(SerializeStep::WriteChunk {
            width_octets: self.shift / 8,
            parts: std::mem::take(&mut self.parts),
        });
        self.shift = 0;
    }

    fn plan_field(&mut self, field: &'a Field) -> Result<(), PlanError> {
        if layout::is_bit_field(self.file, field) {
            return self.plan_bit_field(field);
        }

        match field {
            Field::Padding(_) => Ok(()),
            Field::Array(_) => {
                if self.shift != 0 {
                    return Err(self.unaligned(field));
                }
                self.plan_array(field)
            }
            Field::Typedef(_) => self.plan_typedef(field),
            Field::Payload(_) | Field::Body(_) => self.plan_payload(),
            Field::Checksum(_) => {
                if self.shift != 0 {
                    return Err(self.unaligned(field));
                }
                self.steps.push(SerializeStep::MarkChecksumStart);
                Ok(())
            }
            Field::Group(_) => Err(PlanError::UnexpectedGroup {
                decl: self.decl_id.clone(),
            }),
            _ => unreachable!("bit fields are handled above"),
        }
    }

    fn plan_bit_field(&mut self, field: &Field) -> Result<(), PlanError> {
        match field {
            Field::Scalar(f) => {
                self.steps.push(SerializeStep::CheckScalarMax {
                    id: f.id.clone(),
                    width: f.width,
                });
                self.push_part(f.width, Some(ChunkSource::Scalar { id: f.id.clone() }));
            }
            Field::Fixed(f) => {
                if let (Some(width), Some(value)) = (f.width, f.value) {
                    self.push_part(width, Some(ChunkSource::FixedScalar { value }));
                } else {
                    let enum_id = f.enum_id.clone().unwrap_or_default();
                    let tag_id = f.tag_id.clone().unwrap_or_default();
                    let value = enum_tag_value(self.file, &enum_id, &tag_id, &self.decl_id)?;
                    let width = self
                        .file
                        .typedef(&enum_id)
                        .and_then(Declaration::width)
                        .unwrap_or(0);
                    self.push_part(
                        width,
                        Some(ChunkSource::FixedEnum {
                            enum_id,
                            tag_id,
                            value,
                        }),
                    );
                }
            }
            Field::Typedef(f) => {
                let width = self
                    .file
                    .typedef(&f.type_id)
                    .and_then(Declaration::width)
                    .unwrap_or(0);
                self.push_part(
                    width,
                    Some(ChunkSource::EnumField {
                        id: f.id.clone(),
                        type_id: f.type_id.clone(),
                    }),
                );
            }
            Field::Size(f) => {
                let (source, modifier) = self.size_source(&f.field_id)?;
                if matches!(source, SizeSource::Payload) {
                    self.steps.push(SerializeStep::CheckPayloadMax {
                        field_id: f.field_id.clone(),
                        width: f.width,
                        modifier,
                    });
                }
                self.push_part(
                    f.width,
                    Some(ChunkSource::Size {
                        field_id: f.field_id.clone(),
                        source,
                        modifier,
                    }),
                );
            }
            Field::Count(f) => {
                self.steps.push(SerializeStep::CheckCountMax {
                    field_id: f.field_id.clone(),
                    width: f.width,
                });
                self.push_part(
                    f.width,
                    Some(ChunkSource::Count {
                        field_id: f.field_id.clone(),
                    }),
                );
            }
            Field::Reserved(f) => self.push_part(f.width, None),
            _ => unreachable!("not a bit field"),
        }
        Ok(())
    }

    /// Resolve how the value of a size field is computed from its target.
    fn size_source(&self, field_id: &str) -> Result<(SizeSource, u64), PlanError> {
        let target =
            layout::packet_field(self.file, self.decl, field_id).ok_or_else(|| {
                PlanError::UnknownField {
                    decl: self.decl_id.clone(),
                    field_id: field_id.to_string(),
                }
            })?;
        let not_octet = |field: &str| PlanError::ElementWidthNotOctet {
            decl: self.decl_id.clone(),
            field: field.to_string(),
        };
        match target {
            Field::Payload(payload) => {
                let modifier =
                    payload
                        .modifier_octets()
                        .ok_or_else(|| PlanError::InvalidSizeModifier {
                            decl: self.decl_id.clone(),
                            field: field_id.to_string(),
                            text: payload.size_modifier.clone().unwrap_or_default(),
                        })?;
                Ok((SizeSource::Payload, modifier))
            }
            Field::Body(_) => Ok((SizeSource::Payload, 0)),
            Field::Array(array) => {
                let modifier =
                    array
                        .modifier_octets()
                        .ok_or_else(|| PlanError::InvalidSizeModifier {
                            decl: self.decl_id.clone(),
                            field: array.id.clone(),
                            text: array.size_modifier.clone().unwrap_or_default(),
                        })?;
                if let Some(width) = array.width {
                    if width % 8 != 0 {
                        return Err(not_octet(&array.id));
                    }
                    return Ok((
                        SizeSource::FixedElementArray {
                            element_octets: width / 8,
                        },
                        modifier,
                    ));
                }
                match array.type_id.as_deref().and_then(|id| self.file.typedef(id)) {
                    Some(Declaration::Enum(e)) => {
                        if e.width % 8 != 0 {
                            return Err(not_octet(&array.id));
                        }
                        Ok((
                            SizeSource::FixedElementArray {
                                element_octets: e.width / 8,
                            },
                            modifier,
                        ))
                    }
                    _ => Ok((SizeSource::DynamicElementArray, modifier)),
                }
            }
            _ => Err(PlanError::BadSizeTarget {
                decl: self.decl_id.clone(),
                field_id: field_id.to_string(),
            }),
        }
    }

    fn plan_typedef(&mut self, field: &'a Field) -> Result<(), PlanError> {
        let Field::Typedef(typedef) = field else {
            unreachable!()
        };
        if self.shift != 0 {
            return Err(self.unaligned(field));
        }
        let referent = self.file.typedef(&typedef.type_id);
        if let Some(Declaration::Struct(s)) = referent {
            if s.parent_id.is_some() {
                return Err(PlanError::DerivedStructTypedef {
                    decl: self.decl_id.clone(),
                    type_id: typedef.type_id.clone(),
                });
            }
        }

        if let Some(Declaration::Checksum(checksum)) = referent {
            if checksum.width % 8 != 0 {
                return Err(PlanError::ChecksumNotAligned {
                    decl: self.decl_id.clone(),
                    field_id: typedef.id.clone(),
                });
            }
            self.steps.push(SerializeStep::WriteChecksum {
                field_id: typedef.id.clone(),
                function: checksum.function.clone(),
                width_octets: checksum.width / 8,
            });
        } else {
            self.steps.push(SerializeStep::WriteTypedef {
                id: typedef.id.clone(),
                type_id: typedef.type_id.clone(),
            });
        }
        Ok(())
    }

    fn plan_array(&mut self, field: &'a Field) -> Result<(), PlanError> {
        let Field::Array(array) = field else {
            unreachable!()
        };
        let not_octet = || PlanError::ElementWidthNotOctet {
            decl: self.decl_id.clone(),
            field: array.id.clone(),
        };

        if array.padded_size.is_some() {
            self.steps.push(SerializeStep::MarkArrayStart {
                id: array.id.clone(),
            });
        }

        match (array.width, &array.type_id) {
            (Some(8), _) => self.steps.push(SerializeStep::WriteByteArray {
                id: array.id.clone(),
            }),
            (Some(width), _) => {
                if width % 8 != 0 {
                    return Err(not_octet());
                }
                self.steps.push(SerializeStep::WriteScalarArray {
                    id: array.id.clone(),
                    element_octets: width / 8,
                });
            }
            (None, Some(type_id)) => match self.file.typedef(type_id) {
                Some(Declaration::Enum(e)) => {
                    if e.width % 8 != 0 {
                        return Err(not_octet());
                    }
                    self.steps.push(SerializeStep::WriteEnumArray {
                        id: array.id.clone(),
                        type_id: type_id.clone(),
                        element_octets: e.width / 8,
                    });
                }
                _ => self.steps.push(SerializeStep::WriteTypedefArray {
                    id: array.id.clone(),
                    type_id: type_id.clone(),
                }),
            },
            (None, None) => {
                return Err(PlanError::UnsupportedElementType {
                    decl: self.decl_id.clone(),
                    field: array.id.clone(),
                })
            }
        }

        if let Some(padded) = array.padded_size {
            self.steps.push(SerializeStep::PadToSize {
                id: array.id.clone(),
                padded_octets: padded,
            });
        }
        Ok(())
    }

    fn plan_payload(&mut self) -> Result<(), PlanError> {
        if self.shift == 0 {
            self.steps.push(SerializeStep::WritePayload);
            return Ok(());
        }

        if !self.file.byteorder().is_little() {
            return Err(PlanError::BigEndianShiftedBody {
                decl: self.decl_id.clone(),
            });
        }

        // Bit-shifted body: the first payload byte shares bits with the
        // open chunk. Re-extract its high bits, or them into the chunk,
        // and append the rest of the payload after the chunk is written.
        let rounded = (self.shift + 7) / 8;
        let padding_bits = 8 * rounded - self.shift;
        self.steps
            .push(SerializeStep::CheckPayloadMin { octets: rounded });
        self.push_part(
            padding_bits,
            Some(ChunkSource::PayloadResidue {
                rounded_octets: rounded,
            }),
        );
        debug_assert_eq!(self.shift, 0);
        self.steps.push(SerializeStep::WritePayloadTail {
            skip_octets: rounded,
        });
        Ok(())
    }
}

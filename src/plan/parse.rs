//! Parse planner: turns a canonical declaration into an ordered parse
//! program over a byte span.
//!
//! The planner keeps the state of the original field walk: the byte
//! `offset` consumed so far, the bit `shift` inside the open chunk, the
//! buffered chunk entries, and the reads whose size check is still
//! pending. A size check always lands before the reads it covers.
use crate::error::PlanError;
use crate::ir::{ChecksumField, Declaration, Field, File, PayloadField};
use crate::layout;
use crate::plan::{
    ArrayElement, ArrayExtent, ChecksumRegion, ChunkExtract, ChunkTarget, Guard, GuardValue,
    Length, ParsePlan, ParseStep, PayloadExtent,
};

/// Build the parse program for a packet or struct declaration.
pub fn plan_parse(file: &File, decl: &Declaration) -> Result<ParsePlan, PlanError> {
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

    let constraints = guards(file, decl, &decl_id)?;

    let mut planner = Planner {
        file,
        decl,
        decl_id: decl_id.clone(),
        offset: 0,
        shift,
        chunk: Vec::new(),
        unchecked: Vec::new(),
        steps: Vec::new(),
    };
    for (index, field) in decl.fields().iter().enumerate() {
        planner.plan_field(index, field)?;
    }
    planner.consume(0);
    if planner.shift % 8 != 0 {
        return Err(PlanError::TrailingBits { decl: decl_id });
    }

    let children = layout::derived_packets(file, decl)
        .into_iter()
        .filter_map(|(_, child)| child.id().map(str::to_string))
        .collect();

    Ok(ParsePlan {
        packet: decl_id,
        shift,
        constraints,
        steps: planner.steps,
        children,
    })
}

/// Resolve the declaration's own constraints into runtime guards.
fn guards(file: &File, decl: &Declaration, decl_id: &str) -> Result<Vec<Guard>, PlanError> {
    let mut guards = Vec::new();
    for constraint in decl.constraints() {
        let value = if let Some(value) = constraint.value {
            GuardValue::Scalar(value)
        } else {
            let tag_id = constraint
                .tag_id
                .clone()
                .ok_or_else(|| PlanError::BadConstraint {
                    decl: decl_id.to_string(),
                    id: constraint.id.clone(),
                })?;
            let field = layout::packet_field(file, decl, &constraint.id).ok_or_else(|| {
                PlanError::UnknownField {
                    decl: decl_id.to_string(),
                    field_id: constraint.id.clone(),
                }
            })?;
            let Field::Typedef(typedef) = field else {
                return Err(PlanError::BadConstraint {
                    decl: decl_id.to_string(),
                    id: constraint.id.clone(),
                });
            };
            let value = enum_tag_value(file, &typedef.type_id, &tag_id, decl_id)?;
            GuardValue::Enum {
                type_id: typedef.type_id.clone(),
                tag_id,
                value,
            }
        };
        guards.push(Guard {
            id: constraint.id.clone(),
            value,
        });
    }
    Ok(guards)
}

pub(crate) fn enum_tag_value(
    file: &File,
    enum_id: &str,
    tag_id: &str,
    decl_id: &str,
) -> Result<u64, PlanError> {
    let unknown = || PlanError::UnknownTag {
        decl: decl_id.to_string(),
        enum_id: enum_id.to_string(),
        tag_id: tag_id.to_string(),
    };
    let Some(Declaration::Enum(decl)) = file.typedef(enum_id) else {
        return Err(unknown());
    };
    decl.tag(tag_id).and_then(|tag| tag.value).ok_or_else(unknown)
}

struct Planner<'a> {
    file: &'a File,
    decl: &'a Declaration,
    decl_id: String,
    /// Bytes consumed from the span since the last `Consume`.
    offset: usize,
    /// Bits accumulated in the open chunk.
    shift: usize,
    /// `(shift, width, target)` entries of the open chunk.
    chunk: Vec<(usize, usize, Option<ChunkTarget>)>,
    /// Reads whose covering size check has not been emitted yet.
    unchecked: Vec<ParseStep>,
    steps: Vec<ParseStep>,
}

impl<'a> Planner<'a> {
    fn unaligned(&self, field: &Field) -> PlanError {
        PlanError::UnalignedField {
            decl: self.decl_id.clone(),
            field: field.id().unwrap_or(field.kind_name()).to_string(),
        }
    }

    /// Emit a size check. There must be no pending unchecked reads.
    fn check_size(&mut self, bytes: Length) {
        debug_assert!(self.unchecked.is_empty());
        self.steps.push(ParseStep::CheckSize { bytes });
    }

    /// Flush pending reads behind one check covering the consumed prefix.
    fn flush_unchecked(&mut self) {
        if !self.unchecked.is_empty() {
            debug_assert!(self.chunk.is_empty());
            let buffered = std::mem::take(&mut self.unchecked);
            self.steps.push(ParseStep::CheckSize {
                bytes: Length::Const(self.offset),
            });
            self.steps.extend(buffered);
        }
    }

    /// Advance the span past the consumed prefix, keeping the last `keep`
    /// octets visible (a bit-shifted body shares its first byte).
    fn consume(&mut self, keep: usize) {
        if self.offset > 0 {
            self.flush_unchecked();
            if self.offset > keep {
                self.steps.push(ParseStep::Consume {
                    octets: self.offset - keep,
                });
            }
            self.offset = 0;
        }
    }

    /// Append a bit field to the open chunk, closing the chunk when it
    /// reaches a byte boundary.
    fn push_bit(&mut self, width: usize, target: Option<ChunkTarget>) {
        self.chunk.push((self.shift, width, target));
        self.shift += width;
        if self.shift % 8 != 0 {
            return;
        }

        let width_octets = self.shift / 8;
        let extract = self
            .chunk
            .drain(..)
            .filter_map(|(shift, width, target)| {
                target.map(|target| ChunkExtract {
                    shift,
                    width,
                    target,
                })
            })
            .collect();
        self.unchecked.push(ParseStep::ReadChunk {
            offset: self.offset,
            width_octets,
            extract,
        });
        self.offset += width_octets;
        self.shift = 0;
    }

    fn plan_field(&mut self, index: usize, field: &'a Field) -> Result<(), PlanError> {
        if layout::is_bit_field(self.file, field) {
            let (width, target) = self.bit_field_entry(field)?;
            self.push_bit(width, target);
            return Ok(());
        }

        match field {
            // The padded array already accounts for the padding.
            Field::Padding(_) => Ok(()),
            Field::Array(array) if array.width == Some(8) => {
                if self.shift != 0 {
                    return Err(self.unaligned(field));
                }
                self.plan_byte_array(index, field)
            }
            Field::Array(_) => {
                if self.shift != 0 {
                    return Err(self.unaligned(field));
                }
                self.plan_array(index, field)
            }
            Field::Typedef(_) => self.plan_typedef(field),
            Field::Payload(_) | Field::Body(_) => self.plan_payload(index, field),
            Field::Checksum(checksum) => {
                if self.shift != 0 {
                    return Err(self.unaligned(field));
                }
                self.plan_checksum(index, checksum)
            }
            Field::Group(_) => Err(PlanError::UnexpectedGroup {
                decl: self.decl_id.clone(),
            }),
            _ => unreachable!("bit fields are handled above"),
        }
    }

    /// Width and extraction target of a bit-granular field.
    fn bit_field_entry(
        &self,
        field: &Field,
    ) -> Result<(usize, Option<ChunkTarget>), PlanError> {
        match field {
            Field::Scalar(f) => Ok((
                f.width,
                Some(ChunkTarget::Scalar { id: f.id.clone() }),
            )),
            Field::Size(f) => Ok((
                f.width,
                Some(ChunkTarget::SizeLocal {
                    field_id: f.field_id.clone(),
                }),
            )),
            Field::Count(f) => Ok((
                f.width,
                Some(ChunkTarget::CountLocal {
                    field_id: f.field_id.clone(),
                }),
            )),
            Field::Reserved(f) => Ok((f.width, None)),
            Field::Fixed(f) => {
                if let (Some(width), Some(value)) = (f.width, f.value) {
                    Ok((width, Some(ChunkTarget::FixedScalar { value })))
                } else {
                    let enum_id = f.enum_id.clone().unwrap_or_default();
                    let tag_id = f.tag_id.clone().unwrap_or_default();
                    let value = enum_tag_value(self.file, &enum_id, &tag_id, &self.decl_id)?;
                    let width = self
                        .file
                        .typedef(&enum_id)
                        .and_then(Declaration::width)
                        .unwrap_or(0);
                    Ok((
                        width,
                        Some(ChunkTarget::FixedEnum {
                            enum_id,
                            tag_id,
                            value,
                        }),
                    ))
                }
            }
            Field::Typedef(f) => {
                let width = self
                    .file
                    .typedef(&f.type_id)
                    .and_then(Declaration::width)
                    .unwrap_or(0);
                Ok((
                    width,
                    Some(ChunkTarget::Enum {
                        id: f.id.clone(),
                        type_id: f.type_id.clone(),
                    }),
                ))
            }
            _ => unreachable!("not a bit field"),
        }
    }

    fn plan_typedef(&mut self, field: &Field) -> Result<(), PlanError> {
        let Field::Typedef(typedef) = field else {
            unreachable!()
        };
        if self.shift != 0 {
            return Err(PlanError::UnalignedField {
                decl: self.decl_id.clone(),
                field: typedef.id.clone(),
            });
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

        match referent.and_then(|decl| layout::declaration_size(self.file, decl, false)) {
            None => {
                self.consume(0);
                self.steps.push(ParseStep::DelegateTypedef {
                    id: typedef.id.clone(),
                    type_id: typedef.type_id.clone(),
                });
            }
            Some(width) => {
                if width % 8 != 0 {
                    return Err(PlanError::TypedefWidthNotOctet {
                        decl: self.decl_id.clone(),
                        field: typedef.id.clone(),
                    });
                }
                let width_octets = width / 8;
                // The checksum value is read by the verification step
                // emitted at the marker; only advance over it here.
                if !matches!(referent, Some(Declaration::Checksum(_))) {
                    self.unchecked.push(ParseStep::ReadTypedef {
                        id: typedef.id.clone(),
                        type_id: typedef.type_id.clone(),
                        offset: self.offset,
                        width_octets,
                    });
                }
                self.offset += width_octets;
            }
        }
        Ok(())
    }

    /// Octet size of the array's modifier, or the planner error for a
    /// malformed modifier string.
    fn array_modifier(&self, array: &crate::ir::ArrayField) -> Result<u64, PlanError> {
        array
            .modifier_octets()
            .ok_or_else(|| PlanError::InvalidSizeModifier {
                decl: self.decl_id.clone(),
                field: array.id.clone(),
                text: array.size_modifier.clone().unwrap_or_default(),
            })
    }

    /// An array without any extent runs to the end of the span; nothing
    /// can follow it unless a padded window bounds it.
    fn check_unbounded_is_last(
        &self,
        index: usize,
        array: &crate::ir::ArrayField,
    ) -> Result<(), PlanError> {
        if array.padded_size.is_none()
            && layout::offset_from_end(self.file, self.decl, index) != Some(0)
        {
            return Err(PlanError::UnboundedArrayNotLast {
                decl: self.decl_id.clone(),
                field: array.id.clone(),
            });
        }
        Ok(())
    }

    fn plan_byte_array(&mut self, index: usize, field: &Field) -> Result<(), PlanError> {
        let Field::Array(array) = field else {
            unreachable!()
        };
        self.consume(0);

        let size = match layout::array_size_source(self.decl, array) {
            layout::ArraySize::Static(count) => Some(Length::Const(count)),
            layout::ArraySize::Size(_) => {
                let modifier = self.array_modifier(array)?;
                if modifier > 0 {
                    self.steps.push(ParseStep::AdjustSize {
                        field_id: array.id.clone(),
                        octets: modifier,
                    });
                }
                Some(Length::SizeOf {
                    field_id: array.id.clone(),
                })
            }
            layout::ArraySize::Count(_) => Some(Length::CountOf {
                field_id: array.id.clone(),
            }),
            layout::ArraySize::Unbounded => {
                self.check_unbounded_is_last(index, array)?;
                None
            }
        };

        let padded = array.padded_size;
        if let Some(padded) = padded {
            self.check_size(Length::Const(padded));
            self.steps.push(ParseStep::BeginPadded { octets: padded });
        }
        if let Some(size) = &size {
            self.check_size(size.clone());
        }
        self.steps.push(ParseStep::ReadByteArray {
            id: array.id.clone(),
            size,
        });
        if padded.is_some() {
            self.steps.push(ParseStep::EndPadded);
        }
        Ok(())
    }

    fn plan_array(&mut self, index: usize, field: &Field) -> Result<(), PlanError> {
        let Field::Array(array) = field else {
            unreachable!()
        };
        self.consume(0);

        let decl_id_for_error = self.decl_id.clone();
        let not_octet = || PlanError::ElementWidthNotOctet {
            decl: decl_id_for_error.clone(),
            field: array.id.clone(),
        };

        // Derive the extent operands.
        let (size, count) = match layout::array_size_source(self.decl, array) {
            layout::ArraySize::Static(n) => (None, Some(Length::Const(n))),
            layout::ArraySize::Size(_) => (
                Some(Length::SizeOf {
                    field_id: array.id.clone(),
                }),
                None,
            ),
            layout::ArraySize::Count(_) => (
                None,
                Some(Length::CountOf {
                    field_id: array.id.clone(),
                }),
            ),
            layout::ArraySize::Unbounded => {
                self.check_unbounded_is_last(index, array)?;
                (None, None)
            }
        };

        if size.is_some() {
            let modifier = self.array_modifier(array)?;
            if modifier > 0 {
                self.steps.push(ParseStep::AdjustSize {
                    field_id: array.id.clone(),
                    octets: modifier,
                });
            }
        }

        let padded = array.padded_size;
        if let Some(padded) = padded {
            self.check_size(Length::Const(padded));
            self.steps.push(ParseStep::BeginPadded { octets: padded });
        }

        // Element shape and static width.
        let element = match (array.width, &array.type_id) {
            (Some(width), _) => {
                if width % 8 != 0 {
                    return Err(not_octet());
                }
                ArrayElement::Scalar {
                    width_octets: width / 8,
                }
            }
            (None, Some(type_id)) => match self.file.typedef(type_id) {
                Some(Declaration::Enum(e)) => {
                    if e.width % 8 != 0 {
                        return Err(not_octet());
                    }
                    ArrayElement::Enum {
                        type_id: type_id.clone(),
                        width_octets: e.width / 8,
                    }
                }
                Some(referent) => match layout::declaration_size(self.file, referent, false) {
                    Some(width) => {
                        if width % 8 != 0 {
                            return Err(not_octet());
                        }
                        ArrayElement::Typedef {
                            type_id: type_id.clone(),
                            width_octets: Some(width / 8),
                        }
                    }
                    None => {
                        if !matches!(referent, Declaration::Struct(_)) {
                            return Err(PlanError::UnsupportedElementType {
                                decl: self.decl_id.clone(),
                                field: array.id.clone(),
                            });
                        }
                        ArrayElement::Typedef {
                            type_id: type_id.clone(),
                            width_octets: None,
                        }
                    }
                },
                None => {
                    return Err(PlanError::UnsupportedElementType {
                        decl: self.decl_id.clone(),
                        field: array.id.clone(),
                    })
                }
            },
            (None, None) => {
                return Err(PlanError::UnsupportedElementType {
                    decl: self.decl_id.clone(),
                    field: array.id.clone(),
                })
            }
        };

        let element_octets = match &element {
            ArrayElement::Scalar { width_octets } => Some(*width_octets),
            ArrayElement::Enum { width_octets, .. } => Some(*width_octets),
            ArrayElement::Typedef { width_octets, .. } => *width_octets,
        };

        match (element_octets, size, count) {
            // Self-delimiting elements over a sized region.
            (None, Some(size), _) => {
                self.check_size(size.clone());
                self.push_array(array, element, ArrayExtent::Bytes(size));
            }
            // Self-delimiting elements, counted.
            (None, None, Some(count)) => {
                self.push_array(array, element, ArrayExtent::Count(count));
            }
            // Self-delimiting elements to the end of the span.
            (None, None, None) => {
                self.push_array(array, element, ArrayExtent::Remaining);
            }
            // Fixed-width elements, counted.
            (Some(octets), _, Some(count)) => {
                let total = match &count {
                    Length::Const(n) => Length::Const(n * octets),
                    Length::CountOf { field_id } if octets == 1 => Length::CountOf {
                        field_id: field_id.clone(),
                    },
                    Length::CountOf { field_id } => Length::CountTimes {
                        field_id: field_id.clone(),
                        element_octets: octets,
                    },
                    _ => unreachable!("array counts are constants or count locals"),
                };
                self.check_size(total);
                self.push_array(array, element, ArrayExtent::Count(count));
            }
            // Fixed-width elements over a sized region.
            (Some(octets), Some(size), None) => {
                self.check_size(size.clone());
                if octets > 1 {
                    self.steps.push(ParseStep::CheckSizeMultiple {
                        size: size.clone(),
                        element_octets: octets,
                    });
                }
                self.push_array(array, element, ArrayExtent::Bytes(size));
            }
            // Fixed-width elements to the end of the span.
            (Some(octets), None, None) => {
                if octets > 1 {
                    self.steps.push(ParseStep::CheckSizeMultiple {
                        size: Length::Remaining,
                        element_octets: octets,
                    });
                }
                self.push_array(array, element, ArrayExtent::Remaining);
            }
        }

        if padded.is_some() {
            self.steps.push(ParseStep::EndPadded);
        }
        Ok(())
    }

    fn push_array(
        &mut self,
        array: &crate::ir::ArrayField,
        element: ArrayElement,
        extent: ArrayExtent,
    ) {
        self.steps.push(ParseStep::ReadArray {
            id: array.id.clone(),
            element,
            extent,
        });
    }

    fn plan_payload(&mut self, index: usize, field: &'a Field) -> Result<(), PlanError> {
        let payload_id = field.id().unwrap_or_default().to_string();
        let size_source = layout::payload_size_source(self.decl, &payload_id).is_some();

        // A bit-shifted payload re-parses the shared byte: read the
        // trailing bits as reserved, then keep that byte in the span.
        if self.shift != 0 {
            if size_source {
                return Err(PlanError::ShiftedPayloadSized {
                    decl: self.decl_id.clone(),
                });
            }
            let rounded = (self.shift + 7) / 8;
            let padding_bits = 8 * rounded - self.shift;
            self.push_bit(padding_bits, None);
            self.consume(rounded);
        } else {
            self.consume(0);
        }

        if size_source {
            if let Field::Payload(PayloadField {
                size_modifier: Some(text),
            }) = field
            {
                let octets = crate::ir::parse_size_modifier(text).ok_or_else(|| {
                    PlanError::InvalidSizeModifier {
                        decl: self.decl_id.clone(),
                        field: payload_id.clone(),
                        text: text.clone(),
                    }
                })?;
                if octets > 0 {
                    self.steps.push(ParseStep::AdjustSize {
                        field_id: payload_id.clone(),
                        octets,
                    });
                }
            }
            self.check_size(Length::SizeOf {
                field_id: payload_id.clone(),
            });
            self.steps.push(ParseStep::ReadPayload {
                extent: PayloadExtent::Sized {
                    field_id: payload_id,
                },
            });
            return Ok(());
        }

        match layout::offset_from_end(self.file, self.decl, index) {
            Some(0) => {
                self.steps.push(ParseStep::ReadPayload {
                    extent: PayloadExtent::Trailing,
                });
                Ok(())
            }
            Some(bits) => {
                if bits % 8 != 0 {
                    return Err(PlanError::PayloadSuffixNotOctet {
                        decl: self.decl_id.clone(),
                    });
                }
                let suffix_octets = bits / 8;
                self.check_size(Length::Const(suffix_octets));
                self.steps.push(ParseStep::ReadPayload {
                    extent: PayloadExtent::SuffixDelimited { suffix_octets },
                });
                Ok(())
            }
            None => Err(PlanError::PayloadExtentUnknown {
                decl: self.decl_id.clone(),
            }),
        }
    }

    fn plan_checksum(&mut self, index: usize, checksum: &ChecksumField) -> Result<(), PlanError> {
        self.consume(0);

        let fields = self.decl.fields();
        let value_index = fields
            .iter()
            .position(|f| f.id() == Some(checksum.field_id.as_str()))
            .ok_or_else(|| PlanError::UnknownField {
                decl: self.decl_id.clone(),
                field_id: checksum.field_id.clone(),
            })?;

        if value_index <= index {
            return Err(PlanError::ChecksumOffsetDynamic {
                decl: self.decl_id.clone(),
                field_id: checksum.field_id.clone(),
            });
        }
        let Field::Typedef(value_field) = &fields[value_index] else {
            return Err(PlanError::UnknownField {
                decl: self.decl_id.clone(),
                field_id: checksum.field_id.clone(),
            });
        };
        let Some(Declaration::Checksum(checksum_decl)) = self.file.typedef(&value_field.type_id)
        else {
            return Err(PlanError::UnknownField {
                decl: self.decl_id.clone(),
                field_id: checksum.field_id.clone(),
            });
        };
        let not_aligned = || PlanError::ChecksumNotAligned {
            decl: self.decl_id.clone(),
            field_id: checksum.field_id.clone(),
        };
        if checksum_decl.width % 8 != 0 {
            return Err(not_aligned());
        }
        let width_octets = checksum_decl.width / 8;

        // Both bounds are derived fresh from static offsets: the value is
        // read at a constant distance from the marker when the covered
        // fields have static size, from the end of the span otherwise.
        let offset_from_start: Option<usize> = fields[index + 1..value_index]
            .iter()
            .try_fold(0, |acc, f| {
                layout::field_size(self.file, f, false).map(|s| acc + s)
            });
        let offset_from_end: Option<usize> = fields[value_index..].iter().try_fold(0, |acc, f| {
            layout::field_size(self.file, f, false).map(|s| acc + s)
        });

        let region = if let Some(bits) = offset_from_start {
            if bits % 8 != 0 {
                return Err(not_aligned());
            }
            let prefix_octets = bits / 8;
            self.check_size(Length::Const(prefix_octets + width_octets));
            ChecksumRegion::FromStart { prefix_octets }
        } else if let Some(bits) = offset_from_end {
            if bits % 8 != 0 {
                return Err(not_aligned());
            }
            let suffix_octets = bits / 8;
            self.check_size(Length::Const(suffix_octets));
            ChecksumRegion::FromEnd { suffix_octets }
        } else {
            return Err(PlanError::ChecksumOffsetDynamic {
                decl: self.decl_id.clone(),
                field_id: checksum.field_id.clone(),
            });
        };

        self.steps.push(ParseStep::VerifyChecksum {
            field_id: checksum.field_id.clone(),
            function: checksum_decl.function.clone(),
            width_octets,
            region,
        });
        Ok(())
    }
}

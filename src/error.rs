//! Error definitions shared across library modules.
//! Each type models one failure domain (IR loading, normalization,
//! plan construction, test-vector generation).
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors raised while importing or validating the intermediate representation.
pub enum IrError {
    /// The JSON document does not match the IR schema.
    #[error("Malformed IR document: {0}")]
    Json(#[from] serde_json::Error),

    /// Two declarations share the same identifier.
    #[error("Duplicate declaration id: {id}")]
    DuplicateDeclaration { id: String },

    /// A packet or struct names a parent that is not in the matching scope.
    #[error("Declaration {id} references unknown parent {parent_id}")]
    UnknownParent { id: String, parent_id: String },

    /// Following `parent_id` links returns to a declaration already visited.
    #[error("Parent chain of declaration {id} forms a cycle")]
    ParentCycle { id: String },

    /// A typedef, array, or fixed field names a type that does not exist.
    #[error("Declaration {decl} references unknown type {type_id}")]
    UnknownType { decl: String, type_id: String },

    /// A fixed field must carry either a width and value, or an enum and tag.
    #[error("Malformed fixed field in declaration {decl}")]
    MalformedFixedField { decl: String },

    /// Two tags of the same enum carry the same value.
    #[error("Enum {decl} declares tag {tag} with a duplicate value")]
    DuplicateTag { decl: String, tag: String },

    /// A reserved range overlaps a named tag value.
    #[error("Enum {decl} range {tag} overlaps a named tag value")]
    TagOverlap { decl: String, tag: String },
}

#[derive(Debug, Error)]
/// Errors raised by the normalization pass.
pub enum NormalizeError {
    /// A group field references a group that was never declared.
    #[error("Declaration {decl} references unknown group {group_id}")]
    UnknownGroup { decl: String, group_id: String },

    /// A constraint names an enum tag that the enum does not declare.
    #[error("Constraint on {decl} uses unknown tag {tag_id} of enum {enum_id}")]
    UnknownTag {
        decl: String,
        enum_id: String,
        tag_id: String,
    },

    /// A constraint is missing the literal or tag its target field requires.
    #[error("Constraint {id} on declaration {decl} carries no usable value")]
    BadConstraint { decl: String, id: String },

    /// A padding field must directly follow the array it pads.
    #[error("Padding field in declaration {decl} does not follow an array")]
    PaddingWithoutArray { decl: String },

    /// Scope rebuild after normalization failed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

#[derive(Debug, Error)]
/// Unsupported layouts detected while planning parse or serialize programs.
pub enum PlanError {
    /// Only packet and struct declarations can be planned.
    #[error("Declaration {id} is not a packet or struct")]
    NotAPacket { id: String },

    /// A group field survived normalization; the file was not normalized.
    #[error("Declaration {decl} still contains group fields; normalize first")]
    UnexpectedGroup { decl: String },

    /// A field that must start on a byte boundary follows an open bit chunk.
    #[error("Field {field} of declaration {decl} does not start on an octet boundary")]
    UnalignedField { decl: String, field: String },

    /// A typedef field's referent is not an integral number of octets.
    #[error("Typedef field {field} of declaration {decl} has a non-octet width")]
    TypedefWidthNotOctet { decl: String, field: String },

    /// A derived struct cannot be referenced as a typedef field.
    #[error("Derived struct {type_id} used in typedef field of declaration {decl}")]
    DerivedStructTypedef { decl: String, type_id: String },

    /// Array elements must measure an integral number of octets.
    #[error("Array field {field} of declaration {decl} has a non-octet element width")]
    ElementWidthNotOctet { decl: String, field: String },

    /// Dynamically sized array elements must be struct declarations.
    #[error("Array field {field} of declaration {decl} has an unsupported element type")]
    UnsupportedElementType { decl: String, field: String },

    /// The size modifier string is not a valid octet count.
    #[error("Field {field} of declaration {decl} has invalid size modifier `{text}`")]
    InvalidSizeModifier {
        decl: String,
        field: String,
        text: String,
    },

    /// A payload without a size field must be delimited by trailing
    /// static-size fields or end the packet.
    #[error("Payload of declaration {decl} has unknown size and unknown suffix")]
    PayloadExtentUnknown { decl: String },

    /// A bit-shifted payload cannot also carry a size field.
    #[error("Payload of declaration {decl} is bit-shifted and cannot be sized")]
    ShiftedPayloadSized { decl: String },

    /// The suffix after a payload must be an integral number of octets.
    #[error("Payload of declaration {decl} is followed by a non-octet suffix")]
    PayloadSuffixNotOctet { decl: String },

    /// Big-endian files have no defined semantics for shifted packet bodies.
    #[error("Big-endian packet {decl} has an unsupported body shift")]
    BigEndianShiftedBody { decl: String },

    /// A size, count, or checksum field names a field that does not exist.
    #[error("Field {field_id} referenced by declaration {decl} was not found")]
    UnknownField { decl: String, field_id: String },

    /// A fixed field or constraint names an enum tag that does not exist.
    #[error("Declaration {decl} uses unknown tag {tag_id} of enum {enum_id}")]
    UnknownTag {
        decl: String,
        enum_id: String,
        tag_id: String,
    },

    /// A constraint does not match the shape of the field it restricts.
    #[error("Constraint {id} on declaration {decl} cannot be resolved")]
    BadConstraint { decl: String, id: String },

    /// The checksum value must sit at a constant offset from the marker
    /// or from the end of the packet.
    #[error("Checksum value {field_id} of declaration {decl} has no constant offset")]
    ChecksumOffsetDynamic { decl: String, field_id: String },

    /// The checksum value must be octet-aligned.
    #[error("Checksum value {field_id} of declaration {decl} is not octet-aligned")]
    ChecksumNotAligned { decl: String, field_id: String },

    /// A size field must target a payload or array field.
    #[error("Size field {field_id} of declaration {decl} targets an unsupported field")]
    BadSizeTarget { decl: String, field_id: String },

    /// An array nothing bounds consumes the rest of the span and must
    /// therefore end its declaration.
    #[error("Unbounded array {field} of declaration {decl} is followed by more fields")]
    UnboundedArrayNotLast { decl: String, field: String },

    /// The declaration's fields do not close the last bit chunk.
    #[error("Declaration {decl} ends inside an open bit chunk")]
    TrailingBits { decl: String },
}

#[derive(Debug, Error)]
/// Failures while generating test vectors. Recorded per packet; a failing
/// packet is skipped without aborting the run.
pub enum VectorError {
    /// A value generator needs a field the packet does not carry.
    #[error("Field {field_id} not found in packet {packet}")]
    MissingField { packet: String, field_id: String },

    /// Scalar and size/count widths are limited to 64 bits, and size-driven
    /// maxima to widths the generator can exhaust.
    #[error("Field {field_id} of packet {packet} is too wide to enumerate")]
    WidthOverflow { packet: String, field_id: String },

    /// Array elements and sized regions must be an integral number of octets.
    #[error("Field {field_id} of packet {packet} has a non-octet width")]
    NonOctetWidth { packet: String, field_id: String },

    /// The serialized packet does not end on an octet boundary.
    #[error("Packet {packet} does not serialize to a whole number of octets")]
    NonOctetPacket { packet: String },

    /// A checksum value field appears without a matching start marker.
    #[error("Checksum {field_id} of packet {packet} has no start marker")]
    MalformedChecksum { packet: String, field_id: String },

    /// The reference checksum is defined for 8-bit checksums only.
    #[error("Checksum {field_id} of packet {packet} has unsupported width")]
    UnsupportedChecksumWidth { packet: String, field_id: String },

    /// Custom field values cannot be synthesized without the user function.
    #[error("Custom field type {type_id} cannot be enumerated")]
    UnsupportedCustomField { type_id: String },

    /// The array bounds leave no room for a single element.
    #[error("Array {field_id} of packet {packet} cannot fit its bounds")]
    UnsatisfiableArray { packet: String, field_id: String },

    /// A bit chunk wider than 128 bits cannot be packed.
    #[error("Packet {packet} accumulates a bit chunk wider than 128 bits")]
    ChunkTooWide { packet: String },

    /// A deferred value survived finalization.
    #[error("Unresolved deferred value in packet {packet}")]
    UnresolvedValue { packet: String },

    /// The size modifier string is not a valid octet count.
    #[error("Field {field_id} of packet {packet} has an invalid size modifier")]
    InvalidSizeModifier { packet: String, field_id: String },

    /// A fixed field or constraint names an enum tag that does not exist.
    #[error("Packet {packet} uses unknown tag {tag_id} of enum {enum_id}")]
    UnknownTag {
        packet: String,
        enum_id: String,
        tag_id: String,
    },

    /// A group field survived normalization; the file was not normalized.
    #[error("Packet {packet} still contains group fields; normalize first")]
    UnexpectedGroup { packet: String },
}

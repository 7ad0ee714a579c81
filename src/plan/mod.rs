//! Language-agnostic parse and serialize programs.
//!
//! The planners turn a canonical declaration into an ordered list of
//! concrete actions over a byte span: chunked bit reads and writes, size
//! checks, array and payload extraction, checksum handling, and
//! specialization to derived packets. Rendering these actions into a
//! target language is a mechanical step left to each backend.
use crate::error::PlanError;
use crate::ir::{Declaration, File};

mod parse;
mod serialize;

pub use parse::plan_parse;
pub use serialize::plan_serialize;

//==================================================================================OPERANDS

/// Length operand of a size check or span operation. Values are either
/// compile-time constants or locals established by earlier chunk reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Length {
    /// Constant number of octets.
    Const(usize),
    /// Runtime size local of the named field (`<id>_size`).
    SizeOf { field_id: String },
    /// Runtime count local of the named field (`<id>_count`).
    CountOf { field_id: String },
    /// Count local scaled by a fixed element width.
    CountTimes {
        field_id: String,
        element_octets: usize,
    },
    /// Whatever remains of the current span.
    Remaining,
}

/// Where one bit field extracted from a chunk goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkTarget {
    /// Assign to the named field.
    Scalar { id: String },
    /// Assign to the named field after validating enum membership.
    Enum { id: String, type_id: String },
    /// Establish the size local of the referenced field.
    SizeLocal { field_id: String },
    /// Establish the count local of the referenced field.
    CountLocal { field_id: String },
    /// Fail unless the extracted bits equal the literal.
    FixedScalar { value: u64 },
    /// Fail unless the extracted bits equal the tag value.
    FixedEnum {
        enum_id: String,
        tag_id: String,
        value: u64,
    },
}

/// One field extracted out of a chunk's backing integer:
/// `(backing >> shift) & mask(width)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkExtract {
    pub shift: usize,
    pub width: usize,
    pub target: ChunkTarget,
}

/// Array element shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayElement {
    /// Unsigned integers of a fixed octet width.
    Scalar { width_octets: usize },
    /// Enum values of a fixed octet width, validated on parse.
    Enum {
        type_id: String,
        width_octets: usize,
    },
    /// Nested typedef elements. A known width means each element is read
    /// from a fixed window; unknown width delegates to the element parser.
    Typedef {
        type_id: String,
        width_octets: Option<usize>,
    },
}

/// What bounds an array read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayExtent {
    /// Element count known at runtime.
    Count(Length),
    /// Total octet size known at runtime.
    Bytes(Length),
    /// Consume elements until the span is exhausted.
    Remaining,
}

/// How the payload span is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadExtent {
    /// A size local bounds the payload.
    Sized { field_id: String },
    /// The payload runs to the end of the span.
    Trailing,
    /// Static-size fields follow; the payload stops `suffix_octets` from
    /// the end and the suffix becomes the residual span.
    SuffixDelimited { suffix_octets: usize },
}

/// Where the covered region and value of a checksum sit, both bounds
/// derived from static offsets at the marker position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumRegion {
    /// Covered region is the next `prefix_octets`; the value follows it.
    FromStart { prefix_octets: usize },
    /// Covered region ends `suffix_octets` before the end of the span;
    /// the value starts there.
    FromEnd { suffix_octets: usize },
}

//==================================================================================PARSE

/// One parse action. Actions between two size checks never read past the
/// checked prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStep {
    /// Fail with a length error unless at least `bytes` remain.
    CheckSize { bytes: Length },
    /// Read `width_octets` at `offset` as one little/big-endian integer
    /// and extract the listed bit fields. An empty extraction list only
    /// advances the cursor.
    ReadChunk {
        offset: usize,
        width_octets: usize,
        extract: Vec<ChunkExtract>,
    },
    /// Drop `octets` from the front of the span.
    Consume { octets: usize },
    /// Subtract the size modifier from an established size local.
    AdjustSize { field_id: String, octets: u64 },
    /// Fixed-width typedef: `parse_all` over a window at `offset`.
    ReadTypedef {
        id: String,
        type_id: String,
        offset: usize,
        width_octets: usize,
    },
    /// Variable-width typedef: delegate to the referent's parser, which
    /// returns the residual span.
    DelegateTypedef { id: String, type_id: String },
    /// Carve the next `octets` into a window; subsequent steps operate
    /// inside it until [`ParseStep::EndPadded`].
    BeginPadded { octets: usize },
    /// Restore the remainder saved by the matching `BeginPadded`.
    EndPadded,
    /// Fail unless `size` is a multiple of the element width.
    CheckSizeMultiple {
        size: Length,
        element_octets: usize,
    },
    /// Read a `u8` array; `None` means the rest of the span.
    ReadByteArray { id: String, size: Option<Length> },
    /// Read an element array according to its extent.
    ReadArray {
        id: String,
        element: ArrayElement,
        extent: ArrayExtent,
    },
    /// Extract the payload or body span.
    ReadPayload { extent: PayloadExtent },
    /// Apply the user checksum function over the covered region and fail
    /// unless it matches the stored value, which is also assigned to
    /// `field_id`. Span-relative at this point of the program.
    VerifyChecksum {
        field_id: String,
        function: String,
        width_octets: usize,
        region: ChecksumRegion,
    },
}

/// Constraint guard a derived declaration applies to inherited fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub id: String,
    pub value: GuardValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardValue {
    Scalar(u64),
    Enum {
        type_id: String,
        tag_id: String,
        value: u64,
    },
}

/// Ordered parse program for one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePlan {
    pub packet: String,
    /// Bit shift inherited from the parent chain; the first chunk of a
    /// shifted plan starts mid-byte.
    pub shift: usize,
    /// Inherited-field guards checked before any read.
    pub constraints: Vec<Guard>,
    pub steps: Vec<ParseStep>,
    /// Derived declarations to try in order on the extracted payload; the
    /// first that parses wins, otherwise the packet stands as itself.
    pub children: Vec<String>,
}

//==================================================================================SERIALIZE

/// Size expression shapes a size field can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeSource {
    /// Octet length of the payload or body.
    Payload,
    /// Element count times a fixed element width.
    FixedElementArray { element_octets: usize },
    /// Sum of dynamically sized element serializations.
    DynamicElementArray,
}

/// One value contributing to a chunk under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// The named field's value.
    Scalar { id: String },
    /// The named enum field's numeric value.
    EnumField { id: String, type_id: String },
    /// A literal.
    FixedScalar { value: u64 },
    /// An enum tag value.
    FixedEnum {
        enum_id: String,
        tag_id: String,
        value: u64,
    },
    /// The computed size of the referenced field plus its modifier.
    Size {
        field_id: String,
        source: SizeSource,
        modifier: u64,
    },
    /// The element count of the referenced array.
    Count { field_id: String },
    /// Low bits of the first payload byte, re-packed into the open chunk
    /// of a bit-shifted body.
    PayloadResidue { rounded_octets: usize },
}

/// `(source << shift)` contribution to the chunk's backing integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPart {
    pub shift: usize,
    pub width: usize,
    pub source: ChunkSource,
}

/// One serialize action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeStep {
    /// Truncate the named scalar to `width` bits, warning on overflow.
    CheckScalarMax { id: String, width: usize },
    /// Truncate the referenced array to `(1 << width) - 1` elements.
    CheckCountMax { field_id: String, width: usize },
    /// Fail when the payload length plus modifier overflows the size field.
    CheckPayloadMax {
        field_id: String,
        width: usize,
        modifier: u64,
    },
    /// Fail unless the payload carries at least `octets` bytes
    /// (bit-shifted bodies need the shared first byte).
    CheckPayloadMin { octets: usize },
    /// Or-combine the parts and write them as one little/big-endian
    /// integer. No parts means a run of zero bytes.
    WriteChunk {
        width_octets: usize,
        parts: Vec<ChunkPart>,
    },
    /// Append the `u8` array verbatim.
    WriteByteArray { id: String },
    /// Append each element as a fixed-width integer.
    WriteScalarArray { id: String, element_octets: usize },
    /// Append each enum element as a fixed-width integer.
    WriteEnumArray {
        id: String,
        type_id: String,
        element_octets: usize,
    },
    /// Append each element's own serialization.
    WriteTypedefArray { id: String, type_id: String },
    /// Remember the output offset where the named padded array begins.
    MarkArrayStart { id: String },
    /// Zero-fill the named array's region up to its padded size.
    PadToSize { id: String, padded_octets: usize },
    /// Append the named typedef field's serialization.
    WriteTypedef { id: String, type_id: String },
    /// Remember the output offset where checksum coverage begins.
    MarkChecksumStart,
    /// Apply the user checksum function from the remembered offset to the
    /// current end and append the result.
    WriteChecksum {
        field_id: String,
        function: String,
        width_octets: usize,
    },
    /// Append the payload bytes.
    WritePayload,
    /// Append the payload bytes after the shared first `skip_octets`
    /// already merged into the preceding chunk.
    WritePayloadTail { skip_octets: usize },
}

/// Ordered serialize program for one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializePlan {
    pub packet: String,
    /// Bit shift the first chunk starts at (derived declarations only).
    pub shift: usize,
    pub steps: Vec<SerializeStep>,
    /// Derived declarations serialize their own fields into a buffer and
    /// hand it to this parent as its payload.
    pub parent: Option<String>,
}

//==================================================================================DRIVER

/// Parse and serialize programs for one declaration.
#[derive(Debug, Clone)]
pub struct DeclarationPlans {
    pub id: String,
    pub parse: ParsePlan,
    pub serialize: SerializePlan,
}

/// Plan every packet and struct of a canonical file, in declaration order.
pub fn plan_all(file: &File) -> Result<Vec<DeclarationPlans>, PlanError> {
    let mut plans = Vec::new();
    for decl in &file.declarations {
        if !matches!(decl, Declaration::Packet(_) | Declaration::Struct(_)) {
            continue;
        }
        let id = decl.id().unwrap_or_default().to_string();
        tracing::debug!(packet = %id, "planning declaration");
        plans.push(DeclarationPlans {
            parse: plan_parse(file, decl)?,
            serialize: plan_serialize(file, decl)?,
            id,
        });
    }
    Ok(plans)
}

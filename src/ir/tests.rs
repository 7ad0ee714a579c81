//! Import, scope, validation, and normalization tests for the IR model.
use super::*;
use crate::ir::normalize;
use serde_json::json;

fn file(declarations: serde_json::Value) -> File {
    try_file(declarations).expect("valid IR")
}

fn try_file(declarations: serde_json::Value) -> Result<File, IrError> {
    File::from_json(json!({
        "endianness": { "kind": "endianness_declaration", "value": "little_endian" },
        "declarations": declarations,
    }))
}

#[test]
fn imports_packet_with_scalar_fields() {
    let file = file(json!([
        {
            "kind": "packet_declaration",
            "id": "Basic",
            "fields": [
                { "kind": "scalar_field", "id": "a", "width": 7 },
                { "kind": "scalar_field", "id": "c", "width": 57 },
            ],
        },
    ]));
    assert_eq!(file.byteorder(), Endianness::LittleEndian);
    let decl = file.packet("Basic").expect("packet in scope");
    assert_eq!(decl.fields().len(), 2);
    assert_eq!(decl.fields()[0].id(), Some("a"));
}

#[test]
fn accepts_hex_string_literals() {
    let file = file(json!([
        {
            "kind": "packet_declaration",
            "id": "Hex",
            "fields": [
                { "kind": "fixed_field", "width": 8, "value": "0x2A" },
                { "kind": "scalar_field", "id": "a", "width": "0x8" },
            ],
        },
    ]));
    let Field::Fixed(fixed) = &file.packet("Hex").unwrap().fields()[0] else {
        panic!("expected fixed field");
    };
    assert_eq!(fixed.value, Some(0x2A));
}

#[test]
fn rejects_duplicate_declaration_ids() {
    let err = try_file(json!([
        { "kind": "packet_declaration", "id": "P", "fields": [] },
        { "kind": "packet_declaration", "id": "P", "fields": [] },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::DuplicateDeclaration { id } if id == "P"));
}

#[test]
fn rejects_unknown_parent() {
    let err = try_file(json!([
        { "kind": "packet_declaration", "id": "Child", "parent_id": "Ghost", "fields": [] },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::UnknownParent { parent_id, .. } if parent_id == "Ghost"));
}

#[test]
fn rejects_parent_cycle() {
    let err = try_file(json!([
        { "kind": "packet_declaration", "id": "A", "parent_id": "B", "fields": [] },
        { "kind": "packet_declaration", "id": "B", "parent_id": "A", "fields": [] },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::ParentCycle { .. }));
}

#[test]
fn rejects_unknown_typedef_reference() {
    let err = try_file(json!([
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [{ "kind": "typedef_field", "id": "t", "type_id": "Ghost" }],
        },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::UnknownType { type_id, .. } if type_id == "Ghost"));
}

#[test]
fn rejects_malformed_fixed_field() {
    let err = try_file(json!([
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [{ "kind": "fixed_field", "width": 8 }],
        },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::MalformedFixedField { .. }));
}

#[test]
fn enum_tags_resolve_through_subgroups() {
    let file = file(json!([
        {
            "kind": "enum_declaration",
            "id": "Kind",
            "width": 8,
            "tags": [
                { "id": "A", "value": 1 },
                { "id": "Grouped", "tags": [{ "id": "B", "value": 2 }] },
                { "id": "Reserved", "range": { "start": 0x10, "end": 0x1f } },
            ],
        },
    ]));
    let Some(Declaration::Enum(decl)) = file.typedef("Kind") else {
        panic!("enum in typedef scope");
    };
    assert_eq!(decl.tag("B").and_then(|t| t.value), Some(2));
    assert_eq!(decl.named_values(), vec![("A", 1), ("B", 2)]);
    assert!(decl.is_open());
    assert!(decl.contains(0x15));
    assert!(!decl.contains(0x30));
}

#[test]
fn rejects_duplicate_tag_values() {
    let err = try_file(json!([
        {
            "kind": "enum_declaration",
            "id": "E",
            "width": 8,
            "tags": [{ "id": "A", "value": 1 }, { "id": "B", "value": 1 }],
        },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::DuplicateTag { tag, .. } if tag == "B"));
}

#[test]
fn rejects_range_covering_named_tag() {
    let err = try_file(json!([
        {
            "kind": "enum_declaration",
            "id": "E",
            "width": 8,
            "tags": [
                { "id": "A", "value": 4 },
                { "id": "R", "range": { "start": 0, "end": 7 } },
            ],
        },
    ]))
    .unwrap_err();
    assert!(matches!(err, IrError::TagOverlap { tag, .. } if tag == "R"));
}

#[test]
fn size_modifier_accepts_sign_and_hex() {
    assert_eq!(parse_size_modifier("2"), Some(2));
    assert_eq!(parse_size_modifier("+2"), Some(2));
    assert_eq!(parse_size_modifier("0x10"), Some(16));
    assert_eq!(parse_size_modifier("nope"), None);
}

#[test]
fn lists_required_custom_types() {
    let file = file(json!([
        { "kind": "custom_field_declaration", "id": "Uuid", "function": "uuid", "width": 128 },
        { "kind": "checksum_declaration", "id": "Crc8", "function": "crc8", "width": 8 },
    ]));
    assert_eq!(file.required_custom_types(), vec!["Uuid", "Crc8"]);
}

//==================================================================================NORMALIZE

#[test]
fn normalize_inlines_groups_and_applies_constraints() {
    let mut file = file(json!([
        {
            "kind": "enum_declaration",
            "id": "Kind",
            "width": 8,
            "tags": [{ "id": "One", "value": 1 }, { "id": "Two", "value": 2 }],
        },
        {
            "kind": "group_declaration",
            "id": "Header",
            "fields": [
                { "kind": "scalar_field", "id": "version", "width": 8 },
                { "kind": "typedef_field", "id": "kind", "type_id": "Kind" },
            ],
        },
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [
                {
                    "kind": "group_field",
                    "group_id": "Header",
                    "constraints": [
                        { "id": "version", "value": 3 },
                        { "id": "kind", "tag_id": "Two" },
                    ],
                },
                { "kind": "scalar_field", "id": "data", "width": 8 },
            ],
        },
    ]));
    normalize(&mut file).expect("normalizes");

    assert!(file.group_scope.is_empty());
    assert!(file.group("Header").is_none());

    let fields = file.packet("P").unwrap().fields();
    assert_eq!(fields.len(), 3);
    let Field::Fixed(version) = &fields[0] else {
        panic!("constrained scalar becomes fixed");
    };
    assert_eq!((version.width, version.value), (Some(8), Some(3)));
    let Field::Fixed(kind) = &fields[1] else {
        panic!("constrained typedef becomes fixed");
    };
    assert_eq!(kind.enum_id.as_deref(), Some("Kind"));
    assert_eq!(kind.tag_id.as_deref(), Some("Two"));
}

#[test]
fn normalize_links_padding_to_preceding_array() {
    let mut file = file(json!([
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [
                { "kind": "array_field", "id": "data", "width": 8 },
                { "kind": "padding_field", "size": 16 },
            ],
        },
    ]));
    normalize(&mut file).expect("normalizes");
    let fields = file.packet("P").unwrap().fields();
    let Field::Array(array) = &fields[0] else {
        panic!("array survives");
    };
    assert_eq!(array.padded_size, Some(16));
    assert!(matches!(fields[1], Field::Padding(_)));
}

#[test]
fn normalize_rejects_padding_without_array() {
    let mut file = file(json!([
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [
                { "kind": "scalar_field", "id": "a", "width": 8 },
                { "kind": "padding_field", "size": 4 },
            ],
        },
    ]));
    let err = normalize(&mut file).unwrap_err();
    assert!(matches!(
        err,
        crate::error::NormalizeError::PaddingWithoutArray { .. }
    ));
}

#[test]
fn normalize_rejects_unknown_group() {
    let mut file = file(json!([
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [{ "kind": "group_field", "group_id": "Ghost", "constraints": [] }],
        },
    ]));
    let err = normalize(&mut file).unwrap_err();
    assert!(matches!(
        err,
        crate::error::NormalizeError::UnknownGroup { group_id, .. } if group_id == "Ghost"
    ));
}

#[test]
fn normalize_rejects_unknown_constraint_tag() {
    let mut file = file(json!([
        {
            "kind": "enum_declaration",
            "id": "Kind",
            "width": 8,
            "tags": [{ "id": "One", "value": 1 }],
        },
        {
            "kind": "group_declaration",
            "id": "G",
            "fields": [{ "kind": "typedef_field", "id": "kind", "type_id": "Kind" }],
        },
        {
            "kind": "packet_declaration",
            "id": "P",
            "fields": [
                {
                    "kind": "group_field",
                    "group_id": "G",
                    "constraints": [{ "id": "kind", "tag_id": "Ghost" }],
                },
            ],
        },
    ]));
    let err = normalize(&mut file).unwrap_err();
    assert!(matches!(
        err,
        crate::error::NormalizeError::UnknownTag { tag_id, .. } if tag_id == "Ghost"
    ));
}

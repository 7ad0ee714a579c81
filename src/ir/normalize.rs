//! Normalization pass rewriting the raw IR into its canonical form.
//!
//! Group fields are inlined at their reference sites, fields matching a
//! constraint supplied at the site become fixed fields, padding fields are
//! linked to the array they pad, and group declarations disappear from the
//! file. Planning and vector generation only accept canonical files.
use std::collections::HashMap;

use crate::error::NormalizeError;
use crate::ir::{
    Constraint, Declaration, EnumDeclaration, Field, File, FixedField,
};

/// Rewrite `file` in place into its canonical form and rebuild the scopes.
pub fn normalize(file: &mut File) -> Result<(), NormalizeError> {
    // Group and enum lookups are needed while declarations are mutated;
    // snapshot them first.
    let groups: HashMap<String, Vec<Field>> = file
        .declarations
        .iter()
        .filter_map(|d| match d {
            Declaration::Group(g) => Some((g.id.clone(), g.fields.clone())),
            _ => None,
        })
        .collect();
    let enums: HashMap<String, EnumDeclaration> = file
        .declarations
        .iter()
        .filter_map(|d| match d {
            Declaration::Enum(e) => Some((e.id.clone(), e.clone())),
            _ => None,
        })
        .collect();

    for decl in &mut file.declarations {
        let (id, fields) = match decl {
            Declaration::Packet(p) => (p.id.clone(), &mut p.fields),
            Declaration::Struct(s) => (s.id.clone(), &mut s.fields),
            _ => continue,
        };
        let raw = std::mem::take(fields);
        let mut out = Vec::with_capacity(raw.len());
        for field in raw {
            desugar_field(&id, field, &mut out, &groups, &enums, &HashMap::new())?;
        }
        *fields = out;
    }

    file.declarations
        .retain(|d| !matches!(d, Declaration::Group(_)));
    file.index()?;
    Ok(())
}

/// Inline one field into `out`, applying the constraints supplied at the
/// enclosing group reference site. Group fields recurse with the
/// constraints of their own site.
fn desugar_field(
    decl_id: &str,
    field: Field,
    out: &mut Vec<Field>,
    groups: &HashMap<String, Vec<Field>>,
    enums: &HashMap<String, EnumDeclaration>,
    constraints: &HashMap<String, Constraint>,
) -> Result<(), NormalizeError> {
    match field {
        Field::Scalar(scalar) if constraints.contains_key(&scalar.id) => {
            let constraint = &constraints[&scalar.id];
            let value = constraint.value.ok_or_else(|| NormalizeError::BadConstraint {
                decl: decl_id.to_string(),
                id: scalar.id.clone(),
            })?;
            out.push(Field::Fixed(FixedField {
                width: Some(scalar.width),
                value: Some(value),
                enum_id: None,
                tag_id: None,
            }));
        }

        Field::Typedef(typedef) if constraints.contains_key(&typedef.id) => {
            let constraint = &constraints[&typedef.id];
            let tag_id = constraint
                .tag_id
                .clone()
                .ok_or_else(|| NormalizeError::BadConstraint {
                    decl: decl_id.to_string(),
                    id: typedef.id.clone(),
                })?;
            if let Some(decl) = enums.get(&typedef.type_id) {
                if decl.tag(&tag_id).is_none() {
                    return Err(NormalizeError::UnknownTag {
                        decl: decl_id.to_string(),
                        enum_id: typedef.type_id.clone(),
                        tag_id,
                    });
                }
            }
            out.push(Field::Fixed(FixedField {
                width: None,
                value: None,
                enum_id: Some(typedef.type_id),
                tag_id: Some(tag_id),
            }));
        }

        Field::Padding(padding) => {
            match out.last_mut() {
                Some(Field::Array(array)) => array.padded_size = Some(padding.size),
                _ => {
                    return Err(NormalizeError::PaddingWithoutArray {
                        decl: decl_id.to_string(),
                    })
                }
            }
            out.push(Field::Padding(padding));
        }

        Field::Group(group) => {
            let group_fields =
                groups
                    .get(&group.group_id)
                    .ok_or_else(|| NormalizeError::UnknownGroup {
                        decl: decl_id.to_string(),
                        group_id: group.group_id.clone(),
                    })?;
            let site_constraints: HashMap<String, Constraint> = group
                .constraints
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect();
            for nested in group_fields.clone() {
                desugar_field(decl_id, nested, out, groups, enums, &site_constraints)?;
            }
        }

        other => out.push(other),
    }
    Ok(())
}

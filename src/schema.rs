//! The remote GraphQL schema descriptor and its compiled [`SchemaInfo`] partition.
//!
//! `Schema` is plain data: a map from typename to [`Type`]. It is produced by
//! whatever layer knows how to introspect or hand-describe the remote API; this
//! crate only consumes it. [`SchemaInfo`] is derived once, at [`Mirror::new`]
//! time, and is the structure every other component (store init, planner,
//! ingester, extractor) actually walks.
//!
//! [`Mirror::new`]: crate::Mirror::new

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Whether a `NODE` reference field reports every remote-side identity change.
///
/// Only `Faithful` is implemented; `Unfaithful` fields fail schema compilation
/// with a not-implemented error (see [`SchemaInfo::compile`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fidelity {
    Faithful,
    Unfaithful,
}

/// The shape of one field of an [`Type::Object`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// The object's identity field. Exactly one per object type.
    Id,
    /// A scalar or enum value, stored as JSON text.
    Primitive,
    /// A nullable reference to another object.
    Node {
        element_type: String,
        fidelity: Fidelity,
    },
    /// An ordered, paginated list of nullable node references.
    Connection { element_type: String },
    /// A nullable object-shaped group of primitive/node "eggs".
    Nested { eggs: BTreeMap<String, FieldType> },
}

/// One type in the remote schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Scalar,
    Enum,
    Object { fields: BTreeMap<String, FieldType> },
    Union { clauses: BTreeSet<String> },
}

/// A remote GraphQL schema: a map from typename to [`Type`].
pub type Schema = BTreeMap<String, Type>;

/// The primitive/node/connection/nested partition of one `OBJECT` type's fields.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub id_field: String,
    pub primitives: Vec<String>,
    pub links: Vec<String>,
    pub connections: Vec<String>,
    /// nested field name -> (egg primitive names, egg node names)
    pub nested: BTreeMap<String, NestedInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct NestedInfo {
    pub primitive_eggs: Vec<String>,
    pub node_eggs: Vec<String>,
}

impl ObjectInfo {
    /// All link fieldnames that need a row in `links`: top-level NODE fields
    /// plus `parent.child`-named nested NODE eggs.
    pub fn all_link_field_names(&self) -> Vec<String> {
        let mut out = self.links.clone();
        for (field, nested) in &self.nested {
            for egg in &nested.node_eggs {
                out.push(format!("{field}.{egg}"));
            }
        }
        out
    }
}

/// Per-typename compiled view of a [`Schema`], computed once at construction.
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    pub objects: BTreeMap<String, ObjectInfo>,
    pub unions: BTreeMap<String, Vec<String>>,
}

impl SchemaInfo {
    /// Walk `schema` once, partitioning every `OBJECT` type's fields and every
    /// `UNION` type's clause list.
    ///
    /// Fails immediately on an `Unfaithful` NODE fidelity, anywhere (top-level
    /// or nested egg) — "unfaithful fields not yet implemented".
    pub fn compile(schema: &Schema) -> Result<Self, MirrorError> {
        let mut info = SchemaInfo::default();

        for (typename, ty) in schema {
            match ty {
                Type::Scalar | Type::Enum => {}
                Type::Union { clauses } => {
                    info.unions
                        .insert(typename.clone(), clauses.iter().cloned().collect());
                }
                Type::Object { fields } => {
                    let mut object = ObjectInfo::default();
                    for (fieldname, field_type) in fields {
                        match field_type {
                            FieldType::Id => object.id_field = fieldname.clone(),
                            FieldType::Primitive => object.primitives.push(fieldname.clone()),
                            FieldType::Node { fidelity, .. } => {
                                check_fidelity(*fidelity)?;
                                object.links.push(fieldname.clone());
                            }
                            FieldType::Connection { .. } => {
                                object.connections.push(fieldname.clone())
                            }
                            FieldType::Nested { eggs } => {
                                let mut nested = NestedInfo::default();
                                for (egg_name, egg_type) in eggs {
                                    match egg_type {
                                        FieldType::Primitive => {
                                            nested.primitive_eggs.push(egg_name.clone())
                                        }
                                        FieldType::Node { fidelity, .. } => {
                                            check_fidelity(*fidelity)?;
                                            nested.node_eggs.push(egg_name.clone());
                                        }
                                        other => {
                                            return Err(MirrorError::SchemaValidity(format!(
                                                "nested egg {fieldname}.{egg_name} has unsupported kind {other:?}"
                                            )))
                                        }
                                    }
                                }
                                object.nested.insert(fieldname.clone(), nested);
                            }
                        }
                    }
                    if object.id_field.is_empty() {
                        return Err(MirrorError::SchemaValidity(format!(
                            "object type {typename} has no id field"
                        )));
                    }
                    info.objects.insert(typename.clone(), object);
                }
            }
        }

        Ok(info)
    }

    pub fn object(&self, typename: &str) -> Result<&ObjectInfo, MirrorError> {
        self.objects
            .get(typename)
            .ok_or_else(|| MirrorError::SchemaValidity(format!("unknown object type {typename}")))
    }
}

fn check_fidelity(fidelity: Fidelity) -> Result<(), MirrorError> {
    if fidelity == Fidelity::Unfaithful {
        return Err(MirrorError::SchemaValidity(
            "unfaithful fields not yet implemented".to_string(),
        ));
    }
    Ok(())
}

/// Returns `true` iff `s` is safe to splice literally into a SQL identifier
/// position: non-empty and matching `[A-Za-z0-9_]+`.
pub fn is_sql_safe(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(fields: &[(&str, FieldType)]) -> Type {
        Type::Object {
            fields: fields
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.clone()))
                .collect(),
        }
    }

    #[test]
    fn partitions_fields_by_kind() {
        let mut eggs = BTreeMap::new();
        eggs.insert("date".to_string(), FieldType::Primitive);
        eggs.insert(
            "user".to_string(),
            FieldType::Node {
                element_type: "User".to_string(),
                fidelity: Fidelity::Faithful,
            },
        );

        let mut schema = Schema::new();
        schema.insert(
            "Issue".to_string(),
            object(&[
                ("id", FieldType::Id),
                ("title", FieldType::Primitive),
                (
                    "author",
                    FieldType::Node {
                        element_type: "User".to_string(),
                        fidelity: Fidelity::Faithful,
                    },
                ),
                ("comments", FieldType::Connection { element_type: "Comment".to_string() }),
                ("authoredAt", FieldType::Nested { eggs }),
            ]),
        );
        schema.insert(
            "User".to_string(),
            object(&[("id", FieldType::Id), ("login", FieldType::Primitive)]),
        );

        let info = SchemaInfo::compile(&schema).unwrap();
        let issue = info.object("Issue").unwrap();
        assert_eq!(issue.primitives, vec!["title".to_string()]);
        assert_eq!(issue.links, vec!["author".to_string()]);
        assert_eq!(issue.connections, vec!["comments".to_string()]);
        let nested = issue.nested.get("authoredAt").unwrap();
        assert_eq!(nested.primitive_eggs, vec!["date".to_string()]);
        assert_eq!(nested.node_eggs, vec!["user".to_string()]);
        assert_eq!(
            issue.all_link_field_names(),
            vec!["author".to_string(), "authoredAt.user".to_string()]
        );
    }

    #[test]
    fn rejects_unfaithful_fidelity() {
        let mut schema = Schema::new();
        schema.insert(
            "Issue".to_string(),
            object(&[
                ("id", FieldType::Id),
                (
                    "author",
                    FieldType::Node {
                        element_type: "User".to_string(),
                        fidelity: Fidelity::Unfaithful,
                    },
                ),
            ]),
        );
        let err = SchemaInfo::compile(&schema).unwrap_err();
        assert!(matches!(err, MirrorError::SchemaValidity(_)));
    }

    #[test]
    fn sql_safety() {
        assert!(is_sql_safe("Issue_1"));
        assert!(!is_sql_safe(""));
        assert!(!is_sql_safe("drop table; --"));
        assert!(!is_sql_safe("has space"));
    }
}

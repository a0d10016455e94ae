//! Turns a [`QueryPlan`] into the selection-set trees for one `MirrorUpdate`
//! query body, bucketed and aliased so the ingester can route each response
//! section back to the object or connection it answers.

use std::collections::BTreeMap;

use crate::cursor::EndCursor;
use crate::error::MirrorError;
use crate::query::{alias, field, inline_fragment, leaf, print_query, Selection, Value};
use crate::schema::{FieldType, Schema, SchemaInfo, Type};
use crate::store::QueryPlan;

/// The four batching limits a planning pass is bounded by.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub nodes_limit: usize,
    pub nodes_of_type_limit: usize,
    pub connection_limit: usize,
    pub connection_page_size: usize,
}

/// Builds the top-level selections for one update step and prints them as a
/// `MirrorUpdate` query document. Returns `None` if `plan` is empty.
pub fn plan_query(
    schema: &Schema,
    schema_info: &SchemaInfo,
    plan: &QueryPlan,
    limits: PlanLimits,
) -> Result<Option<String>, MirrorError> {
    let selections = plan_selections(schema, schema_info, plan, limits)?;
    if selections.is_empty() {
        return Ok(None);
    }
    Ok(Some(print_query("MirrorUpdate", &selections)))
}

fn plan_selections(
    schema: &Schema,
    schema_info: &SchemaInfo,
    plan: &QueryPlan,
    limits: PlanLimits,
) -> Result<Vec<Selection>, MirrorError> {
    let mut selections = Vec::new();

    let mut by_typename: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (typename, id) in plan.objects.iter().take(limits.nodes_limit) {
        by_typename.entry(typename.as_str()).or_default().push(id.as_str());
    }

    let mut owndata_index = 0usize;
    for (typename, ids) in &by_typename {
        for chunk in ids.chunks(limits.nodes_of_type_limit.max(1)) {
            let own_data = query_own_data(schema, schema_info, typename)?;
            let selection = alias(
                format!("owndata_{owndata_index}"),
                field(
                    "nodes",
                    vec![(
                        "ids".to_string(),
                        Value::list(chunk.iter().map(|id| Value::Str(id.to_string()))),
                    )],
                    vec![inline_fragment(*typename, own_data)],
                ),
            );
            selections.push(selection);
            owndata_index += 1;
        }
    }

    let mut by_object: BTreeMap<&str, (&str, Vec<(&str, &EndCursor)>)> = BTreeMap::new();
    for conn in plan.connections.iter().take(limits.connection_limit) {
        let entry = by_object
            .entry(conn.object_id.as_str())
            .or_insert_with(|| (conn.object_typename.as_str(), Vec::new()));
        if entry.0 != conn.object_typename {
            return Err(MirrorError::Consistency(format!(
                "object {} appears as both {} and {} within one plan",
                conn.object_id, entry.0, conn.object_typename
            )));
        }
        entry.1.push((conn.fieldname.as_str(), &conn.end_cursor));
    }

    let mut node_index = 0usize;
    for (object_id, (typename, fields)) in &by_object {
        let mut children = Vec::new();
        for (fieldname, end_cursor) in fields {
            children.push(query_connection(
                schema_info,
                typename,
                fieldname,
                end_cursor,
                limits.connection_page_size,
            )?);
        }
        let selection = alias(
            format!("node_{node_index}"),
            field(
                "node",
                vec![("id".to_string(), Value::Str(object_id.to_string()))],
                vec![leaf("id"), inline_fragment(*typename, children)],
            ),
        );
        selections.push(selection);
        node_index += 1;
    }

    Ok(selections)
}

/// `queryShallow(T)`: the minimal selection identifying a reference.
pub fn query_shallow(schema: &Schema, typename: &str) -> Result<Vec<Selection>, MirrorError> {
    match schema.get(typename) {
        Some(Type::Object { .. }) => Ok(vec![leaf("__typename"), leaf("id")]),
        Some(Type::Union { clauses }) => {
            let mut children = vec![leaf("__typename")];
            for clause in clauses {
                children.push(inline_fragment(clause, vec![leaf("id")]));
            }
            Ok(children)
        }
        Some(_) => Err(MirrorError::SchemaValidity(format!(
            "{typename} is a scalar or enum and cannot be a node reference target"
        ))),
        None => Err(MirrorError::SchemaValidity(format!(
            "unknown type {typename}"
        ))),
    }
}

/// `queryOwnData(T)`: the selection for one OBJECT type's non-connection fields.
pub fn query_own_data(
    schema: &Schema,
    schema_info: &SchemaInfo,
    typename: &str,
) -> Result<Vec<Selection>, MirrorError> {
    let Some(Type::Object { fields }) = schema.get(typename) else {
        return Err(MirrorError::SchemaValidity(format!(
            "{typename} is not an object type"
        )));
    };
    let object_info = schema_info.object(typename)?;

    let mut selections = vec![leaf("__typename"), leaf(object_info.id_field.as_str())];

    for field_name in &object_info.primitives {
        selections.push(leaf(field_name.as_str()));
    }

    for field_name in &object_info.links {
        let Some(FieldType::Node { element_type, .. }) = fields.get(field_name) else {
            return Err(MirrorError::SchemaValidity(format!(
                "{typename}.{field_name} is not a node field"
            )));
        };
        selections.push(field(
            field_name.as_str(),
            Vec::new(),
            query_shallow(schema, element_type)?,
        ));
    }

    for (field_name, nested) in &object_info.nested {
        let Some(FieldType::Nested { eggs }) = fields.get(field_name) else {
            return Err(MirrorError::SchemaValidity(format!(
                "{typename}.{field_name} is not a nested field"
            )));
        };
        let mut children = Vec::new();
        for egg in &nested.primitive_eggs {
            children.push(leaf(egg.as_str()));
        }
        for egg in &nested.node_eggs {
            let Some(FieldType::Node { element_type, .. }) = eggs.get(egg) else {
                return Err(MirrorError::SchemaValidity(format!(
                    "{typename}.{field_name}.{egg} is not a node field"
                )));
            };
            children.push(field(
                egg.as_str(),
                Vec::new(),
                query_shallow(schema, element_type)?,
            ));
        }
        selections.push(field(field_name.as_str(), Vec::new(), children));
    }

    Ok(selections)
}

/// `queryConnection(T, F, endCursor, pageSize)`.
pub fn query_connection(
    schema_info: &SchemaInfo,
    typename: &str,
    fieldname: &str,
    end_cursor: &EndCursor,
    page_size: usize,
) -> Result<Selection, MirrorError> {
    let object_info = schema_info.object(typename)?;
    if !object_info.connections.iter().any(|f| f == fieldname) {
        return Err(MirrorError::SchemaValidity(format!(
            "{typename}.{fieldname} is not a connection field"
        )));
    }

    let mut args = vec![("first".to_string(), Value::Int(page_size as i64))];
    if let Some(after) = end_cursor.after_argument() {
        args.push((
            "after".to_string(),
            match after {
                Some(cursor) => Value::Str(cursor.to_string()),
                None => Value::Null,
            },
        ));
    }

    Ok(field(
        fieldname,
        args,
        vec![
            leaf("totalCount"),
            field(
                "pageInfo",
                Vec::new(),
                vec![leaf("endCursor"), leaf("hasNextPage")],
            ),
            field(
                "nodes",
                Vec::new(),
                vec![leaf("__typename"), leaf("id")],
            ),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, Fidelity, SchemaInfo};
    use crate::store::QueryPlan;
    use std::collections::BTreeMap;

    fn schema() -> Schema {
        let mut issue_fields = BTreeMap::new();
        issue_fields.insert("id".to_string(), FieldType::Id);
        issue_fields.insert("title".to_string(), FieldType::Primitive);
        issue_fields.insert(
            "author".to_string(),
            FieldType::Node {
                element_type: "User".to_string(),
                fidelity: Fidelity::Faithful,
            },
        );
        issue_fields.insert(
            "comments".to_string(),
            FieldType::Connection {
                element_type: "Comment".to_string(),
            },
        );

        let mut user_fields = BTreeMap::new();
        user_fields.insert("id".to_string(), FieldType::Id);
        user_fields.insert("login".to_string(), FieldType::Primitive);

        let mut schema = Schema::new();
        schema.insert("Issue".to_string(), Type::Object { fields: issue_fields });
        schema.insert("User".to_string(), Type::Object { fields: user_fields });
        schema
    }

    fn limits() -> PlanLimits {
        PlanLimits {
            nodes_limit: 100,
            nodes_of_type_limit: 50,
            connection_limit: 100,
            connection_page_size: 20,
        }
    }

    #[test]
    fn own_data_query_includes_primitives_and_shallow_link() {
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let selections = query_own_data(&schema, &info, "Issue").unwrap();
        let doc = print_query("X", &selections);
        assert!(doc.contains("title"));
        assert!(doc.contains("author {"));
        assert!(doc.contains("__typename"));
        assert!(!doc.contains("comments"));
    }

    #[test]
    fn connection_query_omits_after_when_unknown_and_includes_null_when_known_null() {
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();

        let unknown = query_connection(&info, "Issue", "comments", &EndCursor::Unknown, 20).unwrap();
        let doc = print_query("X", &[unknown]);
        assert!(!doc.contains("after"));

        let known_null =
            query_connection(&info, "Issue", "comments", &EndCursor::KnownNull, 20).unwrap();
        let doc = print_query("X", &[known_null]);
        assert!(doc.contains("after: null"));
    }

    #[test]
    fn plan_buckets_own_data_by_typename_and_aliases_sequentially() {
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let plan = QueryPlan {
            objects: vec![
                ("Issue".to_string(), "i1".to_string()),
                ("User".to_string(), "u1".to_string()),
            ],
            connections: vec![],
        };
        let doc = plan_query(&schema, &info, &plan, limits()).unwrap().unwrap();
        assert!(doc.contains("owndata_0:"));
        assert!(doc.contains("owndata_1:"));
    }

    #[test]
    fn plan_groups_connections_by_object_and_rejects_typename_conflicts() {
        use crate::store::OutdatedConnection;

        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let plan = QueryPlan {
            objects: vec![],
            connections: vec![
                OutdatedConnection {
                    object_typename: "Issue".to_string(),
                    object_id: "i1".to_string(),
                    fieldname: "comments".to_string(),
                    end_cursor: EndCursor::Unknown,
                },
                OutdatedConnection {
                    object_typename: "User".to_string(),
                    object_id: "i1".to_string(),
                    fieldname: "comments".to_string(),
                    end_cursor: EndCursor::Unknown,
                },
            ],
        };
        let err = plan_query(&schema, &info, &plan, limits()).unwrap_err();
        assert!(matches!(err, MirrorError::Consistency(_)));
    }

    #[test]
    fn empty_plan_produces_no_query() {
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let plan = QueryPlan::default();
        assert!(plan_query(&schema, &info, &plan, limits()).unwrap().is_none());
    }
}

//! Reconstructs a possibly-cyclic object graph rooted at a given id, via a
//! recursive SQL closure over the store.
//!
//! Rust has no way to build a literal cyclic data structure without shared,
//! interior-mutable ownership, so the graph is represented as an arena: every
//! reachable object gets a stable [`NodeRef`] index into [`ExtractedValue`],
//! and link/connection slots hold `NodeRef`s rather than nested values. This
//! is the same shape the recursive CTE naturally produces — a flat id set —
//! just carried one step further into the in-memory representation.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value as Json;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use crate::error::MirrorError;
use crate::schema::SchemaInfo;
use crate::sql::next_unused_name;
use crate::store::Store;

/// A stable index into an [`ExtractedValue`]'s arena. Cheap to copy; two
/// `NodeRef`s compare equal iff they name the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub usize);

/// One field slot of an [`ExtractedObject`].
#[derive(Debug, Clone)]
pub enum ExtractedField {
    /// A primitive value, stored as the JSON the remote returned.
    Scalar(Json),
    /// A NODE field: `None` is a null reference.
    Link(Option<NodeRef>),
    /// A NESTED field: `None` means the group itself was null.
    Nested(Option<NestedValue>),
    /// A CONNECTION field, in append order; entries may themselves be null.
    Connection(Vec<Option<NodeRef>>),
}

/// The eggs of one present NESTED field.
#[derive(Debug, Clone, Default)]
pub struct NestedValue {
    pub fields: IndexMap<String, ExtractedField>,
}

/// One materialized object: its own typename plus every declared field,
/// keyed by fieldname. Fields appear in the order they're filled in: links,
/// then nested groups, then connections (the skeleton pass), then primitives
/// (filled in afterward, per type).
#[derive(Debug, Clone)]
pub struct ExtractedObject {
    pub id: String,
    pub typename: String,
    pub fields: IndexMap<String, ExtractedField>,
}

/// The result of [`Store::extract`]: every object reachable from the root,
/// plus the root's own index. Distinct calls yield disjoint arenas — the
/// caller may mutate the result freely.
#[derive(Debug, Clone)]
pub struct ExtractedValue {
    arena: Vec<ExtractedObject>,
    root: NodeRef,
}

impl ExtractedValue {
    pub fn root(&self) -> &ExtractedObject {
        &self.arena[self.root.0]
    }

    pub fn get(&self, node: NodeRef) -> &ExtractedObject {
        &self.arena[node.0]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl Store {
    /// Builds the transitive-dependency closure of `root_id` and materializes
    /// it as an [`ExtractedValue`]. Fails if any reachable object's own data,
    /// or any of its connections, has never been fetched.
    pub async fn extract(&self, root_id: &str) -> Result<ExtractedValue, MirrorError> {
        let mut conn = self.pool.acquire().await?;
        extract_non_tx(&mut conn, &self.schema_info, root_id).await
    }
}

async fn extract_non_tx(
    conn: &mut SqliteConnection,
    schema_info: &SchemaInfo,
    root_id: &str,
) -> Result<ExtractedValue, MirrorError> {
    let temp_table = next_unused_name(conn, "tmp_transitive_dependencies_").await?;

    sqlx::query(&format!(
        "CREATE TEMP TABLE \"{temp_table}\" (id TEXT PRIMARY KEY, typename TEXT NOT NULL)"
    ))
    .execute(&mut *conn)
    .await?;

    let outcome = match populate_closure(conn, &temp_table, root_id).await {
        Ok(()) => materialize(conn, schema_info, &temp_table, root_id).await,
        Err(err) => Err(err),
    };

    sqlx::query(&format!("DROP TABLE \"{temp_table}\""))
        .execute(&mut *conn)
        .await?;

    outcome
}

async fn populate_closure(
    conn: &mut SqliteConnection,
    temp_table: &str,
    root_id: &str,
) -> Result<(), MirrorError> {
    let sql = format!(
        "INSERT INTO \"{temp_table}\" (id, typename)
         WITH RECURSIVE closure(id) AS (
             SELECT ?
             UNION
             SELECT l.child_id FROM closure c
                 JOIN links l ON l.parent_id = c.id
                 WHERE l.child_id IS NOT NULL
             UNION
             SELECT ce.child_id FROM closure c
                 JOIN connections conn ON conn.object_id = c.id
                 JOIN connection_entries ce ON ce.connection_id = conn.rowid
                 WHERE ce.child_id IS NOT NULL
         )
         SELECT c.id, o.typename FROM closure c JOIN objects o ON o.id = c.id"
    );
    sqlx::query(&sql).bind(root_id).execute(&mut *conn).await?;
    Ok(())
}

async fn materialize(
    conn: &mut SqliteConnection,
    schema_info: &SchemaInfo,
    temp_table: &str,
    root_id: &str,
) -> Result<ExtractedValue, MirrorError> {
    check_freshness(conn, temp_table).await?;

    let members: Vec<(String, String)> =
        sqlx::query_as(&format!("SELECT id, typename FROM \"{temp_table}\""))
            .fetch_all(&mut *conn)
            .await?;

    let mut arena = Vec::with_capacity(members.len());
    let mut index_of: HashMap<String, NodeRef> = HashMap::with_capacity(members.len());
    for (id, typename) in &members {
        let object_info = schema_info.object(typename)?;
        let mut fields = IndexMap::new();
        for field in &object_info.links {
            fields.insert(field.clone(), ExtractedField::Link(None));
        }
        for field in object_info.nested.keys() {
            fields.insert(field.clone(), ExtractedField::Nested(None));
        }
        for field in &object_info.connections {
            fields.insert(field.clone(), ExtractedField::Connection(Vec::new()));
        }
        index_of.insert(id.clone(), NodeRef(arena.len()));
        arena.push(ExtractedObject {
            id: id.clone(),
            typename: typename.clone(),
            fields,
        });
    }

    let typenames: std::collections::HashSet<&str> =
        members.iter().map(|(_, typename)| typename.as_str()).collect();
    for typename in typenames {
        materialize_primitives(conn, schema_info, temp_table, typename, &index_of, &mut arena).await?;
    }

    apply_links(conn, temp_table, &index_of, &mut arena).await?;
    apply_connections(conn, temp_table, &index_of, &mut arena).await?;

    let root = *index_of
        .get(root_id)
        .ok_or_else(|| MirrorError::Consistency(format!("root {root_id} was not extracted")))?;

    Ok(ExtractedValue { arena, root })
}

async fn check_freshness(conn: &mut SqliteConnection, temp_table: &str) -> Result<(), MirrorError> {
    let stale_object: Option<String> = sqlx::query_scalar(&format!(
        "SELECT t.id FROM \"{temp_table}\" t
         JOIN objects o ON o.id = t.id
         WHERE o.last_update IS NULL
         LIMIT 1"
    ))
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(id) = stale_object {
        return Err(MirrorError::Freshness(format!(
            "{id}: own data has never been fetched"
        )));
    }

    #[derive(sqlx::FromRow)]
    struct StaleConnection {
        object_id: String,
        fieldname: String,
    }
    let stale_connection: Option<StaleConnection> = sqlx::query_as(&format!(
        "SELECT c.object_id AS object_id, c.fieldname AS fieldname
         FROM connections c
         JOIN \"{temp_table}\" t ON t.id = c.object_id
         WHERE c.last_update IS NULL
         LIMIT 1"
    ))
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = stale_connection {
        return Err(MirrorError::Freshness(format!(
            "{}: {} connection has never been fetched",
            row.object_id, row.fieldname
        )));
    }

    Ok(())
}

async fn materialize_primitives(
    conn: &mut SqliteConnection,
    schema_info: &SchemaInfo,
    temp_table: &str,
    typename: &str,
    index_of: &HashMap<String, NodeRef>,
    arena: &mut [ExtractedObject],
) -> Result<(), MirrorError> {
    let object_info = schema_info.object(typename)?;

    let sql = format!(
        "SELECT p.* FROM \"primitives_{typename}\" p
         JOIN \"{temp_table}\" t ON t.id = p.id"
    );
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

    for row in rows {
        let id: String = row.try_get("id")?;
        let Some(&node) = index_of.get(&id) else {
            continue;
        };
        let object = &mut arena[node.0];
        let mut primitive_fields = IndexMap::new();

        for field in &object_info.primitives {
            let raw: Option<String> = row.try_get(field.as_str())?;
            let value = decode_primitive(typename, &id, field, raw)?;
            primitive_fields.insert(field.clone(), ExtractedField::Scalar(value));
        }

        for (field, nested_info) in &object_info.nested {
            let presence: Option<i64> = row.try_get(field.as_str())?;
            let nested_field = match presence {
                None => {
                    return Err(MirrorError::Corruption(format!(
                        "{typename}:{id}.{field} presence marker is unset despite a fresh extract"
                    )))
                }
                Some(0) => ExtractedField::Nested(None),
                Some(1) => {
                    let mut group = NestedValue::default();
                    for egg in &nested_info.primitive_eggs {
                        let column = format!("{field}.{egg}");
                        let raw: Option<String> = row.try_get(column.as_str())?;
                        let value = decode_primitive(typename, &id, &column, raw)?;
                        group.fields.insert(egg.clone(), ExtractedField::Scalar(value));
                    }
                    for egg in &nested_info.node_eggs {
                        group.fields.insert(egg.clone(), ExtractedField::Link(None));
                    }
                    ExtractedField::Nested(Some(group))
                }
                Some(other) => {
                    return Err(MirrorError::Corruption(format!(
                        "{typename}:{id}.{field} presence marker is {other}, expected 0 or 1"
                    )))
                }
            };
            object.fields.insert(field.clone(), nested_field);
        }

        for (field, value) in primitive_fields {
            object.fields.insert(field, value);
        }
    }

    Ok(())
}

fn decode_primitive(
    typename: &str,
    id: &str,
    field: &str,
    raw: Option<String>,
) -> Result<Json, MirrorError> {
    match raw {
        None => Err(MirrorError::Corruption(format!(
            "{typename}:{id}.{field} has never been fetched despite a fresh extract"
        ))),
        Some(text) => serde_json::from_str(&text).map_err(|err| {
            MirrorError::Corruption(format!(
                "{typename}:{id}.{field} does not contain valid JSON: {err}"
            ))
        }),
    }
}

async fn apply_links(
    conn: &mut SqliteConnection,
    temp_table: &str,
    index_of: &HashMap<String, NodeRef>,
    arena: &mut [ExtractedObject],
) -> Result<(), MirrorError> {
    #[derive(sqlx::FromRow)]
    struct LinkRow {
        parent_id: String,
        fieldname: String,
        child_id: Option<String>,
    }

    let rows: Vec<LinkRow> = sqlx::query_as(&format!(
        "SELECT l.parent_id AS parent_id, l.fieldname AS fieldname, l.child_id AS child_id
         FROM links l
         JOIN \"{temp_table}\" t ON t.id = l.parent_id"
    ))
    .fetch_all(&mut *conn)
    .await?;

    for row in rows {
        let Some(&parent) = index_of.get(&row.parent_id) else {
            continue;
        };
        let child = match row.child_id {
            None => None,
            Some(child_id) => Some(resolve(index_of, &row.parent_id, &row.fieldname, &child_id)?),
        };

        match row.fieldname.split_once('.') {
            None => {
                arena[parent.0]
                    .fields
                    .insert(row.fieldname, ExtractedField::Link(child));
            }
            Some((field, egg)) => {
                if let Some(ExtractedField::Nested(Some(group))) =
                    arena[parent.0].fields.get_mut(field)
                {
                    group.fields.insert(egg.to_string(), ExtractedField::Link(child));
                }
                // Nested group absent: silently drop the egg link per §4.8.
            }
        }
    }

    Ok(())
}

async fn apply_connections(
    conn: &mut SqliteConnection,
    temp_table: &str,
    index_of: &HashMap<String, NodeRef>,
    arena: &mut [ExtractedObject],
) -> Result<(), MirrorError> {
    #[derive(sqlx::FromRow)]
    struct EntryRow {
        object_id: String,
        fieldname: String,
        idx: Option<i64>,
        child_id: Option<String>,
    }

    let rows: Vec<EntryRow> = sqlx::query_as(&format!(
        "SELECT c.object_id AS object_id, c.fieldname AS fieldname, ce.idx AS idx, ce.child_id AS child_id
         FROM connections c
         JOIN \"{temp_table}\" t ON t.id = c.object_id
         LEFT JOIN connection_entries ce ON ce.connection_id = c.rowid
         ORDER BY c.object_id, c.fieldname, ce.idx ASC"
    ))
    .fetch_all(&mut *conn)
    .await?;

    for row in rows {
        let Some(&parent) = index_of.get(&row.object_id) else {
            continue;
        };

        // `idx IS NULL` means the LEFT JOIN found no entry row at all (an
        // empty connection), not a genuine null entry. The slot already
        // exists (empty) from the skeleton pass, so there is nothing to do.
        let Some(_idx) = row.idx else {
            continue;
        };

        let child = match row.child_id {
            None => None,
            Some(child_id) => Some(resolve(index_of, &row.object_id, &row.fieldname, &child_id)?),
        };

        let Some(ExtractedField::Connection(entries)) =
            arena[parent.0].fields.get_mut(&row.fieldname)
        else {
            return Err(MirrorError::Corruption(format!(
                "{}.{} is not a connection field in the extracted object",
                row.object_id, row.fieldname
            )));
        };
        entries.push(child);
    }

    Ok(())
}

fn resolve(
    index_of: &HashMap<String, NodeRef>,
    parent_id: &str,
    fieldname: &str,
    child_id: &str,
) -> Result<NodeRef, MirrorError> {
    index_of.get(child_id).copied().ok_or_else(|| {
        MirrorError::Corruption(format!(
            "{parent_id}.{fieldname} references {child_id}, which is outside the extracted closure"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, Fidelity, Schema, Type};
    use crate::store::{MirrorOptions, Store};
    use serde_json::json;
    use sqlx::SqlitePool;
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

    async fn store() -> Store {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Store::open(pool, schema(), MirrorOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn extract_fails_on_own_data_never_fetched() {
        let store = store().await;
        store.register("Issue", "i1").await.unwrap();
        let err = store.extract("i1").await.unwrap_err();
        assert!(matches!(err, MirrorError::Freshness(_)));
    }

    #[tokio::test]
    async fn extract_materializes_primitives_links_and_connections() {
        let store = store().await;
        store.register("Issue", "i1").await.unwrap();
        store.register("User", "u1").await.unwrap();

        store
            .ingest(
                1,
                json!({
                    "owndata_0": [
                        {"__typename": "Issue", "id": "i1", "title": "hi", "author": {"__typename": "User", "id": "u1"}}
                    ]
                }),
            )
            .await
            .unwrap();
        store
            .ingest(
                2,
                json!({
                    "owndata_0": [
                        {"__typename": "User", "id": "u1", "login": "alice"}
                    ]
                }),
            )
            .await
            .unwrap();
        store
            .ingest(
                3,
                json!({
                    "node_0": {
                        "id": "i1",
                        "comments": {
                            "totalCount": 1,
                            "pageInfo": {"endCursor": "c1", "hasNextPage": false},
                            "nodes": [{"__typename": "User", "id": "u1"}]
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let graph = store.extract("i1").await.unwrap();
        let root = graph.root();
        assert_eq!(root.typename, "Issue");
        match root.fields.get("title").unwrap() {
            ExtractedField::Scalar(v) => assert_eq!(v, &json!("hi")),
            other => panic!("expected scalar, got {other:?}"),
        }
        let author_ref = match root.fields.get("author").unwrap() {
            ExtractedField::Link(Some(r)) => *r,
            other => panic!("expected link, got {other:?}"),
        };
        assert_eq!(graph.get(author_ref).typename, "User");
        match root.fields.get("comments").unwrap() {
            ExtractedField::Connection(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0], Some(author_ref));
            }
            other => panic!("expected connection, got {other:?}"),
        }
    }
}

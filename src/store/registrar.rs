//! Declaring a new object: one `objects` row plus its empty link/connection/
//! primitive rows, created eagerly so every later ingest is a pure `UPDATE`.

use sqlx::sqlite::SqliteConnection;

use super::Store;
use crate::error::MirrorError;
use crate::schema::Type;
use crate::sql::run_in_transaction;

impl Store {
    /// Registers `(typename, id)` as a root or dependency. A no-op if the id
    /// is already registered with the same typename; a hard error if it is
    /// registered with a different one.
    pub async fn register(&self, typename: &str, id: &str) -> Result<(), MirrorError> {
        let typename = typename.to_string();
        let id = id.to_string();
        let schema = &self.schema;
        let schema_info = &self.schema_info;

        run_in_transaction(&self.pool, &self.guard, move |mut tx| async move {
            register_non_tx(&mut tx, schema, schema_info, &typename, &id).await?;
            Ok((tx, ()))
        })
        .await
    }
}

pub(crate) async fn register_non_tx(
    conn: &mut SqliteConnection,
    schema: &crate::schema::Schema,
    schema_info: &crate::schema::SchemaInfo,
    typename: &str,
    id: &str,
) -> Result<(), MirrorError> {
    let existing: Option<String> = sqlx::query_scalar("SELECT typename FROM objects WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some(existing_typename) if existing_typename == typename => return Ok(()),
        Some(existing_typename) => {
            return Err(MirrorError::Consistency(format!(
                "id {id} already registered as {existing_typename}, cannot re-register as {typename}"
            )))
        }
        None => {}
    }

    match schema.get(typename) {
        Some(Type::Object { .. }) => {}
        Some(_) => {
            return Err(MirrorError::SchemaValidity(format!(
                "{typename} is not an object type"
            )))
        }
        None => {
            return Err(MirrorError::SchemaValidity(format!(
                "unknown object type {typename}"
            )))
        }
    }

    let object_info = schema_info.object(typename)?;

    sqlx::query("INSERT INTO objects (id, typename, last_update) VALUES (?, ?, NULL)")
        .bind(id)
        .bind(typename)
        .execute(&mut *conn)
        .await?;

    let insert_primitives_sql = format!("INSERT INTO \"primitives_{typename}\" (\"id\") VALUES (?)");
    sqlx::query(&insert_primitives_sql)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    for fieldname in object_info.all_link_field_names() {
        sqlx::query(
            "INSERT INTO links (parent_id, fieldname, child_id) VALUES (?, ?, NULL)",
        )
        .bind(id)
        .bind(&fieldname)
        .execute(&mut *conn)
        .await?;
    }

    for fieldname in &object_info.connections {
        sqlx::query(
            "INSERT INTO connections (object_id, fieldname, last_update, total_count, has_next_page, end_cursor) \
             VALUES (?, ?, NULL, NULL, NULL, NULL)",
        )
        .bind(id)
        .bind(fieldname)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Registers the identity carried by a shallow node-field result (`{__typename,
/// id}` or a union clause thereof), unless the id is blacklisted. Returns the
/// id to store as the link/entry target, or `None` if the reference is null
/// or severed by the blacklist.
pub(crate) async fn register_node_field_result(
    conn: &mut SqliteConnection,
    schema: &crate::schema::Schema,
    schema_info: &crate::schema::SchemaInfo,
    blacklisted_ids: &std::collections::HashSet<String>,
    result: Option<(&str, &str)>,
) -> Result<Option<String>, MirrorError> {
    let Some((typename, id)) = result else {
        return Ok(None);
    };
    if blacklisted_ids.contains(id) {
        return Ok(None);
    }
    register_non_tx(conn, schema, schema_info, typename, id).await?;
    Ok(Some(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::{MirrorOptions, Store};
    use crate::error::MirrorError;
    use crate::schema::{FieldType, Schema, Type};
    use sqlx::SqlitePool;
    use std::collections::BTreeMap;

    async fn store() -> Store {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::Id);
        fields.insert("title".to_string(), FieldType::Primitive);
        let mut schema = Schema::new();
        schema.insert("Issue".to_string(), Type::Object { fields });

        let mut user_fields = BTreeMap::new();
        user_fields.insert("id".to_string(), FieldType::Id);
        schema.insert(
            "User".to_string(),
            Type::Object {
                fields: user_fields,
            },
        );

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Store::open(pool, schema, MirrorOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let store = store().await;
        store.register("Issue", "i1").await.unwrap();
        store.register("Issue", "i1").await.unwrap();
    }

    #[tokio::test]
    async fn reregistering_with_different_typename_fails() {
        let store = store().await;
        store.register("Issue", "i1").await.unwrap();
        let err = store.register("User", "i1").await.unwrap_err();
        assert!(matches!(err, MirrorError::Consistency(_)));
    }

    #[tokio::test]
    async fn registering_unknown_type_fails() {
        let store = store().await;
        let err = store.register("Ghost", "g1").await.unwrap_err();
        assert!(matches!(err, MirrorError::SchemaValidity(_)));
    }
}

//! Discovery of everything that needs a fresh fetch: objects whose own data
//! has never been (or was long ago) fetched, and connections that are either
//! unfetched, stale, or mid-pagination.

use super::Store;
use crate::cursor::EndCursor;
use crate::error::MirrorError;

/// One connection that needs fetching, with enough context for the planner
/// to build its query and route the ingest.
#[derive(Debug, Clone)]
pub struct OutdatedConnection {
    pub object_typename: String,
    pub object_id: String,
    pub fieldname: String,
    pub end_cursor: EndCursor,
}

/// The result of [`Store::find_outdated`]: everything a single update step
/// should try to fetch, before the planner's limits are applied.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub objects: Vec<(String, String)>,
    pub connections: Vec<OutdatedConnection>,
}

impl QueryPlan {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.connections.is_empty()
    }
}

impl Store {
    /// Returns every object and connection that is not up to date at `since`
    /// (epoch milliseconds). "Never fetched" always counts as outdated.
    pub async fn find_outdated(&self, since: i64) -> Result<QueryPlan, MirrorError> {
        let mut conn = self.pool.acquire().await?;

        let objects: Vec<(String, String)> = sqlx::query_as(
            "SELECT o.typename, o.id
             FROM objects o
             LEFT JOIN updates u ON o.last_update = u.rowid
             WHERE o.last_update IS NULL OR u.time_epoch_millis < ?",
        )
        .bind(since)
        .fetch_all(&mut *conn)
        .await?;

        #[derive(sqlx::FromRow)]
        struct ConnectionRow {
            typename: String,
            object_id: String,
            fieldname: String,
            last_update_is_null: bool,
            end_cursor: Option<String>,
        }

        let rows: Vec<ConnectionRow> = sqlx::query_as(
            "SELECT o.typename AS typename, c.object_id AS object_id, c.fieldname AS fieldname,
                    c.last_update IS NULL AS last_update_is_null, c.end_cursor AS end_cursor
             FROM connections c
             JOIN objects o ON o.id = c.object_id
             LEFT JOIN updates u ON c.last_update = u.rowid
             WHERE c.has_next_page = 1 OR c.last_update IS NULL OR u.time_epoch_millis < ?",
        )
        .bind(since)
        .fetch_all(&mut *conn)
        .await?;

        let connections = rows
            .into_iter()
            .map(|row| OutdatedConnection {
                object_typename: row.typename,
                object_id: row.object_id,
                fieldname: row.fieldname,
                end_cursor: EndCursor::from_row(row.last_update_is_null, row.end_cursor),
            })
            .collect();

        Ok(QueryPlan {
            objects,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{MirrorOptions, Store};
    use crate::schema::{FieldType, Schema, Type};
    use sqlx::SqlitePool;
    use std::collections::BTreeMap;

    async fn store() -> Store {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::Id);
        fields.insert("title".to_string(), FieldType::Primitive);
        fields.insert(
            "comments".to_string(),
            FieldType::Connection {
                element_type: "Comment".to_string(),
            },
        );
        let mut schema = Schema::new();
        schema.insert("Issue".to_string(), Type::Object { fields });

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Store::open(pool, schema, MirrorOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn never_fetched_object_and_connection_are_outdated() {
        let store = store().await;
        store.register("Issue", "i1").await.unwrap();

        let plan = store.find_outdated(0).await.unwrap();
        assert_eq!(plan.objects, vec![("Issue".to_string(), "i1".to_string())]);
        assert_eq!(plan.connections.len(), 1);
        assert_eq!(plan.connections[0].fieldname, "comments");
        assert_eq!(
            plan.connections[0].end_cursor,
            crate::cursor::EndCursor::Unknown
        );
    }
}

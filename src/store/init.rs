//! Structural and per-type table creation, gated on a canonical
//! `{version, schema, options}` blob stored in the `meta` singleton.

use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use super::MirrorOptions;
use crate::error::MirrorError;
use crate::schema::{is_sql_safe, Schema, SchemaInfo};

/// Bump this on any change to the mapping rules or column encoding. An old
/// database then refuses to open, by design — there is no migration path.
const VERSION: &str = "MIRROR_v3";

#[derive(serde::Serialize)]
struct ConfigBlob<'a> {
    version: &'a str,
    schema: &'a Schema,
    options: OptionsBlob<'a>,
}

#[derive(serde::Serialize)]
struct OptionsBlob<'a> {
    blacklisted_ids: Vec<&'a String>,
}

fn canonical_config<'a>(schema: &'a Schema, options: &'a MirrorOptions) -> String {
    let mut blacklisted: Vec<&String> = options.blacklisted_ids.iter().collect();
    blacklisted.sort();
    let blob = ConfigBlob {
        version: VERSION,
        schema,
        options: OptionsBlob {
            blacklisted_ids: blacklisted,
        },
    };
    serde_json::to_string(&blob).expect("schema/options are always JSON-serializable")
}

pub async fn initialize(
    pool: &SqlitePool,
    schema: &Schema,
    schema_info: &SchemaInfo,
    options: &MirrorOptions,
) -> Result<(), MirrorError> {
    let blob = canonical_config(schema, options);
    let mut tx = pool.begin().await?;

    ensure_meta_table(&mut tx).await?;
    match read_meta(&mut tx).await? {
        None => {
            insert_meta(&mut tx, &blob).await?;
        }
        Some(existing) if existing == blob => {
            // Already initialized with an identical config; the structural
            // and per-type tables were created the first time. Nothing to do.
            tx.commit().await?;
            return Ok(());
        }
        Some(_) => return Err(MirrorError::ConfigMismatch),
    }

    create_structural_tables(&mut tx).await?;
    create_primitive_tables(&mut tx, schema_info).await?;

    tx.commit().await?;
    Ok(())
}

async fn ensure_meta_table(conn: &mut SqliteConnection) -> Result<(), MirrorError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS meta (zero INTEGER PRIMARY KEY CHECK (zero = 0), config TEXT NOT NULL)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_meta(conn: &mut SqliteConnection) -> Result<Option<String>, MirrorError> {
    let row: Option<String> = sqlx::query_scalar("SELECT config FROM meta WHERE zero = 0")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

async fn insert_meta(conn: &mut SqliteConnection, blob: &str) -> Result<(), MirrorError> {
    sqlx::query("INSERT INTO meta (zero, config) VALUES (0, ?)")
        .bind(blob)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn create_structural_tables(conn: &mut SqliteConnection) -> Result<(), MirrorError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS updates (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            time_epoch_millis INTEGER NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS objects (
            id TEXT PRIMARY KEY,
            typename TEXT NOT NULL,
            last_update INTEGER REFERENCES updates(rowid)
        )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS links (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id TEXT NOT NULL,
            fieldname TEXT NOT NULL,
            child_id TEXT,
            UNIQUE(parent_id, fieldname)
        )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_parent ON links(parent_id)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS connections (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            object_id TEXT NOT NULL,
            fieldname TEXT NOT NULL,
            last_update INTEGER REFERENCES updates(rowid),
            total_count INTEGER,
            has_next_page INTEGER,
            end_cursor TEXT,
            UNIQUE(object_id, fieldname)
        )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_object ON connections(object_id)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS connection_entries (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES connections(rowid),
            idx INTEGER NOT NULL,
            child_id TEXT,
            UNIQUE(connection_id, idx)
        )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_connection_entries_connection ON connection_entries(connection_id)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn create_primitive_tables(
    conn: &mut SqliteConnection,
    schema_info: &SchemaInfo,
) -> Result<(), MirrorError> {
    for (typename, object) in &schema_info.objects {
        if !is_sql_safe(typename) {
            return Err(MirrorError::SchemaValidity(format!(
                "type name {typename} is not a safe SQL identifier"
            )));
        }

        let mut columns = vec!["\"id\" TEXT PRIMARY KEY REFERENCES objects(id)".to_string()];

        for field in &object.primitives {
            validate_field_identifier(typename, field)?;
            columns.push(format!("\"{field}\" TEXT"));
        }
        for (field, nested) in &object.nested {
            validate_field_identifier(typename, field)?;
            columns.push(format!("\"{field}\" INTEGER"));
            for egg in &nested.primitive_eggs {
                validate_field_identifier(typename, egg)?;
                columns.push(format!("\"{field}.{egg}\" TEXT"));
            }
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"primitives_{typename}\" ({})",
            columns.join(", ")
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

fn validate_field_identifier(typename: &str, field: &str) -> Result<(), MirrorError> {
    if !is_sql_safe(field) {
        return Err(MirrorError::SchemaValidity(format!(
            "field {typename}.{field} is not a safe SQL identifier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, Fidelity, Type};
    use std::collections::BTreeMap;

    fn schema() -> Schema {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::Id);
        fields.insert("title".to_string(), FieldType::Primitive);
        let mut schema = Schema::new();
        schema.insert("Issue".to_string(), Type::Object { fields });
        schema
    }

    #[tokio::test]
    async fn reopen_with_same_schema_is_a_no_op() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let options = MirrorOptions::default();

        initialize(&pool, &schema, &info, &options).await.unwrap();
        initialize(&pool, &schema, &info, &options).await.unwrap();
    }

    #[tokio::test]
    async fn reopen_with_different_schema_fails() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = schema();
        let info = SchemaInfo::compile(&schema).unwrap();
        let options = MirrorOptions::default();
        initialize(&pool, &schema, &info, &options).await.unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::Id);
        fields.insert(
            "author".to_string(),
            FieldType::Node {
                element_type: "User".to_string(),
                fidelity: Fidelity::Faithful,
            },
        );
        let mut other_schema = Schema::new();
        other_schema.insert("Issue".to_string(), Type::Object { fields });
        let other_info = SchemaInfo::compile(&other_schema).unwrap();

        let err = initialize(&pool, &other_schema, &other_info, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::ConfigMismatch));
    }

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::Id);
        fields.insert("bad name".to_string(), FieldType::Primitive);
        let mut schema = Schema::new();
        schema.insert("Issue".to_string(), Type::Object { fields });
        let info = SchemaInfo::compile(&schema).unwrap();
        let options = MirrorOptions::default();

        let err = initialize(&pool, &schema, &info, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::SchemaValidity(_)));
    }
}

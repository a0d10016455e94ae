//! Transactional ingestion of one GraphQL response into the store: own-data
//! batches (primitives + links) and connection pages.

use serde_json::Value as Json;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::Arguments as _;
use std::collections::HashSet;

use super::registrar::register_node_field_result;
use super::Store;
use crate::error::MirrorError;
use crate::schema::{Schema, SchemaInfo};
use crate::sql::{exec_single_update, run_in_transaction};

impl Store {
    /// Opens a transaction, stamps a fresh `updates` row with `now`, and
    /// ingests `result` under that update id. Returns the new update id.
    pub async fn ingest(&self, now: i64, result: Json) -> Result<i64, MirrorError> {
        let schema = self.schema.clone();
        let schema_info = self.schema_info.clone();
        let blacklisted = self.options.blacklisted_ids.clone();

        run_in_transaction(&self.pool, &self.guard, move |mut tx| async move {
            let update_id: i64 = sqlx::query_scalar(
                "INSERT INTO updates (time_epoch_millis) VALUES (?) RETURNING rowid",
            )
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            ingest_result(&mut tx, &schema, &schema_info, &blacklisted, update_id, result).await?;

            Ok((tx, update_id))
        })
        .await
    }
}

async fn ingest_result(
    conn: &mut SqliteConnection,
    schema: &Schema,
    schema_info: &SchemaInfo,
    blacklisted: &HashSet<String>,
    update_id: i64,
    result: Json,
) -> Result<(), MirrorError> {
    let Json::Object(top) = result else {
        return Err(MirrorError::Consistency(
            "top-level query result must be an object".to_string(),
        ));
    };

    for (key, value) in top {
        if let Some(_i) = key.strip_prefix("owndata_") {
            let Json::Array(records) = value else {
                return Err(MirrorError::Consistency(format!(
                    "{key}: expected an array of own-data records"
                )));
            };
            update_own_data(conn, schema, schema_info, blacklisted, update_id, &records).await?;
        } else if let Some(_i) = key.strip_prefix("node_") {
            let Json::Object(fields) = value else {
                return Err(MirrorError::Consistency(format!(
                    "{key}: expected an object keyed by connection fieldname"
                )));
            };
            let object_id = fields
                .get("id")
                .and_then(Json::as_str)
                .ok_or_else(|| {
                    MirrorError::Consistency(format!("{key}: missing id in node result"))
                })?
                .to_string();
            for (fieldname, connection_value) in fields {
                if fieldname == "id" {
                    continue;
                }
                update_connection(
                    conn,
                    schema,
                    schema_info,
                    blacklisted,
                    update_id,
                    &object_id,
                    &fieldname,
                    connection_value,
                )
                .await?;
            }
        } else {
            return Err(MirrorError::Consistency(format!(
                "unrecognized top-level query alias {key}"
            )));
        }
    }

    Ok(())
}

async fn update_own_data(
    conn: &mut SqliteConnection,
    schema: &Schema,
    schema_info: &SchemaInfo,
    blacklisted: &HashSet<String>,
    update_id: i64,
    records: &[Json],
) -> Result<(), MirrorError> {
    if records.is_empty() {
        return Ok(());
    }

    let mut typename: Option<String> = None;
    for record in records {
        let this_typename = record
            .get("__typename")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                MirrorError::Consistency("own-data record missing __typename".to_string())
            })?;
        match &typename {
            None => typename = Some(this_typename.to_string()),
            Some(existing) if existing == this_typename => {}
            Some(existing) => {
                return Err(MirrorError::Consistency(format!(
                    "own-data batch mixes typenames {existing} and {this_typename}"
                )))
            }
        }
    }
    let typename = typename.unwrap();
    let object_info = schema_info.object(&typename)?;

    for record in records {
        let id = record
            .get("id")
            .and_then(Json::as_str)
            .ok_or_else(|| MirrorError::Consistency("own-data record missing id".to_string()))?
            .to_string();

        let exists: Option<String> = sqlx::query_scalar("SELECT typename FROM objects WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(MirrorError::Consistency(format!(
                "own-data ingest for unregistered object {id}"
            )));
        }

        let mut args = SqliteArguments::default();
        bind_arg(&mut args, update_id)?;
        bind_arg(&mut args, id.clone())?;
        exec_single_update(
            conn,
            "UPDATE objects SET last_update = ? WHERE id = ?",
            args,
            &format!("{update_id}, {id}"),
        )
        .await?;

        write_primitives(conn, &typename, object_info, &id, record).await?;
        write_links(
            conn,
            schema,
            schema_info,
            blacklisted,
            object_info,
            &id,
            record,
        )
        .await?;
    }

    Ok(())
}

enum BindValue {
    Text(Option<String>),
    Int(Option<i64>),
}

/// `SqliteArguments::add` returns a boxed dyn error on encode failure (which
/// cannot actually happen for the plain owned types this module binds); this
/// just folds that into [`MirrorError`] so call sites can use `?`.
fn bind_arg<'q, T>(args: &mut SqliteArguments<'q>, value: T) -> Result<(), MirrorError>
where
    T: sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + 'q,
{
    args.add(value)
        .map_err(sqlx::Error::Encode)
        .map_err(MirrorError::from)
}

async fn write_primitives(
    conn: &mut SqliteConnection,
    typename: &str,
    object_info: &crate::schema::ObjectInfo,
    id: &str,
    record: &Json,
) -> Result<(), MirrorError> {
    let mut columns = Vec::new();
    let mut values = Vec::new();

    for field in &object_info.primitives {
        let value = record.get(field).ok_or_else(|| {
            MirrorError::Consistency(format!(
                "own-data response for {typename}:{id} is missing declared field {field}"
            ))
        })?;
        columns.push(field.clone());
        values.push(BindValue::Text(Some(value.to_string())));
    }

    for (field, nested) in &object_info.nested {
        let value = record.get(field).ok_or_else(|| {
            MirrorError::Consistency(format!(
                "own-data response for {typename}:{id} is missing declared nested field {field}"
            ))
        })?;

        match value {
            Json::Null => {
                columns.push(field.clone());
                values.push(BindValue::Int(Some(0)));
                for egg in &nested.primitive_eggs {
                    columns.push(format!("{field}.{egg}"));
                    values.push(BindValue::Text(None));
                }
            }
            Json::Object(group) => {
                columns.push(field.clone());
                values.push(BindValue::Int(Some(1)));
                for egg in &nested.primitive_eggs {
                    let egg_value = group.get(egg).ok_or_else(|| {
                        MirrorError::Consistency(format!(
                            "own-data response for {typename}:{id} is missing declared nested egg {field}.{egg}"
                        ))
                    })?;
                    columns.push(format!("{field}.{egg}"));
                    values.push(BindValue::Text(Some(egg_value.to_string())));
                }
            }
            other => {
                return Err(MirrorError::Consistency(format!(
                    "nested field {typename}:{id}.{field} must be an object or null, got {other}"
                )))
            }
        }
    }

    if columns.is_empty() {
        return Ok(());
    }

    let set_clause = columns
        .iter()
        .map(|c| format!("\"{c}\" = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE \"primitives_{typename}\" SET {set_clause} WHERE \"id\" = ?");

    let mut args = SqliteArguments::default();
    let mut diagnostic = Vec::new();
    for value in &values {
        match value {
            BindValue::Text(Some(s)) => {
                diagnostic.push(s.clone());
                bind_arg(&mut args, s.clone())?;
            }
            BindValue::Text(None) => {
                diagnostic.push("NULL".to_string());
                bind_arg(&mut args, Option::<String>::None)?;
            }
            BindValue::Int(v) => {
                diagnostic.push(format!("{v:?}"));
                bind_arg(&mut args, *v)?;
            }
        }
    }
    diagnostic.push(id.to_string());
    bind_arg(&mut args, id.to_string())?;

    exec_single_update(conn, &sql, args, &diagnostic.join(", ")).await
}

async fn write_links(
    conn: &mut SqliteConnection,
    schema: &Schema,
    schema_info: &SchemaInfo,
    blacklisted: &HashSet<String>,
    object_info: &crate::schema::ObjectInfo,
    id: &str,
    record: &Json,
) -> Result<(), MirrorError> {
    for field in &object_info.links {
        let value = record.get(field).ok_or_else(|| {
            MirrorError::Consistency(format!(
                "own-data response for {id} is missing declared link field {field}"
            ))
        })?;
        let target = parse_node_ref(value)?;
        set_link(conn, schema, schema_info, blacklisted, id, field, target).await?;
    }

    for (field, nested) in &object_info.nested {
        if nested.node_eggs.is_empty() {
            continue;
        }
        let value = record.get(field).ok_or_else(|| {
            MirrorError::Consistency(format!(
                "own-data response for {id} is missing declared nested field {field}"
            ))
        })?;
        let group = match value {
            Json::Null => None,
            Json::Object(group) => Some(group),
            other => {
                return Err(MirrorError::Consistency(format!(
                    "nested field {id}.{field} must be an object or null, got {other}"
                )))
            }
        };

        for egg in &nested.node_eggs {
            let link_name = format!("{field}.{egg}");
            let target = match group {
                None => None,
                Some(group) => {
                    let egg_value = group.get(egg).ok_or_else(|| {
                        MirrorError::Consistency(format!(
                            "own-data response for {id} is missing declared nested egg {field}.{egg}"
                        ))
                    })?;
                    parse_node_ref(egg_value)?
                }
            };
            set_link(conn, schema, schema_info, blacklisted, id, &link_name, target).await?;
        }
    }

    Ok(())
}

/// Extracts `(typename, id)` from a shallow node-reference result
/// (`{__typename, id}`), or `None` for a JSON null reference.
fn parse_node_ref(value: &Json) -> Result<Option<(String, String)>, MirrorError> {
    match value {
        Json::Null => Ok(None),
        Json::Object(obj) => {
            let typename = obj
                .get("__typename")
                .and_then(Json::as_str)
                .ok_or_else(|| {
                    MirrorError::Consistency("node reference missing __typename".to_string())
                })?
                .to_string();
            let id = obj
                .get("id")
                .and_then(Json::as_str)
                .ok_or_else(|| MirrorError::Consistency("node reference missing id".to_string()))?
                .to_string();
            Ok(Some((typename, id)))
        }
        other => Err(MirrorError::Consistency(format!(
            "node reference must be an object or null, got {other}"
        ))),
    }
}

async fn set_link(
    conn: &mut SqliteConnection,
    schema: &Schema,
    schema_info: &SchemaInfo,
    blacklisted: &HashSet<String>,
    parent_id: &str,
    fieldname: &str,
    target: Option<(String, String)>,
) -> Result<(), MirrorError> {
    let child_id = register_node_field_result(
        conn,
        schema,
        schema_info,
        blacklisted,
        target.as_ref().map(|(t, i)| (t.as_str(), i.as_str())),
    )
    .await?;

    let mut args = SqliteArguments::default();
    bind_arg(&mut args, child_id.clone())?;
    bind_arg(&mut args, parent_id.to_string())?;
    bind_arg(&mut args, fieldname.to_string())?;

    exec_single_update(
        conn,
        "UPDATE links SET child_id = ? WHERE parent_id = ? AND fieldname = ?",
        args,
        &format!("{child_id:?}, {parent_id}, {fieldname}"),
    )
    .await
}

async fn update_connection(
    conn: &mut SqliteConnection,
    schema: &Schema,
    schema_info: &SchemaInfo,
    blacklisted: &HashSet<String>,
    update_id: i64,
    object_id: &str,
    fieldname: &str,
    value: Json,
) -> Result<(), MirrorError> {
    let connection_id: Option<i64> = sqlx::query_scalar(
        "SELECT rowid FROM connections WHERE object_id = ? AND fieldname = ?",
    )
    .bind(object_id)
    .bind(fieldname)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(connection_id) = connection_id else {
        return Err(MirrorError::Consistency(format!(
            "no such connection {object_id}.{fieldname}"
        )));
    };

    let Json::Object(fields) = &value else {
        return Err(MirrorError::Consistency(format!(
            "connection response for {object_id}.{fieldname} must be an object"
        )));
    };

    let total_count = fields.get("totalCount").and_then(Json::as_i64);
    let page_info = fields
        .get("pageInfo")
        .and_then(Json::as_object)
        .ok_or_else(|| {
            MirrorError::Consistency(format!(
                "connection response for {object_id}.{fieldname} missing pageInfo"
            ))
        })?;
    let has_next_page = page_info
        .get("hasNextPage")
        .and_then(Json::as_bool)
        .ok_or_else(|| {
            MirrorError::Consistency(format!(
                "connection response for {object_id}.{fieldname} missing pageInfo.hasNextPage"
            ))
        })?;
    let end_cursor = page_info.get("endCursor").and_then(Json::as_str).map(str::to_string);
    let nodes = fields
        .get("nodes")
        .and_then(Json::as_array)
        .ok_or_else(|| {
            MirrorError::Consistency(format!(
                "connection response for {object_id}.{fieldname} missing nodes"
            ))
        })?;

    let mut args = SqliteArguments::default();
    bind_arg(&mut args, update_id)?;
    bind_arg(&mut args, total_count)?;
    bind_arg(&mut args, has_next_page as i64)?;
    bind_arg(&mut args, end_cursor.clone())?;
    bind_arg(&mut args, connection_id)?;
    exec_single_update(
        conn,
        "UPDATE connections SET last_update = ?, total_count = ?, has_next_page = ?, end_cursor = ? WHERE rowid = ?",
        args,
        &format!("{update_id}, {total_count:?}, {has_next_page}, {end_cursor:?}, {connection_id}"),
    )
    .await?;

    let max_idx: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(idx) FROM connection_entries WHERE connection_id = ?",
    )
    .bind(connection_id)
    .fetch_one(&mut *conn)
    .await?;
    let mut next_idx = max_idx.map(|n| n + 1).unwrap_or(1);

    for node in nodes {
        let target = parse_node_ref(node)?;
        let child_id = register_node_field_result(
            conn,
            schema,
            schema_info,
            blacklisted,
            target.as_ref().map(|(t, i)| (t.as_str(), i.as_str())),
        )
        .await?;

        sqlx::query(
            "INSERT INTO connection_entries (connection_id, idx, child_id) VALUES (?, ?, ?)",
        )
        .bind(connection_id)
        .bind(next_idx)
        .bind(child_id)
        .execute(&mut *conn)
        .await?;
        next_idx += 1;
    }

    Ok(())
}

//! SQL-safety checks, the scoped-transaction helper, and the single-row-update
//! assertion that backs every `UPDATE`-shaped write in the ingester.

use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Connection, Sqlite, Transaction};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

pub use crate::schema::is_sql_safe;
use crate::error::MirrorError;

/// Runs an `UPDATE`/`INSERT`-style statement that is required to change
/// exactly one row. A row count other than one is a consistency violation
/// that aborts whatever transaction it runs in, carrying the SQL text and a
/// human-readable rendering of the bound arguments for diagnosis.
pub async fn exec_single_update(
    conn: &mut SqliteConnection,
    sql: &str,
    args: SqliteArguments<'_>,
    diagnostic_args: &str,
) -> Result<(), MirrorError> {
    let result = sqlx::query_with(sql, args).execute(conn).await?;
    if result.rows_affected() != 1 {
        return Err(MirrorError::Consistency(format!(
            "expected exactly one row to change, but {} changed\n  sql: {}\n  args: {}",
            result.rows_affected(),
            sql,
            diagnostic_args,
        )));
    }
    Ok(())
}

/// Guards against re-entrant use of [`run_in_transaction`]: exactly one
/// transaction may be open through a given [`TransactionGuard`] at a time.
/// This is deliberately stricter than the source this crate is modeled on,
/// which let the inner closure end its own transaction and start a fresh one
/// — the commit/rollback would then silently apply to that second
/// transaction. That was surprising rather than useful, so this rewrite
/// forbids it outright instead of inheriting it.
#[derive(Debug, Default)]
pub struct TransactionGuard {
    in_transaction: AtomicBool,
}

impl TransactionGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Opens a transaction on `pool`, runs `f` with it, and commits on success or
/// rolls back on failure. Fails immediately, without touching the database,
/// if a transaction opened through `guard` is already in flight.
pub async fn run_in_transaction<T, F, Fut>(
    pool: &sqlx::SqlitePool,
    guard: &TransactionGuard,
    f: F,
) -> Result<T, MirrorError>
where
    F: FnOnce(Transaction<'static, Sqlite>) -> Fut,
    Fut: Future<Output = Result<(Transaction<'static, Sqlite>, T), MirrorError>>,
{
    if guard.in_transaction.swap(true, Ordering::SeqCst) {
        return Err(MirrorError::Consistency(
            "already in a transaction".to_string(),
        ));
    }

    let outcome = async {
        let tx = pool.begin().await?;
        f(tx).await
    }
    .await;

    guard.in_transaction.store(false, Ordering::SeqCst);

    match outcome {
        Ok((tx, value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => Err(err),
    }
}

/// Finds an identifier of the form `<prefix><n>` not already present as a
/// name in `sqlite_master`, scanning for the maximum existing numeric suffix
/// and adding one. Used to name the extractor's temp table; robust to a
/// previous aborted attempt having left a same-named table behind.
pub async fn next_unused_name(
    conn: &mut SqliteConnection,
    prefix: &str,
) -> Result<String, MirrorError> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name LIKE ?",
    )
    .bind(format!("{prefix}%"))
    .fetch_all(&mut *conn)
    .await?;

    let max_suffix = rows
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max();

    let next = max_suffix.map(|n| n + 1).unwrap_or(0);
    Ok(format!("{prefix}{next}"))
}

/// Checks whether `conn` is a live connection (used defensively before
/// assuming pool exclusivity at construction time).
pub async fn ping(conn: &mut SqliteConnection) -> Result<(), MirrorError> {
    conn.ping().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn memory_pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn rejects_reentrant_transactions() {
        let pool = memory_pool().await;
        let guard = TransactionGuard::new();
        guard.in_transaction.store(true, Ordering::SeqCst);

        let result = run_in_transaction(&pool, &guard, |tx| async move { Ok((tx, ())) }).await;
        assert!(matches!(result, Err(MirrorError::Consistency(_))));
    }

    #[tokio::test]
    async fn next_unused_name_increments_past_existing_tables() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query("CREATE TABLE tmp_x_0 (id INTEGER)")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE tmp_x_1 (id INTEGER)")
            .execute(&mut *conn)
            .await
            .unwrap();
        let name = next_unused_name(&mut conn, "tmp_x_").await.unwrap();
        assert_eq!(name, "tmp_x_2");
    }
}

//! The relational store: schema initialization, object registration, the
//! outdated finder, and update ingestion all live here, sharing one
//! [`Store`] handle.

mod ingest;
mod init;
mod outdated;
mod registrar;

pub use outdated::{OutdatedConnection, QueryPlan};

use std::collections::HashSet;

use sqlx::SqlitePool;

use crate::error::MirrorError;
use crate::schema::{Schema, SchemaInfo};
use crate::sql::{self, TransactionGuard};

/// Configuration the store's identity is gated on and behavior it tweaks.
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Ids silently coerced to null wherever they appear as a reference target.
    pub blacklisted_ids: HashSet<String>,
}

/// Owns the single SQLite connection pool a `Mirror` uses, exclusively, for
/// its whole lifetime, plus the compiled schema and the re-entrancy guard
/// every transactional operation shares.
#[derive(Debug)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) schema: Schema,
    pub(crate) schema_info: SchemaInfo,
    pub(crate) options: MirrorOptions,
    pub(crate) guard: TransactionGuard,
}

impl Store {
    /// Compiles `schema`, opens (or verifies) the on-disk structural and
    /// per-type tables on `pool`, and returns a ready `Store`.
    pub async fn open(
        pool: SqlitePool,
        schema: Schema,
        options: MirrorOptions,
    ) -> Result<Self, MirrorError> {
        sql::ping(&mut *pool.acquire().await?).await?;
        let schema_info = SchemaInfo::compile(&schema)?;
        init::initialize(&pool, &schema, &schema_info, &options).await?;
        Ok(Self {
            pool,
            schema,
            schema_info,
            options,
            guard: TransactionGuard::new(),
        })
    }
}

//! The top-level driver: wires the store, the planner, an injected transport,
//! and the extractor into the public `Mirror` handle described by §6.

use sqlx::SqlitePool;

use crate::error::MirrorError;
use crate::extract::ExtractedValue;
use crate::planner::{plan_query, PlanLimits};
use crate::schema::Schema;
use crate::store::{MirrorOptions, Store};
use crate::transport::{PostQuery, PostedQuery};

/// The limits and timestamps one call to [`Mirror::update`] runs with.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// Objects/connections last updated before this threshold are outdated.
    pub since: i64,
    /// The timestamp stamped on every `updates` row this call creates.
    pub now: i64,
    pub nodes_limit: usize,
    pub nodes_of_type_limit: usize,
    pub connection_limit: usize,
    pub connection_page_size: usize,
}

impl From<UpdateOptions> for PlanLimits {
    fn from(options: UpdateOptions) -> Self {
        PlanLimits {
            nodes_limit: options.nodes_limit,
            nodes_of_type_limit: options.nodes_of_type_limit,
            connection_limit: options.connection_limit,
            connection_page_size: options.connection_page_size,
        }
    }
}

/// A durable, incremental, locally-persisted mirror of a remote GraphQL
/// object graph, backed by a single exclusively-owned SQLite connection pool.
#[derive(Debug)]
pub struct Mirror {
    store: Store,
}

impl Mirror {
    /// Compiles `schema`, opens (or verifies) the on-disk tables on `pool`,
    /// and returns a ready `Mirror`. `pool` should be configured with
    /// `max_connections(1)`: the store relies on exclusive ownership of its
    /// single connection for transaction-boundary correctness.
    pub async fn new(
        pool: SqlitePool,
        schema: Schema,
        options: MirrorOptions,
    ) -> Result<Self, MirrorError> {
        let store = Store::open(pool, schema, options).await?;
        Ok(Self { store })
    }

    /// Declares `(typename, id)` as a root or dependency of interest.
    pub async fn register_object(&self, typename: &str, id: &str) -> Result<(), MirrorError> {
        self.store.register(typename, id).await
    }

    /// Runs the update loop to convergence: `find_outdated → plan → post →
    /// ingest`, repeating until nothing in the store is older than
    /// `options.since`.
    pub async fn update(
        &self,
        transport: &dyn PostQuery,
        options: UpdateOptions,
    ) -> Result<(), MirrorError> {
        let limits: PlanLimits = options.into();
        let mut step = 0u64;

        loop {
            let plan = self.store.find_outdated(options.since).await?;
            if plan.is_empty() {
                tracing::info!(step, "mirror update converged");
                return Ok(());
            }

            tracing::info!(
                step,
                objects = plan.objects.len(),
                connections = plan.connections.len(),
                "fetching outdated entities"
            );

            let Some(body) = plan_query(&self.store.schema, &self.store.schema_info, &plan, limits)?
            else {
                return Ok(());
            };
            tracing::debug!(query = %body, "posting update query");

            let data = transport
                .post(PostedQuery {
                    body,
                    variables: serde_json::json!({}),
                })
                .await
                .map_err(|err| {
                    tracing::warn!(error = %err, "transport failure during update step");
                    MirrorError::from(err)
                })?;

            let update_id = self.store.ingest(options.now, data).await?;
            tracing::debug!(update_id, "ingested update step");

            step += 1;
        }
    }

    /// Builds the transitive-dependency closure of `root_id` and materializes
    /// it as an [`ExtractedValue`].
    pub async fn extract(&self, root_id: &str) -> Result<ExtractedValue, MirrorError> {
        self.store.extract(root_id).await
    }

    /// Renders the query that the next [`Mirror::update`] step would post,
    /// without posting it, for debugging and tests.
    pub async fn peek_next_query(&self, since: i64, limits: PlanLimits) -> Result<Option<String>, MirrorError> {
        let plan = self.store.find_outdated(since).await?;
        plan_query(&self.store.schema, &self.store.schema_info, &plan, limits)
    }
}

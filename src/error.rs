//! The public error surface. Every failure that crosses the library boundary
//! is a [`MirrorError`] variant, matching the §7 error-kind taxonomy.

use thiserror::Error;

/// Everything that can fail while compiling a schema, initializing a store,
/// registering an object, running an update step, or extracting a graph.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The on-disk `meta` blob does not match `{version, schema, options}`.
    #[error("incompatible schema, options, or version")]
    ConfigMismatch,

    /// Unknown type, non-OBJECT registration target, unsafe identifier, or an
    /// `Unfaithful` NODE fidelity.
    #[error("schema error: {0}")]
    SchemaValidity(String),

    /// Re-registration with a different typename, a missing connection/object
    /// row at ingest time, a typename mismatch within an own-data batch, a
    /// missing required field in a response, or a single-row-update assertion
    /// failure.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A nested-presence column held something other than `{NULL, 0, 1}`, or a
    /// column name had more than one `.`.
    #[error("store corruption: {0}")]
    Corruption(String),

    /// A transitive dependency of an extracted root lacks own-data or
    /// connection data.
    #[error("not fresh enough to extract: {0}")]
    Freshness(String),

    /// The injected transport failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The underlying SQL engine failed in a way none of the above names.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// An error returned by an injected [`crate::transport::PostQuery`] implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

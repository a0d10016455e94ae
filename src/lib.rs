//! A durable, incremental, locally-persisted mirror of a remote GraphQL
//! object graph: declare the objects you care about, run `update` on a
//! schedule to pull whatever has gone stale, and `extract` a consistent
//! snapshot of any root's transitive dependency closure at any time.

pub mod config;
pub mod cursor;
pub mod error;
pub mod extract;
pub mod mirror;
pub mod planner;
pub mod query;
pub mod schema;
mod sql;
pub mod store;
pub mod transport;

pub use cursor::EndCursor;
pub use error::{MirrorError, TransportError};
pub use extract::{ExtractedField, ExtractedObject, ExtractedValue, NestedValue, NodeRef};
pub use mirror::{Mirror, UpdateOptions};
pub use planner::PlanLimits;
pub use query::{print_query, Selection, Value};
pub use schema::{Fidelity, FieldType, ObjectInfo, Schema, SchemaInfo, Type};
pub use store::MirrorOptions;
pub use transport::{MockTransport, PostQuery, PostedQuery};

//! Document storage over a relational database, with map/reduce index
//! tables maintained at flush time and queried through typed predicates.

pub mod coalesce;
mod commands;
pub mod config;
pub mod describe;
pub mod dialect;
mod engine;
pub mod error;
pub mod id;
pub mod model;
pub mod predicate;
pub mod query;
pub mod schema;
pub mod serializer;
pub mod session;
pub mod storage;
pub mod store;
pub mod value;

#[cfg(test)]
mod testing;

pub use coalesce::{QueryCoalescer, QueryKey};
pub use config::StoreConfig;
pub use describe::{DescribeContext, IndexDescriptor, IndexProvider};
pub use dialect::{SqlDialect, StandardDialect};
pub use error::{DocketError, Result};
pub use id::{DefaultIdGenerator, IdGenerator};
pub use model::{Column, ColumnKind, Document, Entity, Index, IndexKind, TableNames};
pub use predicate::{field, host, val, Args, CompiledQuery, Expr};
pub use query::{DocumentQuery, IndexQuery};
pub use schema::SchemaBuilder;
pub use serializer::{ContentSerializer, JsonSerializer};
pub use session::Session;
pub use storage::{Connection, ConnectionFactory};
pub use store::{Store, StoreBuilder};
pub use value::{Parameters, Row, Value};

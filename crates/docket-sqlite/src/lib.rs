//! SQLite backend for docket: a rusqlite connection collaborator and the
//! SQLite dialect.

pub mod connection;
pub mod dialect;
pub mod options;

pub use connection::{SqliteConnection, SqliteConnectionFactory};
pub use dialect::SqliteDialect;
pub use options::SqliteOptions;

use docket_core::{Store, StoreBuilder};
use std::path::PathBuf;

/// Store builder wired to the SQLite file at `path`.
pub fn store(path: impl Into<PathBuf>) -> StoreBuilder {
    Store::builder(SqliteDialect, SqliteConnectionFactory::new(path))
}

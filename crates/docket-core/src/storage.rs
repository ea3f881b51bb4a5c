use crate::error::Result;
use crate::value::{Parameters, Row, Value};
use async_trait::async_trait;

/// An already-open transactional connection.
///
/// Methods take `&self` so several queries of one session can be in flight at
/// once; implementations serialize access internally. Pooling and retries are
/// not this trait's concern.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&self, sql: &str, params: &Parameters) -> Result<u64>;

    /// Execute a statement and return the first column of the first row.
    async fn execute_scalar(&self, sql: &str, params: &Parameters) -> Result<Option<Value>>;

    async fn query(&self, sql: &str, params: &Parameters) -> Result<Vec<Row>>;
}

/// Opens one connection per unit of work.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

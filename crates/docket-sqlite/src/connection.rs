use crate::options::SqliteOptions;
use async_trait::async_trait;
use docket_core::{Connection, ConnectionFactory, DocketError, Parameters, Result, Row, Value};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Prepare `sql` and bind every parameter it names. Parameters the
/// statement does not reference are skipped.
fn prepare<'c>(
    conn: &'c rusqlite::Connection,
    sql: &str,
    params: &Parameters,
) -> rusqlite::Result<rusqlite::Statement<'c>> {
    let mut stmt = conn.prepare(sql)?;
    for (name, value) in params.iter() {
        if let Some(index) = stmt.parameter_index(name)? {
            stmt.raw_bind_parameter(index, to_sql(value))?;
        }
    }
    Ok(stmt)
}

fn read_rows(conn: &rusqlite::Connection, sql: &str, params: &Parameters) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = prepare(conn, sql, params)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            columns.push((name.clone(), from_sql(row.get_ref(i)?)));
        }
        out.push(Row::new(columns));
    }
    Ok(out)
}

/// One SQLite connection, used by one session at a time. Calls run on the
/// blocking pool.
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteConnection {
    pub fn open(path: impl AsRef<Path>, options: &SqliteOptions) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(DocketError::storage)?;
        conn.busy_timeout(options.busy_timeout)
            .map_err(DocketError::storage)?;
        conn.pragma_update(None, "journal_mode", options.journal_mode.as_str())
            .map_err(DocketError::storage)?;
        conn.pragma_update(None, "foreign_keys", options.foreign_keys)
            .map_err(DocketError::storage)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| DocketError::Internal(format!("sqlite task failed: {e}")))?
        .map_err(DocketError::storage)
    }

    async fn batch(&self, sql: &'static str) -> Result<()> {
        debug!(sql, "transaction");
        self.run(move |conn| conn.execute_batch(sql)).await
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn begin(&self) -> Result<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.batch("ROLLBACK").await
    }

    async fn execute(&self, sql: &str, params: &Parameters) -> Result<u64> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.run(move |conn| {
            let mut stmt = prepare(conn, &sql, &params)?;
            stmt.raw_execute().map(|n| n as u64)
        })
        .await
    }

    async fn execute_scalar(&self, sql: &str, params: &Parameters) -> Result<Option<Value>> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.run(move |conn| {
            let rows = read_rows(conn, &sql, &params)?;
            Ok(rows
                .first()
                .and_then(|row| row.columns().next().map(|(_, v)| v.clone())))
        })
        .await
    }

    async fn query(&self, sql: &str, params: &Parameters) -> Result<Vec<Row>> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.run(move |conn| read_rows(conn, &sql, &params)).await
    }
}

/// Opens a fresh connection to one database file per session.
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    options: SqliteOptions,
}

impl SqliteConnectionFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, SqliteOptions::from_env())
    }

    pub fn with_options(path: impl Into<PathBuf>, options: SqliteOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (path, options) = (self.path.clone(), self.options.clone());
        let conn = tokio::task::spawn_blocking(move || SqliteConnection::open(&path, &options))
            .await
            .map_err(|e| DocketError::Internal(format!("sqlite task failed: {e}")))??;
        info!(path = %self.path.display(), "sqlite connection opened");
        Ok(Box::new(conn))
    }
}

//! Mutation commands produced by a flush.

use crate::dialect::SqlDialect;
use crate::error::{DocketError, Result};
use crate::model::{
    TableNames, CONTENT_COLUMN, DOCUMENT_ID_COLUMN, ID_COLUMN, TYPE_COLUMN, VERSION_COLUMN,
};
use crate::storage::Connection;
use crate::value::{Parameters, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    CreateDocument {
        names: TableNames,
        id: i64,
        document_type: String,
        content: String,
    },
    UpdateDocument {
        names: TableNames,
        id: i64,
        document_type: String,
        content: String,
        version: i64,
        /// `None` skips the optimistic check.
        expected_version: Option<i64>,
    },
    DeleteDocument {
        names: TableNames,
        id: i64,
    },
    CreateMapIndex {
        names: TableNames,
        index: &'static str,
        document_id: i64,
        values: Vec<(&'static str, Value)>,
    },
    DeleteMapIndex {
        names: TableNames,
        index: &'static str,
        document_id: i64,
    },
    CreateReduceIndex {
        names: TableNames,
        index: &'static str,
        values: Vec<(&'static str, Value)>,
        link: BTreeSet<i64>,
    },
    UpdateReduceIndex {
        names: TableNames,
        index: &'static str,
        id: i64,
        values: Vec<(&'static str, Value)>,
        link: BTreeSet<i64>,
        unlink: BTreeSet<i64>,
    },
    DeleteReduceIndex {
        names: TableNames,
        index: &'static str,
        id: i64,
    },
}

impl Command {
    /// Execution order within a flush. Documents exist before anything
    /// references them, bridge rows go before the aggregate they point at,
    /// and documents are deleted only once nothing references them.
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Command::CreateDocument { .. } | Command::UpdateDocument { .. } => 0,
            Command::DeleteMapIndex { .. } => 1,
            Command::CreateMapIndex { .. } => 2,
            Command::CreateReduceIndex { .. } => 3,
            Command::UpdateReduceIndex { .. } => 4,
            Command::DeleteReduceIndex { .. } => 5,
            Command::DeleteDocument { .. } => 6,
        }
    }

    pub(crate) async fn execute(&self, conn: &dyn Connection, dialect: &dyn SqlDialect) -> Result<()> {
        let q = |ident: &str| dialect.quote(ident);
        match self {
            Command::CreateDocument {
                names,
                id,
                document_type,
                content,
            } => {
                let mut s = Statement::new(dialect);
                let sql = format!(
                    "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, {}, {})",
                    q(&names.document()),
                    q(ID_COLUMN),
                    q(TYPE_COLUMN),
                    q(CONTENT_COLUMN),
                    q(VERSION_COLUMN),
                    s.bind(*id),
                    s.bind(document_type.as_str()),
                    s.bind(content.as_str()),
                    s.bind(1),
                );
                s.execute(conn, &sql).await?;
            }
            Command::UpdateDocument {
                names,
                id,
                document_type,
                content,
                version,
                expected_version,
            } => {
                let mut s = Statement::new(dialect);
                let mut sql = format!(
                    "UPDATE {} SET {} = {}, {} = {} WHERE {} = {}",
                    q(&names.document()),
                    q(CONTENT_COLUMN),
                    s.bind(content.as_str()),
                    q(VERSION_COLUMN),
                    s.bind(*version),
                    q(ID_COLUMN),
                    s.bind(*id),
                );
                if let Some(expected) = expected_version {
                    sql.push_str(&format!(" AND {} = {}", q(VERSION_COLUMN), s.bind(*expected)));
                }
                let affected = s.execute(conn, &sql).await?;
                if affected == 0 && expected_version.is_some() {
                    warn!(id, document_type = %document_type, "concurrency conflict");
                    return Err(DocketError::ConcurrencyConflict {
                        id: *id,
                        document_type: document_type.clone(),
                    });
                }
            }
            Command::DeleteDocument { names, id } => {
                let mut s = Statement::new(dialect);
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(&names.document()),
                    q(ID_COLUMN),
                    s.bind(*id)
                );
                s.execute(conn, &sql).await?;
            }
            Command::CreateMapIndex {
                names,
                index,
                document_id,
                values,
            } => {
                let mut s = Statement::new(dialect);
                let mut columns = vec![q(DOCUMENT_ID_COLUMN)];
                let mut bound = vec![s.bind(*document_id)];
                for (name, value) in values {
                    columns.push(q(name));
                    bound.push(s.bind(value.clone()));
                }
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(&names.index(index)),
                    columns.join(", "),
                    bound.join(", ")
                );
                s.execute(conn, &sql).await?;
            }
            Command::DeleteMapIndex {
                names,
                index,
                document_id,
            } => {
                let mut s = Statement::new(dialect);
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(&names.index(index)),
                    q(DOCUMENT_ID_COLUMN),
                    s.bind(*document_id)
                );
                s.execute(conn, &sql).await?;
            }
            Command::CreateReduceIndex {
                names,
                index,
                values,
                link,
            } => {
                let mut s = Statement::new(dialect);
                let (columns, bound): (Vec<String>, Vec<String>) = values
                    .iter()
                    .map(|(name, value)| (q(name), s.bind(value.clone())))
                    .unzip();
                let insert = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(&names.index(index)),
                    columns.join(", "),
                    bound.join(", ")
                );
                let sql = dialect.insert_returning_id(&insert);
                debug!(%sql, "command");
                let id = conn
                    .execute_scalar(&sql, &s.params)
                    .await?
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        DocketError::Internal(format!("insert into '{index}' returned no id"))
                    })?;
                link_documents(conn, dialect, names, index, id, link).await?;
            }
            Command::UpdateReduceIndex {
                names,
                index,
                id,
                values,
                link,
                unlink,
            } => {
                let mut s = Statement::new(dialect);
                let assignments: Vec<String> = values
                    .iter()
                    .map(|(name, value)| format!("{} = {}", q(name), s.bind(value.clone())))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    q(&names.index(index)),
                    assignments.join(", "),
                    q(ID_COLUMN),
                    s.bind(*id)
                );
                s.execute(conn, &sql).await?;
                let bridge_column = TableNames::bridge_column(index);
                for document_id in unlink {
                    let mut s = Statement::new(dialect);
                    let sql = format!(
                        "DELETE FROM {} WHERE {} = {} AND {} = {}",
                        q(&names.bridge(index)),
                        q(&bridge_column),
                        s.bind(*id),
                        q(DOCUMENT_ID_COLUMN),
                        s.bind(*document_id)
                    );
                    s.execute(conn, &sql).await?;
                }
                link_documents(conn, dialect, names, index, *id, link).await?;
            }
            Command::DeleteReduceIndex { names, index, id } => {
                let mut s = Statement::new(dialect);
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(&names.bridge(index)),
                    q(&TableNames::bridge_column(index)),
                    s.bind(*id)
                );
                s.execute(conn, &sql).await?;
                let mut s = Statement::new(dialect);
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(&names.index(index)),
                    q(ID_COLUMN),
                    s.bind(*id)
                );
                s.execute(conn, &sql).await?;
            }
        }
        Ok(())
    }
}

async fn link_documents(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    names: &TableNames,
    index: &str,
    id: i64,
    documents: &BTreeSet<i64>,
) -> Result<()> {
    for document_id in documents {
        let mut s = Statement::new(dialect);
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            dialect.quote(&names.bridge(index)),
            dialect.quote(&TableNames::bridge_column(index)),
            dialect.quote(DOCUMENT_ID_COLUMN),
            s.bind(id),
            s.bind(*document_id)
        );
        s.execute(conn, &sql).await?;
    }
    Ok(())
}

struct Statement<'d> {
    dialect: &'d dyn SqlDialect,
    params: Parameters,
}

impl<'d> Statement<'d> {
    fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            params: Parameters::new(),
        }
    }

    fn bind(&mut self, value: impl Into<Value>) -> String {
        let name = self.dialect.parameter(self.params.len());
        self.params.push(name.clone(), value.into());
        name
    }

    async fn execute(&self, conn: &dyn Connection, sql: &str) -> Result<u64> {
        debug!(%sql, "command");
        conn.execute(sql, &self.params).await
    }
}

//! Query builders over index tables and the documents behind them.

use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::model::{
    decode_index, Entity, Index, IndexKind, TableNames, CONTENT_COLUMN, DOCUMENT_ID_COLUMN,
    ID_COLUMN, TYPE_COLUMN, VERSION_COLUMN,
};
use crate::predicate::{Expr, OrderBy, PredicateCompiler};
use crate::session::Session;
use crate::value::{Parameters, Row, Value};
use std::marker::PhantomData;

const DOCUMENT_ALIAS: &str = "d";
const COUNT_COLUMN: &str = "Count";

/// `SELECT alias.* FROM index AS alias WHERE ...`, aliased by the index name.
pub(crate) fn index_select(
    dialect: &dyn SqlDialect,
    names: &TableNames,
    index: &str,
    filter: &str,
    order: &str,
    paging: &str,
) -> String {
    let alias = dialect.quote(index);
    format!(
        "SELECT {alias}.* FROM {} AS {alias} WHERE {filter}{order}{paging}",
        dialect.quote(&names.index(index))
    )
}

fn count_of(rows: &[Row]) -> Result<u64> {
    match rows.first() {
        Some(row) => Ok(row.get_i64(COUNT_COLUMN)?.max(0) as u64),
        None => Ok(0),
    }
}

fn and(current: Option<Expr>, expr: Expr) -> Expr {
    match current {
        Some(existing) => existing.and(expr),
        None => expr,
    }
}

/// Rows of one index type.
pub struct IndexQuery<'s, I> {
    session: &'s Session,
    collection: String,
    filter: Option<Expr>,
    order: Vec<OrderBy>,
    skip: Option<u64>,
    take: Option<u64>,
    _index: PhantomData<fn() -> I>,
}

impl<'s, I: Index> IndexQuery<'s, I> {
    pub(crate) fn new(session: &'s Session, collection: &str) -> Self {
        Self {
            session,
            collection: collection.to_string(),
            filter: None,
            order: Vec::new(),
            skip: None,
            take: None,
            _index: PhantomData,
        }
    }

    /// Add a predicate; several calls are combined with `AND`.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(and(self.filter.take(), expr));
        self
    }

    pub fn order_by(mut self, expr: Expr) -> Self {
        self.order.push(OrderBy {
            expr,
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, expr: Expr) -> Self {
        self.order.push(OrderBy {
            expr,
            descending: true,
        });
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    fn build(&self, count: bool) -> Result<(String, Parameters)> {
        let store = self.session.store();
        let dialect = store.dialect();
        let names = store.names(&self.collection);
        let mut compiler = PredicateCompiler::new(dialect, &names);
        compiler.bind_index(I::NAME, I::NAME);
        let filter = match &self.filter {
            Some(expr) => compiler.predicate(expr)?,
            None => dialect.true_predicate().to_string(),
        };
        let sql = if count {
            let alias = dialect.quote(I::NAME);
            format!(
                "SELECT COUNT(*) AS {} FROM {} AS {alias} WHERE {filter}",
                dialect.quote(COUNT_COLUMN),
                dialect.quote(&names.index(I::NAME))
            )
        } else {
            let order = compiler.order_by(&self.order)?;
            let paging = dialect.paging(self.skip, self.take);
            index_select(dialect, &names, I::NAME, &filter, &order, &paging)
        };
        let (params, _) = compiler.into_parts();
        Ok((sql, params))
    }

    pub fn to_sql(&self) -> Result<(String, Parameters)> {
        self.build(false)
    }

    pub async fn list(self) -> Result<Vec<I>> {
        let (sql, params) = self.build(false)?;
        let rows = self.session.fetch(&sql, &params).await?;
        rows.iter().map(decode_index::<I>).collect()
    }

    pub async fn first(self) -> Result<Option<I>> {
        Ok(self.take(1).list().await?.into_iter().next())
    }

    /// Number of matching rows; paging is ignored.
    pub async fn count(self) -> Result<u64> {
        let (sql, params) = self.build(true)?;
        count_of(&self.session.fetch(&sql, &params).await?)
    }
}

/// Documents of entity type `T`, filtered through the index tables they
/// feed. Map indexes join on `DocumentId`; reduce indexes join through their
/// bridge table, so a document matches when the aggregate it contributes to
/// does.
pub struct DocumentQuery<'s, T> {
    session: &'s Session,
    collection: String,
    joins: Vec<(&'static str, Expr)>,
    order: Vec<OrderBy>,
    skip: Option<u64>,
    take: Option<u64>,
    _entity: PhantomData<fn() -> T>,
}

impl<'s, T: Entity> DocumentQuery<'s, T> {
    pub(crate) fn new(session: &'s Session, collection: &str) -> Self {
        Self {
            session,
            collection: collection.to_string(),
            joins: Vec::new(),
            order: Vec::new(),
            skip: None,
            take: None,
            _entity: PhantomData,
        }
    }

    /// Join index `I` and filter on it.
    pub fn with<I: Index>(mut self, expr: Expr) -> Self {
        match self.joins.iter_mut().find(|(name, _)| *name == I::NAME) {
            Some((_, existing)) => {
                let current = std::mem::replace(existing, Expr::Constant(Value::Null));
                *existing = current.and(expr);
            }
            None => self.joins.push((I::NAME, expr)),
        }
        self
    }

    /// Order by an expression over one of the joined indexes.
    pub fn order_by(mut self, expr: Expr) -> Self {
        self.order.push(OrderBy {
            expr,
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, expr: Expr) -> Self {
        self.order.push(OrderBy {
            expr,
            descending: true,
        });
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    fn build(&self, count: bool) -> Result<(String, Parameters)> {
        let store = self.session.store();
        let dialect = store.dialect();
        let names = store.names(&self.collection);
        let q = |ident: &str| dialect.quote(ident);
        let d = q(DOCUMENT_ALIAS);

        let mut compiler = PredicateCompiler::new(dialect, &names);
        let mut from = format!("{} AS {d}", q(&names.document()));
        for (index, _) in &self.joins {
            let index = *index;
            let alias = q(index);
            match store.index_kind(T::TYPE, &self.collection, index)? {
                IndexKind::Map => from.push_str(&format!(
                    " INNER JOIN {} AS {alias} ON {alias}.{} = {d}.{}",
                    q(&names.index(index)),
                    q(DOCUMENT_ID_COLUMN),
                    q(ID_COLUMN)
                )),
                IndexKind::Reduce => {
                    let bridge = q(&format!("{index}_Document"));
                    from.push_str(&format!(
                        " INNER JOIN {} AS {bridge} ON {bridge}.{} = {d}.{} INNER JOIN {} AS {alias} ON {alias}.{} = {bridge}.{}",
                        q(&names.bridge(index)),
                        q(DOCUMENT_ID_COLUMN),
                        q(ID_COLUMN),
                        q(&names.index(index)),
                        q(ID_COLUMN),
                        q(&TableNames::bridge_column(index))
                    ));
                }
            }
            compiler.bind_index(index, index);
        }

        let mut conditions = vec![format!(
            "{d}.{} = {}",
            q(TYPE_COLUMN),
            compiler.bind(Value::from(T::TYPE))
        )];
        for (_, expr) in &self.joins {
            conditions.push(compiler.predicate(expr)?);
        }
        let filter = conditions.join(" AND ");

        let sql = if count {
            format!(
                "SELECT COUNT(DISTINCT {d}.{}) AS {} FROM {from} WHERE {filter}",
                q(ID_COLUMN),
                q(COUNT_COLUMN)
            )
        } else {
            let columns = [ID_COLUMN, TYPE_COLUMN, CONTENT_COLUMN, VERSION_COLUMN]
                .map(|c| format!("{d}.{}", q(c)))
                .join(", ");
            let paging = dialect.paging(self.skip, self.take);
            if self.order.is_empty() {
                format!("SELECT DISTINCT {columns} FROM {from} WHERE {filter}{paging}")
            } else {
                // one row per document; order terms aggregate over its index rows
                let order = compiler.grouped_order_by(&self.order)?;
                format!(
                    "SELECT {columns} FROM {from} WHERE {filter} GROUP BY {columns}{order}{paging}"
                )
            }
        };
        let (params, _) = compiler.into_parts();
        Ok((sql, params))
    }

    pub fn to_sql(&self) -> Result<(String, Parameters)> {
        self.build(false)
    }

    pub async fn list(self) -> Result<Vec<T>> {
        let (sql, params) = self.build(false)?;
        let rows = self.session.fetch(&sql, &params).await?;
        rows.iter()
            .map(|row| self.session.materialize::<T>(&self.collection, row))
            .collect()
    }

    pub async fn first(self) -> Result<Option<T>> {
        Ok(self.take(1).list().await?.into_iter().next())
    }

    pub async fn count(self) -> Result<u64> {
        let (sql, params) = self.build(true)?;
        count_of(&self.session.fetch(&sql, &params).await?)
    }
}

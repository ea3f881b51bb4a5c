use super::compile::{PredicateCompiler, Rebinder};
use super::eval::evaluate;
use super::{Capture, Expr, OrderBy};
use crate::dialect::SqlDialect;
use crate::error::{DocketError, Result};
use crate::model::{Index, TableNames};
use crate::query::index_select;
use crate::value::{Parameters, Value};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_SHAPE: AtomicU32 = AtomicU32::new(1);

/// Nullable captures are tracked as a bitset in the low half of the
/// discriminator.
const MAX_NULLABLE_CAPTURES: usize = 32;

/// Builds captures over the argument type of a compiled query.
pub struct Args<A> {
    _marker: PhantomData<fn(&A)>,
}

impl<A: Send + Sync + 'static> Args<A> {
    /// A capture that must never be null.
    pub fn get<F>(&self, name: &'static str, f: F) -> Expr
    where
        F: Fn(&A) -> Value + Send + Sync + 'static,
    {
        capture(name, false, f)
    }

    /// A capture whose nullness selects a different SQL shape.
    pub fn nullable<F>(&self, name: &'static str, f: F) -> Expr
    where
        F: Fn(&A) -> Value + Send + Sync + 'static,
    {
        capture(name, true, f)
    }
}

fn capture<A, F>(name: &'static str, nullable: bool, f: F) -> Expr
where
    A: 'static,
    F: Fn(&A) -> Value + Send + Sync + 'static,
{
    let getter = move |any: &dyn Any| any.downcast_ref::<A>().map(|a| f(a));
    Expr::Capture(Capture::new(name, nullable, Arc::new(getter)))
}

/// An index query built once and run many times with different arguments.
///
/// The generated SQL is cached by the store per discriminator: the query's
/// shape id in the high 32 bits and one bit per nullable capture that is
/// currently null in the low 32 bits.
pub struct CompiledQuery<A, I> {
    shape: u32,
    predicate: Expr,
    captures: Vec<Capture>,
    order: Vec<OrderBy>,
    skip: Option<u64>,
    take: Option<u64>,
    _marker: PhantomData<fn(&A) -> I>,
}

impl<A: Send + Sync + 'static, I: Index> CompiledQuery<A, I> {
    pub fn new(build: impl FnOnce(&Args<A>) -> Expr) -> Result<Self> {
        let predicate = build(&Args {
            _marker: PhantomData,
        });
        let mut captures = Vec::new();
        predicate.visit_captures(&mut |c| captures.push(c.clone()));
        let nullable = captures.iter().filter(|c| c.nullable).count();
        if nullable > MAX_NULLABLE_CAPTURES {
            return Err(DocketError::unsupported(format!(
                "compiled query has {nullable} nullable captures, at most {MAX_NULLABLE_CAPTURES} are supported"
            )));
        }
        Ok(Self {
            shape: NEXT_SHAPE.fetch_add(1, Ordering::Relaxed),
            predicate,
            captures,
            order: Vec::new(),
            skip: None,
            take: None,
            _marker: PhantomData,
        })
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

    pub fn shape(&self) -> u32 {
        self.shape
    }

    /// Cache key for the SQL generated for `args`.
    pub fn discriminator(&self, args: &A) -> Result<u64> {
        let mut bits = 0u64;
        let mut bit = 0u32;
        for c in &self.captures {
            let value = c.read(args).ok_or_else(|| {
                DocketError::Validation(format!("capture '{}' cannot read its arguments", c.name))
            })?;
            if c.nullable {
                if value.is_null() {
                    bits |= 1u64 << bit;
                }
                bit += 1;
            } else if value.is_null() {
                return Err(DocketError::Validation(format!(
                    "capture '{}' is not nullable but produced null",
                    c.name
                )));
            }
        }
        Ok(((self.shape as u64) << 32) | bits)
    }

    pub(crate) fn compile(
        &self,
        dialect: &dyn SqlDialect,
        names: &TableNames,
        args: &A,
    ) -> Result<CompiledSql> {
        let mut compiler = PredicateCompiler::new(dialect, names).with_args(args as &dyn Any);
        compiler.bind_index(I::NAME, I::NAME);
        let filter = compiler.predicate(&self.predicate)?;
        let order = compiler.order_by(&self.order)?;
        let paging = dialect.paging(self.skip, self.take);
        let (parameters, rebinders) = compiler.into_parts();
        Ok(CompiledSql {
            sql: index_select(dialect, names, I::NAME, &filter, &order, &paging),
            parameters,
            rebinders,
        })
    }
}

/// Cached SQL of a compiled query plus what it takes to re-bind it.
#[derive(Debug, Clone)]
pub struct CompiledSql {
    sql: String,
    parameters: Parameters,
    rebinders: Vec<Rebinder>,
}

impl CompiledSql {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameters for a new argument set; only capture-dependent values are
    /// re-evaluated.
    pub fn bind(&self, args: &dyn Any) -> Result<Parameters> {
        let mut params = self.parameters.clone();
        for r in &self.rebinders {
            let value = r.affix.apply(evaluate(&r.expr, Some(args))?);
            if let Some(slot) = params.get_mut(&r.name) {
                *slot = value;
            }
        }
        Ok(params)
    }
}

//! Predicate expressions over index rows and their translation to SQL.
//!
//! An [`Expr`] is a closed tree: constants, captured argument values, member
//! accesses on a bound index row, operators and a fixed set of methods. Any
//! subtree that never touches a row member is evaluated on the host and bound
//! as a parameter; everything else is rendered structurally by
//! [`PredicateCompiler`].

mod compile;
mod compiled;
mod eval;

pub use compile::{CompiledPredicate, PredicateCompiler};
pub use compiled::{Args, CompiledQuery, CompiledSql};
pub(crate) use eval::evaluate;

use crate::error::Result;
use crate::model::{Column, ColumnKind, Index, DOCUMENT_ID_COLUMN, ID_COLUMN};
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub(crate) fn sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// A column of a bound index row.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub index: &'static str,
    pub column: String,
    columns: &'static [Column],
}

impl Member {
    pub(crate) fn new(index: &'static str, columns: &'static [Column], column: &str) -> Self {
        Self {
            index,
            column: column.to_string(),
            columns,
        }
    }

    /// Declared or implicit (`Id`, `DocumentId`) column.
    pub fn is_known(&self) -> bool {
        self.column == ID_COLUMN
            || self.column == DOCUMENT_ID_COLUMN
            || self.columns.iter().any(|c| c.name == self.column)
    }
}

type Getter = Arc<dyn Fn(&dyn Any) -> Option<Value> + Send + Sync>;

/// A value read from the arguments of a compiled query each time it runs.
#[derive(Clone)]
pub struct Capture {
    pub name: &'static str,
    pub nullable: bool,
    getter: Getter,
}

impl Capture {
    pub(crate) fn new(name: &'static str, nullable: bool, getter: Getter) -> Self {
        Self {
            name,
            nullable,
            getter,
        }
    }

    pub(crate) fn read(&self, args: &dyn Any) -> Option<Value> {
        (self.getter)(args)
    }
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("name", &self.name)
            .field("nullable", &self.nullable)
            .finish()
    }
}

/// A host function. It can only run on values known before the query is
/// sent; applying it to a row member has no SQL rendering.
#[derive(Clone)]
pub struct HostFn {
    pub name: &'static str,
    f: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl HostFn {
    pub(crate) fn call(&self, args: &[Value]) -> Result<Value> {
        (self.f)(args)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({})", self.name)
    }
}

/// `selector IN (SELECT selector FROM index WHERE predicate)`.
#[derive(Debug, Clone)]
pub struct Subquery {
    pub index: &'static str,
    pub selector: Member,
    pub predicate: Expr,
}

#[derive(Debug, Clone)]
pub enum Method {
    StartsWith,
    EndsWith,
    Contains,
    Concat,
    ToUpper,
    ToLower,
    IsIn,
    IsNotIn,
    IsInQuery(Box<Subquery>),
    IsNotInQuery(Box<Subquery>),
    Host(HostFn),
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::StartsWith => "starts_with",
            Method::EndsWith => "ends_with",
            Method::Contains => "contains",
            Method::Concat => "concat",
            Method::ToUpper => "to_upper",
            Method::ToLower => "to_lower",
            Method::IsIn => "is_in",
            Method::IsNotIn => "is_not_in",
            Method::IsInQuery(_) => "is_in_query",
            Method::IsNotInQuery(_) => "is_not_in_query",
            Method::Host(h) => h.name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Value),
    Capture(Capture),
    Member(Member),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `args[0]` is the receiver for string methods and `IsIn` forms.
    Call(Method, Vec<Expr>),
    Convert(Box<Expr>, ColumnKind),
}

/// Member access on index `I`.
pub fn field<I: Index>(column: &str) -> Expr {
    Expr::Member(Member::new(I::NAME, I::COLUMNS, column))
}

pub fn val(value: impl Into<Value>) -> Expr {
    Expr::Constant(value.into())
}

/// Apply a host function to the given arguments.
pub fn host<F>(name: &'static str, args: Vec<Expr>, f: F) -> Expr
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    Expr::Call(
        Method::Host(HostFn {
            name,
            f: Arc::new(f),
        }),
        args,
    )
}

impl Expr {
    /// Whether this subtree reaches a row member and therefore must be
    /// rendered as SQL instead of evaluated up front.
    pub fn is_row_dependent(&self) -> bool {
        match self {
            Expr::Constant(_) | Expr::Capture(_) => false,
            Expr::Member(_) => true,
            Expr::Unary(_, e) | Expr::Convert(e, _) => e.is_row_dependent(),
            Expr::Binary(_, l, r) => l.is_row_dependent() || r.is_row_dependent(),
            Expr::Call(Method::IsInQuery(_) | Method::IsNotInQuery(_), _) => true,
            Expr::Call(_, args) => args.iter().any(Expr::is_row_dependent),
        }
    }

    /// Whether this subtree reads compiled-query arguments.
    pub fn has_captures(&self) -> bool {
        let mut found = false;
        self.visit_captures(&mut |_| found = true);
        found
    }

    pub(crate) fn visit_captures(&self, f: &mut dyn FnMut(&Capture)) {
        match self {
            Expr::Constant(_) | Expr::Member(_) => {}
            Expr::Capture(c) => f(c),
            Expr::Unary(_, e) | Expr::Convert(e, _) => e.visit_captures(f),
            Expr::Binary(_, l, r) => {
                l.visit_captures(f);
                r.visit_captures(f);
            }
            Expr::Call(method, args) => {
                if let Method::IsInQuery(sub) | Method::IsNotInQuery(sub) = method {
                    sub.predicate.visit_captures(f);
                }
                for a in args {
                    a.visit_captures(f);
                }
            }
        }
    }

    fn binary(self, op: BinaryOp, rhs: impl Into<Expr>) -> Expr {
        Expr::Binary(op, Box::new(self), Box::new(rhs.into()))
    }

    fn call(self, method: Method, rest: Vec<Expr>) -> Expr {
        let mut args = Vec::with_capacity(rest.len() + 1);
        args.push(self);
        args.extend(rest);
        Expr::Call(method, args)
    }

    pub fn eq(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gt, rhs)
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ge, rhs)
    }

    pub fn and(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::And, rhs)
    }

    pub fn or(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Or, rhs)
    }

    pub fn starts_with(self, prefix: impl Into<Expr>) -> Expr {
        self.call(Method::StartsWith, vec![prefix.into()])
    }

    pub fn ends_with(self, suffix: impl Into<Expr>) -> Expr {
        self.call(Method::EndsWith, vec![suffix.into()])
    }

    pub fn contains(self, needle: impl Into<Expr>) -> Expr {
        self.call(Method::Contains, vec![needle.into()])
    }

    pub fn concat(self, rhs: impl Into<Expr>) -> Expr {
        match self {
            Expr::Call(Method::Concat, mut args) => {
                args.push(rhs.into());
                Expr::Call(Method::Concat, args)
            }
            lhs => lhs.call(Method::Concat, vec![rhs.into()]),
        }
    }

    pub fn to_upper(self) -> Expr {
        self.call(Method::ToUpper, Vec::new())
    }

    pub fn to_lower(self) -> Expr {
        self.call(Method::ToLower, Vec::new())
    }

    pub fn is_in<V: Into<Expr>>(self, values: impl IntoIterator<Item = V>) -> Expr {
        self.call(Method::IsIn, values.into_iter().map(Into::into).collect())
    }

    pub fn is_not_in<V: Into<Expr>>(self, values: impl IntoIterator<Item = V>) -> Expr {
        self.call(Method::IsNotIn, values.into_iter().map(Into::into).collect())
    }

    /// Correlated form: `self IN (SELECT selector FROM J WHERE predicate)`.
    pub fn is_in_query<J: Index>(self, selector: &str, predicate: Expr) -> Expr {
        self.call(
            Method::IsInQuery(Box::new(Subquery {
                index: J::NAME,
                selector: Member::new(J::NAME, J::COLUMNS, selector),
                predicate,
            })),
            Vec::new(),
        )
    }

    pub fn is_not_in_query<J: Index>(self, selector: &str, predicate: Expr) -> Expr {
        self.call(
            Method::IsNotInQuery(Box::new(Subquery {
                index: J::NAME,
                selector: Member::new(J::NAME, J::COLUMNS, selector),
                predicate,
            })),
            Vec::new(),
        )
    }

    pub fn convert(self, kind: ColumnKind) -> Expr {
        Expr::Convert(Box::new(self), kind)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary(UnaryOp::Not, Box::new(self))
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Negate, Box::new(self))
    }
}

macro_rules! arithmetic {
    ($($trait:ident $fn:ident $op:ident),*) => {
        $(impl<R: Into<Expr>> std::ops::$trait<R> for Expr {
            type Output = Expr;

            fn $fn(self, rhs: R) -> Expr {
                self.binary(BinaryOp::$op, rhs)
            }
        })*
    };
}

arithmetic!(Add add Add, Sub sub Sub, Mul mul Mul, Div div Div);

macro_rules! expr_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Expr {
            fn from(v: $t) -> Self {
                Expr::Constant(Value::from(v))
            }
        })*
    };
}

expr_from!(i32, i64, u32, f64, bool, String, &str, &String, Value);

impl<T: Into<Value>> From<Option<T>> for Expr {
    fn from(v: Option<T>) -> Self {
        Expr::Constant(Value::from(v))
    }
}

/// One `ORDER BY` term.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Tagged {
        tag: String,
    }

    impl Index for Tagged {
        const NAME: &'static str = "Tagged";
        const COLUMNS: &'static [Column] = &[Column::text("tag")];
    }

    #[test]
    fn row_dependence_is_transitive() {
        assert!(!val(1).eq(2).is_row_dependent());
        assert!(field::<Tagged>("tag").to_upper().eq("A").is_row_dependent());
        assert!(!(val(1) + 2).is_row_dependent());
    }

    #[test]
    fn concat_flattens_chains() {
        let e = field::<Tagged>("tag").concat("-").concat("x");
        match e {
            Expr::Call(Method::Concat, args) => assert_eq!(args.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn implicit_columns_are_known() {
        let Expr::Member(m) = field::<Tagged>("DocumentId") else {
            unreachable!()
        };
        assert!(m.is_known());
        let Expr::Member(m) = field::<Tagged>("missing") else {
            unreachable!()
        };
        assert!(!m.is_known());
    }
}

use super::eval::evaluate;
use super::{BinaryOp, Expr, Member, Method, OrderBy, Subquery, UnaryOp};
use crate::dialect::SqlDialect;
use crate::error::{DocketError, Result};
use crate::model::TableNames;
use crate::value::{Parameters, Value};
use std::any::Any;

/// Wildcards spliced onto a bound LIKE operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LikeAffix {
    None,
    Prefix,
    Suffix,
    Contains,
}

impl LikeAffix {
    pub(crate) fn apply(self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        let text = value.to_text();
        Value::Text(match self {
            LikeAffix::None => return value,
            LikeAffix::Prefix => format!("{text}%"),
            LikeAffix::Suffix => format!("%{text}"),
            LikeAffix::Contains => format!("%{text}%"),
        })
    }
}

/// Re-evaluates one bound parameter for a new set of arguments.
#[derive(Debug, Clone)]
pub(crate) struct Rebinder {
    pub(crate) name: String,
    pub(crate) expr: Expr,
    pub(crate) affix: LikeAffix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    pub sql: String,
    pub parameters: Parameters,
}

#[derive(Debug)]
struct Binding {
    index: &'static str,
    alias: String,
}

/// Translates [`Expr`] trees into SQL fragments with bound parameters.
///
/// Row members resolve against a stack of bound index aliases; correlated
/// `is_in_query` forms push a binding for the inner index while the subquery
/// is rendered.
pub struct PredicateCompiler<'a> {
    dialect: &'a dyn SqlDialect,
    names: &'a TableNames,
    args: Option<&'a dyn Any>,
    bindings: Vec<Binding>,
    parameters: Parameters,
    rebinders: Vec<Rebinder>,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(dialect: &'a dyn SqlDialect, names: &'a TableNames) -> Self {
        Self {
            dialect,
            names,
            args: None,
            bindings: Vec::new(),
            parameters: Parameters::new(),
            rebinders: Vec::new(),
        }
    }

    /// Arguments read by captures while compiling.
    pub fn with_args(mut self, args: &'a dyn Any) -> Self {
        self.args = Some(args);
        self
    }

    pub fn bind_index(&mut self, index: &'static str, alias: impl Into<String>) {
        self.bindings.push(Binding {
            index,
            alias: alias.into(),
        });
    }

    pub fn unbind_index(&mut self) {
        self.bindings.pop();
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub(crate) fn into_parts(self) -> (Parameters, Vec<Rebinder>) {
        (self.parameters, self.rebinders)
    }

    /// Compile `expr` as the WHERE clause of a query over `index`, aliased by
    /// its own name.
    pub fn compile(mut self, index: &'static str, expr: &Expr) -> Result<CompiledPredicate> {
        self.bind_index(index, index);
        let sql = self.predicate(expr)?;
        Ok(CompiledPredicate {
            sql,
            parameters: self.parameters,
        })
    }

    pub fn bind(&mut self, value: Value) -> String {
        let name = self.dialect.parameter(self.parameters.len());
        self.parameters.push(name.clone(), value);
        name
    }

    /// Render `expr` where SQL expects a boolean condition.
    pub fn predicate(&mut self, expr: &Expr) -> Result<String> {
        if !expr.is_row_dependent() {
            return self.constant_predicate(expr);
        }
        match expr {
            Expr::Binary(op, l, r) if op.is_logical() => Ok(format!(
                "({} {} {})",
                self.predicate(l)?,
                op.sql(),
                self.predicate(r)?
            )),
            Expr::Binary(op, l, r) if op.is_comparison() => self.compare(*op, l, r),
            Expr::Unary(UnaryOp::Not, e) => Ok(format!("NOT ({})", self.predicate(e)?)),
            Expr::Member(m) => Ok(format!(
                "{} = {}",
                self.member(m)?,
                self.dialect.boolean_literal(true)
            )),
            Expr::Convert(e, _) => self.predicate(e),
            Expr::Call(method, args) => self.call_predicate(method, args),
            other => Err(DocketError::unsupported(format!(
                "{} is not a boolean condition",
                kind_of(other)
            ))),
        }
    }

    /// Render `expr` where SQL expects a value (operands, ORDER BY terms).
    pub fn expression(&mut self, expr: &Expr) -> Result<String> {
        if !expr.is_row_dependent() {
            return self.bind_closure(expr, LikeAffix::None);
        }
        match expr {
            Expr::Constant(_) | Expr::Capture(_) => self.bind_closure(expr, LikeAffix::None),
            Expr::Member(m) => self.member(m),
            Expr::Binary(op, l, r) if !op.is_comparison() && !op.is_logical() => Ok(format!(
                "({} {} {})",
                self.expression(l)?,
                op.sql(),
                self.expression(r)?
            )),
            Expr::Binary(..) | Expr::Unary(UnaryOp::Not, _) => {
                Ok(format!("({})", self.predicate(expr)?))
            }
            Expr::Unary(UnaryOp::Negate, e) => Ok(format!("(-{})", self.expression(e)?)),
            Expr::Convert(e, _) => self.expression(e),
            Expr::Call(Method::Concat, args) => {
                let parts = args
                    .iter()
                    .map(|a| self.expression(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.dialect.concat(&parts))
            }
            Expr::Call(Method::ToUpper, args) => {
                let operand = self.expression(receiver(args, "to_upper")?)?;
                Ok(self.dialect.upper(&operand))
            }
            Expr::Call(Method::ToLower, args) => {
                let operand = self.expression(receiver(args, "to_lower")?)?;
                Ok(self.dialect.lower(&operand))
            }
            Expr::Call(Method::Host(h), _) => Err(no_translation(h.name)),
            Expr::Call(..) => Ok(format!("({})", self.predicate(expr)?)),
        }
    }

    pub fn order_by(&mut self, terms: &[OrderBy]) -> Result<String> {
        self.order_terms(terms, false)
    }

    /// `ORDER BY` for grouped rows: an ascending term sorts by the smallest
    /// value in the group, a descending one by the largest.
    pub fn grouped_order_by(&mut self, terms: &[OrderBy]) -> Result<String> {
        self.order_terms(terms, true)
    }

    fn order_terms(&mut self, terms: &[OrderBy], grouped: bool) -> Result<String> {
        if terms.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(terms.len());
        for term in terms {
            let expr = self.expression(&term.expr)?;
            let (dir, aggregate) = if term.descending {
                ("DESC", "MAX")
            } else {
                ("ASC", "MIN")
            };
            if grouped {
                parts.push(format!("{aggregate}({expr}) {dir}"));
            } else {
                parts.push(format!("{expr} {dir}"));
            }
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    fn constant_predicate(&mut self, expr: &Expr) -> Result<String> {
        if expr.has_captures() {
            let p = self.bind_closure(expr, LikeAffix::None)?;
            return Ok(format!("{p} = {}", self.dialect.boolean_literal(true)));
        }
        match evaluate(expr, self.args)? {
            Value::Null => Ok(self.dialect.false_predicate().to_string()),
            v => match v.as_bool() {
                Some(true) => Ok(self.dialect.true_predicate().to_string()),
                Some(false) => Ok(self.dialect.false_predicate().to_string()),
                None => Err(DocketError::unsupported(format!(
                    "{} value {v} is not a boolean condition",
                    v.type_name()
                ))),
            },
        }
    }

    fn bind_closure(&mut self, expr: &Expr, affix: LikeAffix) -> Result<String> {
        let value = affix.apply(evaluate(expr, self.args)?);
        Ok(self.bind_evaluated(expr, value, affix))
    }

    fn bind_evaluated(&mut self, expr: &Expr, value: Value, affix: LikeAffix) -> String {
        let name = self.bind(value);
        if expr.has_captures() {
            self.rebinders.push(Rebinder {
                name: name.clone(),
                expr: expr.clone(),
                affix,
            });
        }
        name
    }

    fn compare(&mut self, op: BinaryOp, l: &Expr, r: &Expr) -> Result<String> {
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            if let Some(sql) = self.null_test(op, l, r)? {
                return Ok(sql);
            }
            if let Some(sql) = self.null_test(op, r, l)? {
                return Ok(sql);
            }
        }
        let left = self.expression(l)?;
        let right = self.expression(r)?;
        Ok(format!("{left} {} {right}", op.sql()))
    }

    /// A host-side null compared for (in)equality becomes `IS [NOT] NULL`.
    fn null_test(&mut self, op: BinaryOp, side: &Expr, other: &Expr) -> Result<Option<String>> {
        if side.is_row_dependent() || !evaluate(side, self.args)?.is_null() {
            return Ok(None);
        }
        let not = if op == BinaryOp::Ne { "NOT " } else { "" };
        let target = self.expression(other)?;
        Ok(Some(format!("{target} IS {not}NULL")))
    }

    fn call_predicate(&mut self, method: &Method, args: &[Expr]) -> Result<String> {
        match method {
            Method::StartsWith => self.like(args, LikeAffix::Prefix),
            Method::EndsWith => self.like(args, LikeAffix::Suffix),
            Method::Contains => self.like(args, LikeAffix::Contains),
            Method::IsIn => self.in_list(args, false),
            Method::IsNotIn => self.in_list(args, true),
            Method::IsInQuery(sub) => self.in_subquery(receiver(args, "is_in_query")?, sub, false),
            Method::IsNotInQuery(sub) => {
                self.in_subquery(receiver(args, "is_not_in_query")?, sub, true)
            }
            Method::Host(h) => Err(no_translation(h.name)),
            Method::Concat | Method::ToUpper | Method::ToLower => Err(DocketError::unsupported(
                format!("{} is not a boolean condition", method.name()),
            )),
        }
    }

    fn like(&mut self, args: &[Expr], affix: LikeAffix) -> Result<String> {
        let (Some(target), Some(pattern)) = (args.first(), args.get(1)) else {
            return Err(DocketError::Validation(
                "LIKE methods need a receiver and an argument".into(),
            ));
        };
        let left = self.expression(target)?;
        let right = if pattern.is_row_dependent() {
            let p = self.expression(pattern)?;
            let pct = self.dialect.string_literal("%");
            let parts = match affix {
                LikeAffix::Prefix => vec![p, pct],
                LikeAffix::Suffix => vec![pct, p],
                LikeAffix::Contains => vec![pct.clone(), p, pct],
                LikeAffix::None => vec![p],
            };
            self.dialect.concat(&parts)
        } else {
            self.bind_closure(pattern, affix)?
        };
        Ok(self.dialect.like(&left, &right))
    }

    fn in_list(&mut self, args: &[Expr], negate: bool) -> Result<String> {
        let Some((target, items)) = args.split_first() else {
            return Err(DocketError::Validation("is_in needs a receiver".into()));
        };
        match items {
            [] if negate => Ok(self.dialect.true_predicate().to_string()),
            [] => Ok(self.dialect.false_predicate().to_string()),
            [single] => {
                let op = if negate { BinaryOp::Ne } else { BinaryOp::Eq };
                self.compare(op, target, single)
            }
            _ => {
                let left = self.expression(target)?;
                let rendered = items
                    .iter()
                    .map(|item| self.expression(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.dialect.in_list(&left, &rendered, negate))
            }
        }
    }

    fn in_subquery(&mut self, target: &Expr, sub: &Subquery, negate: bool) -> Result<String> {
        let left = self.expression(target)?;
        let alias = format!("{}_{}", sub.index, self.bindings.len());
        self.bind_index(sub.index, alias.clone());
        let inner = self.subquery_select(sub, &alias);
        self.unbind_index();
        Ok(self.dialect.in_list(&left, &[inner?], negate))
    }

    fn subquery_select(&mut self, sub: &Subquery, alias: &str) -> Result<String> {
        let selector = self.member(&sub.selector)?;
        let filter = self.predicate(&sub.predicate)?;
        Ok(format!(
            "SELECT {selector} FROM {} AS {} WHERE {filter}",
            self.dialect.quote(&self.names.index(sub.index)),
            self.dialect.quote(alias)
        ))
    }

    fn member(&self, m: &Member) -> Result<String> {
        if !m.is_known() {
            return Err(DocketError::unsupported(format!(
                "index '{}' has no column '{}'",
                m.index, m.column
            )));
        }
        let binding = self
            .bindings
            .iter()
            .rev()
            .find(|b| b.index == m.index)
            .ok_or_else(|| {
                DocketError::unsupported(format!("index '{}' is not part of this query", m.index))
            })?;
        Ok(format!(
            "{}.{}",
            self.dialect.quote(&binding.alias),
            self.dialect.quote(&m.column)
        ))
    }
}

fn receiver<'e>(args: &'e [Expr], method: &str) -> Result<&'e Expr> {
    args.first()
        .ok_or_else(|| DocketError::Validation(format!("{method} needs a receiver")))
}

fn no_translation(name: &str) -> DocketError {
    DocketError::unsupported(format!("method '{name}' has no SQL translation"))
}

fn kind_of(expr: &Expr) -> &'static str {
    match expr {
        Expr::Constant(_) => "constant",
        Expr::Capture(_) => "capture",
        Expr::Member(_) => "member",
        Expr::Unary(..) => "unary expression",
        Expr::Binary(..) => "arithmetic expression",
        Expr::Call(..) => "method call",
        Expr::Convert(..) => "conversion",
    }
}

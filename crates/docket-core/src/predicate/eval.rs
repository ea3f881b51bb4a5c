use super::{BinaryOp, Expr, Method, UnaryOp};
use crate::error::{DocketError, Result};
use crate::model::ColumnKind;
use crate::value::Value;
use std::any::Any;
use std::cmp::Ordering;

/// Evaluate a subtree that does not depend on the row.
pub(crate) fn evaluate(expr: &Expr, args: Option<&dyn Any>) -> Result<Value> {
    match expr {
        Expr::Constant(v) => Ok(v.clone()),
        Expr::Capture(c) => {
            let args = args.ok_or_else(|| {
                DocketError::Validation(format!("capture '{}' evaluated without arguments", c.name))
            })?;
            c.read(args).ok_or_else(|| {
                DocketError::Validation(format!(
                    "capture '{}' cannot read the supplied arguments",
                    c.name
                ))
            })
        }
        Expr::Member(m) => Err(DocketError::unsupported(format!(
            "member '{}.{}' has no value before the query runs",
            m.index, m.column
        ))),
        Expr::Unary(op, e) => unary(*op, evaluate(e, args)?),
        Expr::Binary(op, l, r) => binary(*op, evaluate(l, args)?, evaluate(r, args)?),
        Expr::Call(method, call_args) => {
            let values = call_args
                .iter()
                .map(|a| evaluate(a, args))
                .collect::<Result<Vec<_>>>()?;
            call(method, values)
        }
        Expr::Convert(e, kind) => convert(evaluate(e, args)?, *kind),
    }
}

fn unary(op: UnaryOp, v: Value) -> Result<Value> {
    match (op, v) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, v) => v
            .as_bool()
            .map(|b| Value::Bool(!b))
            .ok_or_else(|| type_error("not", &v)),
        (UnaryOp::Negate, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Negate, v) => Err(type_error("negate", &v)),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinaryOp::And | BinaryOp::Or => {
            let (Some(a), Some(b)) = (l.as_bool(), r.as_bool()) else {
                return Ok(Value::Null);
            };
            Ok(Value::Bool(if op == BinaryOp::And { a && b } else { a || b }))
        }
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ord) = compare(&l, &r) else {
                return Ok(Value::Null);
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, l, r),
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            _ => a.checked_div(b),
        };
        return out
            .map(Value::Int)
            .ok_or_else(|| DocketError::Validation(format!("integer overflow in {a} {} {b}", op.sql())));
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(type_error(op.sql(), if l.as_f64().is_none() { &l } else { &r }));
    };
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => a / b,
    }))
}

fn call(method: &Method, args: Vec<Value>) -> Result<Value> {
    let text = |i: usize| -> Result<String> {
        match args.get(i) {
            Some(Value::Text(s)) => Ok(s.clone()),
            Some(v) => Err(type_error(method.name(), v)),
            None => Err(DocketError::Validation(format!(
                "{} is missing argument {i}",
                method.name()
            ))),
        }
    };
    if matches!(
        method,
        Method::StartsWith | Method::EndsWith | Method::Contains | Method::ToUpper | Method::ToLower
    ) && args.first().is_some_and(Value::is_null)
    {
        return Ok(Value::Null);
    }
    match method {
        Method::StartsWith => Ok(Value::Bool(text(0)?.starts_with(&text(1)?))),
        Method::EndsWith => Ok(Value::Bool(text(0)?.ends_with(&text(1)?))),
        Method::Contains => Ok(Value::Bool(text(0)?.contains(&text(1)?))),
        Method::ToUpper => Ok(Value::Text(text(0)?.to_uppercase())),
        Method::ToLower => Ok(Value::Text(text(0)?.to_lowercase())),
        Method::Concat => Ok(Value::Text(args.iter().map(Value::to_text).collect())),
        Method::IsIn | Method::IsNotIn => {
            let (target, items) = args
                .split_first()
                .ok_or_else(|| DocketError::Validation("is_in needs a receiver".into()))?;
            let found = items.iter().any(|v| v == target);
            Ok(Value::Bool(found == matches!(method, Method::IsIn)))
        }
        Method::IsInQuery(_) | Method::IsNotInQuery(_) => Err(DocketError::unsupported(
            "correlated subqueries can only run in SQL",
        )),
        Method::Host(h) => h.call(&args),
    }
}

pub(crate) fn convert(v: Value, kind: ColumnKind) -> Result<Value> {
    let out = match (kind, &v) {
        (_, Value::Null) => Some(Value::Null),
        (ColumnKind::Integer, Value::Float(f)) => Some(Value::Int(f.trunc() as i64)),
        (ColumnKind::Integer, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),
        (ColumnKind::Integer, other) => other.as_i64().map(Value::Int),
        (ColumnKind::Real, Value::Text(s)) => s.trim().parse().ok().map(Value::Float),
        (ColumnKind::Real, other) => other.as_f64().map(Value::Float),
        (ColumnKind::Boolean, other) => other.as_bool().map(Value::Bool),
        (ColumnKind::Text, other) => Some(Value::Text(other.to_text())),
    };
    out.ok_or_else(|| {
        DocketError::Validation(format!("cannot convert {} to {kind:?}", v.type_name()))
    })
}

fn type_error(op: &str, v: &Value) -> DocketError {
    DocketError::Validation(format!("'{op}' does not apply to {} value {v}", v.type_name()))
}

//! Evaluator for per-cell `prepare` formulas.
//!
//! A cell formula is a small expression applied to the raw source
//! value while a row is projected: `strip()` trims whitespace,
//! `swap('N/A',null)` replaces sentinel values, binds read sibling
//! cells. Functions that take a subject argument use it; with the
//! argument omitted they apply to the cell being prepared.

use serde_json::Value;

use crate::{Error, Result};
use manifest::Error as DomainError;
use rql::Expr;

type Json = serde_json::Map<String, Value>;

pub fn eval_cell(expr: &Expr, this: &Value, row: &Json) -> Result<Value> {
    match expr {
        Expr::Value(value) => Ok(value.to_json()),
        Expr::Bind(place) => Ok(row.get(place).cloned().unwrap_or(Value::Null)),
        Expr::Op { name, args } => apply(name, args, this, row),
    }
}

fn apply(name: &str, args: &[Expr], this: &Value, row: &Json) -> Result<Value> {
    // The subject is the first argument when given, the cell value
    // otherwise.
    let subject = |n: usize| -> Result<Value> {
        match args.get(n) {
            Some(arg) => eval_cell(arg, this, row),
            None => Ok(this.clone()),
        }
    };

    match name {
        "self" => Ok(this.clone()),
        "lower" => Ok(map_str(subject(0)?, str::to_lowercase)),
        "upper" => Ok(map_str(subject(0)?, str::to_uppercase)),
        "strip" => Ok(map_str(subject(0)?, |s| s.trim().to_string())),
        // swap(old, new): replace the exact value `old` with `new`.
        "swap" => {
            let old = eval_cell(
                args.first().ok_or_else(|| bad_formula(name))?,
                this,
                row,
            )?;
            let new = eval_cell(args.get(1).ok_or_else(|| bad_formula(name))?, this, row)?;
            Ok(if *this == old { new } else { this.clone() })
        }
        "replace" => {
            let from = eval_cell(
                args.first().ok_or_else(|| bad_formula(name))?,
                this,
                row,
            )?;
            let to = eval_cell(args.get(1).ok_or_else(|| bad_formula(name))?, this, row)?;
            match (this, from, to) {
                (Value::String(s), Value::String(from), Value::String(to)) => {
                    Ok(Value::String(s.replace(&from, &to)))
                }
                _ => Ok(this.clone()),
            }
        }
        other => Err(Error::Domain(DomainError::NotImplementedFeature {
            feature: format!("formula function {other:?}"),
        })),
    }
}

fn bad_formula(name: &str) -> Error {
    Error::Domain(DomainError::NotImplementedFeature {
        feature: format!("formula function {name:?} with these arguments"),
    })
}

fn map_str(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

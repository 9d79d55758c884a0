//! Expression mini-language used in URL query strings and in manifest
//! `prepare` formulas.
//!
//! An expression is a tree of named operations over property binds and
//! literal values, e.g. `and(eq(code,'lt'),sort(+name),limit(10))`.
//! The same [`Expr`] type is produced by the URL parser and stored on
//! models as their source-filter formula, so the two can be merged into
//! a single predicate tree before query planning.

mod parse;
mod unparse;

pub use parse::{parse, ParseError};
pub use unparse::unparse;

use serde::{Deserialize, Serialize};

/// A literal value appearing in an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Lossless conversion into a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Number(n) => serde_json::Value::from(*n),
            Value::String(s) => serde_json::Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// One node of an expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A named operation applied to arguments: `eq(code,'lt')`.
    Op { name: String, args: Vec<Expr> },
    /// A reference to a property by its dotted place: `notes.note`.
    Bind(String),
    /// A literal value.
    Value(Value),
}

impl Expr {
    pub fn op(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Op {
            name: name.into(),
            args,
        }
    }

    pub fn bind(place: impl Into<String>) -> Expr {
        Expr::Bind(place.into())
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::Value(Value::String(s.into()))
    }

    pub fn integer(i: i64) -> Expr {
        Expr::Value(Value::Integer(i))
    }

    /// The `eq(_id,'<id>')` predicate used to address a single row.
    pub fn eq_id(id: &str) -> Expr {
        Expr::op("eq", vec![Expr::bind("_id"), Expr::string(id)])
    }

    pub fn op_name(&self) -> Option<&str> {
        match self {
            Expr::Op { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Iterate the conjunct clauses of this expression: an `and` node
    /// yields each argument, anything else yields itself.
    pub fn conjuncts(&self) -> impl Iterator<Item = &Expr> {
        let items: Vec<&Expr> = match self {
            Expr::Op { name, args } if name == "and" => args.iter().collect(),
            other => vec![other],
        };
        items.into_iter()
    }
}

/// Merge two optional predicate trees into their conjunction.
///
/// `and` nodes on either side are flattened so merging is associative
/// and does not build degenerate nesting when called repeatedly.
pub fn merge_formulas(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
    fn flatten(expr: Expr, into: &mut Vec<Expr>) {
        match expr {
            Expr::Op { name, args } if name == "and" => {
                for arg in args {
                    flatten(arg, into);
                }
            }
            other => into.push(other),
        }
    }

    match (left, right) {
        (None, None) => None,
        (Some(expr), None) | (None, Some(expr)) => Some(expr),
        (Some(left), Some(right)) => {
            let mut args = Vec::new();
            flatten(left, &mut args);
            flatten(right, &mut args);
            Some(Expr::op("and", args))
        }
    }
}

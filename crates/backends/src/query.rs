//! Lowering of parsed query expressions against a model.
//!
//! [`resolve`] turns the operation tree produced by the URL parser into
//! a typed [`ResolvedQuery`]: each condition is bound to a property,
//! its value coerced to the property's data type, and sort/select/limit
//! clauses are split out. The SQL builders for the internal store and
//! for external sources both start from this shape.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use manifest::{DataType, Error, Model, Property};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Ne,
    Contains,
    Startswith,
}

impl CompareOp {
    pub fn from_name(name: &str) -> Option<CompareOp> {
        Some(match name {
            "eq" => CompareOp::Eq,
            "ge" => CompareOp::Ge,
            "gt" => CompareOp::Gt,
            "le" => CompareOp::Le,
            "lt" => CompareOp::Lt,
            "ne" => CompareOp::Ne,
            "contains" => CompareOp::Contains,
            "startswith" => CompareOp::Startswith,
            _ => return None,
        })
    }

    /// SQL comparison operator for the order family; `Contains` and
    /// `Startswith` render as LIKE patterns instead.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ge => ">=",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Lt => "<",
            CompareOp::Ne => "<>",
            CompareOp::Contains | CompareOp::Startswith => "LIKE",
        }
    }
}

/// A query value coerced to its property's type.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Normalised to UTC with the offset dropped.
    DateTime(NaiveDateTime),
    Uuid(uuid::Uuid),
}

impl QueryValue {
    /// ISO-8601 rendering, used when comparing against JSON-stored
    /// values in the lists table.
    pub fn to_text(&self) -> String {
        match self {
            QueryValue::Null => String::new(),
            QueryValue::Bool(b) => b.to_string(),
            QueryValue::Int(i) => i.to_string(),
            QueryValue::Num(n) => n.to_string(),
            QueryValue::Str(s) => s.clone(),
            QueryValue::Date(d) => d.to_string(),
            QueryValue::Time(t) => t.to_string(),
            QueryValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            QueryValue::Uuid(u) => u.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub op: CompareOp,
    /// Dotted place of the property the condition binds to.
    pub place: String,
    pub prop: Property,
    pub value: QueryValue,
    /// Place of the nearest enclosing array when the property lives in
    /// the lists table.
    pub array: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub place: String,
    pub descending: bool,
    pub array: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedQuery {
    pub filters: Vec<Filter>,
    pub sort: Vec<SortKey>,
    pub select: Option<Vec<String>>,
    /// `select(count())` was requested.
    pub count: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Resolve a parsed expression against a model.
pub fn resolve(model: &Model, expr: Option<&rql::Expr>) -> Result<ResolvedQuery, Error> {
    let mut query = ResolvedQuery::default();
    let Some(expr) = expr else {
        return Ok(query);
    };

    for clause in expr.conjuncts() {
        let (name, args) = match clause {
            rql::Expr::Op { name, args } => (name.as_str(), args.as_slice()),
            other => {
                return Err(Error::UnknownOperator {
                    prop: String::new(),
                    operator: rql::unparse(other),
                })
            }
        };
        match name {
            "select" => {
                let mut select = Vec::new();
                for arg in args {
                    match arg {
                        rql::Expr::Bind(place) => {
                            lookup(model, place)?;
                            select.push(place.clone());
                        }
                        rql::Expr::Op { name, .. } if name == "count" => query.count = true,
                        other => {
                            return Err(Error::UnknownParameter {
                                name: rql::unparse(other),
                            })
                        }
                    }
                }
                if !select.is_empty() {
                    query.select = Some(select);
                }
            }
            "sort" => {
                for arg in args {
                    let (descending, place) = match arg {
                        rql::Expr::Bind(place) => (false, place),
                        rql::Expr::Op { name, args } if name == "asc" || name == "desc" => {
                            match args.first() {
                                Some(rql::Expr::Bind(place)) => (name == "desc", place),
                                _ => {
                                    return Err(Error::UnknownParameter {
                                        name: rql::unparse(arg),
                                    })
                                }
                            }
                        }
                        other => {
                            return Err(Error::UnknownParameter {
                                name: rql::unparse(other),
                            })
                        }
                    };
                    lookup(model, place)?;
                    query.sort.push(SortKey {
                        place: place.clone(),
                        descending,
                        array: array_prefix(model, place),
                    });
                }
            }
            "limit" => query.limit = Some(non_negative(name, args)?),
            "offset" => query.offset = Some(non_negative(name, args)?),
            op => {
                let Some(op) = CompareOp::from_name(op) else {
                    let prop = match args.first() {
                        Some(rql::Expr::Bind(place)) => place.clone(),
                        _ => String::new(),
                    };
                    return Err(Error::UnknownOperator {
                        prop,
                        operator: op.to_string(),
                    });
                };
                let (place, value) = match args {
                    [rql::Expr::Bind(place), rql::Expr::Value(value)] => (place, value),
                    _ => {
                        return Err(Error::UnknownParameter {
                            name: rql::unparse(clause),
                        })
                    }
                };
                let prop = lookup(model, place)?;
                let value = coerce(prop, value)?;
                query.filters.push(Filter {
                    op,
                    place: place.clone(),
                    prop: prop.clone(),
                    value,
                    array: array_prefix(model, place),
                });
            }
        }
    }
    Ok(query)
}

fn non_negative(name: &str, args: &[rql::Expr]) -> Result<i64, Error> {
    match args {
        [rql::Expr::Value(rql::Value::Integer(n))] if *n >= 0 => Ok(*n),
        _ => Err(Error::InvalidValue {
            prop: name.to_string(),
            dtype: "integer".to_string(),
            value: serde_json::Value::String(
                args.iter().map(rql::unparse).collect::<Vec<_>>().join(","),
            ),
        }),
    }
}

fn lookup<'a>(model: &'a Model, place: &str) -> Result<&'a Property, Error> {
    if place == "_id" {
        // The surrogate key is addressable even though it is not a
        // declared property.
        return Ok(id_prop());
    }
    model.flat_prop(place).ok_or_else(|| Error::FieldNotInResource {
        model: model.model_type().to_string(),
        prop: place.to_string(),
    })
}

fn id_prop() -> &'static Property {
    use std::sync::OnceLock;
    static ID: OnceLock<Property> = OnceLock::new();
    ID.get_or_init(|| Property::new("_id", "_id", DataType::PrimaryKey))
}

/// Place of the nearest enclosing array of `place`, or `None` when the
/// property lives in the main table. A scalar array is its own
/// enclosing array.
pub fn array_prefix(model: &Model, place: &str) -> Option<String> {
    if !model.props_in_lists().contains(place) {
        return None;
    }
    let mut members = Some(&model.properties);
    let mut nearest = None;
    let mut prefix = String::new();
    for part in place.split('.') {
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(part);

        let prop = members.and_then(|m| m.get(part))?;
        members = match &prop.dtype {
            DataType::Object(members) => Some(members),
            DataType::Array(item) => {
                nearest = Some(prefix.clone());
                match &item.dtype {
                    DataType::Object(members) => Some(members),
                    _ => None,
                }
            }
            _ => None,
        };
    }
    nearest
}

/// Coerce a literal to the property's data type.
pub fn coerce(prop: &Property, value: &rql::Value) -> Result<QueryValue, Error> {
    use rql::Value::*;

    let dtype = match &prop.dtype {
        // Searching an array matches against its items.
        DataType::Array(item) => &item.dtype,
        other => other,
    };

    let invalid = || Error::InvalidValue {
        prop: prop.place.clone(),
        dtype: dtype.tag().to_string(),
        value: value.to_json(),
    };

    if let Null = value {
        return Ok(QueryValue::Null);
    }

    Ok(match dtype {
        DataType::String | DataType::Text | DataType::Uri | DataType::Geometry => match value {
            String(s) => QueryValue::Str(s.clone()),
            Integer(i) => QueryValue::Str(i.to_string()),
            _ => return Err(invalid()),
        },
        DataType::Integer => match value {
            Integer(i) => QueryValue::Int(*i),
            String(s) => QueryValue::Int(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        DataType::Number => match value {
            Integer(i) => QueryValue::Num(*i as f64),
            Number(n) => QueryValue::Num(*n),
            String(s) => QueryValue::Num(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        DataType::Boolean => match value {
            Bool(b) => QueryValue::Bool(*b),
            _ => return Err(invalid()),
        },
        DataType::Date => match value {
            String(s) => QueryValue::Date(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        DataType::Time => match value {
            String(s) => QueryValue::Time(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        DataType::DateTime => match value {
            String(s) => QueryValue::DateTime(normalize_datetime(s).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        },
        DataType::PrimaryKey | DataType::Ref { .. } => match value {
            String(s) => QueryValue::Uuid(s.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        DataType::Binary | DataType::File | DataType::Object(..) | DataType::Array(..) => {
            return Err(Error::UnknownOperator {
                prop: prop.place.clone(),
                operator: format!("comparison against {}", dtype.tag()),
            })
        }
    })
}

/// Parse an ISO-8601 datetime and normalise it: values with an offset
/// convert to UTC and the offset is dropped. The identical
/// normalisation applies when rows are mirrored into the lists table,
/// so lexicographic comparison of the stored text is correct.
pub fn normalize_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::IndexMap;
    use manifest::{ModelName, Property};
    use pretty_assertions::assert_eq;

    fn model() -> Model {
        let mut model = Model::new(ModelName::new("country"));
        model
            .properties
            .insert("code".into(), Property::new("code", "code", DataType::String));
        model.properties.insert(
            "area".into(),
            Property::new("area", "area", DataType::Integer),
        );
        model.properties.insert(
            "since".into(),
            Property::new("since", "since", DataType::DateTime),
        );
        let mut note = IndexMap::new();
        note.insert(
            "note".into(),
            Property::new("note", "notes.note", DataType::String),
        );
        let items = Property::new("notes", "notes", DataType::Object(note));
        model.properties.insert(
            "notes".into(),
            Property::new("notes", "notes", DataType::Array(Box::new(items))),
        );
        model.link();
        model
    }

    fn resolve_str(q: &str) -> Result<ResolvedQuery, Error> {
        let expr = rql::parse(q).unwrap();
        resolve(&model(), Some(&expr))
    }

    #[test]
    fn test_resolve_filters_and_paging() {
        let query = resolve_str("eq(code,'LT')&gt(area,100)&limit(10)&offset(5)").unwrap();
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[0].op, CompareOp::Eq);
        assert_eq!(query.filters[0].value, QueryValue::Str("LT".into()));
        assert_eq!(query.filters[1].value, QueryValue::Int(100));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
    }

    #[test]
    fn test_resolve_sort_and_select() {
        let query = resolve_str("select(code,count())&sort(-area,code)").unwrap();
        assert_eq!(query.select, Some(vec!["code".to_string()]));
        assert!(query.count);
        assert!(query.sort[0].descending);
        assert!(!query.sort[1].descending);
    }

    #[test]
    fn test_resolve_list_prop_condition() {
        let query = resolve_str("eq(notes.note,'x')").unwrap();
        assert_eq!(query.filters[0].array.as_deref(), Some("notes"));
    }

    #[test]
    fn test_resolve_unknown_prop() {
        let err = resolve_str("eq(nope,'x')").unwrap_err();
        assert_eq!(err.code(), "FieldNotInResource");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_resolve_unknown_operator() {
        let err = resolve_str("almost(code,'x')").unwrap_err();
        assert_eq!(err.code(), "UnknownOperator");
    }

    #[test]
    fn test_resolve_invalid_value() {
        let err = resolve_str("eq(area,'ten')").unwrap_err();
        assert_eq!(err.code(), "InvalidValue");
    }

    #[test]
    fn test_negative_limit_rejected() {
        assert!(resolve_str("limit(-1)").is_err());
        assert!(resolve_str("offset(0)").is_ok());
        assert!(resolve_str("limit(0)").is_ok());
    }

    #[test]
    fn test_normalize_datetime_drops_offset() {
        let dt = normalize_datetime("2020-01-01T12:00:00+02:00").unwrap();
        assert_eq!(dt.to_string(), "2020-01-01 10:00:00");
        let dt = normalize_datetime("2020-01-01T12:00:00").unwrap();
        assert_eq!(dt.to_string(), "2020-01-01 12:00:00");
    }

    #[test]
    fn test_id_is_addressable() {
        let query = resolve_str("eq(_id,'11111111-2222-3333-4444-555555555555')").unwrap();
        assert!(matches!(query.filters[0].value, QueryValue::Uuid(..)));
    }
}

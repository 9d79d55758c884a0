//! SQL text generation for the internal store.
//!
//! Builders here are pure: they take a resolved query and produce SQL
//! plus an ordered bind list, so plans are unit-testable without a
//! database. Identifiers come from the table registry and property
//! places validated at manifest load; only values travel as binds.

use manifest::{DataType, Error, Model};
use uuid::Uuid;

use super::ModelTables;
use crate::query::{CompareOp, Filter, QueryValue, ResolvedQuery, SortKey};
use crate::Result;

#[derive(Debug, Clone)]
pub struct SqlQuery {
    pub sql: String,
    pub binds: Vec<QueryValue>,
}

struct Builder {
    binds: Vec<QueryValue>,
    joins: Vec<String>,
    where_: Vec<String>,
    order: Vec<String>,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            binds: Vec::new(),
            joins: Vec::new(),
            where_: Vec::new(),
            order: Vec::new(),
        }
    }

    fn bind(&mut self, value: QueryValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }
}

/// How a field expression compares: as its native column type, or as
/// text extracted from JSON.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    Native,
    JsonText,
}

pub fn build_getall(
    tables: &ModelTables,
    model: &Model,
    query: &ResolvedQuery,
) -> Result<SqlQuery> {
    let mut builder = Builder::new();
    apply_filters(tables, model, query, &mut builder)?;
    apply_sort(tables, query, &mut builder);

    let mut sql = format!(r#"SELECT main.* FROM "{}" AS main"#, tables.main);
    finish(&mut sql, query, builder, true)
}

pub fn build_count(
    tables: &ModelTables,
    model: &Model,
    query: &ResolvedQuery,
) -> Result<SqlQuery> {
    let mut builder = Builder::new();
    apply_filters(tables, model, query, &mut builder)?;

    let mut sql = format!(r#"SELECT count(*) FROM "{}" AS main"#, tables.main);
    finish(&mut sql, query, builder, false)
}

fn finish(
    sql: &mut String,
    query: &ResolvedQuery,
    builder: Builder,
    paged: bool,
) -> Result<SqlQuery> {
    for join in &builder.joins {
        sql.push(' ');
        sql.push_str(join);
    }
    if !builder.where_.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&builder.where_.join(" AND "));
    }
    if paged {
        if !builder.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&builder.order.join(", "));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            if offset > 0 {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
    }
    Ok(SqlQuery {
        sql: std::mem::take(sql),
        binds: builder.binds,
    })
}

fn apply_filters(
    tables: &ModelTables,
    model: &Model,
    query: &ResolvedQuery,
    builder: &mut Builder,
) -> Result<()> {
    for filter in &query.filters {
        match (&filter.array, filter.op) {
            (None, _) => {
                let (expr, kind) = main_expr(&filter.place, &filter.prop.dtype);
                let cond = condition(&expr, kind, filter, builder)?;
                builder.where_.push(cond);
            }
            // `ne` over a list matches rows whose list has no equal
            // element, including rows missing the key entirely.
            (Some(array), CompareOp::Ne) => {
                let lists = lists_table(tables, model)?;
                let mut eq = filter.clone();
                eq.op = CompareOp::Eq;
                let (expr, kind) = lists_expr(&eq.place, &eq.prop.dtype);
                let cond = condition(&expr, kind, &eq, builder)?;
                builder.where_.push(format!(
                    r#"NOT EXISTS (SELECT 1 FROM "{lists}" AS l WHERE l."id" = main."_id" AND l."key" = '{array}' AND {cond})"#,
                ));
            }
            (Some(array), _) => {
                let lists = lists_table(tables, model)?;
                let (expr, kind) = lists_expr(&filter.place, &filter.prop.dtype);
                let cond = condition(&expr, kind, filter, builder)?;
                let alias = format!("j{}", builder.joins.len());
                builder.joins.push(format!(
                    r#"JOIN (SELECT DISTINCT "id" FROM "{lists}" WHERE "key" = '{array}' AND {cond}) AS "{alias}" ON main."_id" = "{alias}"."id""#,
                ));
            }
        }
    }
    Ok(())
}

fn apply_sort(tables: &ModelTables, query: &ResolvedQuery, builder: &mut Builder) {
    for key in &query.sort {
        let dir = if key.descending { "DESC" } else { "ASC" };
        match &key.array {
            None => {
                let expr = if key.place.contains('.') {
                    json_path_expr("main", &key.place)
                } else {
                    format!(r#"main."{}""#, key.place)
                };
                builder.order.push(format!("{expr} {dir}"));
            }
            Some(array) => {
                // The representative element per row is the min or max
                // value, picked by a window over the lists table.
                let Some(lists) = tables.lists.as_deref() else {
                    continue;
                };
                let alias = format!("o{}", builder.joins.len());
                builder.joins.push(format!(
                    r#"JOIN (SELECT "id", "value" FROM (SELECT "id", "data" ->> '{place}' AS "value", row_number() OVER (PARTITION BY "id" ORDER BY "data" ->> '{place}' {dir}) AS "rn" FROM "{lists}" WHERE "key" = '{array}') AS "w" WHERE "rn" = 1) AS "{alias}" ON main."_id" = "{alias}"."id""#,
                    place = key.place,
                ));
                builder.order.push(format!(r#""{alias}"."value" {dir}"#));
            }
        }
    }
}

fn lists_table<'a>(tables: &'a ModelTables, model: &Model) -> Result<&'a str> {
    tables
        .lists
        .as_deref()
        .ok_or_else(|| Error::FieldNotInResource {
            model: model.model_type().to_string(),
            prop: "lists".to_string(),
        })
        .map_err(Into::into)
}

/// Field expression over the main table. Top-level properties are
/// native columns; nested object members extract text from JSONB.
fn main_expr(place: &str, dtype: &DataType) -> (String, FieldKind) {
    if place.contains('.') {
        (typed_json_expr(&json_path_expr("main", place), dtype), FieldKind::JsonText)
    } else {
        (format!(r#"main."{place}""#), FieldKind::Native)
    }
}

/// Field expression over a lists-table row.
fn lists_expr(place: &str, dtype: &DataType) -> (String, FieldKind) {
    let dtype = match dtype {
        DataType::Array(item) => &item.dtype,
        other => other,
    };
    (
        typed_json_expr(&format!(r#""data" ->> '{place}'"#), dtype),
        FieldKind::JsonText,
    )
}

fn json_path_expr(table: &str, place: &str) -> String {
    let (top, rest) = place.split_once('.').expect("nested place");
    let path = rest.split('.').collect::<Vec<_>>().join(",");
    format!(r#"{table}."{top}" #>> '{{{path}}}'"#)
}

fn typed_json_expr(text_expr: &str, dtype: &DataType) -> String {
    match dtype {
        DataType::Integer | DataType::Number => format!("({text_expr})::numeric"),
        DataType::Boolean => format!("({text_expr})::boolean"),
        _ => text_expr.to_string(),
    }
}

/// Render one comparison, pushing its bind.
fn condition(
    expr: &str,
    kind: FieldKind,
    filter: &Filter,
    builder: &mut Builder,
) -> Result<String> {
    let is_string = matches!(
        filter.prop.dtype,
        DataType::String | DataType::Text | DataType::Uri
    ) || matches!(
        &filter.prop.dtype,
        DataType::Array(item) if matches!(item.dtype, DataType::String | DataType::Text | DataType::Uri)
    );

    // Strings compare case-insensitively: the column side is lowered
    // here and the value side was lowered when the bind was built.
    let expr = if is_string {
        format!("lower({expr})")
    } else {
        expr.to_string()
    };

    if matches!(filter.value, QueryValue::Null) {
        return match filter.op {
            CompareOp::Eq => Ok(format!("{expr} IS NULL")),
            CompareOp::Ne => Ok(format!("{expr} IS NOT NULL")),
            _ => Err(Error::InvalidValue {
                prop: filter.place.clone(),
                dtype: filter.prop.dtype.tag().to_string(),
                value: serde_json::Value::Null,
            }
            .into()),
        };
    }

    let value = bind_value(&filter.value, kind, is_string, filter.op);
    let placeholder = builder.bind(value);

    Ok(match filter.op {
        CompareOp::Contains | CompareOp::Startswith => {
            format!(r#"{expr} LIKE {placeholder} ESCAPE '\'"#)
        }
        CompareOp::Ne => format!("{expr} IS DISTINCT FROM {placeholder}"),
        op => format!("{expr} {} {placeholder}", op.sql()),
    })
}

fn bind_value(value: &QueryValue, kind: FieldKind, is_string: bool, op: CompareOp) -> QueryValue {
    let mut value = match kind {
        FieldKind::Native => value.clone(),
        // JSON-extracted fields compare as text except for the casts
        // applied in the field expression.
        FieldKind::JsonText => match value {
            QueryValue::Int(..) | QueryValue::Num(..) | QueryValue::Bool(..) => value.clone(),
            other => QueryValue::Str(other.to_text()),
        },
    };
    if is_string {
        if let QueryValue::Str(s) = &value {
            value = QueryValue::Str(s.to_lowercase());
        }
    }
    match op {
        CompareOp::Contains => value = like_pattern(&value, true),
        CompareOp::Startswith => value = like_pattern(&value, false),
        _ => {}
    }
    value
}

fn like_pattern(value: &QueryValue, contains: bool) -> QueryValue {
    let text = match value {
        QueryValue::Str(s) => s.clone(),
        other => other.to_text(),
    };
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    QueryValue::Str(if contains {
        format!("%{escaped}%")
    } else {
        format!("{escaped}%")
    })
}

/// Change feed query. A non-negative offset reads from that change
/// number; a negative offset reads the last `|offset|` changes.
pub fn build_changes(
    tables: &ModelTables,
    id: Option<Uuid>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> SqlQuery {
    let mut binds = Vec::new();
    let mut where_ = Vec::new();
    let changes = &tables.changes;

    if let Some(id) = id {
        binds.push(QueryValue::Uuid(id));
        where_.push(format!(r#""id" = ${}"#, binds.len()));
    }
    match offset {
        Some(offset) if offset > 0 => {
            binds.push(QueryValue::Int(offset));
            where_.push(format!(r#""change" > ${}"#, binds.len()));
        }
        Some(offset) if offset < 0 => {
            binds.push(QueryValue::Int(-offset));
            where_.push(format!(
                r#""change" > (SELECT COALESCE(MAX("change"), 0) FROM "{changes}") - ${}"#,
                binds.len(),
            ));
        }
        _ => {}
    }

    let mut sql = format!(r#"SELECT * FROM "{changes}""#);
    if !where_.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_.join(" AND "));
    }
    sql.push_str(r#" ORDER BY "change""#);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    SqlQuery { sql, binds }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::query::resolve;
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

    fn tables() -> ModelTables {
        ModelTables {
            main: "COUNTRY_0001M".into(),
            lists: Some("COUNTRY_0001L".into()),
            changes: "COUNTRY_0001C".into(),
        }
    }

    fn plan(q: &str) -> SqlQuery {
        let expr = rql::parse(q).unwrap();
        let query = resolve(&model(), Some(&expr)).unwrap();
        build_getall(&tables(), &model(), &query).unwrap()
    }

    #[test]
    fn test_plan_simple_eq_is_case_insensitive() {
        let plan = plan("eq(code,'LT')&limit(10)");
        assert_eq!(
            plan.sql,
            r#"SELECT main.* FROM "COUNTRY_0001M" AS main WHERE lower(main."code") = $1 LIMIT 10"#,
        );
        assert_eq!(plan.binds, vec![QueryValue::Str("lt".into())]);
    }

    #[test]
    fn test_plan_integer_compare() {
        let plan = plan("gt(area,100)");
        assert_eq!(
            plan.sql,
            r#"SELECT main.* FROM "COUNTRY_0001M" AS main WHERE main."area" > $1"#,
        );
        assert_eq!(plan.binds, vec![QueryValue::Int(100)]);
    }

    #[test]
    fn test_plan_list_prop_joins_distinct_subquery() {
        let plan = plan("eq(notes.note,'X')");
        assert_eq!(
            plan.sql,
            r#"SELECT main.* FROM "COUNTRY_0001M" AS main JOIN (SELECT DISTINCT "id" FROM "COUNTRY_0001L" WHERE "key" = 'notes' AND lower("data" ->> 'notes.note') = $1) AS "j0" ON main."_id" = "j0"."id""#,
        );
        assert_eq!(plan.binds, vec![QueryValue::Str("x".into())]);
    }

    #[test]
    fn test_plan_ne_on_list_prop_uses_not_exists() {
        let plan = plan("ne(notes.note,'x')");
        assert_eq!(
            plan.sql,
            r#"SELECT main.* FROM "COUNTRY_0001M" AS main WHERE NOT EXISTS (SELECT 1 FROM "COUNTRY_0001L" AS l WHERE l."id" = main."_id" AND l."key" = 'notes' AND lower("data" ->> 'notes.note') = $1)"#,
        );
    }

    #[test]
    fn test_plan_ne_on_plain_prop_matches_missing() {
        let plan = plan("ne(code,'lt')");
        assert!(plan.sql.contains(r#"lower(main."code") IS DISTINCT FROM $1"#));
    }

    #[test]
    fn test_plan_sort_on_list_prop_uses_window() {
        let plan = plan("sort(-notes.note)");
        assert!(plan.sql.contains("row_number() OVER (PARTITION BY"));
        assert!(plan.sql.contains(r#""o0"."value" DESC"#));
    }

    #[test]
    fn test_plan_contains_escapes_pattern() {
        let plan = plan("contains(code,'10%')");
        assert_eq!(plan.binds, vec![QueryValue::Str("%10\\%%".into())]);
        assert!(plan.sql.contains(r#"LIKE $1 ESCAPE '\'"#));
    }

    #[test]
    fn test_plan_count() {
        let expr = rql::parse("select(count())&eq(code,'lt')").unwrap();
        let query = resolve(&model(), Some(&expr)).unwrap();
        let plan = build_count(&tables(), &model(), &query).unwrap();
        assert_eq!(
            plan.sql,
            r#"SELECT count(*) FROM "COUNTRY_0001M" AS main WHERE lower(main."code") = $1"#,
        );
    }

    #[test]
    fn test_plan_changes_negative_offset() {
        let plan = build_changes(&tables(), None, Some(100), Some(-10));
        assert_eq!(
            plan.sql,
            r#"SELECT * FROM "COUNTRY_0001C" WHERE "change" > (SELECT COALESCE(MAX("change"), 0) FROM "COUNTRY_0001C") - $1 ORDER BY "change" LIMIT 100"#,
        );
        assert_eq!(plan.binds, vec![QueryValue::Int(10)]);
    }

    #[test]
    fn test_plan_changes_offset_zero_reads_from_start() {
        let plan = build_changes(&tables(), None, None, Some(0));
        assert_eq!(plan.sql, r#"SELECT * FROM "COUNTRY_0001C" ORDER BY "change""#);
    }

    #[test]
    fn test_plan_null_eq() {
        let plan = plan("eq(area,null)");
        assert!(plan.sql.contains(r#"main."area" IS NULL"#));
        assert!(plan.binds.is_empty());
    }
}

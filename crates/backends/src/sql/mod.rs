//! Read-only projection of external SQL sources into model shape.
//!
//! A model bound to an external resource reads rows from a foreign
//! table. The source filter declared on the model, enum membership
//! filters and the caller's query merge into one predicate tree, which
//! renders to SQL with backend-appropriate placeholders. Each row is
//! then projected: cell formulas evaluate, enum values translate,
//! primary keys synthesise surrogate `_id`s through the keymap, and
//! references resolve by level.

mod eval;

use serde_json::{Map, Value};
use sqlx::any::{AnyKind, AnyPool, AnyRow};
use sqlx::Row;
use uuid::Uuid;

use crate::query::{self, CompareOp, QueryValue, ResolvedQuery};
use crate::{Error, Result};
use keymap::KeyMap;
use manifest::{nested, DataType, Manifest, Model, Property};

type Json = Map<String, Value>;

/// One projected source column.
#[derive(Debug, Clone)]
struct Selected {
    place: String,
    prop: Property,
    column: String,
}

pub struct SqlSource {
    name: String,
    pool: AnyPool,
}

impl SqlSource {
    pub async fn connect(name: &str, dsn: &str) -> Result<SqlSource> {
        let pool = AnyPool::connect(dsn).await?;
        Ok(SqlSource {
            name: name.to_string(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort row count for progress reporting.
    pub async fn count_rows(&self, model: &Model) -> Result<i64> {
        let table = external_table(model)?;
        let row = sqlx::query(&format!(r#"SELECT count(*) FROM "{table}""#))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Read rows shaped as the model, applying the merged source
    /// filter and the caller's query. `after` resumes keyset
    /// pagination past the given page-property value.
    pub async fn getall(
        &self,
        manifest: &Manifest,
        model: &Model,
        keymap: &KeyMap,
        expr: Option<&rql::Expr>,
        after: Option<&Value>,
    ) -> Result<Vec<Json>> {
        let prepare = model.external.as_ref().and_then(|e| e.prepare.clone());
        let merged = rql::merge_formulas(prepare, expr.cloned());
        let query = query::resolve(model, merged.as_ref())?;

        let selected = selected_props(model);
        let (sql, binds) = build_select(model, &selected, &query, after, self.pool.any_kind())?;

        let mut fetch = sqlx::query(&sql);
        for value in &binds {
            fetch = bind_any(fetch, value);
        }
        let rows = fetch.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.project(manifest, model, keymap, &selected, row)?);
        }
        Ok(out)
    }

    /// Fetch one row by surrogate id: the id decodes back to the
    /// natural key through the keymap and the source is filtered on
    /// the primary key columns.
    pub async fn getone(
        &self,
        manifest: &Manifest,
        model: &Model,
        keymap: &KeyMap,
        id: Uuid,
    ) -> Result<Json> {
        let natural = keymap
            .decode(model.keymap_namespace(), id)
            .map_err(|_| manifest::Error::ItemDoesNotExist {
                model: model.model_type().to_string(),
                id: id.to_string(),
            })?;
        let external = model
            .external
            .as_ref()
            .ok_or_else(|| Error::UnpreparedModel {
                model: model.model_type().to_string(),
            })?;

        let key_values: Vec<Value> = match natural {
            Value::Array(items) => items,
            single => vec![single],
        };
        if key_values.len() != external.pkeys.len() {
            return Err(Error::Domain(manifest::Error::ItemDoesNotExist {
                model: model.model_type().to_string(),
                id: id.to_string(),
            }));
        }

        let selected = selected_props(model);
        let kind = self.pool.any_kind();
        let mut sql = format!(
            r#"SELECT {} FROM "{}""#,
            select_list(&selected),
            external.name,
        );
        let mut binds = Vec::new();
        let conds: Vec<String> = external
            .pkeys
            .iter()
            .zip(&key_values)
            .map(|(col, value)| {
                binds.push(json_to_query_value(value));
                format!(r#""{col}" = {}"#, placeholder(kind, binds.len()))
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));

        let mut fetch = sqlx::query(&sql);
        for value in &binds {
            fetch = bind_any(fetch, value);
        }
        let rows = fetch.fetch_all(&self.pool).await?;
        match rows.len() {
            0 => Err(Error::Domain(manifest::Error::ItemDoesNotExist {
                model: model.model_type().to_string(),
                id: id.to_string(),
            })),
            1 => self.project(manifest, model, keymap, &selected, &rows[0]),
            _ => Err(Error::Domain(manifest::Error::MultipleRowsFound {
                model: model.model_type().to_string(),
                id: id.to_string(),
            })),
        }
    }

    /// Project one source row into model shape.
    fn project(
        &self,
        manifest: &Manifest,
        model: &Model,
        keymap: &KeyMap,
        selected: &[Selected],
        row: &AnyRow,
    ) -> Result<Json> {
        // Raw cell values, keyed by place, before projection.
        let mut cells = Json::new();
        for (i, sel) in selected.iter().enumerate() {
            cells.insert(sel.place.clone(), decode_any(row, i, &sel.prop.dtype)?);
        }

        let mut flat = Json::new();
        for sel in selected {
            let mut value = cells
                .get(&sel.place)
                .cloned()
                .unwrap_or(Value::Null);

            if let Some(external) = &sel.prop.external {
                if let Some(prepare) = &external.prepare {
                    value = eval::eval_cell(prepare, &value, &cells)?;
                }
            }
            if let Some(members) = &sel.prop.enum_members {
                value = translate_enum(&sel.prop, members, value)?;
            }
            if let DataType::Ref { model: target, refprops } = &sel.prop.dtype {
                value = self.resolve_ref(manifest, keymap, &sel.prop, target, refprops, value)?;
            }
            flat.insert(sel.place.clone(), value);
        }

        // Synthesise the surrogate id from the natural key, and index
        // declared unique properties as alternate lookups.
        let id = self.generate_pk(model, keymap, &flat)?;

        let mut page_value = None;
        if let Some(page) = &model.page {
            page_value = flat.get(&page.prop).cloned();
        }

        let shaped = nested::nest(flat.into_iter().map(|(k, v)| (k, v)));
        let mut out = match shaped {
            Value::Object(map) => map,
            _ => Json::new(),
        };
        out.insert(
            "_type".to_string(),
            Value::String(model.model_type().to_string()),
        );
        if let Some(id) = id {
            out.insert("_id".to_string(), Value::String(id.to_string()));
        }
        if let Some(page_value) = page_value {
            out.insert("_page".to_string(), page_value);
        }
        Ok(out)
    }

    fn generate_pk(&self, model: &Model, keymap: &KeyMap, flat: &Json) -> Result<Option<Uuid>> {
        if model.primary_key.is_empty() {
            return Ok(None);
        }
        let values: Vec<Value> = model
            .primary_key
            .iter()
            .map(|place| flat.get(place).cloned().unwrap_or(Value::Null))
            .collect();
        let key = if values.len() == 1 {
            values.into_iter().next().expect("len is 1")
        } else {
            Value::Array(values)
        };
        let ns = model.keymap_namespace();
        let id = keymap.encode(ns, &key)?;

        for prop in model.properties.values() {
            if prop.unique && !model.primary_key.contains(&prop.place) {
                if let Some(value) = flat.get(&prop.place) {
                    if !value.is_null() {
                        keymap.encode_with_parent(
                            &format!("{ns}.{}", prop.place),
                            value,
                            Some(id),
                        )?;
                    }
                }
            }
        }
        Ok(Some(id))
    }

    /// Shape a reference by the property's level: identifiable levels
    /// store the surrogate key, lower levels keep the natural value
    /// under the referenced property's name.
    fn resolve_ref(
        &self,
        manifest: &Manifest,
        keymap: &KeyMap,
        prop: &Property,
        target: &manifest::ModelName,
        refprops: &[String],
        value: Value,
    ) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let identifiable = prop.level.map(|l| l.identifiable()).unwrap_or(true);
        if identifiable {
            let target_model = manifest.model(target.as_str())?;
            let id = keymap.encode(target_model.keymap_namespace(), &value)?;
            return Ok(serde_json::json!({ "_id": id.to_string() }));
        }
        if refprops.len() == 1 {
            let mut out = Json::new();
            out.insert(refprops[0].clone(), value);
            return Ok(Value::Object(out));
        }
        if refprops.len() > 1 {
            return Err(Error::Domain(manifest::Error::NotImplementedFeature {
                feature: format!(
                    "multiple refprops on low-level reference {:?}",
                    prop.place
                ),
            }));
        }
        let target_model = manifest.model(target.as_str())?;
        if target_model.primary_key.len() == 1 {
            let mut out = Json::new();
            out.insert(target_model.primary_key[0].clone(), value);
            return Ok(Value::Object(out));
        }
        let id = keymap.encode(target_model.keymap_namespace(), &value)?;
        Ok(serde_json::json!({ "_id": id.to_string() }))
    }
}

fn external_table(model: &Model) -> Result<&str> {
    model
        .external
        .as_ref()
        .map(|e| e.name.as_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::UnpreparedModel {
            model: model.model_type().to_string(),
        })
}

/// Flat scalar and ref properties carrying a source binding, in
/// manifest order.
fn selected_props(model: &Model) -> Vec<Selected> {
    model
        .flat_props()
        .iter()
        .filter_map(|(place, prop)| {
            let external = prop.external.as_ref()?;
            if matches!(
                prop.dtype,
                DataType::Object(..) | DataType::Array(..) | DataType::File
            ) {
                return None;
            }
            Some(Selected {
                place: place.clone(),
                prop: prop.clone(),
                column: external.name.clone(),
            })
        })
        .collect()
}

fn select_list(selected: &[Selected]) -> String {
    selected
        .iter()
        .map(|s| format!(r#""{}""#, s.column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_select(
    model: &Model,
    selected: &[Selected],
    query: &ResolvedQuery,
    after: Option<&Value>,
    kind: AnyKind,
) -> Result<(String, Vec<QueryValue>)> {
    let table = external_table(model)?;
    let mut sql = format!(r#"SELECT {} FROM "{table}""#, select_list(selected));
    let mut binds = Vec::new();
    let mut where_ = Vec::new();

    // Enum membership constrains source values to the declared keys.
    for sel in selected {
        if let Some(members) = &sel.prop.enum_members {
            let mut placeholders = Vec::new();
            for key in members.keys() {
                binds.push(enum_key_value(key));
                placeholders.push(placeholder(kind, binds.len()));
            }
            where_.push(format!(
                r#""{}" IN ({})"#,
                sel.column,
                placeholders.join(", "),
            ));
        }
    }

    for filter in &query.filters {
        let column = column_for(model, selected, &filter.place)?;
        where_.push(render_condition(&column, filter, kind, &mut binds)?);
    }

    if let (Some(page), Some(after)) = (&model.page, after) {
        let column = column_for(model, selected, &page.prop)?;
        binds.push(json_to_query_value(after));
        where_.push(format!(
            r#""{column}" > {}"#,
            placeholder(kind, binds.len()),
        ));
    }

    if !where_.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_.join(" AND "));
    }

    let mut order = Vec::new();
    for key in &query.sort {
        let column = column_for(model, selected, &key.place)?;
        order.push(format!(
            r#""{column}" {}"#,
            if key.descending { "DESC" } else { "ASC" },
        ));
    }
    if let Some(page) = &model.page {
        let column = column_for(model, selected, &page.prop)?;
        order.push(format!(r#""{column}" ASC"#));
    }
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    } else if let Some(page) = &model.page {
        sql.push_str(&format!(" LIMIT {}", page.size));
    }
    if let Some(offset) = query.offset {
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    Ok((sql, binds))
}

fn column_for(model: &Model, selected: &[Selected], place: &str) -> Result<String> {
    selected
        .iter()
        .find(|s| s.place == place)
        .map(|s| s.column.clone())
        .ok_or_else(|| {
            Error::Domain(manifest::Error::FieldNotInResource {
                model: model.model_type().to_string(),
                prop: place.to_string(),
            })
        })
}

fn render_condition(
    column: &str,
    filter: &crate::query::Filter,
    kind: AnyKind,
    binds: &mut Vec<QueryValue>,
) -> Result<String> {
    let is_string = matches!(
        filter.prop.dtype,
        DataType::String | DataType::Text | DataType::Uri
    );
    let expr = if is_string {
        format!(r#"lower("{column}")"#)
    } else {
        format!(r#""{column}""#)
    };

    if matches!(filter.value, QueryValue::Null) {
        return match filter.op {
            CompareOp::Eq => Ok(format!("{expr} IS NULL")),
            CompareOp::Ne => Ok(format!("{expr} IS NOT NULL")),
            _ => Err(Error::Domain(manifest::Error::InvalidValue {
                prop: filter.place.clone(),
                dtype: filter.prop.dtype.tag().to_string(),
                value: Value::Null,
            })),
        };
    }

    let mut value = match &filter.value {
        // Temporal and uuid values travel as ISO text on the wire
        // protocol shared by both source engines.
        QueryValue::Date(..)
        | QueryValue::Time(..)
        | QueryValue::DateTime(..)
        | QueryValue::Uuid(..) => QueryValue::Str(filter.value.to_text()),
        other => other.clone(),
    };
    if is_string {
        if let QueryValue::Str(s) = &value {
            value = QueryValue::Str(s.to_lowercase());
        }
    }
    match filter.op {
        CompareOp::Contains => {
            if let QueryValue::Str(s) = &value {
                value = QueryValue::Str(format!("%{}%", escape_like(s)));
            }
        }
        CompareOp::Startswith => {
            if let QueryValue::Str(s) = &value {
                value = QueryValue::Str(format!("{}%", escape_like(s)));
            }
        }
        _ => {}
    }
    binds.push(value);
    let placeholder = placeholder(kind, binds.len());

    Ok(match filter.op {
        CompareOp::Contains | CompareOp::Startswith => {
            format!(r#"{expr} LIKE {placeholder} ESCAPE '\'"#)
        }
        CompareOp::Ne => format!("({expr} <> {placeholder} OR {expr} IS NULL)"),
        op => format!("{expr} {} {placeholder}", op.sql()),
    })
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn placeholder(kind: AnyKind, n: usize) -> String {
    match kind {
        AnyKind::Postgres => format!("${n}"),
        _ => "?".to_string(),
    }
}

fn enum_key_value(key: &str) -> QueryValue {
    match key.parse::<i64>() {
        Ok(n) => QueryValue::Int(n),
        Err(_) => QueryValue::Str(key.to_string()),
    }
}

fn json_to_query_value(value: &Value) -> QueryValue {
    match value {
        Value::Null => QueryValue::Null,
        Value::Bool(b) => QueryValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                QueryValue::Int(i)
            } else {
                QueryValue::Num(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => QueryValue::Str(s.clone()),
        other => QueryValue::Str(other.to_string()),
    }
}

fn bind_any<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &QueryValue,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    match value {
        QueryValue::Null => query.bind(Option::<String>::None),
        QueryValue::Bool(b) => query.bind(*b),
        QueryValue::Int(i) => query.bind(*i),
        QueryValue::Num(n) => query.bind(*n),
        QueryValue::Str(s) => query.bind(s.clone()),
        other => query.bind(other.to_text()),
    }
}

/// Decode one cell of a source row by the property's declared type.
/// Source engines disagree on column affinities, so decoding falls
/// back across representations instead of trusting the driver type.
fn decode_any(row: &AnyRow, index: usize, dtype: &DataType) -> Result<Value> {
    let value = match dtype {
        DataType::Integer => row
            .try_get::<Option<i64>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        DataType::Number => match row.try_get::<Option<f64>, _>(index) {
            Ok(v) => v.map(Value::from).unwrap_or(Value::Null),
            Err(_) => row
                .try_get::<Option<i64>, _>(index)?
                .map(|i| Value::from(i as f64))
                .unwrap_or(Value::Null),
        },
        DataType::Boolean => match row.try_get::<Option<bool>, _>(index) {
            Ok(v) => v.map(Value::Bool).unwrap_or(Value::Null),
            Err(_) => row
                .try_get::<Option<i64>, _>(index)?
                .map(|i| Value::Bool(i != 0))
                .unwrap_or(Value::Null),
        },
        _ => match row.try_get::<Option<String>, _>(index) {
            Ok(v) => v.map(Value::String).unwrap_or(Value::Null),
            // Numeric key columns read as text for key synthesis.
            Err(_) => row
                .try_get::<Option<i64>, _>(index)?
                .map(Value::from)
                .unwrap_or(Value::Null),
        },
    };
    Ok(value)
}

fn translate_enum(
    prop: &Property,
    members: &std::collections::BTreeMap<String, Value>,
    value: Value,
) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    let key = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match members.get(&key) {
        Some(prepared) => Ok(prepared.clone()),
        None => Err(Error::Domain(manifest::Error::ValueNotInEnum {
            prop: prop.place.clone(),
            value,
        })),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use manifest::from_reader;

    const MANIFEST: &str = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,datasets/gov/example,,,,,,,,,,open,,,
,,sqlres,sqldb,,,sql,,,,,,,,
,,,,country,,,code,salis,,4,,,,
,,,,,code,string,,kodas,,,,,,
,,,,,title,string,,pavadinimas,,,,,,
,,,,,driving,string,,vairavimas,,,,,,
,,,,,,enum,,l,'left',,,,,
,,,,,,enum,,r,'right',,,,,
";

    fn manifest() -> Manifest {
        from_reader("test", MANIFEST.as_bytes()).unwrap()
    }

    #[test]
    fn test_build_select_merges_user_query_and_enum_filters() {
        let manifest = manifest();
        let model = manifest.model("datasets/gov/example/country").unwrap();
        let selected = selected_props(model);
        let expr = rql::parse("ne(code,'ee')&sort(+code)").unwrap();
        let query = query::resolve(model, Some(&expr)).unwrap();

        let (sql, binds) =
            build_select(model, &selected, &query, None, AnyKind::Sqlite).unwrap();
        assert_eq!(
            sql,
            r#"SELECT "kodas", "vairavimas", "pavadinimas" FROM "salis" WHERE "vairavimas" IN (?, ?) AND (lower("kodas") <> ? OR lower("kodas") IS NULL) ORDER BY "kodas" ASC"#,
        );
        assert_eq!(
            binds,
            vec![
                QueryValue::Str("l".into()),
                QueryValue::Str("r".into()),
                QueryValue::Str("ee".into()),
            ],
        );
    }

    #[test]
    fn test_translate_enum_strict() {
        let manifest = manifest();
        let model = manifest.model("datasets/gov/example/country").unwrap();
        let prop = model.flat_prop("driving").unwrap();
        let members = prop.enum_members.as_ref().unwrap();

        assert_eq!(
            translate_enum(prop, members, Value::String("l".into())).unwrap(),
            Value::String("left".into()),
        );
        let err = translate_enum(prop, members, Value::String("x".into())).unwrap_err();
        assert!(matches!(
            err,
            Error::Domain(manifest::Error::ValueNotInEnum { .. })
        ));
    }

    #[test]
    fn test_enum_key_value_prefers_integers() {
        assert_eq!(enum_key_value("7"), QueryValue::Int(7));
        assert_eq!(enum_key_value("l"), QueryValue::Str("l".into()));
    }
}

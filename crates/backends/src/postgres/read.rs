//! Read path of the internal store: single rows, streamed result sets,
//! and the change feed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::Row;
use uuid::Uuid;

use super::{sqlgen, PostgresStore, ReadTransaction, SqlQuery};
use crate::query::{QueryValue, ResolvedQuery};
use crate::{Error, Result};
use manifest::{DataType, Model, Property};

impl PostgresStore {
    /// Build the row plan for a resolved query.
    pub fn plan_getall(&self, model: &Model, query: &ResolvedQuery) -> Result<SqlQuery> {
        sqlgen::build_getall(self.tables(model)?, model, query)
    }

    /// Build the `count(*)` plan for a resolved query.
    pub fn plan_count(&self, model: &Model, query: &ResolvedQuery) -> Result<SqlQuery> {
        sqlgen::build_count(self.tables(model)?, model, query)
    }

    /// Stream the rows of a plan. The stream borrows the transaction's
    /// connection; dropping it midway releases the connection without
    /// draining the result set.
    pub fn fetch<'c>(
        &self,
        txn: &'c mut ReadTransaction,
        model: &'c Model,
        plan: &'c SqlQuery,
    ) -> BoxStream<'c, Result<Map<String, Value>>> {
        let mut query = sqlx::query(&plan.sql);
        for value in &plan.binds {
            query = bind(query, value);
        }
        query
            .fetch(txn.conn())
            .map(move |row| {
                row.map_err(Error::from)
                    .and_then(|row| decode_row(model, &row))
            })
            .boxed()
    }

    pub async fn count(&self, txn: &mut ReadTransaction, plan: &SqlQuery) -> Result<i64> {
        let mut query = sqlx::query(&plan.sql);
        for value in &plan.binds {
            query = bind(query, value);
        }
        let row = query.fetch_one(txn.conn()).await?;
        Ok(row.try_get(0)?)
    }

    /// Fetch a single row by id.
    pub async fn getone(
        &self,
        txn: &mut ReadTransaction,
        model: &Model,
        id: Uuid,
    ) -> Result<Map<String, Value>> {
        let tables = self.tables(model)?;
        let sql = format!(
            r#"SELECT main.* FROM "{}" AS main WHERE main."_id" = $1 LIMIT 2"#,
            tables.main,
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(txn.conn()).await?;
        match rows.len() {
            0 => Err(Error::Domain(manifest::Error::ItemDoesNotExist {
                model: model.model_type().to_string(),
                id: id.to_string(),
            })),
            1 => decode_row(model, &rows[0]),
            _ => Err(Error::Domain(manifest::Error::MultipleRowsFound {
                model: model.model_type().to_string(),
                id: id.to_string(),
            })),
        }
    }

    /// Read the change feed of a model.
    pub async fn changes(
        &self,
        txn: &mut ReadTransaction,
        model: &Model,
        id: Option<Uuid>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Map<String, Value>>> {
        let plan = sqlgen::build_changes(self.tables(model)?, id, limit, offset);
        let mut query = sqlx::query(&plan.sql);
        for value in &plan.binds {
            query = bind(query, value);
        }
        let rows = query.fetch_all(txn.conn()).await?;
        rows.iter().map(decode_change_row).collect()
    }
}

pub(crate) fn bind<'q>(
    query: Query<'q, sqlx::Postgres, PgArguments>,
    value: &QueryValue,
) -> Query<'q, sqlx::Postgres, PgArguments> {
    match value {
        QueryValue::Null => query.bind(Option::<String>::None),
        QueryValue::Bool(b) => query.bind(*b),
        QueryValue::Int(i) => query.bind(*i),
        QueryValue::Num(n) => query.bind(*n),
        QueryValue::Str(s) => query.bind(s.clone()),
        QueryValue::Date(d) => query.bind(*d),
        QueryValue::Time(t) => query.bind(*t),
        QueryValue::DateTime(dt) => query.bind(*dt),
        QueryValue::Uuid(u) => query.bind(*u),
    }
}

/// Decode a main-table row into wire shape: `_type`, `_id`,
/// `_revision`, then one entry per declared property.
pub(crate) fn decode_row(model: &Model, row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    out.insert(
        "_type".to_string(),
        Value::String(model.model_type().to_string()),
    );
    out.insert(
        "_id".to_string(),
        Value::String(row.try_get::<Uuid, _>("_id")?.to_string()),
    );
    out.insert(
        "_revision".to_string(),
        Value::String(row.try_get::<String, _>("_revision")?),
    );
    for prop in model.properties.values() {
        if matches!(prop.dtype, DataType::PrimaryKey) {
            continue;
        }
        out.insert(prop.name.clone(), decode_prop(row, prop)?);
    }
    Ok(out)
}

fn decode_prop(row: &PgRow, prop: &Property) -> Result<Value> {
    let name = prop.name.as_str();
    let value = match &prop.dtype {
        DataType::String | DataType::Text | DataType::Uri | DataType::Geometry => row
            .try_get::<Option<String>, _>(name)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        DataType::Integer => row
            .try_get::<Option<i64>, _>(name)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        DataType::Number => row
            .try_get::<Option<f64>, _>(name)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(name)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        DataType::Date => row
            .try_get::<Option<NaiveDate>, _>(name)?
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        DataType::Time => row
            .try_get::<Option<NaiveTime>, _>(name)?
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null),
        DataType::DateTime => row
            .try_get::<Option<NaiveDateTime>, _>(name)?
            .map(|dt| Value::String(iso_datetime(&dt)))
            .unwrap_or(Value::Null),
        DataType::Binary => row
            .try_get::<Option<Vec<u8>>, _>(name)?
            .map(|b| Value::String(base64::encode(b)))
            .unwrap_or(Value::Null),
        DataType::File | DataType::Object(..) | DataType::Array(..) => row
            .try_get::<Option<Value>, _>(name)?
            .unwrap_or(Value::Null),
        DataType::Ref { .. } => row
            .try_get::<Option<Uuid>, _>(name)?
            .map(|id| serde_json::json!({ "_id": id.to_string() }))
            .unwrap_or(Value::Null),
        DataType::PrimaryKey => Value::Null,
    };
    Ok(value)
}

fn decode_change_row(row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    out.insert("_change".to_string(), Value::from(row.try_get::<i64, _>("change")?));
    out.insert(
        "_revision".to_string(),
        Value::String(row.try_get::<String, _>("revision")?),
    );
    out.insert(
        "_transaction".to_string(),
        row.try_get::<Option<i64>, _>("transaction")?
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    out.insert(
        "_id".to_string(),
        Value::String(row.try_get::<Uuid, _>("id")?.to_string()),
    );
    out.insert(
        "_created".to_string(),
        Value::String(
            row.try_get::<DateTime<Utc>, _>("datetime")?
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        ),
    );
    out.insert(
        "_op".to_string(),
        Value::String(row.try_get::<String, _>("action")?),
    );
    if let Value::Object(data) = row.try_get::<Value, _>("data")? {
        for (k, v) in data {
            out.insert(k, v);
        }
    }
    Ok(out)
}

pub(crate) fn iso_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

//! Write path of the internal store: insert, update/patch, delete,
//! wipe, the lists mirror and the change log.
//!
//! Every operation runs inside a [`WriteTransaction`] and stamps its
//! transaction id on the rows it touches. Change-log entries are
//! append-only; updates never rewrite history.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use uuid::Uuid;

use super::{PostgresStore, WriteTransaction};
use crate::query::normalize_datetime;
use crate::{DataItem, Error, Result};
use manifest::nested;
use manifest::{Action, DataType, Model, Property};

type Json = Map<String, Value>;

impl PostgresStore {
    /// Insert a batch of items. Each item gets a fresh `_revision`, a
    /// surrogate `_id` unless one was supplied, a lists-table mirror,
    /// and an `insert` change entry.
    pub async fn insert(
        &self,
        txn: &mut WriteTransaction,
        model: &Model,
        items: Vec<DataItem>,
    ) -> Result<Vec<Json>> {
        let tables = self.tables(model)?.clone();
        let mut out = Vec::with_capacity(items.len());

        for item in items {
            let patch = normalize_patch(model, &item.patch)?;
            let id = patch_id(&patch)?.unwrap_or_else(Uuid::new_v4);
            let revision = new_revision();

            let columns = model_columns(model, &patch)?;
            for (prop, value) in &columns {
                if prop.unique {
                    self.check_unique(txn, &tables.main, model, prop, value, None)
                        .await?;
                }
            }

            let mut names = vec!["\"_id\"", "\"_revision\"", "\"_transaction\"", "\"_created\""]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            names.extend(columns.iter().map(|(p, _)| format!("\"{}\"", p.name)));
            let placeholders = (1..=names.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                r#"INSERT INTO "{}" ({}) VALUES ({placeholders})"#,
                tables.main,
                names.join(", "),
            );

            let mut query = sqlx::query(&sql)
                .bind(id)
                .bind(&revision)
                .bind(txn.id)
                .bind(Utc::now());
            for (prop, value) in &columns {
                query = bind_patch_value(query, prop, value)?;
            }
            query.execute(txn.conn()).await?;

            self.update_lists(txn, model, id, &patch, Action::Insert)
                .await?;
            self.append_change(txn, model, id, &revision, Action::Insert, &patch)
                .await?;

            out.push(result_row(model, id, &revision, &patch));
        }
        Ok(out)
    }

    /// Update or patch a batch of items with optimistic concurrency:
    /// the row must still carry the revision the caller read.
    pub async fn update(
        &self,
        txn: &mut WriteTransaction,
        model: &Model,
        items: Vec<DataItem>,
    ) -> Result<Vec<Json>> {
        let tables = self.tables(model)?.clone();
        let mut out = Vec::with_capacity(items.len());

        for item in items {
            let saved = item.saved.as_ref().ok_or_else(|| {
                Error::Domain(manifest::Error::ItemDoesNotExist {
                    model: model.model_type().to_string(),
                    id: String::new(),
                })
            })?;
            let id = patch_id(saved)?.ok_or_else(|| {
                Error::Domain(manifest::Error::ItemDoesNotExist {
                    model: model.model_type().to_string(),
                    id: String::new(),
                })
            })?;
            let saved_revision = saved
                .get("_revision")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let mut patch = normalize_patch(model, &item.patch)?;
            if item.action == Action::Patch {
                merge_nested_objects(model, saved, &mut patch);
            }
            let revision = new_revision();

            let columns = model_columns(model, &patch)?;
            for (prop, value) in &columns {
                // Reserved fields riding along in a patch body are used
                // for validation only and never checked for uniqueness.
                if prop.unique {
                    self.check_unique(txn, &tables.main, model, prop, value, Some(id))
                        .await?;
                }
            }

            let mut sets = vec![
                r#""_revision" = $1"#.to_string(),
                r#""_transaction" = $2"#.to_string(),
                r#""_updated" = $3"#.to_string(),
            ];
            let mut n = 3;
            for (prop, _) in &columns {
                n += 1;
                sets.push(format!(r#""{}" = ${n}"#, prop.name));
            }
            let sql = format!(
                r#"UPDATE "{}" SET {} WHERE "_id" = ${} AND "_revision" = ${}"#,
                tables.main,
                sets.join(", "),
                n + 1,
                n + 2,
            );

            let mut query = sqlx::query(&sql)
                .bind(&revision)
                .bind(txn.id)
                .bind(Utc::now());
            for (prop, value) in &columns {
                query = bind_patch_value(query, prop, value)?;
            }
            let result = query
                .bind(id)
                .bind(&saved_revision)
                .execute(txn.conn())
                .await?;

            match result.rows_affected() {
                0 => {
                    return Err(Error::RevisionMismatch {
                        model: model.model_type().to_string(),
                        id: id.to_string(),
                        expected: saved_revision,
                    })
                }
                1 => {}
                n => {
                    tracing::error!(model = model.model_type(), %id, rows = n, "update matched more than one row");
                    return Err(Error::Domain(manifest::Error::MultipleRowsFound {
                        model: model.model_type().to_string(),
                        id: id.to_string(),
                    }));
                }
            }

            // The mirror reflects the whole row, so overlay the patch
            // on the saved state before rebuilding it.
            let mut full = saved.clone();
            for (k, v) in &patch {
                full.insert(k.clone(), v.clone());
            }
            self.update_lists(txn, model, id, &full, item.action).await?;
            self.append_change(txn, model, id, &revision, item.action, &patch)
                .await?;

            out.push(result_row(model, id, &revision, &full));
        }
        Ok(out)
    }

    /// Delete a batch of items, their lists mirror included. The change
    /// log records the deletion and keeps prior history.
    pub async fn delete(
        &self,
        txn: &mut WriteTransaction,
        model: &Model,
        items: Vec<DataItem>,
    ) -> Result<()> {
        let tables = self.tables(model)?.clone();
        for item in items {
            let saved = item.saved.as_ref().ok_or_else(|| {
                Error::Domain(manifest::Error::ItemDoesNotExist {
                    model: model.model_type().to_string(),
                    id: String::new(),
                })
            })?;
            let id = patch_id(saved)?.ok_or_else(|| {
                Error::Domain(manifest::Error::ItemDoesNotExist {
                    model: model.model_type().to_string(),
                    id: String::new(),
                })
            })?;

            if let Some(lists) = &tables.lists {
                sqlx::query(&format!(r#"DELETE FROM "{lists}" WHERE "id" = $1"#))
                    .bind(id)
                    .execute(txn.conn())
                    .await?;
            }
            sqlx::query(&format!(
                r#"DELETE FROM "{}" WHERE "_id" = $1"#,
                tables.main,
            ))
            .bind(id)
            .execute(txn.conn())
            .await?;

            let revision = new_revision();
            self.append_change(txn, model, id, &revision, Action::Delete, &Json::new())
                .await?;
        }
        Ok(())
    }

    /// Truncate all three tables of a model: lists, changes, then main.
    pub async fn wipe(&self, txn: &mut WriteTransaction, model: &Model) -> Result<()> {
        let tables = self.tables(model)?.clone();
        if let Some(lists) = &tables.lists {
            sqlx::query(&format!(r#"DELETE FROM "{lists}""#))
                .execute(txn.conn())
                .await?;
        }
        sqlx::query(&format!(r#"DELETE FROM "{}""#, tables.changes))
            .execute(txn.conn())
            .await?;
        sqlx::query(&format!(r#"DELETE FROM "{}""#, tables.main))
            .execute(txn.conn())
            .await?;
        tracing::info!(model = model.model_type(), "wiped model");
        Ok(())
    }

    async fn check_unique(
        &self,
        txn: &mut WriteTransaction,
        main: &str,
        model: &Model,
        prop: &Property,
        value: &Value,
        exclude: Option<Uuid>,
    ) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let sql = match exclude {
            None => format!(r#"SELECT 1 FROM "{main}" WHERE "{}" = $1 LIMIT 1"#, prop.name),
            Some(..) => format!(
                r#"SELECT 1 FROM "{main}" WHERE "{}" = $1 AND "_id" <> $2 LIMIT 1"#,
                prop.name,
            ),
        };
        let mut query = sqlx::query(&sql);
        query = bind_patch_value(query, prop, value)?;
        if let Some(id) = exclude {
            query = query.bind(id);
        }
        if query.fetch_optional(txn.conn()).await?.is_some() {
            return Err(Error::Domain(manifest::Error::UniqueConstraint {
                model: model.model_type().to_string(),
                prop: prop.place.clone(),
            }));
        }
        Ok(())
    }

    /// Rebuild the lists mirror for one row: delete-then-insert, one
    /// row per array element.
    async fn update_lists(
        &self,
        txn: &mut WriteTransaction,
        model: &Model,
        id: Uuid,
        data: &Json,
        action: Action,
    ) -> Result<()> {
        let tables = self.tables(model)?.clone();
        let Some(lists) = &tables.lists else {
            return Ok(());
        };
        if action != Action::Insert {
            sqlx::query(&format!(r#"DELETE FROM "{lists}" WHERE "id" = $1"#))
                .bind(id)
                .execute(txn.conn())
                .await?;
        }
        let Some(only) = nested::lists_only(&Value::Object(strip_reserved(data))) else {
            return Ok(());
        };
        let sql = format!(
            r#"INSERT INTO "{lists}" ("transaction", "id", "key", "data") VALUES ($1, $2, $3, $4)"#,
        );
        for row in nested::list_rows(&only) {
            sqlx::query(&sql)
                .bind(txn.id)
                .bind(id)
                .bind(&row.key)
                .bind(Value::Object(row.data))
                .execute(txn.conn())
                .await?;
        }
        Ok(())
    }

    async fn append_change(
        &self,
        txn: &mut WriteTransaction,
        model: &Model,
        id: Uuid,
        revision: &str,
        action: Action,
        patch: &Json,
    ) -> Result<()> {
        let tables = self.tables(model)?;
        let sql = format!(
            r#"INSERT INTO "{}" ("revision", "transaction", "id", "datetime", "action", "data")
               VALUES ($1, $2, $3, $4, $5, $6)"#,
            tables.changes,
        );
        sqlx::query(&sql)
            .bind(revision)
            .bind(txn.id)
            .bind(id)
            .bind(Utc::now())
            .bind(action.as_str())
            .bind(Value::Object(strip_reserved(patch)))
            .execute(txn.conn())
            .await?;
        Ok(())
    }
}

fn new_revision() -> String {
    Uuid::new_v4().simple().to_string()
}

fn patch_id(data: &Json) -> Result<Option<Uuid>> {
    match data.get("_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some).map_err(|_| {
            Error::Domain(manifest::Error::InvalidValue {
                prop: "_id".to_string(),
                dtype: "pk".to_string(),
                value: Value::String(s.clone()),
            })
        }),
        Some(other) => Err(Error::Domain(manifest::Error::InvalidValue {
            prop: "_id".to_string(),
            dtype: "pk".to_string(),
            value: other.clone(),
        })),
    }
}

fn strip_reserved(data: &Json) -> Json {
    data.iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Pair each non-reserved patch field with its declared property.
/// Unknown fields are rejected, managed fields cannot be written.
fn model_columns<'a>(model: &'a Model, patch: &'a Json) -> Result<Vec<(&'a Property, &'a Value)>> {
    let mut columns = Vec::new();
    for (key, value) in patch {
        if key.starts_with('_') {
            continue;
        }
        let prop = model
            .properties
            .get(key)
            .ok_or_else(|| manifest::Error::FieldNotInResource {
                model: model.model_type().to_string(),
                prop: key.clone(),
            })?;
        if matches!(prop.dtype, DataType::PrimaryKey) {
            return Err(Error::Domain(manifest::Error::ManagedProperty {
                prop: key.clone(),
            }));
        }
        columns.push((prop, value));
    }
    Ok(columns)
}

/// Overlay semantics of PATCH for nested objects: the saved object is
/// copied first and patched keys overlay it, so untouched members
/// survive.
fn merge_nested_objects(model: &Model, saved: &Json, patch: &mut Json) {
    for prop in model.properties.values() {
        if !matches!(prop.dtype, DataType::Object(..)) {
            continue;
        }
        let (Some(Value::Object(saved_obj)), Some(Value::Object(patched))) =
            (saved.get(&prop.name), patch.get_mut(&prop.name))
        else {
            continue;
        };
        for (k, v) in saved_obj {
            if !patched.contains_key(k) {
                patched.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Normalise a patch for storage: datetime strings anywhere in the
/// tree convert to UTC with the offset dropped, so the main table, the
/// lists mirror and the change log all hold comparable values.
fn normalize_patch(model: &Model, patch: &Json) -> Result<Json> {
    let mut out = Json::new();
    for (key, value) in patch {
        if key.starts_with('_') {
            out.insert(key.clone(), value.clone());
            continue;
        }
        out.insert(key.clone(), normalize_value(model, key, value));
    }
    Ok(out)
}

fn normalize_value(model: &Model, place: &str, value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        normalize_value(model, &format!("{place}.{k}"), v),
                    )
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_value(model, place, item))
                .collect(),
        ),
        Value::String(s) => {
            let is_datetime = model
                .flat_prop(place)
                .map(|p| matches!(p.dtype, DataType::DateTime))
                .unwrap_or(false);
            if is_datetime {
                match normalize_datetime(s) {
                    Some(dt) => Value::String(super::read::iso_datetime(&dt)),
                    None => value.clone(),
                }
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

fn result_row(model: &Model, id: Uuid, revision: &str, data: &Json) -> Json {
    let mut out = Json::new();
    out.insert(
        "_type".to_string(),
        Value::String(model.model_type().to_string()),
    );
    out.insert("_id".to_string(), Value::String(id.to_string()));
    out.insert("_revision".to_string(), Value::String(revision.to_string()));
    for (k, v) in strip_reserved(data) {
        out.insert(k, v);
    }
    out
}

fn bind_patch_value<'q>(
    query: Query<'q, sqlx::Postgres, PgArguments>,
    prop: &Property,
    value: &Value,
) -> Result<Query<'q, sqlx::Postgres, PgArguments>> {
    let invalid = || {
        Error::Domain(manifest::Error::InvalidValue {
            prop: prop.place.clone(),
            dtype: prop.dtype.tag().to_string(),
            value: value.clone(),
        })
    };

    if value.is_null() {
        // A typed NULL; text is acceptable to every column type here
        // except the ones bound below, which get their own null.
        return Ok(match &prop.dtype {
            DataType::Integer => query.bind(Option::<i64>::None),
            DataType::Number => query.bind(Option::<f64>::None),
            DataType::Boolean => query.bind(Option::<bool>::None),
            DataType::Date => query.bind(Option::<chrono::NaiveDate>::None),
            DataType::Time => query.bind(Option::<chrono::NaiveTime>::None),
            DataType::DateTime => query.bind(Option::<chrono::NaiveDateTime>::None),
            DataType::Binary => query.bind(Option::<Vec<u8>>::None),
            DataType::File | DataType::Object(..) | DataType::Array(..) => {
                query.bind(Option::<Value>::None)
            }
            DataType::Ref { .. } => query.bind(Option::<Uuid>::None),
            _ => query.bind(Option::<String>::None),
        });
    }

    Ok(match &prop.dtype {
        DataType::String | DataType::Text | DataType::Uri | DataType::Geometry => {
            query.bind(value.as_str().ok_or_else(invalid)?.to_string())
        }
        DataType::Integer => query.bind(value.as_i64().ok_or_else(invalid)?),
        DataType::Number => query.bind(value.as_f64().ok_or_else(invalid)?),
        DataType::Boolean => query.bind(value.as_bool().ok_or_else(invalid)?),
        DataType::Date => {
            let date: chrono::NaiveDate = value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(invalid)?;
            query.bind(date)
        }
        DataType::Time => {
            let time: chrono::NaiveTime = value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(invalid)?;
            query.bind(time)
        }
        DataType::DateTime => {
            let dt = value
                .as_str()
                .and_then(normalize_datetime)
                .ok_or_else(invalid)?;
            query.bind(dt)
        }
        DataType::Binary => {
            let bytes = value
                .as_str()
                .and_then(|s| base64::decode(s).ok())
                .ok_or_else(invalid)?;
            query.bind(bytes)
        }
        DataType::File | DataType::Object(..) | DataType::Array(..) => query.bind(value.clone()),
        DataType::Ref { .. } => {
            let id: Uuid = match value {
                Value::String(s) => s.parse().map_err(|_| invalid())?,
                Value::Object(map) => map
                    .get("_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(invalid)?,
                _ => return Err(invalid()),
            };
            query.bind(id)
        }
        DataType::PrimaryKey => return Err(invalid()),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::IndexMap;
    use manifest::ModelName;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn model() -> Model {
        let mut model = Model::new(ModelName::new("event"));
        model.properties.insert(
            "when".into(),
            Property::new("when", "when", DataType::DateTime),
        );
        let mut meta = IndexMap::new();
        meta.insert(
            "seen".into(),
            Property::new("seen", "meta.seen", DataType::DateTime),
        );
        model.properties.insert(
            "meta".into(),
            Property::new("meta", "meta", DataType::Object(meta)),
        );
        model.link();
        model
    }

    #[test]
    fn test_normalize_patch_rewrites_nested_datetimes() {
        let model = model();
        let patch: Json = json!({
            "when": "2020-01-01T12:00:00+02:00",
            "meta": {"seen": "2020-06-01T00:30:00+03:00"},
        })
        .as_object()
        .unwrap()
        .clone();

        let normalized = normalize_patch(&model, &patch).unwrap();
        assert_eq!(normalized["when"], json!("2020-01-01T10:00:00"));
        assert_eq!(normalized["meta"]["seen"], json!("2020-05-31T21:30:00"));
    }

    #[test]
    fn test_merge_nested_objects_keeps_unpatched_members() {
        let model = model();
        let saved: Json = json!({"meta": {"seen": "a", "extra": "b"}})
            .as_object()
            .unwrap()
            .clone();
        let mut patch: Json = json!({"meta": {"seen": "c"}}).as_object().unwrap().clone();
        merge_nested_objects(&model, &saved, &mut patch);
        assert_eq!(
            Value::Object(patch),
            json!({"meta": {"seen": "c", "extra": "b"}}),
        );
    }

    #[test]
    fn test_model_columns_rejects_unknown_fields() {
        let model = model();
        let patch: Json = json!({"nope": 1}).as_object().unwrap().clone();
        let err = model_columns(&model, &patch).unwrap_err();
        assert!(matches!(
            err,
            Error::Domain(manifest::Error::FieldNotInResource { .. })
        ));
    }

    #[test]
    fn test_strip_reserved() {
        let data: Json = json!({"_id": "x", "_revision": "y", "code": "lt"})
            .as_object()
            .unwrap()
            .clone();
        let stripped = strip_reserved(&data);
        assert_eq!(Value::Object(stripped), json!({"code": "lt"}));
    }
}

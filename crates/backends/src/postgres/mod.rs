//! The internal relational store.
//!
//! Every internal model persists as a triple of tables: the main row
//! table, a lists side table mirroring array subtrees for search, and
//! an append-only change log. Table names derive from the qualified
//! model name folded to ASCII and truncated to the identifier limit,
//! made unique by a short id allocated through the process-wide table
//! registry, so the mapping is stable across restarts.

mod read;
mod sqlgen;
mod write;

pub use sqlgen::SqlQuery;

use std::collections::HashMap;

use chrono::Utc;
use sqlx::postgres::{PgConnection, PgPool};
use unicode_normalization::UnicodeNormalization;

use crate::{Error, Result};
use manifest::{DataType, Manifest, Model, Property};

// PostgreSQL identifier limit (NAMEDATALEN - 1).
const IDENTIFIER_LIMIT: usize = 63;

const MAIN_TABLE: char = 'M';
const LISTS_TABLE: char = 'L';
const CHANGES_TABLE: char = 'C';

// Internal metadata tables use plain names and integer identifiers.
const TABLE_REGISTRY: &str = "lode_table";
const TRANSACTION_TABLE: &str = "lode_transaction";

/// Table names backing one model.
#[derive(Debug, Clone)]
pub struct ModelTables {
    pub main: String,
    /// Present only when the model has array subtrees.
    pub lists: Option<String>,
    pub changes: String,
}

pub struct PostgresStore {
    pool: PgPool,
    tables: HashMap<String, ModelTables>,
}

impl PostgresStore {
    pub async fn connect(dsn: &str) -> Result<PostgresStore> {
        let pool = PgPool::connect(dsn).await?;
        Ok(PostgresStore {
            pool,
            tables: HashMap::new(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self, model: &Model) -> Result<&ModelTables> {
        self.tables
            .get(model.model_type())
            .ok_or_else(|| Error::UnpreparedModel {
                model: model.model_type().to_string(),
            })
    }

    /// Create the metadata tables and the table triple of every
    /// internal model. Existing tables are left untouched; there is no
    /// destructive auto-migration.
    pub async fn prepare(&mut self, manifest: &Manifest) -> Result<()> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{TABLE_REGISTRY}" (
                "_id"  BIGSERIAL PRIMARY KEY,
                "name" TEXT UNIQUE NOT NULL
            )"#,
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{TRANSACTION_TABLE}" (
                "_id"         BIGSERIAL PRIMARY KEY,
                "datetime"    TIMESTAMPTZ NOT NULL,
                "client_type" TEXT NOT NULL DEFAULT '',
                "client_id"   TEXT NOT NULL DEFAULT '',
                "errors"      BIGINT NOT NULL DEFAULT 0
            )"#,
        ))
        .execute(&self.pool)
        .await?;

        for model in manifest.models() {
            if model.external.is_some() {
                continue;
            }
            let table_id = self.table_id(model.model_type()).await?;
            let tables = ModelTables {
                main: table_name(model.model_type(), table_id, MAIN_TABLE),
                lists: model
                    .has_lists()
                    .then(|| table_name(model.model_type(), table_id, LISTS_TABLE)),
                changes: table_name(model.model_type(), table_id, CHANGES_TABLE),
            };
            self.create_model_tables(model, &tables).await?;
            tracing::debug!(
                model = model.model_type(),
                main = %tables.main,
                "prepared model tables",
            );
            self.tables.insert(model.model_type().to_string(), tables);
        }
        Ok(())
    }

    /// Allocate (or look up) the short table id for a qualified name.
    /// The insert is idempotent, so concurrent allocators converge on
    /// the same id.
    async fn table_id(&self, name: &str) -> Result<i64> {
        sqlx::query(&format!(
            r#"INSERT INTO "{TABLE_REGISTRY}" ("name") VALUES ($1) ON CONFLICT ("name") DO NOTHING"#,
        ))
        .bind(name)
        .execute(&self.pool)
        .await?;
        let id: i64 = sqlx::query_scalar(&format!(
            r#"SELECT "_id" FROM "{TABLE_REGISTRY}" WHERE "name" = $1"#,
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_model_tables(&self, model: &Model, tables: &ModelTables) -> Result<()> {
        let mut columns = vec![
            r#""_id" UUID PRIMARY KEY"#.to_string(),
            r#""_revision" TEXT NOT NULL"#.to_string(),
            format!(r#""_transaction" BIGINT REFERENCES "{TRANSACTION_TABLE}" ("_id")"#),
            r#""_created" TIMESTAMPTZ"#.to_string(),
            r#""_updated" TIMESTAMPTZ"#.to_string(),
        ];
        for prop in model.properties.values() {
            if let Some(ddl) = column_ddl(prop) {
                columns.push(ddl);
            }
        }
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" ({})"#,
            tables.main,
            columns.join(", "),
        ))
        .execute(&self.pool)
        .await?;

        if let Some(lists) = &tables.lists {
            sqlx::query(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{lists}" (
                    "transaction" BIGINT,
                    "id"          UUID NOT NULL,
                    "key"         TEXT NOT NULL,
                    "data"        JSONB NOT NULL
                )"#,
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                "change"      BIGSERIAL PRIMARY KEY,
                "revision"    TEXT NOT NULL,
                "transaction" BIGINT,
                "id"          UUID NOT NULL,
                "datetime"    TIMESTAMPTZ NOT NULL,
                "action"      TEXT NOT NULL,
                "data"        JSONB NOT NULL
            )"#,
            tables.changes,
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a read transaction: one pooled connection scoped to the
    /// request, released on drop.
    pub async fn read(&self) -> Result<ReadTransaction> {
        let conn = self.pool.acquire().await?;
        Ok(ReadTransaction { conn })
    }

    /// Open a write transaction. A row is inserted into the
    /// transaction table and its id stamps every write made within the
    /// scope. Dropping without [`WriteTransaction::commit`] rolls back.
    pub async fn write(&self) -> Result<WriteTransaction> {
        let mut txn = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(&format!(
            r#"INSERT INTO "{TRANSACTION_TABLE}" ("datetime") VALUES ($1) RETURNING "_id""#,
        ))
        .bind(Utc::now())
        .fetch_one(&mut *txn)
        .await?;
        Ok(WriteTransaction {
            id,
            txn,
            errors: 0,
        })
    }
}

pub struct ReadTransaction {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

impl ReadTransaction {
    pub(crate) fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

pub struct WriteTransaction {
    pub id: i64,
    pub errors: u64,
    txn: sqlx::Transaction<'static, sqlx::Postgres>,
}

impl WriteTransaction {
    pub(crate) fn conn(&mut self) -> &mut PgConnection {
        &mut self.txn
    }

    pub async fn commit(self) -> Result<()> {
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

/// Fold a qualified name into a PostgreSQL identifier: ASCII-fold,
/// collapse everything else to `_`, uppercase, truncate to leave room
/// for the `_{id:04}{kind}` suffix.
pub(crate) fn table_name(qn: &str, table_id: i64, kind: char) -> String {
    let folded: String = qn
        .nfkd()
        .filter(char::is_ascii)
        .collect::<String>()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let mut name = String::with_capacity(folded.len());
    for c in folded.chars() {
        if c == '_' && name.ends_with('_') {
            continue;
        }
        name.push(c);
    }
    name.truncate(IDENTIFIER_LIMIT - 6);
    let name = name.trim_matches('_');
    format!("{name}_{table_id:04}{kind}")
}

fn column_ddl(prop: &Property) -> Option<String> {
    let sql_type = match &prop.dtype {
        DataType::String | DataType::Text | DataType::Uri | DataType::Geometry => "TEXT",
        DataType::Integer => "BIGINT",
        DataType::Number => "DOUBLE PRECISION",
        DataType::Boolean => "BOOLEAN",
        DataType::Date => "DATE",
        DataType::Time => "TIME",
        // Normalised to UTC before writes, so no offset is stored.
        DataType::DateTime => "TIMESTAMP",
        DataType::Binary => "BYTEA",
        DataType::File | DataType::Object(..) | DataType::Array(..) => "JSONB",
        DataType::Ref { .. } => "UUID",
        DataType::PrimaryKey => return None,
    };
    Some(format!(r#""{}" {sql_type}"#, prop.name))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_name_folds_and_suffixes() {
        assert_eq!(
            table_name("datasets/gov/example/country", 7, MAIN_TABLE),
            "DATASETS_GOV_EXAMPLE_COUNTRY_0007M",
        );
        // Non-ASCII letters fold to their ASCII base where one exists.
        assert_eq!(table_name("šalis/ūkis", 12, LISTS_TABLE), "SALIS_UKIS_0012L");
    }

    #[test]
    fn test_table_name_respects_identifier_limit() {
        let qn: String = std::iter::repeat("very/long/segment/").take(20).collect();
        let name = table_name(&qn, 42, CHANGES_TABLE);
        assert!(name.len() <= IDENTIFIER_LIMIT, "{} > limit", name.len());
        assert!(name.ends_with("_0042C"));
    }

    #[test]
    fn test_table_names_with_shared_prefix_do_not_collide() {
        // Qualified names that truncate to the same prefix stay unique
        // through the allocated short id.
        let long: String = std::iter::repeat("segment/").take(30).collect();
        let a = table_name(&format!("{long}one"), 1, MAIN_TABLE);
        let b = table_name(&format!("{long}two"), 2, MAIN_TABLE);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_names_collide_free_via_short_id() {
        // Synthetic qualified names sharing one long prefix: the folded
        // prefix exhausts the identifier budget, so uniqueness rests
        // entirely on the short id suffix.
        let prefix: String = std::iter::repeat("x").take(80).collect();
        let names: std::collections::BTreeSet<String> = (0..10_000)
            .map(|i| table_name(&format!("{prefix}/{i}"), i, MAIN_TABLE))
            .collect();
        assert_eq!(names.len(), 10_000);
        assert!(names.iter().all(|n| n.len() <= IDENTIFIER_LIMIT));
    }
}

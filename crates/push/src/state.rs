//! The embedded push-state store.
//!
//! One table per model keeps, for every row ever offered to the
//! remote: its last accepted revision, the checksum of the last
//! attempted payload, when it was pushed, and whether the attempt
//! failed. A shared `_page` table stores keyset cursors so paginated
//! sources resume where they left off.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct StateRow {
    pub checksum: String,
    pub revision: Option<String>,
    pub error: bool,
}

pub struct State {
    conn: Mutex<rusqlite::Connection>,
}

impl State {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<State> {
        Self::init(rusqlite::Connection::open(path)?)
    }

    pub fn in_memory() -> anyhow::Result<State> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> anyhow::Result<State> {
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS "_page" (
                model    TEXT NOT NULL,
                property TEXT NOT NULL,
                value    TEXT NOT NULL,
                PRIMARY KEY (model, property)
            );"#,
        )?;
        Ok(State {
            conn: Mutex::new(conn),
        })
    }

    /// Create the per-model table if this is the first run for it.
    pub fn prepare_model(&self, model_type: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{model_type}" (
                id       TEXT PRIMARY KEY,
                revision TEXT,
                checksum TEXT NOT NULL,
                pushed   TEXT,
                error    INTEGER NOT NULL DEFAULT 0,
                data     TEXT
            );"#,
        ))?;
        Ok(())
    }

    /// All persisted rows of a model, keyed by id.
    pub fn load(&self, model_type: &str) -> anyhow::Result<BTreeMap<String, StateRow>> {
        let conn = self.conn.lock().expect("state lock");
        let mut stmt = conn.prepare(&format!(
            r#"SELECT id, checksum, revision, error FROM "{model_type}""#,
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                StateRow {
                    checksum: row.get(1)?,
                    revision: row.get(2)?,
                    error: row.get::<_, i64>(3)? != 0,
                },
            ))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (id, state) = row?;
            out.insert(id, state);
        }
        Ok(out)
    }

    /// Payloads of rows whose last attempt failed; retried first.
    pub fn error_payloads(&self, model_type: &str) -> anyhow::Result<Vec<(String, Value)>> {
        let conn = self.conn.lock().expect("state lock");
        let mut stmt = conn.prepare(&format!(
            r#"SELECT id, data FROM "{model_type}" WHERE error != 0 AND data IS NOT NULL"#,
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, data) = row?;
            if let Ok(payload) = serde_json::from_str(&data) {
                out.push((id, payload));
            }
        }
        Ok(out)
    }

    /// Record an accepted row: the remote's revision, the payload
    /// checksum, and a cleared error flag.
    pub fn commit(
        &self,
        model_type: &str,
        id: &str,
        revision: Option<&str>,
        checksum: &str,
        payload: &Value,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute(
            &format!(
                r#"INSERT INTO "{model_type}" (id, revision, checksum, pushed, error, data)
                   VALUES (?1, ?2, ?3, ?4, 0, ?5)
                   ON CONFLICT (id) DO UPDATE SET
                       revision = excluded.revision,
                       checksum = excluded.checksum,
                       pushed = excluded.pushed,
                       error = 0,
                       data = excluded.data"#,
            ),
            params![
                id,
                revision,
                checksum,
                Utc::now().to_rfc3339(),
                payload.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Record a failed row, keeping any previously accepted revision.
    pub fn mark_error(
        &self,
        model_type: &str,
        id: &str,
        checksum: &str,
        payload: &Value,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute(
            &format!(
                r#"INSERT INTO "{model_type}" (id, revision, checksum, pushed, error, data)
                   VALUES (?1, NULL, ?2, ?3, 1, ?4)
                   ON CONFLICT (id) DO UPDATE SET
                       checksum = excluded.checksum,
                       pushed = excluded.pushed,
                       error = 1,
                       data = excluded.data"#,
            ),
            params![id, checksum, Utc::now().to_rfc3339(), payload.to_string()],
        )?;
        Ok(())
    }

    /// Forget a row after its deletion was accepted by the remote.
    pub fn forget(&self, model_type: &str, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute(
            &format!(r#"DELETE FROM "{model_type}" WHERE id = ?1"#),
            params![id],
        )?;
        Ok(())
    }

    pub fn page_cursor(&self, model_type: &str, property: &str) -> anyhow::Result<Option<Value>> {
        let conn = self.conn.lock().expect("state lock");
        let value: Option<String> = conn
            .query_row(
                r#"SELECT value FROM "_page" WHERE model = ?1 AND property = ?2"#,
                params![model_type, property],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    pub fn set_page_cursor(
        &self,
        model_type: &str,
        property: &str,
        value: &Value,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute(
            r#"INSERT INTO "_page" (model, property, value) VALUES (?1, ?2, ?3)
               ON CONFLICT (model, property) DO UPDATE SET value = excluded.value"#,
            params![model_type, property, value.to_string()],
        )?;
        Ok(())
    }

    pub fn clear_page_cursor(&self, model_type: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("state lock");
        conn.execute(
            r#"DELETE FROM "_page" WHERE model = ?1"#,
            params![model_type],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_commit_then_skip_equal_checksum() {
        let state = State::in_memory().unwrap();
        state.prepare_model("country").unwrap();
        state
            .commit("country", "id-1", Some("r1"), "abc", &json!({"code": "lt"}))
            .unwrap();

        let rows = state.load("country").unwrap();
        assert_eq!(rows["id-1"].checksum, "abc");
        assert_eq!(rows["id-1"].revision.as_deref(), Some("r1"));
        assert!(!rows["id-1"].error);
    }

    #[test]
    fn test_mark_error_keeps_previous_revision() {
        let state = State::in_memory().unwrap();
        state.prepare_model("country").unwrap();
        state
            .commit("country", "id-1", Some("r1"), "abc", &json!({"code": "lt"}))
            .unwrap();
        state
            .mark_error("country", "id-1", "def", &json!({"code": "xx"}))
            .unwrap();

        let rows = state.load("country").unwrap();
        assert!(rows["id-1"].error);
        assert_eq!(rows["id-1"].checksum, "def");
        assert_eq!(rows["id-1"].revision.as_deref(), Some("r1"));

        let retries = state.error_payloads("country").unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].1, json!({"code": "xx"}));
    }

    #[test]
    fn test_forget() {
        let state = State::in_memory().unwrap();
        state.prepare_model("country").unwrap();
        state
            .commit("country", "id-1", Some("r1"), "abc", &json!({}))
            .unwrap();
        state.forget("country", "id-1").unwrap();
        assert!(state.load("country").unwrap().is_empty());
    }

    #[test]
    fn test_page_cursor_roundtrip() {
        let state = State::in_memory().unwrap();
        assert_eq!(state.page_cursor("country", "code").unwrap(), None);
        state
            .set_page_cursor("country", "code", &json!("lt"))
            .unwrap();
        assert_eq!(
            state.page_cursor("country", "code").unwrap(),
            Some(json!("lt")),
        );
        state.clear_page_cursor("country").unwrap();
        assert_eq!(state.page_cursor("country", "code").unwrap(), None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushstate.db");
        {
            let state = State::open(&path).unwrap();
            state.prepare_model("country").unwrap();
            state
                .commit("country", "id-1", Some("r1"), "abc", &json!({}))
                .unwrap();
        }
        let state = State::open(&path).unwrap();
        state.prepare_model("country").unwrap();
        assert_eq!(state.load("country").unwrap().len(), 1);
    }
}

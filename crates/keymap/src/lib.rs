//! Deterministic mapping from source natural keys to stable surrogate
//! identifiers and back.
//!
//! Surrogates are UUIDv5 digests over `(namespace, canonical key,
//! parent)`, so `encode` needs no read-modify-write cycle and two
//! processes encoding the same key independently agree on the result.
//! The embedded table exists for the reverse direction (`decode`) and
//! for auditing which keys have been seen.
//!
//! Keys are JSON values. Composite keys are arrays; a one-element array
//! canonicalises to its element, so `["lt"]` and `"lt"` are the same
//! key. A parent surrogate may be chained into the digest to keep
//! identifiers derived from composite base keys stable.

use std::path::Path;
use std::sync::Mutex;

use lazy_static::lazy_static;
use rusqlite::params;
use sha1::{Digest, Sha1};
use uuid::Uuid;

lazy_static! {
    // Fixed namespace for all keymap digests. Changing it would change
    // every surrogate identifier ever issued.
    static ref KEYMAP_NAMESPACE: Uuid =
        Uuid::new_v5(&Uuid::NAMESPACE_URL, b"urn:lode:keymap");
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("keymap store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("keymap key is not encodable: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("keymap {ns:?} has no entry for {id}")]
    UnknownId { ns: String, id: Uuid },
}

pub struct KeyMap {
    conn: Mutex<rusqlite::Connection>,
}

impl KeyMap {
    /// Open (or create) a keymap store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<KeyMap, Error> {
        let conn = rusqlite::Connection::open(path)?;
        Self::init(conn)
    }

    /// An in-memory keymap, used by tests and one-shot runs.
    pub fn in_memory() -> Result<KeyMap, Error> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<KeyMap, Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS keymap (
                ns    TEXT NOT NULL,
                hash  BLOB NOT NULL,
                key   TEXT NOT NULL,
                id    BLOB NOT NULL,
                PRIMARY KEY (ns, hash)
            );
            CREATE INDEX IF NOT EXISTS keymap_id ON keymap (ns, id);",
        )?;
        Ok(KeyMap {
            conn: Mutex::new(conn),
        })
    }

    /// Encode a natural key into its surrogate identifier.
    pub fn encode(&self, ns: &str, key: &serde_json::Value) -> Result<Uuid, Error> {
        self.encode_with_parent(ns, key, None)
    }

    /// Encode a natural key, chaining a parent surrogate into the
    /// digest. Used for identifiers derived from a base model's key.
    pub fn encode_with_parent(
        &self,
        ns: &str,
        key: &serde_json::Value,
        parent: Option<Uuid>,
    ) -> Result<Uuid, Error> {
        let key = canonical(key);
        let hash = key_hash(&key)?;

        let mut digest = Vec::with_capacity(ns.len() + 1 + hash.len() + 16);
        digest.extend_from_slice(ns.as_bytes());
        digest.push(0);
        digest.extend_from_slice(&hash);
        if let Some(parent) = parent {
            digest.extend_from_slice(parent.as_bytes());
        }
        let id = Uuid::new_v5(&KEYMAP_NAMESPACE, &digest);

        let conn = self.conn.lock().expect("keymap lock is never poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO keymap (ns, hash, key, id) VALUES (?1, ?2, ?3, ?4)",
            params![ns, hash.as_slice(), key.to_string(), id.as_bytes().as_slice()],
        )?;
        Ok(id)
    }

    /// Decode a surrogate identifier back into the natural key it was
    /// issued for.
    pub fn decode(&self, ns: &str, id: Uuid) -> Result<serde_json::Value, Error> {
        let conn = self.conn.lock().expect("keymap lock is never poisoned");
        let key: Option<String> = conn
            .query_row(
                "SELECT key FROM keymap WHERE ns = ?1 AND id = ?2",
                params![ns, id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let key = key.ok_or_else(|| Error::UnknownId {
            ns: ns.to_string(),
            id,
        })?;
        serde_json::from_str(&key).map_err(|_| Error::UnknownId {
            ns: ns.to_string(),
            id,
        })
    }
}

/// A one-element composite key is the same key as its element.
fn canonical(key: &serde_json::Value) -> serde_json::Value {
    match key {
        serde_json::Value::Array(items) if items.len() == 1 => items[0].clone(),
        other => other.clone(),
    }
}

fn key_hash(key: &serde_json::Value) -> Result<Vec<u8>, Error> {
    let packed = rmp_serde::to_vec(key)?;
    Ok(Sha1::digest(&packed).to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_is_deterministic_and_idempotent() {
        let keymap = KeyMap::in_memory().unwrap();
        let a = keymap.encode("country", &json!("lt")).unwrap();
        let b = keymap.encode("country", &json!("lt")).unwrap();
        assert_eq!(a, b);

        // A separate store issues the same identifier.
        let other = KeyMap::in_memory().unwrap();
        assert_eq!(other.encode("country", &json!("lt")).unwrap(), a);
    }

    #[test]
    fn test_encode_is_injective_per_namespace() {
        let keymap = KeyMap::in_memory().unwrap();
        let lt = keymap.encode("country", &json!("lt")).unwrap();
        let lv = keymap.encode("country", &json!("lv")).unwrap();
        let lt_city = keymap.encode("city", &json!("lt")).unwrap();
        assert_ne!(lt, lv);
        assert_ne!(lt, lt_city);
    }

    #[test]
    fn test_roundtrip() {
        let keymap = KeyMap::in_memory().unwrap();
        let id = keymap.encode("country", &json!(["lt", 42])).unwrap();
        assert_eq!(keymap.decode("country", id).unwrap(), json!(["lt", 42]));
    }

    #[test]
    fn test_singleton_tuple_canonicalises() {
        let keymap = KeyMap::in_memory().unwrap();
        let bare = keymap.encode("country", &json!("lt")).unwrap();
        let tuple = keymap.encode("country", &json!(["lt"])).unwrap();
        assert_eq!(bare, tuple);
    }

    #[test]
    fn test_parent_chaining_changes_identity() {
        let keymap = KeyMap::in_memory().unwrap();
        let parent = keymap.encode("country", &json!("lt")).unwrap();
        let plain = keymap.encode("city", &json!("vilnius")).unwrap();
        let chained = keymap
            .encode_with_parent("city", &json!("vilnius"), Some(parent))
            .unwrap();
        assert_ne!(plain, chained);

        // Chaining the same parent twice is stable.
        let again = keymap
            .encode_with_parent("city", &json!("vilnius"), Some(parent))
            .unwrap();
        assert_eq!(chained, again);
    }

    #[test]
    fn test_decode_unknown_id() {
        let keymap = KeyMap::in_memory().unwrap();
        let err = keymap.decode("country", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::UnknownId { .. }));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keymap.db");

        let id = {
            let keymap = KeyMap::open(&path).unwrap();
            keymap.encode("country", &json!("lt")).unwrap()
        };
        let keymap = KeyMap::open(&path).unwrap();
        assert_eq!(keymap.decode("country", id).unwrap(), json!("lt"));
        assert_eq!(keymap.encode("country", &json!("lt")).unwrap(), id);
    }
}

//! End-to-end reads from an external SQL source, using a throwaway
//! sqlite database as the foreign table.

use serde_json::{json, Value};

use backends::SqlSource;
use keymap::KeyMap;
use manifest::Manifest;

const MANIFEST: &str = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,datasets/gov/example,,,,,,,,,,open,,,
,,sqlres,sqldb,,,sql,,,,,,,,
,,,,country,,,code,salis,,4,,,,
,,,,,code,string,,kodas,,,,,,
,,,,,title,string,,pavadinimas,,,,,,
";

fn load_manifest() -> Manifest {
    manifest::from_reader("test", MANIFEST.as_bytes()).unwrap()
}

async fn seed_source(dir: &tempfile::TempDir) -> SqlSource {
    let path = dir.path().join("ext.db");
    let dsn = format!("sqlite://{}?mode=rwc", path.display());

    let source = SqlSource::connect("sqldb", &dsn).await.unwrap();
    // Reach the same database through a plain connection to seed it.
    let pool = sqlx::any::AnyPool::connect(&dsn).await.unwrap();
    sqlx::query("CREATE TABLE salis (kodas TEXT, pavadinimas TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    for (code, title) in [("lt", "Lithuania"), ("lv", "Latvia"), ("ee", "Estonia")] {
        sqlx::query("INSERT INTO salis (kodas, pavadinimas) VALUES (?, ?)")
            .bind(code)
            .bind(title)
            .execute(&pool)
            .await
            .unwrap();
    }
    source
}

#[tokio::test]
async fn test_getall_applies_user_filter() {
    let dir = tempfile::tempdir().unwrap();
    let source = seed_source(&dir).await;
    let manifest = load_manifest();
    let model = manifest.model("datasets/gov/example/country").unwrap();
    let keymap = KeyMap::in_memory().unwrap();

    let expr = rql::parse("ne(code,'ee')&sort(+code)").unwrap();
    let rows = source
        .getall(&manifest, model, &keymap, Some(&expr), None)
        .await
        .unwrap();

    let codes: Vec<&str> = rows
        .iter()
        .map(|r| r.get("code").and_then(Value::as_str).unwrap())
        .collect();
    assert_eq!(codes, vec!["lt", "lv"]);

    for row in &rows {
        assert_eq!(
            row.get("_type").and_then(Value::as_str),
            Some("datasets/gov/example/country"),
        );
        // Surrogate ids come from the keymap and parse as UUIDs.
        let id = row.get("_id").and_then(Value::as_str).unwrap();
        id.parse::<uuid::Uuid>().unwrap();
    }
}

#[tokio::test]
async fn test_surrogate_ids_are_stable_across_reads() {
    let dir = tempfile::tempdir().unwrap();
    let source = seed_source(&dir).await;
    let manifest = load_manifest();
    let model = manifest.model("datasets/gov/example/country").unwrap();
    let keymap = KeyMap::in_memory().unwrap();

    let first = source
        .getall(&manifest, model, &keymap, None, None)
        .await
        .unwrap();
    let second = source
        .getall(&manifest, model, &keymap, None, None)
        .await
        .unwrap();

    let ids = |rows: &[serde_json::Map<String, Value>]| -> Vec<String> {
        rows.iter()
            .map(|r| r.get("_id").and_then(Value::as_str).unwrap().to_string())
            .collect()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_getone_decodes_the_natural_key() {
    let dir = tempfile::tempdir().unwrap();
    let source = seed_source(&dir).await;
    let manifest = load_manifest();
    let model = manifest.model("datasets/gov/example/country").unwrap();
    let keymap = KeyMap::in_memory().unwrap();

    let rows = source
        .getall(&manifest, model, &keymap, None, None)
        .await
        .unwrap();
    let lt = rows
        .iter()
        .find(|r| r.get("code") == Some(&json!("lt")))
        .unwrap();
    let id: uuid::Uuid = lt
        .get("_id")
        .and_then(Value::as_str)
        .unwrap()
        .parse()
        .unwrap();

    let row = source.getone(&manifest, model, &keymap, id).await.unwrap();
    assert_eq!(row.get("code"), Some(&json!("lt")));
    assert_eq!(row.get("title"), Some(&json!("Lithuania")));

    // An id the keymap has never issued is simply not found.
    let missing = source
        .getone(&manifest, model, &keymap, uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_count_rows() {
    let dir = tempfile::tempdir().unwrap();
    let source = seed_source(&dir).await;
    let manifest = load_manifest();
    let model = manifest.model("datasets/gov/example/country").unwrap();
    assert_eq!(source.count_rows(model).await.unwrap(), 3);
}

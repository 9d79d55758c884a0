//! Internal-store tests against a live PostgreSQL.
//!
//! These run only when `LODE_TEST_DATABASE_URL` points at a database
//! the suite may create tables in; without it every test passes
//! vacuously so the suite stays hermetic by default.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use backends::{query, DataItem, PostgresStore};
use manifest::{Action, Manifest};

const MANIFEST: &str = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,,,,country,,,,,,,open,,,
,,,,,code,string unique,,,,,,,,
,,,,,title,string,,,,,,,,
,,,,,notes,array,,,,,,,,
,,,,,notes.note,string,,,,,,,,
";

fn load_manifest() -> Manifest {
    manifest::from_reader("test", MANIFEST.as_bytes()).unwrap()
}

async fn test_store() -> Option<(PostgresStore, Manifest)> {
    let Ok(dsn) = std::env::var("LODE_TEST_DATABASE_URL") else {
        eprintln!("LODE_TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let manifest = load_manifest();
    let mut store = PostgresStore::connect(&dsn).await.unwrap();
    store.prepare(&manifest).await.unwrap();
    Some((store, manifest))
}

fn item(value: Value) -> DataItem {
    DataItem::insert(value.as_object().unwrap().clone())
}

async fn wipe(store: &PostgresStore, manifest: &Manifest) {
    let model = manifest.model("country").unwrap();
    let mut txn = store.write().await.unwrap();
    store.wipe(&mut txn, model).await.unwrap();
    txn.commit().await.unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn test_insert_then_getone_roundtrip() {
    let Some((store, manifest)) = test_store().await else {
        return;
    };
    let model = manifest.model("country").unwrap();
    wipe(&store, &manifest).await;

    let mut txn = store.write().await.unwrap();
    let out = store
        .insert(
            &mut txn,
            model,
            vec![item(json!({"code": "er", "title": "Earth"}))],
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let id: Uuid = out[0]["_id"].as_str().unwrap().parse().unwrap();
    assert!(!out[0]["_revision"].as_str().unwrap().is_empty());

    let mut txn = store.read().await.unwrap();
    let row = store.getone(&mut txn, model, id).await.unwrap();
    assert_eq!(row["_type"], json!("country"));
    assert_eq!(row["code"], json!("er"));
    assert_eq!(row["title"], json!("Earth"));
    assert_eq!(row["_revision"], out[0]["_revision"]);
}

#[tokio::test]
#[serial_test::serial]
async fn test_sort_is_applied_and_strings_compare_case_insensitive() {
    let Some((store, manifest)) = test_store().await else {
        return;
    };
    let model = manifest.model("country").unwrap();
    wipe(&store, &manifest).await;

    let mut txn = store.write().await.unwrap();
    store
        .insert(
            &mut txn,
            model,
            vec![
                item(json!({"code": "lv", "title": "LATVIA"})),
                item(json!({"code": "lt", "title": "Lithuania"})),
            ],
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let expr = rql::parse("sort(+code)").unwrap();
    let resolved = query::resolve(model, Some(&expr)).unwrap();
    let plan = store.plan_getall(model, &resolved).unwrap();
    let mut txn = store.read().await.unwrap();
    use futures::TryStreamExt;
    let rows: Vec<Map<String, Value>> = store
        .fetch(&mut txn, model, &plan)
        .try_collect()
        .await
        .unwrap();
    let codes: Vec<&str> = rows.iter().map(|r| r["code"].as_str().unwrap()).collect();
    assert_eq!(codes, vec!["lt", "lv"]);
    drop(txn);

    // Lower-cased value matches the upper-cased row.
    let expr = rql::parse("eq(title,'latvia')").unwrap();
    let resolved = query::resolve(model, Some(&expr)).unwrap();
    let plan = store.plan_getall(model, &resolved).unwrap();
    let mut txn = store.read().await.unwrap();
    let rows: Vec<Map<String, Value>> = store
        .fetch(&mut txn, model, &plan)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["code"], json!("lv"));
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_bumps_revision_and_change_log_orders_actions() {
    let Some((store, manifest)) = test_store().await else {
        return;
    };
    let model = manifest.model("country").unwrap();
    wipe(&store, &manifest).await;

    let mut txn = store.write().await.unwrap();
    let out = store
        .insert(&mut txn, model, vec![item(json!({"code": "lt"}))])
        .await
        .unwrap();
    txn.commit().await.unwrap();
    let id: Uuid = out[0]["_id"].as_str().unwrap().parse().unwrap();

    let mut txn = store.write().await.unwrap();
    let updated = store
        .update(
            &mut txn,
            model,
            vec![DataItem {
                action: Action::Patch,
                patch: json!({"title": "Lithuania"}).as_object().unwrap().clone(),
                saved: Some(out[0].clone()),
            }],
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();
    assert_ne!(updated[0]["_revision"], out[0]["_revision"]);

    // A second update against the stale revision is a conflict.
    let mut txn = store.write().await.unwrap();
    let conflict = store
        .update(
            &mut txn,
            model,
            vec![DataItem {
                action: Action::Patch,
                patch: json!({"title": "X"}).as_object().unwrap().clone(),
                saved: Some(out[0].clone()),
            }],
        )
        .await;
    assert!(matches!(
        conflict,
        Err(backends::Error::RevisionMismatch { .. })
    ));
    txn.rollback().await.unwrap();

    let mut txn = store.read().await.unwrap();
    let changes = store
        .changes(&mut txn, model, Some(id), Some(100), Some(0))
        .await
        .unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0]["_op"], json!("insert"));
    assert_eq!(changes[1]["_op"], json!("patch"));
    assert!(changes[0]["_change"].as_i64() < changes[1]["_change"].as_i64());
    // The latest change carries the row's current revision.
    assert_eq!(changes[1]["_revision"], updated[0]["_revision"]);
}

#[tokio::test]
#[serial_test::serial]
async fn test_lists_mirror_counts_leaf_values() {
    let Some((store, manifest)) = test_store().await else {
        return;
    };
    let model = manifest.model("country").unwrap();
    wipe(&store, &manifest).await;

    let mut txn = store.write().await.unwrap();
    let out = store
        .insert(
            &mut txn,
            model,
            vec![item(json!({
                "code": "lt",
                "notes": [{"note": "a"}, {"note": "b"}, {"note": "c"}],
            }))],
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();
    let id: Uuid = out[0]["_id"].as_str().unwrap().parse().unwrap();

    // Search through the lists table.
    let expr = rql::parse("eq(notes.note,'B')").unwrap();
    let resolved = query::resolve(model, Some(&expr)).unwrap();
    let plan = store.plan_getall(model, &resolved).unwrap();
    let mut txn = store.read().await.unwrap();
    use futures::TryStreamExt;
    let rows: Vec<Map<String, Value>> = store
        .fetch(&mut txn, model, &plan)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!(id.to_string()));

    // `ne` matches rows lacking the value, including rows with no
    // notes at all.
    drop(txn);
    let mut txn = store.write().await.unwrap();
    store
        .insert(&mut txn, model, vec![item(json!({"code": "lv"}))])
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let expr = rql::parse("ne(notes.note,'b')").unwrap();
    let resolved = query::resolve(model, Some(&expr)).unwrap();
    let plan = store.plan_getall(model, &resolved).unwrap();
    let mut txn = store.read().await.unwrap();
    let rows: Vec<Map<String, Value>> = store
        .fetch(&mut txn, model, &plan)
        .try_collect()
        .await
        .unwrap();
    // Only the row without a matching note: lv (no notes key at all).
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["code"], json!("lv"));
}

#[tokio::test]
#[serial_test::serial]
async fn test_unique_constraint() {
    let Some((store, manifest)) = test_store().await else {
        return;
    };
    let model = manifest.model("country").unwrap();
    wipe(&store, &manifest).await;

    let mut txn = store.write().await.unwrap();
    store
        .insert(&mut txn, model, vec![item(json!({"code": "lt"}))])
        .await
        .unwrap();
    let dup = store
        .insert(&mut txn, model, vec![item(json!({"code": "lt"}))])
        .await;
    assert!(matches!(
        dup,
        Err(backends::Error::Domain(
            manifest::Error::UniqueConstraint { .. }
        ))
    ));
}

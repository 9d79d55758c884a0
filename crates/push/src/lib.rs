//! One-way replication of dataset rows into a remote instance of the
//! same service.
//!
//! The pipeline reads rows from a source backend, projects each into a
//! canonical upsert payload, drops rows whose checksum matches the
//! persisted push state, batches the rest into byte-budgeted JSON
//! envelopes, POSTs them, correlates the response positionally, and
//! commits accepted revisions back to the state store. Models are
//! visited in reference order so inserts never dangle; deletions of
//! rows that disappeared from the source run afterwards in reverse
//! order.

mod checksum;
mod chunk;
mod client;
mod state;

pub use checksum::row_checksum;
pub use client::{ClientCredentials, Credentials, RemoteClient};
pub use state::{State, StateRow};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};

use backends::{PostgresStore, SqlSource};
use chunk::Chunker;
use keymap::KeyMap;
use manifest::{Manifest, Model};

type Json = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read from the service's own relational store.
    Internal,
    /// Read from the external SQL sources bound in the manifest.
    External,
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub dataset: Option<String>,
    pub mode: Mode,
    /// Byte budget per POST body.
    pub chunk_size: usize,
    /// Absolute wall-clock budget for the run.
    pub stop_time: Option<Duration>,
    /// Stop after offering this many rows to the remote.
    pub stop_row: Option<u64>,
    /// Abort the run once this many rows have failed.
    pub max_errors: u64,
    pub stop_on_error: bool,
    pub no_progress: bool,
}

impl Default for PushOptions {
    fn default() -> PushOptions {
        PushOptions {
            dataset: None,
            mode: Mode::External,
            chunk_size: 1024 * 1024,
            stop_time: None,
            stop_row: None,
            max_errors: 50,
            stop_on_error: false,
            no_progress: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PushStats {
    /// Rows accepted by the remote.
    pub sent: u64,
    /// Rows dropped because their checksum matched the stored state.
    pub skipped: u64,
    /// Rows whose attempt failed.
    pub errors: u64,
    /// Delete operations accepted by the remote.
    pub deleted: u64,
    /// POST requests made.
    pub posts: u64,
}

/// Where push reads its rows from.
pub enum PushBackend<'a> {
    Internal(&'a PostgresStore),
    /// External SQL sources, keyed by the backend name resources bind.
    External(&'a HashMap<String, SqlSource>),
}

/// One row moving through the pipeline.
#[derive(Debug, Clone)]
struct PushRow {
    id: String,
    payload: Value,
    checksum: String,
    /// This row deletes instead of upserting.
    delete: bool,
}

struct Budget {
    started: Instant,
    stop_time: Option<Duration>,
    stop_row: Option<u64>,
    offered: u64,
    stopped: bool,
}

impl Budget {
    fn new(options: &PushOptions) -> Budget {
        Budget {
            started: Instant::now(),
            stop_time: options.stop_time,
            stop_row: options.stop_row,
            offered: 0,
            stopped: false,
        }
    }

    /// Account one offered row; flips `stopped` once a budget is
    /// exhausted. The current row still ships, the next one does not.
    fn offer(&mut self) {
        self.offered += 1;
        if let Some(stop_row) = self.stop_row {
            if self.offered >= stop_row {
                self.stopped = true;
            }
        }
        if let Some(stop_time) = self.stop_time {
            if self.started.elapsed() > stop_time {
                self.stopped = true;
            }
        }
    }
}

struct ErrorCounter {
    errors: u64,
    max_errors: u64,
    stop_on_error: bool,
}

impl ErrorCounter {
    fn record(&mut self, count: u64) -> anyhow::Result<()> {
        self.errors += count;
        if self.stop_on_error && self.errors > 0 {
            anyhow::bail!("stopping on first error");
        }
        if self.errors > self.max_errors {
            anyhow::bail!(
                "aborting push after {} row errors (limit {})",
                self.errors,
                self.max_errors,
            );
        }
        Ok(())
    }
}

/// Run a push end to end.
pub async fn push(
    manifest: &Manifest,
    backend: PushBackend<'_>,
    keymap: &KeyMap,
    client: &RemoteClient,
    state: &State,
    options: &PushOptions,
) -> anyhow::Result<PushStats> {
    let models = select_models(manifest, options)?;
    let models = manifest.sort_models_by_refs(&models);

    let progress = make_progress(manifest, &backend, &models, options).await;
    let mut budget = Budget::new(options);
    let mut counter = ErrorCounter {
        errors: 0,
        max_errors: options.max_errors,
        stop_on_error: options.stop_on_error,
    };
    let mut stats = PushStats::default();
    let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for model in &models {
        if budget.stopped {
            break;
        }
        let observed = push_model(
            manifest, &backend, keymap, client, state, model, options, &mut budget,
            &mut counter, &mut stats, &progress,
        )
        .await
        .with_context(|| format!("pushing model {}", model.model_type()))?;
        seen.insert(model.model_type().to_string(), observed);
    }

    // A truncated run has not observed the full source, so absence
    // proves nothing; deletions only run after complete scans.
    if !budget.stopped {
        for model in models.iter().rev() {
            push_deletes(client, state, model, &seen, &mut counter, &mut stats)
                .await
                .with_context(|| format!("deleting from model {}", model.model_type()))?;
        }
    }

    progress.finish_and_clear();
    tracing::info!(
        sent = stats.sent,
        skipped = stats.skipped,
        errors = stats.errors,
        deleted = stats.deleted,
        posts = stats.posts,
        "push finished",
    );
    Ok(stats)
}

fn select_models<'a>(
    manifest: &'a Manifest,
    options: &PushOptions,
) -> anyhow::Result<Vec<&'a Model>> {
    if let Some(dataset) = &options.dataset {
        // Fail early on a dataset the manifest does not know.
        manifest.dataset(dataset)?;
    }
    let models: Vec<&Model> = manifest
        .models()
        .filter(|m| match &options.dataset {
            Some(dataset) => m.dataset.as_deref() == Some(dataset.as_str()),
            None => m.dataset.is_some(),
        })
        .filter(|m| match options.mode {
            Mode::External => m.external.is_some(),
            Mode::Internal => m.external.is_none(),
        })
        .collect();
    Ok(models)
}

async fn make_progress(
    manifest: &Manifest,
    backend: &PushBackend<'_>,
    models: &[&Model],
    options: &PushOptions,
) -> ProgressBar {
    if options.no_progress {
        return ProgressBar::hidden();
    }
    let mut total = 0u64;
    for model in models {
        // Counting is best-effort; a source that cannot count still
        // pushes, just without a total.
        let count = match backend {
            PushBackend::External(sources) => match resolve_source(manifest, model, sources) {
                Ok(source) => source.count_rows(model).await.ok(),
                Err(_) => None,
            },
            PushBackend::Internal(..) => None,
        };
        match count {
            Some(count) => total += count.max(0) as u64,
            None => return ProgressBar::new_spinner().with_message("PUSH"),
        }
    }
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("PUSH {bar:40} {pos}/{len} {msg}")
            .expect("static template is valid"),
    );
    bar
}

/// The configured SQL source a model reads through.
fn resolve_source<'a>(
    manifest: &Manifest,
    model: &Model,
    sources: &'a HashMap<String, SqlSource>,
) -> anyhow::Result<&'a SqlSource> {
    let dataset = model
        .dataset
        .as_ref()
        .map(|d| manifest.dataset(d.as_str()))
        .transpose()?
        .with_context(|| format!("model {} has no dataset", model.model_type()))?;
    let resource = model
        .resource
        .as_ref()
        .and_then(|r| dataset.resources.get(r))
        .with_context(|| format!("model {} has no resource", model.model_type()))?;
    sources
        .get(&resource.backend)
        .with_context(|| format!("no source configured for backend {:?}", resource.backend))
}

#[allow(clippy::too_many_arguments)]
async fn push_model(
    manifest: &Manifest,
    backend: &PushBackend<'_>,
    keymap: &KeyMap,
    client: &RemoteClient,
    state: &State,
    model: &Model,
    options: &PushOptions,
    budget: &mut Budget,
    counter: &mut ErrorCounter,
    stats: &mut PushStats,
    progress: &ProgressBar,
) -> anyhow::Result<BTreeSet<String>> {
    let model_type = model.model_type();
    state.prepare_model(model_type)?;
    let known = state.load(model_type)?;
    let mut observed = BTreeSet::new();
    let mut chunker = Chunker::new(options.chunk_size);

    // Rows whose previous attempt failed retry first, from the payload
    // recorded at the time.
    for (id, payload) in state.error_payloads(model_type)? {
        let checksum = known
            .get(&id)
            .map(|s| s.checksum.clone())
            .unwrap_or_default();
        let row = PushRow {
            id,
            payload,
            checksum,
            delete: false,
        };
        enqueue(client, state, model_type, &mut chunker, row, counter, stats).await?;
    }

    let page_prop = model.page.as_ref().map(|p| p.prop.clone());
    let mut cursor = match &page_prop {
        Some(prop) => state.page_cursor(model_type, prop)?,
        None => None,
    };

    loop {
        let rows = read_page(manifest, backend, keymap, model, cursor.as_ref()).await?;
        let page_len = rows.len();
        let mut last_page_value = None;

        for row in rows {
            progress.inc(1);
            let Some(id) = row.get("_id").and_then(Value::as_str).map(str::to_string) else {
                tracing::warn!(model = model_type, "source row has no id, skipped");
                continue;
            };
            if let Some(value) = row.get("_page") {
                last_page_value = Some(value.clone());
            }
            observed.insert(id.clone());

            let payload = project(model_type, &id, &row);
            let checksum = row_checksum(payload.as_object().expect("payload is an object"))?;
            if let Some(saved) = known.get(&id) {
                if saved.checksum == checksum && !saved.error {
                    stats.skipped += 1;
                    continue;
                }
            }

            let row = PushRow {
                id,
                payload,
                checksum,
                delete: false,
            };
            enqueue(client, state, model_type, &mut chunker, row, counter, stats).await?;
            budget.offer();
            if budget.stopped {
                break;
            }
        }

        // Flush before the cursor moves so an interrupt never skips
        // rows that were scanned but not yet sent.
        if let Some(prop) = &page_prop {
            if let Some((body, rows)) = chunker.flush() {
                send_batch(client, state, model_type, body, rows, counter, stats).await?;
            }
            if let Some(value) = last_page_value {
                state.set_page_cursor(model_type, prop, &value)?;
                cursor = Some(value);
            }
            if budget.stopped || page_len < model.page.as_ref().map(|p| p.size).unwrap_or(0) {
                break;
            }
        } else {
            break;
        }
    }

    if let Some((body, rows)) = chunker.finish() {
        send_batch(client, state, model_type, body, rows, counter, stats).await?;
    }

    // A completed scan starts over next run; a truncated one resumes.
    if page_prop.is_some() && !budget.stopped {
        state.clear_page_cursor(model_type)?;
    }
    Ok(observed)
}

async fn read_page(
    manifest: &Manifest,
    backend: &PushBackend<'_>,
    keymap: &KeyMap,
    model: &Model,
    cursor: Option<&Value>,
) -> anyhow::Result<Vec<Json>> {
    match backend {
        PushBackend::External(sources) => {
            let source = resolve_source(manifest, model, sources)?;
            Ok(source
                .getall(manifest, model, keymap, None, cursor)
                .await?)
        }
        PushBackend::Internal(store) => {
            let query = backends::query::ResolvedQuery::default();
            let plan = store.plan_getall(model, &query)?;
            let mut txn = store.read().await?;
            let rows: Vec<Json> = store.fetch(&mut txn, model, &plan).try_collect().await?;
            Ok(rows)
        }
    }
}

/// Project a source row into the canonical push payload.
fn project(model_type: &str, id: &str, row: &Json) -> Value {
    let mut payload = Json::new();
    payload.insert("_op".to_string(), Value::String("upsert".to_string()));
    payload.insert("_type".to_string(), Value::String(model_type.to_string()));
    payload.insert("_id".to_string(), Value::String(id.to_string()));
    payload.insert(
        "_where".to_string(),
        Value::String(rql::unparse(&rql::Expr::eq_id(id))),
    );
    for (key, value) in row {
        if !key.starts_with('_') {
            payload.insert(key.clone(), value.clone());
        }
    }
    Value::Object(payload)
}

fn delete_payload(model_type: &str, id: &str) -> Value {
    serde_json::json!({
        "_op": "delete",
        "_type": model_type,
        "_where": rql::unparse(&rql::Expr::eq_id(id)),
    })
}

async fn enqueue(
    client: &RemoteClient,
    state: &State,
    model_type: &str,
    chunker: &mut Chunker<PushRow>,
    row: PushRow,
    counter: &mut ErrorCounter,
    stats: &mut PushStats,
) -> anyhow::Result<()> {
    let encoded = row.payload.to_string();
    if let Some((body, rows)) = chunker.push(&encoded, row) {
        send_batch(client, state, model_type, body, rows, counter, stats).await?;
    }
    Ok(())
}

/// POST one envelope and commit per-row outcomes.
///
/// The response `_data` must match the batch positionally: same
/// length, same ids in the same order. Any mismatch distrusts the
/// whole response and marks every row failed.
async fn send_batch(
    client: &RemoteClient,
    state: &State,
    model_type: &str,
    body: String,
    rows: Vec<PushRow>,
    counter: &mut ErrorCounter,
    stats: &mut PushStats,
) -> anyhow::Result<()> {
    stats.posts += 1;
    let received = match client.send_chunk(body).await {
        Ok(received) => received,
        Err(err) => {
            tracing::error!(model = model_type, %err, "chunk transport failed");
            mark_batch_failed(state, model_type, &rows)?;
            stats.errors += rows.len() as u64;
            return counter.record(rows.len() as u64);
        }
    };

    if received.len() != rows.len() {
        tracing::error!(
            model = model_type,
            sent = rows.len(),
            received = received.len(),
            "response length does not match batch",
        );
        mark_batch_failed(state, model_type, &rows)?;
        stats.errors += rows.len() as u64;
        return counter.record(rows.len() as u64);
    }
    for (row, item) in rows.iter().zip(&received) {
        let received_id = item.get("_id").and_then(Value::as_str);
        if !row.delete && received_id != Some(row.id.as_str()) {
            tracing::error!(
                model = model_type,
                sent_id = %row.id,
                received_id = ?received_id,
                "response id does not correlate with batch",
            );
            mark_batch_failed(state, model_type, &rows)?;
            stats.errors += rows.len() as u64;
            return counter.record(rows.len() as u64);
        }
    }

    let mut failed = 0u64;
    for (row, item) in rows.iter().zip(&received) {
        if let Some(errors) = item.get("_errors") {
            tracing::error!(
                model = model_type,
                id = %row.id,
                errors = %errors,
                payload = %row.payload,
                "remote rejected row",
            );
            state.mark_error(model_type, &row.id, &row.checksum, &row.payload)?;
            failed += 1;
            continue;
        }
        if row.delete {
            state.forget(model_type, &row.id)?;
            stats.deleted += 1;
        } else {
            let revision = item.get("_revision").and_then(Value::as_str);
            state.commit(model_type, &row.id, revision, &row.checksum, &row.payload)?;
            stats.sent += 1;
        }
    }
    stats.errors += failed;
    if failed > 0 {
        counter.record(failed)?;
    }
    Ok(())
}

fn mark_batch_failed(state: &State, model_type: &str, rows: &[PushRow]) -> anyhow::Result<()> {
    for row in rows {
        if !row.delete {
            state.mark_error(model_type, &row.id, &row.checksum, &row.payload)?;
        }
    }
    Ok(())
}

/// Emit deletes for state rows the completed scan did not observe.
async fn push_deletes(
    client: &RemoteClient,
    state: &State,
    model: &Model,
    seen: &BTreeMap<String, BTreeSet<String>>,
    counter: &mut ErrorCounter,
    stats: &mut PushStats,
) -> anyhow::Result<()> {
    let model_type = model.model_type();
    let Some(observed) = seen.get(model_type) else {
        return Ok(());
    };
    let known = state.load(model_type)?;
    let mut chunker = Chunker::new(1024 * 1024);
    for id in known.keys() {
        if observed.contains(id) {
            continue;
        }
        let payload = delete_payload(model_type, id);
        let row = PushRow {
            id: id.clone(),
            payload: payload.clone(),
            checksum: String::new(),
            delete: true,
        };
        if let Some((body, rows)) = chunker.push(&payload.to_string(), row) {
            send_batch(client, state, model_type, body, rows, counter, stats).await?;
        }
    }
    if let Some((body, rows)) = chunker.finish() {
        send_batch(client, state, model_type, body, rows, counter, stats).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_project_payload_shape() {
        let row = json!({
            "_id": "b47e3f12-8ee0-4a2e-8e7e-1d0f5a9c3c11",
            "_type": "datasets/gov/example/country",
            "_revision": "abc",
            "code": "lt",
            "title": "Lithuania",
        });
        let payload = project(
            "datasets/gov/example/country",
            "b47e3f12-8ee0-4a2e-8e7e-1d0f5a9c3c11",
            row.as_object().unwrap(),
        );
        assert_eq!(
            payload,
            json!({
                "_op": "upsert",
                "_type": "datasets/gov/example/country",
                "_id": "b47e3f12-8ee0-4a2e-8e7e-1d0f5a9c3c11",
                "_where": "eq(_id,'b47e3f12-8ee0-4a2e-8e7e-1d0f5a9c3c11')",
                "code": "lt",
                "title": "Lithuania",
            }),
        );
    }

    #[test]
    fn test_delete_payload_shape() {
        let payload = delete_payload("country", "abc-id");
        assert_eq!(
            payload,
            json!({
                "_op": "delete",
                "_type": "country",
                "_where": "eq(_id,'abc-id')",
            }),
        );
    }

    #[test]
    fn test_error_counter_threshold() {
        let mut counter = ErrorCounter {
            errors: 0,
            max_errors: 2,
            stop_on_error: false,
        };
        assert!(counter.record(1).is_ok());
        assert!(counter.record(1).is_ok());
        assert!(counter.record(1).is_err());
    }

    #[test]
    fn test_error_counter_stop_on_error() {
        let mut counter = ErrorCounter {
            errors: 0,
            max_errors: 100,
            stop_on_error: true,
        };
        assert!(counter.record(1).is_err());
    }

    #[test]
    fn test_budget_stop_row() {
        let options = PushOptions {
            stop_row: Some(2),
            ..PushOptions::default()
        };
        let mut budget = Budget::new(&options);
        budget.offer();
        assert!(!budget.stopped);
        budget.offer();
        assert!(budget.stopped);
    }
}

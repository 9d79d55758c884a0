//! HTTP handlers for the data surface.
//!
//! The surface is one wildcard route dispatched by path shape: a
//! qualified model name, optionally followed by a row id, a
//! subresource property, or a `:changes`/`:wipe` operation. Models are
//! matched longest-prefix-first so dataset paths and model names can
//! share segments.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use accesslog::Resource as LogResource;
use backends::{query, Backend, DataItem};
use manifest::{access_check, Action, Error as DomainError, Model};

use crate::context::RequestContext;
use crate::{ApiError, AppState};

type JsonMap = Map<String, Value>;
type ApiResult = Result<Response, ApiError>;

/// What a request path addresses.
#[derive(Debug, PartialEq)]
enum Target {
    Model(String),
    One(String, String),
    Sub(String, String, String),
    Changes(String, Option<String>),
    Wipe(String),
    /// A namespace prefix: browse the models and namespaces under it.
    Namespace(String),
}

fn parse_target(manifest: &manifest::Manifest, path: &str) -> Result<Target, DomainError> {
    let path = path.trim_matches('/');
    let segments: Vec<&str> = path.split('/').collect();

    // Longest model prefix wins; the rest addresses into the model.
    for split in (1..=segments.len()).rev() {
        let candidate = segments[..split].join("/");
        if !manifest.has_model(&candidate) {
            continue;
        }
        let rest = &segments[split..];
        return match rest {
            [] => Ok(Target::Model(candidate)),
            [":changes"] => Ok(Target::Changes(candidate, None)),
            [":wipe"] => Ok(Target::Wipe(candidate)),
            [id] => Ok(Target::One(candidate, id.to_string())),
            [id, ":changes"] => Ok(Target::Changes(candidate, Some(id.to_string()))),
            [id, prop] => Ok(Target::Sub(candidate, id.to_string(), prop.to_string())),
            _ => Err(DomainError::NotFound {
                kind: "path",
                name: path.to_string(),
            }),
        };
    }

    // Not a model: browse it as a namespace when models live under it.
    let prefix = format!("{path}/");
    if manifest
        .models()
        .any(|m| m.model_type().starts_with(&prefix))
    {
        return Ok(Target::Namespace(path.to_string()));
    }
    Err(DomainError::NotFound {
        kind: "model",
        name: path.to_string(),
    })
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn request_context(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    uri: &axum::http::Uri,
) -> Result<RequestContext, ApiError> {
    RequestContext::new(
        state.scope_source.as_ref(),
        state.sink.clone(),
        state.accesslog_buffer,
        bearer(headers).as_deref(),
        method.as_str(),
        &uri.to_string(),
    )
    .map_err(Into::into)
}

fn decode_query(raw: Option<String>) -> Result<Option<rql::Expr>, DomainError> {
    let Some(raw) = raw.filter(|q| !q.is_empty()) else {
        return Ok(None);
    };
    let decoded = percent_decode_str(&raw)
        .decode_utf8()
        .map_err(|err| DomainError::Json {
            detail: err.to_string(),
        })?;
    rql::parse(&decoded)
        .map(Some)
        .map_err(|err| DomainError::UnknownParameter {
            name: err.to_string(),
        })
}

/// Resolve the backend a model reads through.
fn backend_for<'a>(state: &'a AppState, model: &Model) -> Result<Backend<'a>, ApiError> {
    if model.external.is_none() {
        return Ok(Backend::Internal(&state.store));
    }
    let dataset = model
        .dataset
        .as_ref()
        .ok_or_else(|| DomainError::NotFound {
            kind: "dataset",
            name: model.model_type().to_string(),
        })
        .map_err(ApiError::from)?;
    let backend_name = model
        .resource
        .as_ref()
        .and_then(|r| {
            state
                .manifest
                .dataset(dataset.as_str())
                .ok()?
                .resources
                .get(r)
                .map(|r| r.backend.clone())
        })
        .ok_or_else(|| {
            ApiError::from(DomainError::NotFound {
                kind: "resource",
                name: model.model_type().to_string(),
            })
        })?;
    state
        .sources
        .get(&backend_name)
        .map(Backend::Sql)
        .ok_or_else(|| {
            ApiError::from(DomainError::NotFound {
                kind: "backend",
                name: backend_name,
            })
        })
}

fn internal_only<'a>(state: &'a AppState, model: &Model) -> Result<&'a backends::PostgresStore, ApiError> {
    if model.external.is_some() {
        return Err(DomainError::NotImplementedFeature {
            feature: format!("writes to external model {:?}", model.model_type()),
        }
        .into());
    }
    Ok(&state.store)
}

fn parse_id(model: &Model, id: &str) -> Result<Uuid, ApiError> {
    id.parse().map_err(|_| {
        ApiError::from(DomainError::ItemDoesNotExist {
            model: model.model_type().to_string(),
            id: id.to_string(),
        })
    })
}

/// Keep only the selected properties plus reserved fields.
fn project_row(row: JsonMap, select: &Option<Vec<String>>) -> JsonMap {
    let Some(select) = select else {
        return row;
    };
    let tops: Vec<&str> = select
        .iter()
        .map(|place| place.split('.').next().unwrap_or(place))
        .collect();
    row.into_iter()
        .filter(|(k, _)| k.starts_with('_') || tops.contains(&k.as_str()))
        .collect()
}

// --- GET --------------------------------------------------------------

pub(crate) async fn get_any(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> ApiResult {
    let mut ctx = request_context(&state, &headers, &Method::GET, &uri)?;
    match parse_target(&state.manifest, &path).map_err(ApiError::from)? {
        Target::Model(name) => getall(&state, &mut ctx, &name, raw_query).await,
        Target::One(name, id) => getone(&state, &mut ctx, &name, &id).await,
        Target::Sub(name, id, prop) => subresource(&state, &mut ctx, &name, &id, &prop).await,
        Target::Changes(name, id) => {
            changes(&state, &mut ctx, &name, id.as_deref(), raw_query).await
        }
        Target::Namespace(prefix) => browse(&state, &mut ctx, &prefix),
        Target::Wipe(..) => Err(DomainError::UnknownParameter {
            name: ":wipe is a DELETE operation".to_string(),
        }
        .into()),
    }
}

/// List the models and child namespaces under a path prefix.
fn browse(state: &AppState, ctx: &mut RequestContext, prefix: &str) -> ApiResult {
    let nested = format!("{prefix}/");
    let mut namespaces = std::collections::BTreeSet::new();
    let mut models = Vec::new();
    for model in state.manifest.models() {
        let Some(rest) = model.model_type().strip_prefix(&nested) else {
            continue;
        };
        match rest.split_once('/') {
            Some((child, _)) => {
                namespaces.insert(format!("{nested}{child}"));
            }
            None => models.push(model),
        }
    }

    let mut rows: Vec<Value> = namespaces
        .into_iter()
        .map(|name| json!({ "_type": "ns", "name": format!("{name}/"), "title": "" }))
        .collect();
    for model in models {
        if access_check(model.model_type(), model.access, Action::Getall, &ctx.scopes).is_err() {
            continue;
        }
        rows.push(json!({
            "_type": "model",
            "name": model.model_type(),
            "title": model.title,
        }));
    }

    ctx.accesslog.log(
        None,
        None,
        Some("browse"),
        &[LogResource {
            kind: "ns",
            name: prefix.to_string(),
            id: None,
        }],
        &[],
    );
    Ok(Json(json!({ "_data": rows })).into_response())
}

async fn getall(
    state: &AppState,
    ctx: &mut RequestContext,
    name: &str,
    raw_query: Option<String>,
) -> ApiResult {
    let model = state.manifest.model(name).map_err(ApiError::from)?;
    let expr = decode_query(raw_query).map_err(ApiError::from)?;
    let action = if expr.is_some() {
        Action::Search
    } else {
        Action::Getall
    };
    access_check(model.model_type(), model.access, action, &ctx.scopes)
        .map_err(ApiError::from)?;
    let resolved = query::resolve(model, expr.as_ref()).map_err(ApiError::from)?;

    let rows: Vec<Value> = match backend_for(state, model)? {
        Backend::Internal(store) => {
            if resolved.count {
                let plan = store.plan_count(model, &resolved)?;
                let mut txn = store.read().await?;
                let count = store.count(&mut txn, &plan).await?;
                vec![json!({ "count()": count })]
            } else {
                let plan = store.plan_getall(model, &resolved)?;
                let mut txn = store.read().await?;
                let rows: Vec<JsonMap> = store.fetch(&mut txn, model, &plan).try_collect().await?;
                rows.into_iter()
                    .map(|row| Value::Object(project_row(row, &resolved.select)))
                    .collect()
            }
        }
        Backend::Sql(source) => {
            let rows = source
                .getall(&state.manifest, model, &state.keymap, expr.as_ref(), None)
                .await?;
            if resolved.count {
                vec![json!({ "count()": rows.len() })]
            } else {
                rows.into_iter()
                    .map(|mut row| {
                        row.remove("_page");
                        Value::Object(project_row(row, &resolved.select))
                    })
                    .collect()
            }
        }
    };

    ctx.accesslog.log(
        None,
        None,
        Some(action.as_str()),
        &[LogResource {
            kind: "model",
            name: model.model_type().to_string(),
            id: None,
        }],
        resolved.select.clone().unwrap_or_default().as_slice(),
    );
    Ok(Json(json!({ "_data": rows })).into_response())
}

async fn getone(state: &AppState, ctx: &mut RequestContext, name: &str, id: &str) -> ApiResult {
    let model = state.manifest.model(name).map_err(ApiError::from)?;
    access_check(model.model_type(), model.access, Action::Getone, &ctx.scopes)
        .map_err(ApiError::from)?;
    let row = fetch_row(state, model, id).await?;

    ctx.accesslog.log(
        None,
        None,
        Some(Action::Getone.as_str()),
        &[LogResource {
            kind: "model",
            name: model.model_type().to_string(),
            id: Some(id.to_string()),
        }],
        &[],
    );
    Ok(Json(Value::Object(row)).into_response())
}

async fn fetch_row(state: &AppState, model: &Model, id: &str) -> Result<JsonMap, ApiError> {
    let uuid = parse_id(model, id)?;
    match backend_for(state, model)? {
        Backend::Internal(store) => {
            let mut txn = store.read().await?;
            Ok(store.getone(&mut txn, model, uuid).await?)
        }
        Backend::Sql(source) => Ok(source
            .getone(&state.manifest, model, &state.keymap, uuid)
            .await?),
    }
}

async fn subresource(
    state: &AppState,
    ctx: &mut RequestContext,
    name: &str,
    id: &str,
    prop_name: &str,
) -> ApiResult {
    let model = state.manifest.model(name).map_err(ApiError::from)?;
    let prop = model
        .properties
        .get(prop_name)
        .ok_or_else(|| DomainError::FieldNotInResource {
            model: model.model_type().to_string(),
            prop: prop_name.to_string(),
        })
        .map_err(ApiError::from)?;

    // Only object and file subtrees are addressable as subresources.
    match &prop.dtype {
        manifest::DataType::Object(..) | manifest::DataType::File => {}
        other => {
            return Err(DomainError::UnavailableSubresource {
                prop: prop_name.to_string(),
                prop_type: other.tag().to_string(),
            }
            .into())
        }
    }
    access_check(model.model_type(), prop.access, Action::Getone, &ctx.scopes)
        .map_err(ApiError::from)?;

    let row = fetch_row(state, model, id).await?;
    let mut out = JsonMap::new();
    out.insert(
        "_type".to_string(),
        Value::String(format!("{}.{}", model.model_type(), prop_name)),
    );
    for key in ["_id", "_revision"] {
        if let Some(value) = row.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    match row.get(prop_name) {
        Some(Value::Object(map)) => out.extend(map.clone()),
        Some(Value::Null) | None if matches!(prop.dtype, manifest::DataType::File) => {
            out.insert("content_type".to_string(), Value::Null);
            out.insert("filename".to_string(), Value::Null);
        }
        Some(other) => {
            out.insert(prop_name.to_string(), other.clone());
        }
        None => {}
    }

    ctx.accesslog.log(
        None,
        None,
        Some(Action::Getone.as_str()),
        &[LogResource {
            kind: "property",
            name: format!("{}.{}", model.model_type(), prop_name),
            id: Some(id.to_string()),
        }],
        &[],
    );
    Ok(Json(Value::Object(out)).into_response())
}

async fn changes(
    state: &AppState,
    ctx: &mut RequestContext,
    name: &str,
    id: Option<&str>,
    raw_query: Option<String>,
) -> ApiResult {
    let model = state.manifest.model(name).map_err(ApiError::from)?;
    access_check(model.model_type(), model.access, Action::Changes, &ctx.scopes)
        .map_err(ApiError::from)?;
    let store = internal_only(state, model)?;
    let id = id.map(|id| parse_id(model, id)).transpose()?;

    // The change feed accepts only limit and offset, and its offset
    // may be negative: read the last |offset| changes.
    let mut limit: i64 = 100;
    let mut offset: i64 = -10;
    if let Some(expr) = decode_query(raw_query).map_err(ApiError::from)? {
        for clause in expr.conjuncts() {
            match clause {
                rql::Expr::Op { name, args } if name == "limit" => match args.as_slice() {
                    [rql::Expr::Value(rql::Value::Integer(n))] if *n >= 0 => limit = *n,
                    _ => {
                        return Err(DomainError::InvalidValue {
                            prop: "limit".to_string(),
                            dtype: "integer".to_string(),
                            value: Value::Null,
                        }
                        .into())
                    }
                },
                rql::Expr::Op { name, args } if name == "offset" => match args.as_slice() {
                    [rql::Expr::Value(rql::Value::Integer(n))] => offset = *n,
                    _ => {
                        return Err(DomainError::InvalidValue {
                            prop: "offset".to_string(),
                            dtype: "integer".to_string(),
                            value: Value::Null,
                        }
                        .into())
                    }
                },
                other => {
                    return Err(DomainError::UnknownParameter {
                        name: rql::unparse(other),
                    }
                    .into())
                }
            }
        }
    }

    let mut txn = store.read().await?;
    let entries = store
        .changes(&mut txn, model, id, Some(limit), Some(offset))
        .await?;

    ctx.accesslog.log(
        None,
        None,
        Some(Action::Changes.as_str()),
        &[LogResource {
            kind: "model",
            name: model.model_type().to_string(),
            id: None,
        }],
        &[],
    );
    Ok(Json(json!({ "_data": entries })).into_response())
}

// --- POST -------------------------------------------------------------

pub(crate) async fn post_any(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let mut ctx = request_context(&state, &headers, &Method::POST, &uri)?;
    let Target::Model(name) = parse_target(&state.manifest, &path).map_err(ApiError::from)?
    else {
        return Err(DomainError::NotFound {
            kind: "model",
            name: path,
        }
        .into());
    };
    let model = state.manifest.model(&name).map_err(ApiError::from)?;
    let store = internal_only(&state, model)?;

    let (items, batch) = parse_body(&headers, &body).map_err(ApiError::from)?;
    let mut txn = store.write().await?;
    let mut rows = Vec::with_capacity(items.len());
    let mut reasons = Vec::new();

    for item in items {
        let op = item
            .get("_op")
            .and_then(Value::as_str)
            .unwrap_or("insert")
            .to_string();
        let action = match op.as_str() {
            "insert" => Action::Insert,
            "upsert" => Action::Upsert,
            "patch" => Action::Patch,
            "delete" => Action::Delete,
            other => {
                return Err(DomainError::UnknownParameter {
                    name: format!("_op={other}"),
                }
                .into())
            }
        };
        access_check(model.model_type(), model.access, action, &ctx.scopes)
            .map_err(ApiError::from)?;
        reasons.push(action.as_str());

        match action {
            Action::Insert => {
                let out = store
                    .insert(&mut txn, model, vec![DataItem::insert(item)])
                    .await?;
                rows.extend(out.into_iter().map(Value::Object));
            }
            Action::Upsert | Action::Patch | Action::Delete => {
                let saved = find_by_where(store, model, &item).await?;
                match (saved, action) {
                    (None, Action::Delete) => {
                        // Deleting what is already absent is a no-op.
                        rows.push(json!({ "_type": model.model_type() }));
                    }
                    (None, _) => {
                        let out = store
                            .insert(&mut txn, model, vec![DataItem::insert(item)])
                            .await?;
                        rows.extend(out.into_iter().map(Value::Object));
                    }
                    (Some(saved), Action::Delete) => {
                        store
                            .delete(
                                &mut txn,
                                model,
                                vec![DataItem {
                                    action: Action::Delete,
                                    patch: JsonMap::new(),
                                    saved: Some(saved.clone()),
                                }],
                            )
                            .await?;
                        rows.push(json!({
                            "_type": model.model_type(),
                            "_id": saved.get("_id").cloned().unwrap_or(Value::Null),
                        }));
                    }
                    (Some(saved), _) => {
                        let mut patch = item;
                        patch.remove("_where");
                        patch.remove("_op");
                        patch.remove("_id");
                        let out = store
                            .update(
                                &mut txn,
                                model,
                                vec![DataItem {
                                    action: Action::Patch,
                                    patch,
                                    saved: Some(saved),
                                }],
                            )
                            .await?;
                        rows.extend(out.into_iter().map(Value::Object));
                    }
                }
            }
            _ => unreachable!("write actions only"),
        }
    }

    let txn_id = txn.id;
    txn.commit().await?;
    ctx.accesslog.log(
        Some(txn_id),
        None,
        reasons.first().copied(),
        &[LogResource {
            kind: "model",
            name: model.model_type().to_string(),
            id: None,
        }],
        &[],
    );

    let body = if batch {
        json!({ "_data": rows })
    } else {
        rows.into_iter().next().unwrap_or_else(|| json!({}))
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// Locate the saved row addressed by an item's `_where` clause (or its
/// `_id`). Returns `None` when no row matches.
async fn find_by_where(
    store: &backends::PostgresStore,
    model: &Model,
    item: &JsonMap,
) -> Result<Option<JsonMap>, ApiError> {
    let expr = match item.get("_where").and_then(Value::as_str) {
        Some(where_) => rql::parse(where_).map_err(|err| {
            ApiError::from(DomainError::UnknownParameter {
                name: err.to_string(),
            })
        })?,
        None => match item.get("_id").and_then(Value::as_str) {
            Some(id) => rql::Expr::eq_id(id),
            None => {
                return Err(DomainError::UnknownParameter {
                    name: "_where or _id is required".to_string(),
                }
                .into())
            }
        },
    };

    let mut resolved = query::resolve(model, Some(&expr)).map_err(ApiError::from)?;
    resolved.limit = Some(2);
    let plan = store.plan_getall(model, &resolved)?;
    let mut txn = store.read().await?;
    let rows: Vec<JsonMap> = store.fetch(&mut txn, model, &plan).try_collect().await?;
    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(rows.into_iter().next().expect("len is 1"))),
        _ => Err(DomainError::MultipleRowsFound {
            model: model.model_type().to_string(),
            id: rql::unparse(&expr),
        }
        .into()),
    }
}

fn parse_body(headers: &HeaderMap, body: &Bytes) -> Result<(Vec<JsonMap>, bool), DomainError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let json_error = |err: serde_json::Error| DomainError::Json {
        detail: err.to_string(),
    };

    match content_type.as_str() {
        "application/json" => {
            let value: Value = serde_json::from_slice(body).map_err(json_error)?;
            match value {
                Value::Object(mut map) => {
                    if let Some(Value::Array(items)) = map.remove("_data") {
                        let items = items
                            .into_iter()
                            .map(|item| match item {
                                Value::Object(map) => Ok(map),
                                other => Err(DomainError::Json {
                                    detail: format!("batch item is not an object: {other}"),
                                }),
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok((items, true))
                    } else {
                        Ok((vec![map], false))
                    }
                }
                other => Err(DomainError::Json {
                    detail: format!("body is not an object: {other}"),
                }),
            }
        }
        "application/x-ndjson" => {
            let text = std::str::from_utf8(body).map_err(|err| DomainError::Json {
                detail: err.to_string(),
            })?;
            let mut items = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let value: JsonMap = serde_json::from_str(line).map_err(json_error)?;
                items.push(value);
            }
            Ok((items, true))
        }
        other => Err(DomainError::UnknownContentType {
            content_type: other.to_string(),
        }),
    }
}

// --- PUT / PATCH / DELETE --------------------------------------------

pub(crate) async fn put_any(
    state: State<Arc<AppState>>,
    path: Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    write_one(state, path, uri, headers, body, Action::Update).await
}

pub(crate) async fn patch_any(
    state: State<Arc<AppState>>,
    path: Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    write_one(state, path, uri, headers, body, Action::Patch).await
}

async fn write_one(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
    action: Action,
) -> ApiResult {
    let method = if action == Action::Update {
        Method::PUT
    } else {
        Method::PATCH
    };
    let mut ctx = request_context(&state, &headers, &method, &uri)?;
    let Target::One(name, id) = parse_target(&state.manifest, &path).map_err(ApiError::from)?
    else {
        return Err(DomainError::NotFound {
            kind: "row",
            name: path,
        }
        .into());
    };
    let model = state.manifest.model(&name).map_err(ApiError::from)?;
    access_check(model.model_type(), model.access, action, &ctx.scopes)
        .map_err(ApiError::from)?;
    let store = internal_only(&state, model)?;

    let (items, batch) = parse_body(&headers, &body).map_err(ApiError::from)?;
    if batch || items.len() != 1 {
        return Err(DomainError::Json {
            detail: "expected a single object body".to_string(),
        }
        .into());
    }
    let mut patch = items.into_iter().next().expect("one item");

    let uuid = parse_id(model, &id)?;
    let saved = {
        let mut txn = store.read().await?;
        store.getone(&mut txn, model, uuid).await?
    };

    // Optimistic concurrency: the body must carry the revision the
    // caller read; a stale revision is a conflict.
    let given_revision = patch.remove("_revision");
    match given_revision.as_ref().and_then(Value::as_str) {
        None => {
            return Err(DomainError::InvalidValue {
                prop: "_revision".to_string(),
                dtype: "string".to_string(),
                value: Value::Null,
            }
            .into())
        }
        Some(given) => {
            let saved_revision = saved.get("_revision").and_then(Value::as_str);
            if saved_revision != Some(given) {
                return Err(backends::Error::RevisionMismatch {
                    model: model.model_type().to_string(),
                    id: id.clone(),
                    expected: given.to_string(),
                }
                .into());
            }
        }
    }
    patch.remove("_id");
    patch.remove("_type");

    let mut txn = store.write().await?;
    let out = store
        .update(
            &mut txn,
            model,
            vec![DataItem {
                action,
                patch,
                saved: Some(saved),
            }],
        )
        .await?;
    let txn_id = txn.id;
    txn.commit().await?;

    ctx.accesslog.log(
        Some(txn_id),
        None,
        Some(action.as_str()),
        &[LogResource {
            kind: "model",
            name: model.model_type().to_string(),
            id: Some(id),
        }],
        &[],
    );
    let row = out.into_iter().next().map(Value::Object).unwrap_or_default();
    Ok(Json(row).into_response())
}

pub(crate) async fn delete_any(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> ApiResult {
    let mut ctx = request_context(&state, &headers, &Method::DELETE, &uri)?;
    match parse_target(&state.manifest, &path).map_err(ApiError::from)? {
        Target::One(name, id) => {
            let model = state.manifest.model(&name).map_err(ApiError::from)?;
            access_check(model.model_type(), model.access, Action::Delete, &ctx.scopes)
                .map_err(ApiError::from)?;
            let store = internal_only(&state, model)?;
            let uuid = parse_id(model, &id)?;
            let saved = {
                let mut txn = store.read().await?;
                store.getone(&mut txn, model, uuid).await?
            };
            let mut txn = store.write().await?;
            store
                .delete(
                    &mut txn,
                    model,
                    vec![DataItem {
                        action: Action::Delete,
                        patch: JsonMap::new(),
                        saved: Some(saved),
                    }],
                )
                .await?;
            let txn_id = txn.id;
            txn.commit().await?;
            ctx.accesslog.log(
                Some(txn_id),
                None,
                Some(Action::Delete.as_str()),
                &[LogResource {
                    kind: "model",
                    name: model.model_type().to_string(),
                    id: Some(id),
                }],
                &[],
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Target::Wipe(name) => {
            let model = state.manifest.model(&name).map_err(ApiError::from)?;
            access_check(model.model_type(), model.access, Action::Wipe, &ctx.scopes)
                .map_err(ApiError::from)?;
            let store = internal_only(&state, model)?;
            let mut txn = store.write().await?;
            store.wipe(&mut txn, model).await?;
            let txn_id = txn.id;
            txn.commit().await?;
            ctx.accesslog.log(
                Some(txn_id),
                None,
                Some(Action::Wipe.as_str()),
                &[LogResource {
                    kind: "model",
                    name: model.model_type().to_string(),
                    id: None,
                }],
                &[],
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(DomainError::NotFound {
            kind: "row",
            name: path,
        }
        .into()),
    }
}

// --- Fixed routes -----------------------------------------------------

pub(crate) async fn version() -> Response {
    Json(json!({
        "implementation": {
            "name": "lode",
            "version": env!("CARGO_PKG_VERSION"),
        },
    }))
    .into_response()
}

pub(crate) async fn robots() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nAllow: /\n",
    )
        .into_response()
}

pub(crate) async fn favicon() -> Response {
    StatusCode::NO_CONTENT.into_response()
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
,,,,city,,,name,miestas,,4,,,,
,,,,,name,string,,pavadinimas,,,,,,
";

    fn manifest() -> manifest::Manifest {
        from_reader("test", MANIFEST.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_target_shapes() {
        let m = manifest();
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country").unwrap(),
            Target::Model("datasets/gov/example/country".into()),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country/abc-id").unwrap(),
            Target::One("datasets/gov/example/country".into(), "abc-id".into()),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country/abc-id/code").unwrap(),
            Target::Sub(
                "datasets/gov/example/country".into(),
                "abc-id".into(),
                "code".into(),
            ),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country/:changes").unwrap(),
            Target::Changes("datasets/gov/example/country".into(), None),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country/abc-id/:changes").unwrap(),
            Target::Changes("datasets/gov/example/country".into(), Some("abc-id".into())),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov").unwrap(),
            Target::Namespace("datasets/gov".into()),
        );
        assert_eq!(
            parse_target(&m, "datasets/gov/example/country/:wipe").unwrap(),
            Target::Wipe("datasets/gov/example/country".into()),
        );
        assert!(parse_target(&m, "datasets/gov/unknown").is_err());
    }

    #[test]
    fn test_decode_query_handles_percent_encoding() {
        let expr = decode_query(Some("eq(code,%27lt%27)".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(rql::unparse(&expr), "eq(code,'lt')");
        assert!(decode_query(Some(String::new())).unwrap().is_none());
        assert!(decode_query(None).unwrap().is_none());
    }

    #[test]
    fn test_project_row_keeps_reserved_and_selected() {
        let row: JsonMap = serde_json::from_value(json!({
            "_id": "x",
            "_type": "country",
            "_revision": "r",
            "code": "lt",
            "title": "Lithuania",
        }))
        .unwrap();
        let projected = project_row(row, &Some(vec!["code".to_string()]));
        assert_eq!(
            Value::Object(projected),
            json!({"_id": "x", "_type": "country", "_revision": "r", "code": "lt"}),
        );
    }

    #[test]
    fn test_parse_body_rejects_unknown_content_type() {
        let headers = {
            let mut h = HeaderMap::new();
            h.insert(header::CONTENT_TYPE, "text/csv".parse().unwrap());
            h
        };
        let err = parse_body(&headers, &Bytes::from_static(b"a,b")).unwrap_err();
        assert_eq!(err.code(), "UnknownContentType");
        assert_eq!(err.status(), 415);
    }

    #[test]
    fn test_parse_body_batch_and_single() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());

        let (items, batch) = parse_body(
            &headers,
            &Bytes::from_static(br#"{"_data":[{"code":"lt"},{"code":"lv"}]}"#),
        )
        .unwrap();
        assert!(batch);
        assert_eq!(items.len(), 2);

        let (items, batch) =
            parse_body(&headers, &Bytes::from_static(br#"{"code":"lt"}"#)).unwrap();
        assert!(!batch);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_parse_body_ndjson() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/x-ndjson".parse().unwrap(),
        );
        let (items, batch) = parse_body(
            &headers,
            &Bytes::from_static(b"{\"code\":\"lt\"}\n{\"code\":\"lv\"}\n"),
        )
        .unwrap();
        assert!(batch);
        assert_eq!(items.len(), 2);
    }
}

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use lxp_store::{BucketKind, BucketStreams, Store, StoreError};
use lxp_types::{Lxp, Oid};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ServerError, ServerResult};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

/// Run a blocking store call off the async runtime.
async fn blocking<T, F>(f: F) -> ServerResult<T>
where
    F: FnOnce() -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
}

/// JSON shape of a record on the wire.
pub fn record_view(record: &Lxp) -> Value {
    json!({
        "oid": record.oid().map(|o| o.as_u64()),
        "type": record.get_type().map(|t| t.name()),
        "fields": record.fields_to_json(),
    })
}

fn parse_oid(raw: &str) -> ServerResult<Oid> {
    raw.parse()
        .map_err(|e| ServerError::BadRequest(format!("invalid oid {raw:?}: {e}")))
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_repos(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.repository_names()))
}

#[derive(Debug, Deserialize)]
pub struct CreateRepo {
    pub name: String,
}

pub async fn create_repo(
    State(state): State<AppState>,
    Json(body): Json<CreateRepo>,
) -> ServerResult<(StatusCode, Json<Value>)> {
    let repo = blocking(move || Ok(state.store.make_repository(&body.name)?)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "name": repo.name() }))))
}

pub async fn delete_repo(
    State(state): State<AppState>,
    Path(repo): Path<String>,
) -> ServerResult<StatusCode> {
    blocking(move || Ok(state.store.delete_repository(&repo)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_buckets(
    State(state): State<AppState>,
    Path(repo): Path<String>,
) -> ServerResult<Json<Value>> {
    let buckets = blocking(move || {
        let repo = state.store.get_repository(&repo)?;
        let mut out = Vec::new();
        for name in repo.bucket_names()? {
            let bucket = repo.get_bucket(&name)?;
            out.push(json!({
                "name": name,
                "kind": bucket.kind(),
                "records": bucket.len()?,
            }));
        }
        Ok(out)
    })
    .await?;
    Ok(Json(Value::Array(buckets)))
}

#[derive(Debug, Deserialize)]
pub struct CreateBucket {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: BucketKind,
}

fn default_kind() -> BucketKind {
    BucketKind::Directory
}

pub async fn create_bucket(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Json(body): Json<CreateBucket>,
) -> ServerResult<(StatusCode, Json<Value>)> {
    let bucket = blocking(move || {
        Ok(state
            .store
            .get_repository(&repo)?
            .make_bucket(&body.name, body.kind)?)
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": bucket.name(), "kind": bucket.kind() })),
    ))
}

pub async fn delete_bucket(
    State(state): State<AppState>,
    Path((repo, bucket)): Path<(String, String)>,
) -> ServerResult<StatusCode> {
    blocking(move || Ok(state.store.get_repository(&repo)?.delete_bucket(&bucket)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_records(
    State(state): State<AppState>,
    Path((repo, bucket)): Path<(String, String)>,
) -> ServerResult<Json<Value>> {
    let records = blocking(move || {
        let bucket = state.store.bucket(&repo, &bucket)?;
        let mut out = Vec::new();
        for record in bucket.input_stream()? {
            out.push(record_view(&record?));
        }
        Ok(out)
    })
    .await?;
    Ok(Json(Value::Array(records)))
}

/// Body of a record upload: label→value JSON plus an optional type name.
#[derive(Debug, Deserialize)]
pub struct PutRecord {
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    pub fields: Value,
}

pub async fn put_record(
    State(state): State<AppState>,
    Path((repo, bucket)): Path<(String, String)>,
    Json(body): Json<PutRecord>,
) -> ServerResult<(StatusCode, Json<Value>)> {
    let oid = blocking(move || {
        let bucket = state.store.bucket(&repo, &bucket)?;
        let mut record = Lxp::from_json_object(&body.fields).map_err(StoreError::from)?;
        if let Some(name) = &body.type_name {
            let label = state
                .store
                .type_with_name(name)
                .ok_or_else(|| ServerError::BadRequest(format!("unknown type: {name}")))?;
            record.set_type(label.type_ref());
        }
        Ok(bucket.make_persistent(&mut record)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "oid": oid.as_u64() }))))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path((repo, bucket, oid)): Path<(String, String, String)>,
) -> ServerResult<Json<Value>> {
    let oid = parse_oid(&oid)?;
    let record = blocking(move || Ok(state.store.bucket(&repo, &bucket)?.get_object_by_id(oid)?))
        .await?;
    Ok(Json(record_view(&record)))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((repo, bucket, oid)): Path<(String, String, String)>,
) -> ServerResult<StatusCode> {
    let oid = parse_oid(&oid)?;
    blocking(move || Ok(state.store.bucket(&repo, &bucket)?.delete(oid)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

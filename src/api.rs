//! HTTP front-end.
//!
//! A thin axum router over the facade: request parsing and response
//! shaping live here, everything stateful lives behind
//! [`VectorDatabase`]. Engine calls run under `spawn_blocking` since the
//! facade blocks on its writer lock and on disk I/O.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::error;

use crate::db::VectorDatabase;
use crate::error::DbError;
use crate::registry::IndexKind;

pub fn create_router(db: Arc<VectorDatabase>) -> Router {
    Router::new()
        .route("/upsert", post(upsert))
        .route("/search", post(search))
        .route("/query/:id", get(query))
        .route("/admin/snapshot", post(snapshot))
        .route("/health", get(health))
        .with_state(db)
}

fn error_response(e: &DbError) -> Response {
    let status = match e {
        DbError::UnknownIndexType(_)
        | DbError::InvalidRequest(_)
        | DbError::DimensionMismatch { .. }
        | DbError::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"retCode": 1, "msg": e.to_string()})),
    )
        .into_response()
}

async fn upsert(State(db): State<Arc<VectorDatabase>>, Json(body): Json<Value>) -> Response {
    let Some(id) = body.get("id").and_then(Value::as_u64) else {
        return error_response(&DbError::invalid("missing or non-integer \"id\""));
    };
    let kind = match body
        .get("indexType")
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::invalid("missing \"indexType\""))
        .and_then(IndexKind::from_request)
    {
        Ok(kind) => kind,
        Err(e) => return error_response(&e),
    };

    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.upsert(id, &body, kind)).await;
    match result {
        Ok(Ok(())) => Json(json!({"retCode": 0, "msg": "upsert success"})).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("upsert task join error: {e}");
            error_response(&DbError::invalid("internal task failure"))
        }
    }
}

async fn search(State(db): State<Arc<VectorDatabase>>, Json(body): Json<Value>) -> Response {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.search(&body)).await;
    match result {
        Ok(Ok((ids, distances))) => {
            // Drop the exact index's -1 padding before it reaches clients.
            let (ids, distances): (Vec<i64>, Vec<f32>) = ids
                .into_iter()
                .zip(distances)
                .filter(|(id, _)| *id >= 0)
                .unzip();
            Json(json!({"retCode": 0, "vectors": ids, "distances": distances})).into_response()
        }
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("search task join error: {e}");
            error_response(&DbError::invalid("internal task failure"))
        }
    }
}

async fn query(State(db): State<Arc<VectorDatabase>>, Path(id): Path<u64>) -> Response {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.query(id)).await;
    match result {
        Ok(Ok(Value::Null)) => Json(json!({})).into_response(),
        Ok(Ok(doc)) => Json(doc).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("query task join error: {e}");
            error_response(&DbError::invalid("internal task failure"))
        }
    }
}

async fn snapshot(State(db): State<Arc<VectorDatabase>>) -> Response {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.take_snapshot()).await;
    match result {
        Ok(Ok(())) => Json(json!({"retCode": 0, "msg": "snapshot success"})).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("snapshot task join error: {e}");
            error_response(&DbError::invalid("internal task failure"))
        }
    }
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

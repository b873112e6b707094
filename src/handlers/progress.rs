//! # Progress REST API Handlers
//!
//! ## Available Endpoints:
//! - `GET /progress?category=upload&include_terminal=true` - List records
//! - `GET /progress/{id}` - One record
//! - `GET /progress/{id}/stream` - Server-Sent Events, one `data:` event per change
//! - `POST /progress/{id}/cancel` - Cancel a record
//!
//! ## SSE format:
//! Every event is `data: <record as JSON>\n\n`. The first event is the current
//! snapshot; the stream closes right after the terminal snapshot.

use crate::progress::{ProgressRecord, TaskCategory};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    pub category: Option<String>,
    #[serde(default)]
    pub include_terminal: bool,
}

pub async fn list_progress(
    state: web::Data<AppState>,
    query: web::Query<ProgressQuery>,
) -> Result<HttpResponse, AppError> {
    let category = query
        .category
        .as_deref()
        .map(str::parse::<TaskCategory>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let records = state.progress.list(category, query.include_terminal);

    Ok(HttpResponse::Ok().json(json!({
        "count": records.len(),
        "records": records
    })))
}

pub async fn get_progress(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let record = state
        .progress
        .get(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("Progress record {} not found", task_id)))?;
    Ok(HttpResponse::Ok().json(record))
}

pub async fn stream_progress(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let stream = state
        .progress
        .stream(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("Progress record {} not found", task_id)))?;

    let events = stream.map(|record| Ok::<_, Infallible>(web::Bytes::from(sse_event(&record))));
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events))
}

pub async fn cancel_progress(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    if state.progress.get(&task_id).is_none() {
        return Err(AppError::NotFound(format!("Progress record {} not found", task_id)));
    }
    Ok(HttpResponse::Ok().json(json!({ "cancelled": state.progress.cancel(&task_id) })))
}

fn sse_event(record: &ProgressRecord) -> String {
    match serde_json::to_string(record) {
        Ok(body) => format!("data: {}\n\n", body),
        Err(e) => format!("event: error\ndata: {}\n\n", json!({ "error": e.to_string() })),
    }
}

//! `GET /system/resources?window_secs=300`: latest host snapshot plus
//! min/avg/max over the window.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_WINDOW_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub window_secs: Option<u64>,
}

pub async fn system_resources(state: web::Data<AppState>, query: web::Query<ResourceQuery>) -> HttpResponse {
    let window = Duration::from_secs(query.window_secs.unwrap_or(DEFAULT_WINDOW_SECS));
    let monitor = &state.monitor;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "monitoring": monitor.is_running(),
        "samples_retained": monitor.history_len(),
        "memory_pressure": monitor.under_memory_pressure(),
        "latest": monitor.latest(),
        "statistics": monitor.statistics(window)
    }))
}

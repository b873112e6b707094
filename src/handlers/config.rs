use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /config`: the effective configuration after file and environment overrides.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config()
    }))
}

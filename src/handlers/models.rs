//! # Model Management REST API Handlers
//!
//! The model is loaded lazily by the first job that needs it and unloaded by
//! the idle reaper, so there is no explicit load endpoint.
//!
//! ## Available Endpoints:
//! - `GET /models/status` - Lifecycle state, reference count, device, idle time
//! - `POST /models/release` - Unload now, even with outstanding leases

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

pub async fn model_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.models.status())
}

pub async fn release_model(state: web::Data<AppState>) -> HttpResponse {
    let before = state.models.status();
    if before.reference_count > 0 {
        warn!(
            reference_count = before.reference_count,
            "Force-releasing model with outstanding leases"
        );
    }
    let released = state.models.force_release();

    HttpResponse::Ok().json(json!({
        "released": released,
        "status": state.models.status()
    }))
}

#[cfg(test)]
mod tests {
    use crate::handlers::configure;
    use crate::state::tests::test_state;
    use actix_web::{test, web, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_status_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let models = state.models.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| configure(cfg, 1024 * 1024)),
        )
        .await;

        let lease = models.acquire().await.unwrap();
        let req = test::TestRequest::get().uri("/api/v1/models/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "loaded");
        assert_eq!(body["reference_count"], 1);
        assert_eq!(body["device"], "cpu");

        let req = test::TestRequest::post().uri("/api/v1/models/release").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["released"], true);
        assert_eq!(body["status"]["state"], "unloaded");
        drop(lease);

        let req = test::TestRequest::post().uri("/api/v1/models/release").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["released"], false);
    }
}

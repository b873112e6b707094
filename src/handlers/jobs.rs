//! # Job REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /jobs` - Submit a job, returns `{task_id, progress_id}` (202)
//! - `GET /jobs` - All task snapshots, oldest first
//! - `GET /jobs/stats` - Scheduler counters
//! - `POST /jobs/compact` - Forget finished tasks
//! - `GET /jobs/{id}` - One task, with its progress record when there is one
//! - `POST /jobs/{id}/cancel` - Cancel a pending or running task

use crate::jobs::SubmitJobRequest;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn submit_job(
    state: web::Data<AppState>,
    body: web::Json<SubmitJobRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let submitted = state.jobs.submit(request.job, request.priority, request.max_retries)?;
    Ok(HttpResponse::Accepted().json(submitted))
}

pub async fn list_jobs(state: web::Data<AppState>) -> HttpResponse {
    let tasks = state.scheduler().list();
    HttpResponse::Ok().json(json!({
        "count": tasks.len(),
        "tasks": tasks
    }))
}

pub async fn job_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.scheduler().stats())
}

pub async fn compact_jobs(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "removed": state.jobs.compact() }))
}

pub async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let task = state
        .scheduler()
        .status(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
    let progress = state
        .jobs
        .progress_id(&task_id)
        .and_then(|id| state.progress.get(&id));

    Ok(HttpResponse::Ok().json(json!({
        "task": task,
        "progress": progress
    })))
}

pub async fn cancel_job(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    if state.scheduler().status(&task_id).is_none() {
        return Err(AppError::NotFound(format!("Task {} not found", task_id)));
    }
    Ok(HttpResponse::Ok().json(json!({ "cancelled": state.jobs.cancel(&task_id) })))
}

#[cfg(test)]
mod tests {
    use crate::handlers::configure;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, web, App};
    use serde_json::{json, Value};

    #[actix_web::test]
    async fn test_job_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let wav_path = dir.path().join("clip.pcm");
        std::fs::write(&wav_path, vec![0u8; 3200]).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| configure(cfg, 1024 * 1024)),
        )
        .await;

        // Missing file is a validation error.
        let req = test::TestRequest::post()
            .uri("/api/v1/jobs")
            .set_json(json!({"job": {"type": "transcription", "file_path": "/definitely/not/here.wav"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Workers are not started, so the job stays pending.
        let req = test::TestRequest::post()
            .uri("/api/v1/jobs")
            .set_json(json!({
                "job": {"type": "transcription", "file_path": wav_path},
                "priority": "high"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let submitted: Value = test::read_body_json(resp).await;
        let task_id = submitted["task_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::get().uri(&format!("/api/v1/jobs/{}", task_id)).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["task"]["status"], "pending");
        assert_eq!(body["task"]["priority"], "high");
        assert_eq!(body["progress"]["task_id"], submitted["progress_id"]);

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/jobs/{}/cancel", task_id))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cancelled"], true);

        let req = test::TestRequest::get().uri("/api/v1/jobs/stats").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cancelled"], 1);

        let req = test::TestRequest::post().uri("/api/v1/jobs/compact").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], 1);

        let req = test::TestRequest::get().uri(&format!("/api/v1/jobs/{}", task_id)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

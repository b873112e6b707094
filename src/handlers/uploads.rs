//! # Upload REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /uploads` - Open a session (201)
//! - `PUT /uploads/{id}/chunks/{index}` - Raw chunk bytes as the request body
//! - `GET /uploads/{id}` - Session status, including missing chunk indices
//! - `POST /uploads/{id}/cancel` - Cancel a session and drop its scratch files
//!
//! ## Typical client flow:
//! 1. Hash the file (SHA-256) and `POST /uploads` with name, size and hash
//! 2. `PUT` each chunk in any order, retrying failures
//! 3. The last chunk's receipt has `completed: true` and the final path

use crate::upload::CreateSessionRequest;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn create_upload(
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> Result<HttpResponse, AppError> {
    let created = state.uploads.create_session(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn upload_chunk(
    state: web::Data<AppState>,
    path: web::Path<(String, u32)>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let (session_id, chunk_index) = path.into_inner();
    let receipt = state.uploads.upload_chunk(&session_id, chunk_index, &body).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn get_upload(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.uploads.status(&path.into_inner())?))
}

pub async fn cancel_upload(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let cancelled = state.uploads.cancel(&path.into_inner()).await;
    HttpResponse::Ok().json(json!({ "cancelled": cancelled }))
}

#[cfg(test)]
mod tests {
    use crate::handlers::configure;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, web, App};
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};

    #[actix_web::test]
    async fn test_chunked_upload_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| configure(cfg, 1024 * 1024)),
        )
        .await;

        let data: Vec<u8> = (0..10u8).collect();
        let hash = format!("{:x}", Sha256::digest(&data));

        let req = test::TestRequest::post()
            .uri("/api/v1/uploads")
            .set_json(json!({
                "file_name": "notes.bin",
                "file_size": data.len(),
                "file_hash": hash,
                "chunk_size": 4
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Value = test::read_body_json(resp).await;
        assert_eq!(created["total_chunks"], 3);
        let session_id = created["session_id"].as_str().unwrap().to_string();

        // Last chunk first; a wrong-length chunk is rejected.
        let req = test::TestRequest::put()
            .uri(&format!("/api/v1/uploads/{}/chunks/2", session_id))
            .set_payload(data[8..].to_vec())
            .to_request();
        let receipt: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(receipt["uploaded_chunks"], 1);

        let req = test::TestRequest::put()
            .uri(&format!("/api/v1/uploads/{}/chunks/0", session_id))
            .set_payload(vec![0u8; 3])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri(&format!("/api/v1/uploads/{}", session_id)).to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["missing_chunks"], json!([0, 1]));

        let mut last = Value::Null;
        for (index, range) in [(0, 0..4), (1, 4..8)] {
            let req = test::TestRequest::put()
                .uri(&format!("/api/v1/uploads/{}/chunks/{}", session_id, index))
                .set_payload(data[range].to_vec())
                .to_request();
            last = test::call_and_read_body_json(&app, req).await;
        }
        assert_eq!(last["completed"], true);
        let final_path = last["final_path"].as_str().unwrap().to_string();
        assert_eq!(std::fs::read(final_path).unwrap(), data);
    }

    #[actix_web::test]
    async fn test_unknown_session_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| configure(cfg, 1024 * 1024)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/uploads/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/api/v1/uploads/nope/cancel").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cancelled"], false);
    }
}

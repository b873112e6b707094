pub mod config;
pub mod jobs;
pub mod models;
pub mod progress;
pub mod system;
pub mod uploads;

pub use config::*;
pub use jobs::*;
pub use models::*;
pub use progress::*;
pub use system::*;
pub use uploads::*;

use crate::health;
use actix_web::web;

/// Register the `/api/v1` routes.
///
/// `max_chunk_bytes` bounds the chunk upload body; every other route keeps
/// actix's default payload limit.
pub fn configure(cfg: &mut web::ServiceConfig, max_chunk_bytes: usize) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(get_config))
            // Jobs
            .route("/jobs", web::post().to(submit_job))
            .route("/jobs", web::get().to(list_jobs))
            .route("/jobs/stats", web::get().to(job_stats))
            .route("/jobs/compact", web::post().to(compact_jobs))
            .route("/jobs/{id}", web::get().to(get_job))
            .route("/jobs/{id}/cancel", web::post().to(cancel_job))
            // Uploads
            .route("/uploads", web::post().to(create_upload))
            .service(
                web::resource("/uploads/{id}/chunks/{index}")
                    .app_data(web::PayloadConfig::new(max_chunk_bytes))
                    .route(web::put().to(upload_chunk)),
            )
            .route("/uploads/{id}", web::get().to(get_upload))
            .route("/uploads/{id}/cancel", web::post().to(cancel_upload))
            // Progress
            .route("/progress", web::get().to(list_progress))
            .route("/progress/{id}", web::get().to(get_progress))
            .route("/progress/{id}/stream", web::get().to(stream_progress))
            .route("/progress/{id}/cancel", web::post().to(cancel_progress))
            // Models and host
            .route("/models/status", web::get().to(model_status))
            .route("/models/release", web::post().to(release_model))
            .route("/system/resources", web::get().to(system_resources)),
    );
}

//! # Health and Metrics Endpoints
//!
//! - `GET /health`: liveness plus a one-line summary per component
//! - `GET /api/v1/metrics`: request metrics, scheduler stats and resource statistics

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::time::Duration;

/// Window used for the resource statistics in `/metrics`.
const METRICS_WINDOW: Duration = Duration::from_secs(300);

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let scheduler = state.scheduler().stats();
    let model = state.models.status();
    let latest = state.monitor.latest();

    let memory_pressure = state.monitor.under_memory_pressure();
    let status = if memory_pressure { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "components": {
            "scheduler": {
                "pending": scheduler.pending,
                "running": scheduler.running,
                "workers": scheduler.workers,
                "utilization": scheduler.worker_utilization
            },
            "uploads": {
                "active_sessions": state.uploads.active_sessions(),
                "max_sessions": config.uploads.max_sessions
            },
            "progress": {
                "records": state.progress.len(),
                "active": state.progress.list_active(None).len()
            },
            "model": {
                "name": model.name,
                "state": model.state,
                "device": model.device,
                "reference_count": model.reference_count
            },
            "resources": {
                "monitoring": state.monitor.is_running(),
                "memory_pressure": memory_pressure,
                "latest": latest
            }
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "scheduler": state.scheduler().stats(),
        "model": state.models.status(),
        "resources": state.monitor.statistics(METRICS_WINDOW)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_components() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["model"]["name"], "silent");
        assert_eq!(body["components"]["model"]["state"], "unloaded");
        assert_eq!(body["components"]["uploads"]["active_sessions"], 0);

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["scheduler"]["workers"], 1);
        assert!(body["resources"].is_null());
    }
}

//! # Media Jobs Backend - Main Application Entry Point
//!
//! Job orchestration core of a media transcription backend, served over HTTP
//! with Actix-web.
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, config.toml, environment variables)
//! - **state**: shared application state, wiring and background loops
//! - **scheduler**: priority queue and worker pool with retries and cancellation
//! - **progress**: progress records with live streams and retention
//! - **upload**: resumable chunked uploads with SHA-256 verification
//! - **transcription**: Whisper model lifecycle (lazy load, leases, idle unload)
//! - **monitor**: periodic CPU/memory/disk sampling and thresholds
//! - **jobs**: job descriptions and the transcription job
//! - **handlers**, **health**, **middleware**: the HTTP surface
//! - **error**: error taxonomy and HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod jobs;
mod middleware;
mod monitor;
mod progress;
mod scheduler;
mod state;
mod transcription;
mod upload;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// ## What this does:
/// 1. Loads and validates configuration
/// 2. Builds the shared state and starts workers, monitor and maintenance loops
/// 3. Serves HTTP until the server fails or SIGINT/SIGTERM arrives
/// 4. Stops the server, then cancels in-flight jobs and background work
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        workers = config.scheduler.workers,
        model = %config.models.whisper_model,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone())?;
    app_state.start();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_chunk_bytes = usize::try_from(config.uploads.max_chunk_size).unwrap_or(usize::MAX);
    info!("Starting HTTP server on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            // Middleware runs in reverse registration order on the way in
            .wrap(middleware::MetricsMiddleware)
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(|cfg| handlers::configure(cfg, max_chunk_bytes))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    app_state.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`.
///
/// Defaults to `media_jobs_backend=debug,actix_web=info` when `RUST_LOG` is unset.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_jobs_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
///
/// If a handler cannot be installed the corresponding branch never fires;
/// the other one still works.
async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

use analytics_node::backend::mock::MockBackend;
use analytics_node::backend::vision::VisionBackend;
use analytics_node::backend::AnalysisBackend;
use analytics_node::source::ffmpeg::FfmpegOpener;
use analytics_node::{api, AnalyticsConfig, AnalyticsState, BackendRegistry, ResultStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = telemetry::init_with_service("analytics-node");

    info!("Starting analytics node...");

    let config = AnalyticsConfig::from_env().context("Failed to load configuration")?;
    config.log_summary();

    let backend: Arc<dyn AnalysisBackend> = match config.vision_config() {
        Some(vision) => match VisionBackend::new(vision) {
            Ok(backend) => {
                info!(model = %config.anthropic_model, "using vision analysis backend");
                Arc::new(backend)
            }
            Err(e) => {
                warn!(error = %e, "failed to initialize vision backend, using mock analysis");
                Arc::new(MockBackend::new())
            }
        },
        None => {
            info!("using mock analysis backend");
            Arc::new(MockBackend::new())
        }
    };

    let backends = BackendRegistry::new(backend).with_timeout(config.backend_timeout);
    let store = ResultStore::new(config.max_results);
    let opener = Arc::new(FfmpegOpener::new(config.ffmpeg_settings()));

    let state = AnalyticsState::new(
        opener,
        backends,
        store,
        config.worker_settings(),
        config.max_concurrent_streams,
    );

    if config.demo_streams {
        let added = state
            .streams()
            .seed_demo_streams(config.demo_video_path.as_deref())
            .await;
        info!(added, "demo streams registered");
    }

    let app = api::router(state.clone(), &config.cors_origins);

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Analytics node listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("Analytics node stopped");

    Ok(())
}

async fn shutdown_signal(state: AnalyticsState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully, stopping all streams...");
    state.shutdown().await;
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use crate::config::StudioToml;
use crate::generator::{CodeGenerator, GeminiModel, RetryPolicy};
use crate::job::JobRegistry;
use crate::pipeline::{ArtifactPersister, Orchestrator};
use crate::render::{DockerCli, RenderExecutor, RenderSettings};
use crate::storage;
use crate::store::{DbHandle, StudioDb};
use crate::validator::{PythonSyntaxChecker, SandboxValidator};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Listener settings for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
        }
    }
}

impl From<&StudioToml> for ServerConfig {
    fn from(config: &StudioToml) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev_mode,
        }
    }
}

/// Build the full application router. Dev mode adds permissive CORS.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let router = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Assemble every pipeline component from configuration.
pub fn build_state(config: &StudioToml) -> Result<SharedState> {
    let db = StudioDb::new(&config.server.db_path)
        .with_context(|| format!("Failed to open database at {}", config.server.db_path.display()))?;
    let db = DbHandle::new(db);

    let blobs = storage::from_config(&config.storage).context("Failed to configure blob storage")?;

    let gen_cfg = &config.generator;
    let model = GeminiModel::new(
        &gen_cfg.api_base,
        &gen_cfg.model,
        gen_cfg.api_key.clone(),
        Duration::from_secs(gen_cfg.request_timeout_secs),
    )?;
    let retry = RetryPolicy {
        max_attempts: gen_cfg.max_attempts.max(1),
        base_delay: Duration::from_millis(gen_cfg.base_delay_ms),
    };
    let generator = CodeGenerator::new(Arc::new(model), retry);

    let temp_root: PathBuf = std::path::absolute(&config.server.temp_root).with_context(|| {
        format!("Failed to resolve temp root {}", config.server.temp_root.display())
    })?;
    std::fs::create_dir_all(&temp_root)
        .with_context(|| format!("Failed to create temp root {}", temp_root.display()))?;

    let checker = PythonSyntaxChecker::new(
        &config.validator.python_cmd,
        Duration::from_secs(config.validator.syntax_timeout_secs),
    )
    .with_scratch_root(temp_root.clone());
    let validator = SandboxValidator::new(Arc::new(checker), config.validator.max_code_bytes);

    let renderer = RenderExecutor::new(
        Arc::new(DockerCli::new(&config.renderer.docker_cmd)),
        RenderSettings::from(&config.renderer),
    );

    let jobs = Arc::new(JobRegistry::new(Duration::from_secs(config.server.job_retention_secs)));
    let persister = ArtifactPersister::new(db.clone(), blobs.clone());

    let orchestrator = Orchestrator::new(generator, validator, renderer, persister, jobs.clone(), temp_root)
        .with_generated_validation(config.validator.validate_generated);

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        db,
        blobs,
        jobs,
        default_url_ttl: Duration::from_secs(config.storage.default_url_ttl_secs),
    }))
}

/// Start the server and block until Ctrl-C.
pub async fn start_server(listen: ServerConfig, config: &StudioToml) -> Result<()> {
    for warning in config.validate() {
        warn!("{warning}");
    }

    let state = build_state(config)?;
    let reaper = state.jobs.spawn_reaper(REAPER_INTERVAL);
    let app = build_router(state, listen.dev_mode);

    let addr: SocketAddr = format!("{}:{}", listen.host, listen.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", listen.host, listen.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(%addr, dev_mode = listen.dev_mode, "promptreel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C; shutting down");
        return;
    }
    info!("Shutting down...");
}

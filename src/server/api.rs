use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::errors::InputError;
use crate::generator::Prompt;
use crate::job::{JobRegistry, JobSnapshot};
use crate::pipeline::{Orchestrator, ProgressSink};
use crate::storage::BlobStore;
use crate::store::{DbHandle, ProjectDetail, ProjectPage};
use crate::validator::ValidationReport;

/// Header carrying the caller's identity, set by the upstream auth proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header on streamed responses naming the job behind them.
pub const JOB_ID_HEADER: &str = "x-job-id";

const PROGRESS_BUFFER: usize = 64;
const DEFAULT_PAGE_LIMIT: i64 = 10;
const MAX_PAGE_LIMIT: i64 = 100;
const MAX_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// ── State ─────────────────────────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub db: DbHandle,
    pub blobs: Arc<dyn BlobStore>,
    pub jobs: Arc<JobRegistry>,
    pub default_url_ttl: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "Request failed");
        ApiError::Internal(err.to_string())
    }
}

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Caller identity ───────────────────────────────────────────────────

/// The authenticated user, read from [`USER_ID_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or_else(|| ApiError::Unauthorized("Missing caller identity".into()))
    }
}

// ── Request / response bodies ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlQuery {
    pub expires_in: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoUrl {
    pub url: String,
    pub file_name: String,
    pub expires_in: u64,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/generate", post(generate))
        .route("/validate", post(validate_code))
        .route("/projects", get(list_projects))
        .route("/project/{project_id}", get(get_project))
        .route("/update/project/{project_id}", put(update_project))
        .route("/video/{video_id}", get(video_redirect))
        .route("/video/{video_id}/url", get(video_url))
        .route("/job/{job_id}", get(get_job))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn generate(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let prompt = Prompt::parse(req.prompt.as_deref().unwrap_or_default())?;

    let job_id = uuid::Uuid::new_v4().to_string();
    info!(job_id, owner_id, "Accepted generation request");

    let (sink, rx) = ProgressSink::channel(PROGRESS_BUFFER);
    let orchestrator = state.orchestrator.clone();
    let id = job_id.clone();
    let task_sink = sink.clone();
    spawn_supervised(state.jobs.clone(), job_id.clone(), sink, async move {
        orchestrator.run_generation(&id, &owner_id, prompt, &task_sink).await
    });

    Ok(progress_response(&job_id, rx))
}

async fn update_project(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    Path(project_id): Path<String>,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let code = req
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or(InputError::EmptyCode)?;

    let id = project_id.clone();
    let project = state
        .db
        .call(move |db| db.get_owned_project(&id, &owner_id))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Project {project_id} not found")))?;

    let job_id = project.id.clone();
    info!(job_id, "Accepted re-render request");

    let (sink, rx) = ProgressSink::channel(PROGRESS_BUFFER);
    let orchestrator = state.orchestrator.clone();
    let task_sink = sink.clone();
    spawn_supervised(state.jobs.clone(), job_id.clone(), sink, async move {
        orchestrator.run_rerender(&project, code, &task_sink).await
    });

    Ok(progress_response(&job_id, rx))
}

async fn validate_code(
    State(state): State<SharedState>,
    _caller: Caller,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<Json<ValidationReport>, ApiError> {
    let Json(req) = payload?;
    let code = req.code.ok_or(InputError::EmptyCode)?;
    Ok(Json(state.orchestrator.validator().validate(&code).await))
}

async fn get_project(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let id = project_id.clone();
    state
        .db
        .call(move |db| db.get_project_detail(&id, &owner_id))
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Project {project_id} not found")))
}

async fn list_projects(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<ProjectPage>, ApiError> {
    let Query(query) = query?;
    let page = query.page.filter(|p| *p >= 1).unwrap_or(1);
    let limit = query
        .limit
        .filter(|l| *l >= 1)
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(MAX_PAGE_LIMIT);

    let page = state
        .db
        .call(move |db| db.list_projects(&owner_id, page, limit))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(page))
}

async fn video_url(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    Path(video_id): Path<String>,
    query: Result<Query<UrlQuery>, QueryRejection>,
) -> Result<Json<VideoUrl>, ApiError> {
    let Query(query) = query?;
    let expires_in = query
        .expires_in
        .filter(|s| *s > 0)
        .unwrap_or(state.default_url_ttl.as_secs())
        .min(MAX_URL_TTL_SECS);

    let (file_name, url) = sign_owned_video(&state, owner_id, video_id, expires_in).await?;
    Ok(Json(VideoUrl { url, file_name, expires_in }))
}

/// Redirect to a signed URL valid for the default TTL.
async fn video_redirect(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    Path(video_id): Path<String>,
) -> Result<Redirect, ApiError> {
    let ttl = state.default_url_ttl.as_secs().min(MAX_URL_TTL_SECS);
    let (_, url) = sign_owned_video(&state, owner_id, video_id, ttl).await?;
    Ok(Redirect::temporary(&url))
}

async fn sign_owned_video(
    state: &AppState,
    owner_id: String,
    video_id: String,
    expires_in: u64,
) -> Result<(String, String), ApiError> {
    let id = video_id.clone();
    let video = state
        .db
        .call(move |db| db.get_owned_video(&id, &owner_id))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Video {video_id} not found")))?;

    let url = state
        .blobs
        .sign_url(&video.blob_key, &video.blob_bucket, Duration::from_secs(expires_in))
        .await
        .map_err(ApiError::internal)?;
    Ok((video.file_name, url))
}

async fn get_job(
    State(state): State<SharedState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    state
        .jobs
        .get(&job_id)
        .filter(|job| job.owner_id == owner_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))
}

// ── Streaming helpers ─────────────────────────────────────────────────

fn progress_response(job_id: &str, rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
    });
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::HeaderName::from_static(JOB_ID_HEADER), job_id.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Run a pipeline task detached from the request. A panicking task still
/// leaves a terminal line on the stream and a failed job behind.
fn spawn_supervised<F>(jobs: Arc<JobRegistry>, job_id: String, sink: ProgressSink, task: F)
where
    F: Future<Output = JobSnapshot> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(async move {
        match handle.await {
            Ok(snapshot) => {
                info!(job_id, status = ?snapshot.status, "Job finished");
            }
            Err(e) => {
                error!(job_id, error = %e, "Job task aborted");
                sink.error("Internal error while processing the request").await;
                jobs.force_fail(&job_id, "Job task aborted");
            }
        }
    });
}

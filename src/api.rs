use std::collections::HashSet;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ServiceConfig;
use crate::db::DbHandle;
use crate::errors::DeployError;
use crate::events::{BuildEvent, EventSink};
use crate::llm::GenerativeModel;
use crate::models::{Framework, ProjectSpec, SiteStatus};
use crate::pipeline::BuildPipeline;
use crate::preview::PreviewManager;
use crate::publish::{is_stale, PublishManager};
use crate::repair::ProjectVerifier;
use crate::vercel::VercelClient;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: ServiceConfig,
    /// None until the model API key is configured; builds are rejected.
    pub model: Option<Arc<dyn GenerativeModel>>,
    /// None until the provider token is configured; publish/preview are
    /// rejected.
    pub vercel: Option<Arc<VercelClient>>,
    pub verifier: Arc<dyn ProjectVerifier>,
    /// Per-project build lock: a second concurrent build for the same
    /// project is rejected instead of racing the first.
    pub active_builds: Mutex<HashSet<i64>>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct BuildConfigRequest {
    pub framework: String,
    pub styling: Option<String>,
    pub typescript: Option<bool>,
}

#[derive(Deserialize)]
pub struct PublishRequest {
    pub slug: Option<String>,
}

#[derive(Serialize)]
pub struct SiteStatusResponse {
    pub status: &'static str,
    pub url: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match &e {
            DeployError::SlugTaken { .. } => ApiError::Conflict(e.to_string()),
            DeployError::InvalidSlug { .. } | DeployError::NothingToPublish { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/projects/{id}/build-config",
            put(put_build_config).get(get_build_config),
        )
        .route("/api/projects/{id}/builds", post(run_build))
        .route("/api/projects/{id}/builds/latest", get(get_latest_build))
        .route(
            "/api/projects/{id}/publish",
            post(publish_site).get(get_publish_state).delete(unpublish_site),
        )
        .route("/api/projects/{id}/site-status", get(get_site_status))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/preview", post(create_preview))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn publish_manager(state: &SharedState) -> Result<PublishManager, ApiError> {
    let vercel = state
        .vercel
        .clone()
        .ok_or_else(|| ApiError::Internal("Hosting provider is not configured".into()))?;
    Ok(PublishManager::new(
        state.db.clone(),
        vercel,
        state.config.publish_domain.clone(),
    ))
}

async fn require_project(state: &SharedState, id: i64) -> Result<crate::models::Project, ApiError> {
    state
        .db
        .call(move |db| db.get_project(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name is required".into()));
    }
    let project = state
        .db
        .call(move |db| db.create_project(req.name.trim()))
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(require_project(&state, id).await?))
}

async fn put_build_config(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<BuildConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_project(&state, id).await?;
    let framework = Framework::from_str(&req.framework).map_err(ApiError::BadRequest)?;
    let styling = req.styling.unwrap_or_else(|| "css".to_string());
    let typescript = req.typescript.unwrap_or(true);
    let config = state
        .db
        .call(move |db| db.upsert_build_config(id, framework, &styling, typescript))
        .await?;
    Ok(Json(config))
}

async fn get_build_config(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .db
        .call(move |db| db.get_build_config(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No build config for project {}", id)))?;
    Ok(Json(config))
}

/// Run a build, streaming progress events to the client as SSE. The
/// response stream ends after the terminal `done`/`error` event.
async fn run_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(spec): Json<ProjectSpec>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_project(&state, id).await?;
    let model = state
        .model
        .clone()
        .ok_or_else(|| ApiError::Internal("Model API is not configured".into()))?;

    // Per-project mutual exclusion for the whole invocation.
    {
        let mut active = state
            .active_builds
            .lock()
            .map_err(|e| ApiError::Internal(format!("Build lock poisoned: {}", e)))?;
        if !active.insert(id) {
            return Err(ApiError::Conflict(format!(
                "A build is already running for project {}",
                id
            )));
        }
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let task_state = state.clone();
    tokio::spawn(async move {
        let pipeline = BuildPipeline::new(
            task_state.db.clone(),
            model,
            task_state.verifier.clone(),
            &task_state.config,
        );
        let mut sink = EventSink::new(tx);
        if let Err(e) = pipeline.run(id, spec, &mut sink).await {
            warn!("build for project {} failed: {}", id, e);
        }
        if let Ok(mut active) = task_state.active_builds.lock() {
            active.remove(&id);
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &BuildEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("failed to serialize build event: {}", e);
            Event::default().data("{}")
        }
    }
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.get_build_output(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Build {} not found", id)))?;
    Ok(Json(build))
}

async fn get_latest_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.latest_complete_build(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No complete build for project {}", id)))?;
    Ok(Json(build))
}

async fn publish_site(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_project(&state, id).await?;
    let site = publish_manager(&state)?.publish(id, req.slug).await?;
    Ok(Json(site))
}

async fn unpublish_site(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let site = publish_manager(&state)?.unpublish(id).await?;
    Ok(Json(site))
}

async fn get_publish_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let status = publish_manager(&state)?
        .status(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} has never been published", id)))?;
    Ok(Json(status))
}

/// Publish-state summary consumed by the preview banner.
async fn get_site_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let site = state.db.call(move |db| db.get_site(id)).await?;
    let response = match site {
        Some(site) if site.status == SiteStatus::Ready => {
            let latest = state
                .db
                .call(move |db| db.latest_complete_build(id))
                .await?;
            if is_stale(&site, latest.map(|b| b.id)) {
                SiteStatusResponse {
                    status: "update_available",
                    url: Some(site.url),
                }
            } else {
                SiteStatusResponse {
                    status: "published",
                    url: Some(site.url),
                }
            }
        }
        _ => SiteStatusResponse {
            status: "not_published",
            url: None,
        },
    };
    Ok(Json(response))
}

async fn create_preview(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let vercel = state
        .vercel
        .clone()
        .ok_or_else(|| ApiError::Internal("Hosting provider is not configured".into()))?;
    let manager = PreviewManager::new(
        state.db.clone(),
        vercel,
        state.config.service_url.clone(),
        state.config.studio_url.clone(),
    );
    let info = manager.preview(id).await?;
    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SiteDb;
    use crate::errors::PipelineError;
    use crate::llm::DeltaStream;
    use crate::models::{Framework, GeneratedFile};
    use crate::verifier::VerifyOutcome;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct ScriptedModel {
        deltas: Vec<String>,
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn stream_generation(&self, _prompt: &str) -> Result<DeltaStream, PipelineError> {
            let items: Vec<Result<String, PipelineError>> =
                self.deltas.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn complete(&self, _prompt: &str) -> Result<String, PipelineError> {
            Ok(String::new())
        }
    }

    struct PassVerifier;

    #[async_trait]
    impl ProjectVerifier for PassVerifier {
        async fn verify(&self, _framework: Framework, _files: &[GeneratedFile]) -> VerifyOutcome {
            VerifyOutcome::Pass
        }
    }

    fn test_state() -> SharedState {
        let config = ServiceConfig {
            vercel_token: Some("test-token".into()),
            ..ServiceConfig::default()
        };
        let vercel = Arc::new(VercelClient::new(&config).unwrap());
        Arc::new(AppState {
            db: DbHandle::new(SiteDb::new_in_memory().unwrap()),
            config,
            model: Some(Arc::new(ScriptedModel {
                deltas: vec!["===FILE: index.html===\n<html>ok</html>\n===END FILE===".into()],
            })),
            vercel: Some(vercel),
            verifier: Arc::new(PassVerifier),
            active_builds: Mutex::new(HashSet::new()),
        })
    }

    fn test_router(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn seed_project(state: &SharedState, framework: &str) -> i64 {
        let app = test_router(state.clone());
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/projects",
                serde_json::json!({"name": "Test Shop"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let project = body_json(resp).await;
        let id = project["id"].as_i64().unwrap();

        let app = test_router(state.clone());
        let resp = app
            .oneshot(json_request(
                "PUT",
                &format!("/api/projects/{}/build-config", id),
                serde_json::json!({"framework": framework}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        id
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router(test_state());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let state = test_state();
        let id = seed_project(&state, "static").await;

        let app = test_router(state);
        let req = Request::builder()
            .uri(format!("/api/projects/{}", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let project = body_json(resp).await;
        assert_eq!(project["name"], "Test Shop");
    }

    #[tokio::test]
    async fn test_unknown_project_is_404() {
        let app = test_router(test_state());
        let req = Request::builder()
            .uri("/api/projects/999")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_framework_is_400() {
        let state = test_state();
        let id = seed_project(&state, "static").await;
        let app = test_router(state);
        let resp = app
            .oneshot(json_request(
                "PUT",
                &format!("/api/projects/{}/build-config", id),
                serde_json::json!({"framework": "rails"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_build_streams_events_and_persists() {
        let state = test_state();
        let id = seed_project(&state, "static").await;

        let app = test_router(state.clone());
        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/api/projects/{}/builds", id),
                serde_json::json!({"name": "Test Shop"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("file_start"));
        assert!(text.contains("file_complete"));
        assert!(text.contains("\"done\""));

        // The completed build is readable afterwards.
        let app = test_router(state);
        let req = Request::builder()
            .uri(format!("/api/projects/{}/builds/latest", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let build = body_json(resp).await;
        assert_eq!(build["status"], "complete");
        assert_eq!(build["files"][0]["path"], "index.html");
    }

    #[tokio::test]
    async fn test_concurrent_build_for_same_project_is_409() {
        let state = test_state();
        let id = seed_project(&state, "static").await;
        state.active_builds.lock().unwrap().insert(id);

        let app = test_router(state);
        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/api/projects/{}/builds", id),
                serde_json::json!({"name": "Test Shop"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_site_status_lifecycle() {
        let state = test_state();
        let id = seed_project(&state, "static").await;

        // Never published.
        let app = test_router(state.clone());
        let req = Request::builder()
            .uri(format!("/api/projects/{}/site-status", id))
            .body(Body::empty())
            .unwrap();
        let status = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(status["status"], "not_published");

        // Seed a complete build and a live site for it.
        state
            .db
            .call(move |db| {
                let config = db.get_build_config(id)?.unwrap();
                let build = db.create_build_output(id, config.id)?;
                let files = vec![GeneratedFile::new("index.html", "<html></html>")];
                let build = db.complete_build_output(build.id, &files, None)?;
                db.upsert_site(id, "test-shop", "prj_1", "dpl_1", "https://test-shop.sites.test", build.id)?;
                Ok(())
            })
            .await
            .unwrap();

        let app = test_router(state.clone());
        let req = Request::builder()
            .uri(format!("/api/projects/{}/site-status", id))
            .body(Body::empty())
            .unwrap();
        let status = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(status["status"], "published");
        assert_eq!(status["url"], "https://test-shop.sites.test");

        // A newer complete build flips it to update_available.
        state
            .db
            .call(move |db| {
                let config = db.get_build_config(id)?.unwrap();
                let build = db.create_build_output(id, config.id)?;
                let files = vec![GeneratedFile::new("index.html", "<html>v2</html>")];
                db.complete_build_output(build.id, &files, None)?;
                Ok(())
            })
            .await
            .unwrap();

        let app = test_router(state);
        let req = Request::builder()
            .uri(format!("/api/projects/{}/site-status", id))
            .body(Body::empty())
            .unwrap();
        let status = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(status["status"], "update_available");
    }

    #[tokio::test]
    async fn test_publish_idempotent_via_api() {
        let state = test_state();
        let id = seed_project(&state, "static").await;
        state
            .db
            .call(move |db| {
                let config = db.get_build_config(id)?.unwrap();
                let build = db.create_build_output(id, config.id)?;
                let files = vec![GeneratedFile::new("index.html", "<html></html>")];
                let build = db.complete_build_output(build.id, &files, None)?;
                db.upsert_site(id, "test-shop", "prj_1", "dpl_1", "https://test-shop.sites.test", build.id)?;
                Ok(())
            })
            .await
            .unwrap();

        // Site already live for the latest build: returns it unchanged.
        let app = test_router(state);
        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/api/projects/{}/publish", id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let site = body_json(resp).await;
        assert_eq!(site["slug"], "test-shop");
        assert_eq!(site["vercel_project_id"], "prj_1");
    }

    #[tokio::test]
    async fn test_publish_slug_conflict_is_409() {
        let state = test_state();
        let owner = seed_project(&state, "static").await;
        state
            .db
            .call(move |db| {
                let config = db.get_build_config(owner)?.unwrap();
                let build = db.create_build_output(owner, config.id)?;
                let files = vec![GeneratedFile::new("index.html", "<html></html>")];
                let build = db.complete_build_output(build.id, &files, None)?;
                db.upsert_site(owner, "taken", "prj_1", "dpl_1", "https://x", build.id)?;
                Ok(())
            })
            .await
            .unwrap();

        let challenger = seed_project(&state, "static").await;
        state
            .db
            .call(move |db| {
                let config = db.get_build_config(challenger)?.unwrap();
                let build = db.create_build_output(challenger, config.id)?;
                let files = vec![GeneratedFile::new("index.html", "<html></html>")];
                db.complete_build_output(build.id, &files, None)?;
                Ok(())
            })
            .await
            .unwrap();

        let app = test_router(state);
        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/api/projects/{}/publish", challenger),
                serde_json::json!({"slug": "taken"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_build_without_model_configured_is_rejected() {
        let state = test_state();
        let id = seed_project(&state, "static").await;
        let stripped = Arc::new(AppState {
            db: state.db.clone(),
            config: state.config.clone(),
            model: None,
            vercel: state.vercel.clone(),
            verifier: state.verifier.clone(),
            active_builds: Mutex::new(HashSet::new()),
        });

        let app = test_router(stripped);
        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/api/projects/{}/builds", id),
                serde_json::json!({"name": "Test Shop"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_get_build_404() {
        let app = test_router(test_state());
        let req = Request::builder()
            .uri("/api/builds/42")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

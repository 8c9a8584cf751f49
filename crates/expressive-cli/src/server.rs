//! HTTP form and the `run` API.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use expressive::constants::QUEUE_MAX_SIZE;
use expressive::lang::DEFAULT_TARGET_LANGUAGE;
use expressive::{ModelContext, Pipeline, PipelineError, Translation};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::page::render_page;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Example {
    pub audio: &'static str,
    pub target_language: &'static str,
}

pub const EXAMPLES: [Example; 4] = [
    Example {
        audio: "sample_input.mp3",
        target_language: "French",
    },
    Example {
        audio: "sample_input.mp3",
        target_language: "Mandarin Chinese",
    },
    Example {
        audio: "sample_input_2.mp3",
        target_language: "French",
    },
    Example {
        audio: "sample_input_2.mp3",
        target_language: "Spanish",
    },
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub assets_dir: PathBuf,
    pub show_duplicate_button: bool,
    pub space_id: Option<String>,
    /// Requests admitted at once, waiting and running.
    pub queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("assets"),
            show_duplicate_button: false,
            space_id: None,
            queue_size: QUEUE_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub text: String,
    pub audio_url: String,
    pub warnings: Vec<String>,
}

/// Shared state for the HTTP server.
pub struct AppState {
    pipeline: Pipeline,
    config: ServerConfig,
    page: String,
    admission: Arc<Semaphore>,
    worker: Arc<tokio::sync::Mutex<()>>,
    outputs: Mutex<HashMap<String, PathBuf>>,
    cached_examples: Mutex<HashMap<usize, RunResponse>>,
    // Uploads and outputs live here until shutdown.
    work_dir: tempfile::TempDir,
}

impl AppState {
    pub fn new(ctx: Arc<ModelContext>, config: ServerConfig) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("expressive-")
            .tempdir()
            .context("create work directory")?;
        for sub in ["uploads", "outputs"] {
            std::fs::create_dir_all(work_dir.path().join(sub))
                .with_context(|| format!("create {sub} directory"))?;
        }
        let pipeline = Pipeline::new(ctx).with_output_dir(work_dir.path().join("outputs"));
        let page = render_page(config.show_duplicate_button, config.space_id.as_deref());
        Ok(Self {
            pipeline,
            admission: Arc::new(Semaphore::new(config.queue_size)),
            config,
            page,
            worker: Arc::new(tokio::sync::Mutex::new(())),
            outputs: Mutex::new(HashMap::new()),
            cached_examples: Mutex::new(HashMap::new()),
            work_dir,
        })
    }

    fn uploads_dir(&self) -> PathBuf {
        self.work_dir.path().join("uploads")
    }

    fn admit(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        self.admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "queue is full, try again later"))
    }

    /// Run one request on the blocking pool, one at a time.
    ///
    /// The worker guard and the admission permit move into the blocking task,
    /// so a client that disconnects mid-run still occupies its slot until the
    /// pipeline returns.
    async fn translate(
        &self,
        permit: Option<OwnedSemaphorePermit>,
        bytes: Vec<u8>,
        extension: Option<String>,
        target_language: String,
    ) -> Result<RunResponse, ApiError> {
        let running = self.worker.clone().lock_owned().await;
        let pipeline = self.pipeline.clone();
        let uploads = self.uploads_dir();

        let translation = tokio::task::spawn_blocking(move || -> Result<Translation, ApiError> {
            let _held = (running, permit);
            let suffix = extension.map(|e| format!(".{e}")).unwrap_or_default();
            let mut input = tempfile::Builder::new()
                .prefix("upload-")
                .suffix(&suffix)
                .tempfile_in(&uploads)
                .map_err(ApiError::internal)?;
            input
                .write_all(&bytes)
                .and_then(|()| input.flush())
                .map_err(ApiError::internal)?;
            Ok(pipeline.run(input.path(), &target_language)?)
        })
        .await
        .map_err(ApiError::internal)??;

        Ok(self.publish(translation))
    }

    fn publish(&self, translation: Translation) -> RunResponse {
        let name = translation
            .audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), translation.audio_path);
        RunResponse {
            text: translation.text,
            audio_url: format!("/outputs/{name}"),
            warnings: translation.warnings,
        }
    }

    fn output_path(&self, name: &str) -> Option<PathBuf> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn cached_example(&self, index: usize) -> Option<RunResponse> {
        self.cached_examples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    async fn run_example(
        &self,
        permit: Option<OwnedSemaphorePermit>,
        index: usize,
    ) -> Result<RunResponse, ApiError> {
        let example = EXAMPLES
            .get(index)
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no example {index}")))?;
        let path = self.config.assets_dir.join(example.audio);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ApiError::internal(format!("read {}: {e}", path.display())))?;
        self.translate(
            permit,
            bytes,
            extension_of(example.audio),
            example.target_language.to_string(),
        )
        .await
    }
}

/// Translate every example row once and keep the results.
pub async fn cache_examples(state: &AppState) -> Result<()> {
    for (index, example) in EXAMPLES.iter().enumerate() {
        let result = state
            .run_example(None, index)
            .await
            .map_err(|e| anyhow::anyhow!("example {index} ({}): {}", example.audio, e.message))?;
        state
            .cached_examples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, result);
        tracing::info!(index, audio = example.audio, lang = example.target_language, "cached example");
    }
    Ok(())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(e: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!(error = %e, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::UnknownLanguage(_) => StatusCode::BAD_REQUEST,
            PipelineError::Audio(_) | PipelineError::Features(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Model(_) | PipelineError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if e.is_input_error() {
            tracing::warn!(error = %e, "rejected request");
        } else {
            tracing::error!(error = %e, "request failed");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Build the HTTP router for the service.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health))
        .route("/api/run", post(run))
        .route("/api/examples/:index", post(example))
        .route("/outputs/:name", get(output))
        .route("/assets/:name", get(asset))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.page.clone())
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Default)]
struct RunForm {
    audio: Option<(Vec<u8>, Option<String>)>,
    target_language: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<RunForm, ApiError> {
    let mut form = RunForm::default();
    while let Some(field) = multipart.next_field().await.map_err(ApiError::bad_request)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("audio") => {
                let extension = field.file_name().and_then(extension_of);
                let bytes = field.bytes().await.map_err(ApiError::bad_request)?;
                form.audio = Some((bytes.to_vec(), extension));
            }
            Some("target_language") => {
                form.target_language = Some(field.text().await.map_err(ApiError::bad_request)?);
            }
            _ => {}
        }
    }
    Ok(form)
}

/// The `run` API: multipart `audio` + `target_language`.
async fn run(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<RunResponse>, ApiError> {
    let permit = state.admit()?;
    let form = read_form(multipart).await?;
    let (bytes, extension) = form
        .audio
        .ok_or_else(|| ApiError::bad_request("missing `audio` field"))?;
    let target_language = form
        .target_language
        .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string());
    tracing::info!(bytes = bytes.len(), target_language = %target_language, "run request");
    Ok(Json(
        state
            .translate(Some(permit), bytes, extension, target_language)
            .await?,
    ))
}

async fn example(
    State(state): State<Arc<AppState>>,
    AxumPath(index): AxumPath<usize>,
) -> Result<Json<RunResponse>, ApiError> {
    if let Some(hit) = state.cached_example(index) {
        return Ok(Json(hit));
    }
    let permit = state.admit()?;
    Ok(Json(state.run_example(Some(permit), index).await?))
}

async fn output(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .output_path(&name)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown output"))?;
    let bytes = tokio::fs::read(&path).await.map_err(ApiError::internal)?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes))
}

async fn asset(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !EXAMPLES.iter().any(|ex| ex.audio == name) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "unknown asset"));
    }
    let bytes = tokio::fs::read(state.config.assets_dir.join(&name))
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "asset not available"))?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes))
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")
}

/// Wait for a shutdown signal.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

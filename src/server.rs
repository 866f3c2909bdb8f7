use std::{
    collections::HashMap,
    path::{Component, Path as FsPath, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    aggregator::MergeStats,
    client::PageSource,
    config::FofaConfig,
    export::default_file_name,
    query::SearchRequest,
    session::{ExportFormat, Session, SessionError, SessionSummary},
    types::{AdditionalField, Record},
};

pub struct AppState<S> {
    inner: Arc<RwLock<ServerState>>, // open sessions by id
    source: Arc<S>,
    config: Arc<FofaConfig>,
    export_root: Arc<PathBuf>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            source: self.source.clone(),
            config: self.config.clone(),
            export_root: self.export_root.clone(),
        }
    }
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    sessions: HashMap<u64, SessionHandle>,
}

#[derive(Clone)]
struct SessionHandle {
    title: String,
    cancel: CancellationToken,
    session: Arc<Mutex<Session<Record>>>,
    // Held for a whole page load so one session never has two pages in flight.
    loader: Arc<Mutex<()>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    #[serde(flatten)]
    pub search: SearchRequest,
    /// Additional fields for this session; the server defaults apply when absent.
    #[serde(default)]
    pub fields: Option<Vec<AdditionalField>>,
    /// Pages to load in the background right away.
    #[serde(default)]
    pub pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    /// Directory to write into, relative to the server's export root; the
    /// file name is generated.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    #[serde(flatten)]
    pub summary: SessionSummary,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub id: u64,
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub records: Vec<Record>,
}

impl<S: PageSource> AppState<S> {
    pub fn new(source: S, config: FofaConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            source: Arc::new(source),
            config: Arc::new(config),
            export_root: Arc::new(PathBuf::from(".")),
        }
    }

    /// Directory that all HTTP-triggered exports are written under.
    pub fn with_export_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.export_root = Arc::new(root.into());
        self
    }
}

pub fn router<S: PageSource>(state: AppState<S>) -> Router {
    let api = Router::new()
        .route("/sessions", get(list_sessions::<S>).post(open_session::<S>))
        .route(
            "/sessions/{id}",
            get(get_session::<S>).delete(close_session::<S>),
        )
        .route("/sessions/{id}/next", post(next_page::<S>))
        .route("/sessions/{id}/export", post(export_session::<S>))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server<S: PageSource>(
    bind: &str,
    source: S,
    config: FofaConfig,
    export_root: PathBuf,
) -> Result<()> {
    let app = router(AppState::new(source, config).with_export_root(export_root));
    info!("serving API on http://{}", bind);
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn list_sessions<S: PageSource>(State(app): State<AppState<S>>) -> impl IntoResponse {
    let handles: Vec<(u64, Arc<Mutex<Session<Record>>>)> = {
        let s = app.inner.read().await;
        s.sessions
            .iter()
            .map(|(id, h)| (*id, h.session.clone()))
            .collect()
    };
    let mut out = Vec::with_capacity(handles.len());
    for (id, session) in handles {
        out.push(SessionInfo {
            id,
            summary: session.lock().await.summary(),
        });
    }
    out.sort_by_key(|i| i.id);
    (StatusCode::OK, Json(out))
}

async fn open_session<S: PageSource>(
    State(app): State<AppState<S>>,
    Json(req): Json<OpenRequest>,
) -> impl IntoResponse {
    let search = SearchRequest {
        query: req.search.query.trim().to_string(),
        ..req.search
    };
    if search.query.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty query").into_response();
    }

    let mut config = (*app.config).clone();
    if let Some(fields) = req.fields {
        config.additional_fields = fields;
    }

    let title = search.title();
    let cancel = CancellationToken::new();
    let session = Arc::new(Mutex::new(Session::with_cancel(search, config, cancel.clone())));

    let (id, handle) = {
        let mut s = app.inner.write().await;
        // An open session with the same title is reused.
        if let Some((id, _)) = s.sessions.iter().find(|(_, h)| h.title == title) {
            return (StatusCode::OK, Json(serde_json::json!({ "id": id, "title": title })))
                .into_response();
        }
        s.next_id += 1;
        let id = s.next_id;
        let handle = SessionHandle {
            title: title.clone(),
            cancel,
            session,
            loader: Arc::new(Mutex::new(())),
        };
        s.sessions.insert(id, handle.clone());
        (id, handle)
    };
    info!(id, %title, "session opened");

    let pages = req.pages.unwrap_or(1);
    if pages > 0 {
        let source = app.source.clone();
        tokio::spawn(async move {
            for _ in 0..pages {
                match load_next(&handle, source.as_ref()).await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(SessionError::Cancelled) => {
                        info!(id, "background load cancelled");
                        return;
                    }
                    Err(e) => {
                        warn!(id, error = %e, "background load stopped");
                        return;
                    }
                }
            }
            info!(id, "background load finished");
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "title": title })),
    )
        .into_response()
}

async fn get_session<S: PageSource>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    let Some(handle) = lookup(&app, id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let guard = handle.session.lock().await;
    let detail = SessionDetail {
        id,
        summary: guard.summary(),
        records: guard.records().to_vec(),
    };
    (StatusCode::OK, Json(detail)).into_response()
}

async fn next_page<S: PageSource>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    let Some(handle) = lookup(&app, id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match load_next(&handle, app.source.as_ref()).await {
        Ok(Some(stats)) => (StatusCode::OK, Json(stats)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(SessionError::Cancelled) => StatusCode::GONE.into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn export_session<S: PageSource>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
    Json(req): Json<ExportRequest>,
) -> impl IntoResponse {
    let Some(handle) = lookup(&app, id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(dir) = resolve_export_dir(&app.export_root, req.dir.as_deref()) else {
        warn!(id, dir = ?req.dir, "export directory rejected");
        return (StatusCode::BAD_REQUEST, "export directory outside the export root").into_response();
    };
    let path = dir.join(default_file_name(req.format.extension()));
    let outcome = handle.session.lock().await.export(req.format, &path);
    let code = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(outcome)).into_response()
}

async fn close_session<S: PageSource>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    let removed = app.inner.write().await.sessions.remove(&id);
    match removed {
        Some(h) => {
            // Wakes any fetch in flight; its page is discarded with the session.
            h.cancel.cancel();
            info!(id, title = %h.title, "session closed");
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn lookup<S>(app: &AppState<S>, id: u64) -> Option<SessionHandle> {
    app.inner.read().await.sessions.get(&id).cloned()
}

// The session lock covers reserving and merging a page, not the request.
async fn load_next<S: PageSource>(
    handle: &SessionHandle,
    source: &S,
) -> Result<Option<MergeStats>, SessionError> {
    let _loading = handle.loader.lock().await;
    let pending = handle.session.lock().await.begin_fetch()?;
    let Some(pending) = pending else {
        return Ok(None);
    };
    let outcome = tokio::select! {
        _ = handle.cancel.cancelled() => return Err(SessionError::Cancelled),
        outcome = source.fetch(pending.url.clone()) => outcome,
    };
    handle.session.lock().await.apply_outcome(pending, outcome)
}

/// Resolve the directory requested for an export against `root`.
///
/// Only relative paths made of plain components are accepted, and an
/// existing target must not lead out of `root` through a symlink.
pub fn resolve_export_dir(root: &FsPath, requested: Option<&FsPath>) -> Option<PathBuf> {
    let Some(rel) = requested else {
        return Some(root.to_path_buf());
    };
    if !rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        return None;
    }
    let dir = root.join(rel);
    if let (Ok(real_root), Ok(real_dir)) = (root.canonicalize(), dir.canonicalize()) {
        if !real_dir.starts_with(&real_root) {
            return None;
        }
    }
    Some(dir)
}

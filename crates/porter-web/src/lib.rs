//! Axum + Askama glue surface for the task snapshot porter: list runs,
//! request exports and imports, download a finished snapshot, delete runs.
//!
//! Request handling stops at validation and enqueueing; all run work happens
//! in the job-queue worker.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use porter_adapters::{collect_document, render_csv, render_ical, render_text, ImportFormat};
use porter_core::{EntityKey, KeyId, Kind, RunKind, RunStatus, Snapshot};
use porter_storage::{EntityStore, HttpClientConfig, HttpFetcher, MemoryStore};
use porter_sync::{
    EnvCredentialStore, HttpTasksService, JobQueue, JobRequest, PorterConfig, RunWorker,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "porter-web";

/// Principal recorded on runs created through this surface. Real sign-in is
/// outside the system boundary.
const DEFAULT_PRINCIPAL: &str = "local";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub queue: JobQueue,
}

impl AppState {
    pub fn new(store: Arc<dyn EntityStore>, queue: JobQueue) -> Self {
        Self { store, queue }
    }
}

#[derive(Debug, Clone)]
struct SnapshotRow {
    id: String,
    kind: String,
    status: String,
    created_at: String,
    lists: usize,
    tasks: usize,
    message: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    snapshots: Vec<SnapshotRow>,
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    name: String,
    format: String,
    file: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DownloadQuery {
    format: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/snapshots", get(snapshots_handler).post(create_snapshot_handler))
        .route("/snapshots/{id}", delete(delete_snapshot_handler))
        .route("/snapshots/{id}/download", get(download_handler))
        .route("/import", post(import_handler))
        .with_state(Arc::new(state))
}

/// Builds the whole in-process stack from the environment and serves it.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PorterConfig::from_env();
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    let remote = Arc::new(HttpTasksService::new(&config)?);
    let blobs = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
    let worker = RunWorker::new(
        store.clone(),
        remote,
        Arc::new(EnvCredentialStore),
        blobs,
        &config,
    );
    let (queue, _worker_task) = JobQueue::start(Arc::new(worker));

    let port: u16 = std::env::var("PORTER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving");
    axum::serve(listener, app(AppState::new(store, queue))).await?;
    Ok(())
}

fn snapshot_key(id: u64) -> EntityKey {
    EntityKey::root(Kind::Snapshot, KeyId::Numeric(id))
}

fn snapshot_rows(store: &dyn EntityStore) -> anyhow::Result<Vec<SnapshotRow>> {
    let mut rows = Vec::new();
    for entity in store.roots(Kind::Snapshot)? {
        let snapshot = Snapshot::from_entity(&entity)?;
        let lists = store.children_of(&snapshot.key, Kind::TaskList)?.len();
        let tasks = store.children_of(&snapshot.key, Kind::Task)?.len();
        rows.push(SnapshotRow {
            id: snapshot.key.id().to_string(),
            kind: snapshot.run_kind.as_str().to_string(),
            status: snapshot.status.as_str().to_string(),
            created_at: snapshot.created_at.to_rfc3339(),
            lists,
            tasks,
            message: snapshot.error_message.unwrap_or_default(),
        });
    }
    Ok(rows)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match snapshot_rows(state.store.as_ref()) {
        Ok(snapshots) => render_html(IndexTemplate { snapshots }),
        Err(err) => server_error(err),
    }
}

async fn snapshots_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut snapshots = Vec::new();
    match state.store.roots(Kind::Snapshot) {
        Ok(entities) => {
            for entity in entities {
                match Snapshot::from_entity(&entity) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(err) => return server_error(anyhow::Error::new(err)),
                }
            }
        }
        Err(err) => return server_error(anyhow::Error::new(err)),
    }
    Json(snapshots).into_response()
}

async fn create_snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    let user = DEFAULT_PRINCIPAL.to_string();
    let snapshot = match porter_sync::create_snapshot(state.store.as_ref(), &user, RunKind::Export) {
        Ok(snapshot) => snapshot,
        Err(err) => return server_error(anyhow::Error::new(err)),
    };
    if let Err(err) = state.queue.enqueue(JobRequest::Export {
        snapshot: snapshot.key.clone(),
    }) {
        return server_error(anyhow::Error::new(err));
    }
    Json(serde_json::json!({ "id": snapshot.key.id().to_string() })).into_response()
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportRequest>,
) -> Response {
    if request.name.is_empty() || request.file.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "name and file are required" })),
        )
            .into_response();
    }
    let format: ImportFormat = match request.format.parse() {
        Ok(format) => format,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err })),
            )
                .into_response()
        }
    };

    let user = request.user.unwrap_or_else(|| DEFAULT_PRINCIPAL.to_string());
    let snapshot = match porter_sync::create_snapshot(state.store.as_ref(), &user, RunKind::Import) {
        Ok(snapshot) => snapshot,
        Err(err) => return server_error(anyhow::Error::new(err)),
    };
    if let Err(err) = state.queue.enqueue(JobRequest::Import {
        snapshot: snapshot.key.clone(),
        name: request.name,
        format,
        payload: request.file,
    }) {
        return server_error(anyhow::Error::new(err));
    }
    Json(serde_json::json!({ "id": snapshot.key.id().to_string() })).into_response()
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<u64>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let key = snapshot_key(id);
    let snapshot = match state.store.get(&key) {
        Ok(Some(entity)) => match Snapshot::from_entity(&entity) {
            Ok(snapshot) => snapshot,
            Err(err) => return server_error(anyhow::Error::new(err)),
        },
        Ok(None) => return (StatusCode::NOT_FOUND, "no such snapshot").into_response(),
        Err(err) => return server_error(anyhow::Error::new(err)),
    };

    let document = match collect_document(state.store.as_ref(), &snapshot) {
        Ok(document) => document,
        Err(err) => return server_error(anyhow::Error::new(err)),
    };

    let stamp = snapshot.created_at.format("%m-%d-%Y");
    match query.format.as_deref().unwrap_or("csv") {
        "csv" => {
            let body = match render_csv(&document) {
                Ok(body) => body,
                Err(err) => return server_error(anyhow::Error::new(err)),
            };
            (
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=tasks_{stamp}.csv"),
                    ),
                ],
                body,
            )
                .into_response()
        }
        "ics" => (
            [
                (header::CONTENT_TYPE, "text/calendar".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=tasks_{stamp}.ics"),
                ),
            ],
            render_ical(&document),
        )
            .into_response(),
        "txt" => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
            render_text(&document),
        )
            .into_response(),
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown download format: {other}"),
        )
            .into_response(),
    }
}

async fn delete_snapshot_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<u64>,
) -> Response {
    let key = snapshot_key(id);
    let snapshot = match state.store.get(&key) {
        Ok(Some(entity)) => match Snapshot::from_entity(&entity) {
            Ok(snapshot) => snapshot,
            Err(err) => return server_error(anyhow::Error::new(err)),
        },
        Ok(None) => return (StatusCode::NOT_FOUND, "no such snapshot").into_response(),
        Err(err) => return server_error(anyhow::Error::new(err)),
    };
    if snapshot.status == RunStatus::Building {
        return (
            StatusCode::CONFLICT,
            "cannot delete a run that is still building",
        )
            .into_response();
    }
    match state.store.delete_tree(&key) {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn render_html<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}

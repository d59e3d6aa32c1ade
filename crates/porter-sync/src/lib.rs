//! Run workers and job queue: the glue that turns a requested Snapshot into
//! a finished one.
//!
//! An export run pulls the remote task data through the ingestion engine; an
//! import run parses an uploaded flat file and pushes the result back out
//! through the remote insert operations. The run boundary here is the single
//! place that catches failures, classifies them, and persists a terminal
//! status + message on the Snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use porter_adapters::{CalendarImporter, CsvImporter, ImportError, ImportFormat};
use porter_core::{
    Entity, EntityKey, FieldValue, Kind, ModelError, RunKind, RunStatus, SchemaRegistry, Snapshot,
    Task,
};
use porter_ingest::{BlobFetch, DateEncoding, IngestError, Ingestor, PageArgs, PageFetch};
use porter_storage::{EntityStore, FetchError, HttpClientConfig, HttpFetcher, StoreError};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "porter-sync";

#[derive(Debug, Clone)]
pub struct PorterConfig {
    pub api_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Wire encoding of remote date-time values; parsed at run time so an
    /// unknown selector fails the run as a configuration error.
    pub date_encoding: String,
}

impl PorterConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("PORTER_API_BASE_URL")
                .unwrap_or_else(|_| "https://www.googleapis.com/tasks/v1".to_string()),
            user_agent: std::env::var("PORTER_USER_AGENT")
                .unwrap_or_else(|_| "task-snapshot-porter/0.1".to_string()),
            http_timeout_secs: std::env::var("PORTER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            date_encoding: std::env::var("PORTER_DATE_ENCODING")
                .unwrap_or_else(|_| "friendly".to_string()),
        }
    }
}

/// Per-principal authorization token lookup. The token blob itself is opaque
/// to the porter; absence or invalidity simply fails the run.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn access_token(&self, user: &str) -> Result<Option<String>, FetchError>;
}

/// Credential lookup backed by a single environment variable; the OAuth
/// exchange that would populate a real store lives outside this system.
pub struct EnvCredentialStore;

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn access_token(&self, _user: &str) -> Result<Option<String>, FetchError> {
        Ok(std::env::var("PORTER_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()))
    }
}

/// The remote tasks service, list and insert sides. List responses are raw
/// pages for the ingestion engine; inserts are the outbound upload path.
#[async_trait]
pub trait RemoteTasks: Send + Sync {
    async fn list_tasklists(&self, token: &str, args: &PageArgs) -> Result<JsonValue, FetchError>;

    async fn list_tasks(
        &self,
        token: &str,
        tasklist_id: &str,
        args: &PageArgs,
    ) -> Result<JsonValue, FetchError>;

    async fn insert_tasklist(&self, token: &str, body: &JsonValue) -> Result<JsonValue, FetchError>;

    /// Inserts one task, threaded after `previous` (the id returned by the
    /// preceding insert) so server-side ordering matches the source file.
    async fn insert_task(
        &self,
        token: &str,
        tasklist_id: &str,
        body: &JsonValue,
        previous: Option<&str>,
    ) -> Result<JsonValue, FetchError>;
}

/// HTTP implementation of [`RemoteTasks`].
pub struct HttpTasksService {
    http: HttpFetcher,
    base_url: String,
}

impl HttpTasksService {
    pub fn new(config: &PorterConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteTasks for HttpTasksService {
    async fn list_tasklists(&self, token: &str, args: &PageArgs) -> Result<JsonValue, FetchError> {
        let url = format!("{}/users/@me/lists", self.base_url);
        self.http.get_json(&url, args, Some(token)).await
    }

    async fn list_tasks(
        &self,
        token: &str,
        tasklist_id: &str,
        args: &PageArgs,
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/lists/{}/tasks", self.base_url, tasklist_id);
        self.http.get_json(&url, args, Some(token)).await
    }

    async fn insert_tasklist(&self, token: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
        let url = format!("{}/users/@me/lists", self.base_url);
        self.http.post_json(&url, &PageArgs::new(), body, Some(token)).await
    }

    async fn insert_task(
        &self,
        token: &str,
        tasklist_id: &str,
        body: &JsonValue,
        previous: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/lists/{}/tasks", self.base_url, tasklist_id);
        let mut args = PageArgs::new();
        if let Some(previous) = previous {
            args.insert("previous".to_string(), JsonValue::String(previous.to_string()));
        }
        self.http.post_json(&url, &args, body, Some(token)).await
    }
}

struct TasklistPages<'a> {
    remote: &'a dyn RemoteTasks,
    token: &'a str,
}

#[async_trait]
impl PageFetch for TasklistPages<'_> {
    async fn fetch(&self, args: &PageArgs) -> Result<JsonValue, FetchError> {
        self.remote.list_tasklists(self.token, args).await
    }
}

struct TaskPages<'a> {
    remote: &'a dyn RemoteTasks,
    token: &'a str,
    tasklist_id: String,
}

#[async_trait]
impl PageFetch for TaskPages<'_> {
    async fn fetch(&self, args: &PageArgs) -> Result<JsonValue, FetchError> {
        self.remote.list_tasks(self.token, &self.tasklist_id, args).await
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("not signed in")]
    NotAuthorized,
    #[error("no snapshot at key {0}")]
    MissingSnapshot(EntityKey),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Maps a run failure onto the message persisted on the Snapshot. Full
/// detail goes to the log; the stored message stays human-readable.
pub fn failure_message(error: &RunError) -> &'static str {
    match error {
        RunError::NotAuthorized => "Must be logged in to create snapshot.",
        RunError::Import(ImportError::Csv(_)) => "The CSV file was malformed.",
        RunError::Import(ImportError::Calendar(_)) => "The iCalendar file was malformed.",
        _ => "Snapshot creation process failed unexpectedly.",
    }
}

/// Creates the Snapshot synchronously, before the job is enqueued, so the
/// worker can be handed nothing but a storage key.
pub fn create_snapshot(
    store: &dyn EntityStore,
    user: &str,
    run_kind: RunKind,
) -> Result<Snapshot, StoreError> {
    let handle = store.create(Kind::Snapshot, None, None)?;
    let snapshot = Snapshot::new(handle.key, user, run_kind, Utc::now());
    store.save(&snapshot.to_entity())?;
    Ok(snapshot)
}

#[derive(Debug, Clone)]
pub enum JobRequest {
    Export {
        snapshot: EntityKey,
    },
    Import {
        snapshot: EntityKey,
        name: String,
        format: ImportFormat,
        payload: String,
    },
}

impl JobRequest {
    pub fn snapshot(&self) -> &EntityKey {
        match self {
            JobRequest::Export { snapshot } | JobRequest::Import { snapshot, .. } => snapshot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub request: JobRequest,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
        }
    }
}

/// Processes one run to completion or failure. Exclusive ownership of a run
/// is delivered through the queue; there is no cancellation.
pub struct RunWorker {
    store: Arc<dyn EntityStore>,
    schema: SchemaRegistry,
    remote: Arc<dyn RemoteTasks>,
    credentials: Arc<dyn CredentialStore>,
    blobs: Arc<dyn BlobFetch>,
    date_encoding: String,
}

impl RunWorker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        remote: Arc<dyn RemoteTasks>,
        credentials: Arc<dyn CredentialStore>,
        blobs: Arc<dyn BlobFetch>,
        config: &PorterConfig,
    ) -> Self {
        Self {
            store,
            schema: SchemaRegistry::tasks(),
            remote,
            credentials,
            blobs,
            date_encoding: config.date_encoding.clone(),
        }
    }

    /// Replaces the compiled-in schema value.
    pub fn with_schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = schema;
        self
    }

    /// Run boundary. Loads the snapshot, tolerates re-delivered jobs whose
    /// run already finished, and converts any failure into a persisted
    /// terminal status. Entities built before a failure remain stored.
    pub async fn process(&self, job: Job) {
        let key = job.request.snapshot().clone();
        let mut snapshot = match self.load_snapshot(&key) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(job_id = %job.id, snapshot = %key, error = %err, "cannot load run");
                return;
            }
        };
        if snapshot.status.is_terminal() {
            info!(job_id = %job.id, snapshot = %key, "run already finished; skipping re-delivered job");
            return;
        }

        let outcome = match &job.request {
            JobRequest::Export { .. } => self.export_run(&snapshot).await,
            JobRequest::Import {
                name,
                format,
                payload,
                ..
            } => self.import_run(&snapshot, name, *format, payload).await,
        };

        match outcome {
            Ok(()) => {
                snapshot.finish(RunStatus::Completed, None);
                info!(job_id = %job.id, snapshot = %key, "run completed");
            }
            Err(err) => {
                error!(job_id = %job.id, snapshot = %key, error = %err, "run failed");
                snapshot.finish(RunStatus::Error, Some(failure_message(&err).to_string()));
            }
        }
        if let Err(err) = self.store.save(&snapshot.to_entity()) {
            error!(job_id = %job.id, snapshot = %key, error = %err, "failed to persist run status");
        }
    }

    fn load_snapshot(&self, key: &EntityKey) -> Result<Snapshot, RunError> {
        let entity = self
            .store
            .get(key)?
            .ok_or_else(|| RunError::MissingSnapshot(key.clone()))?;
        Ok(Snapshot::from_entity(&entity)?)
    }

    async fn export_run(&self, snapshot: &Snapshot) -> Result<(), RunError> {
        let token = self
            .credentials
            .access_token(&snapshot.user)
            .await?
            .ok_or(RunError::NotAuthorized)?;
        let date_encoding: DateEncoding = self.date_encoding.parse()?;

        let list_fetch = TasklistPages {
            remote: self.remote.as_ref(),
            token: &token,
        };
        let first = list_fetch.fetch(&PageArgs::new()).await?;
        let lists = Ingestor::new(
            Kind::TaskList,
            snapshot.key.clone(),
            &self.schema,
            self.store.as_ref(),
            &list_fetch,
            self.blobs.as_ref(),
        )
        .with_date_encoding(date_encoding)
        .ingest(first)
        .await?;
        info!(snapshot = %snapshot.key, lists = lists.len(), "task lists stored");

        for list in lists {
            let Some(list_id) = list.text("id").map(str::to_string) else {
                warn!(key = %list.key, "stored task list has no external id; skipping its tasks");
                continue;
            };
            let mut args = PageArgs::new();
            args.insert("showHidden".to_string(), JsonValue::Bool(true));

            let task_fetch = TaskPages {
                remote: self.remote.as_ref(),
                token: &token,
                tasklist_id: list_id,
            };
            let first = task_fetch.fetch(&args).await?;
            Ingestor::new(
                Kind::Task,
                snapshot.key.clone(),
                &self.schema,
                self.store.as_ref(),
                &task_fetch,
                self.blobs.as_ref(),
            )
            .with_parent(list.key.clone())
            .with_date_encoding(date_encoding)
            .with_base_args(args)
            .ingest(first)
            .await?;
        }
        Ok(())
    }

    async fn import_run(
        &self,
        snapshot: &Snapshot,
        name: &str,
        format: ImportFormat,
        payload: &str,
    ) -> Result<(), RunError> {
        let token = self
            .credentials
            .access_token(&snapshot.user)
            .await?
            .ok_or(RunError::NotAuthorized)?;

        // Destination list, persisted before its tasks exist.
        let mut list = self.store.create(Kind::TaskList, Some(&snapshot.key), None)?;
        self.store.save(&list)?;
        list.set("title", FieldValue::Text(name.to_string()));
        self.store.save(&list)?;

        let tasks = match format {
            ImportFormat::Csv => {
                CsvImporter::new(self.store.as_ref(), snapshot.key.clone(), list.key.clone())
                    .import(payload)?
            }
            ImportFormat::Ics => {
                CalendarImporter::new(self.store.as_ref(), snapshot.key.clone(), list.key.clone())
                    .import(payload)?
            }
        };
        info!(snapshot = %snapshot.key, tasks = tasks.len(), "flat file parsed");

        let created = self
            .remote
            .insert_tasklist(&token, &json!({ "title": name }))
            .await?;
        let remote_list_id = created
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| RunError::Upload("insert response carries no tasklist id".to_string()))?
            .to_string();

        let mut previous: Option<String> = None;
        for task in &tasks {
            let body = task_upload_body(task)?;
            let response = self
                .remote
                .insert_task(&token, &remote_list_id, &body, previous.as_deref())
                .await?;
            previous = response
                .get("id")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
        }
        Ok(())
    }
}

fn task_upload_body(entity: &Entity) -> Result<JsonValue, ModelError> {
    let task = Task::from_entity(entity)?;
    let mut body = serde_json::Map::new();
    body.insert("title".to_string(), json!(task.title.unwrap_or_default()));
    if let Some(notes) = task.notes {
        body.insert("notes".to_string(), json!(notes));
    }
    if let Some(status) = task.status {
        body.insert("status".to_string(), json!(status.as_str()));
    }
    if let Some(due) = task.due {
        body.insert(
            "due".to_string(),
            json!(due.format("%Y-%m-%dT00:00:00.000Z").to_string()),
        );
    }
    if let Some(completed) = task.completed {
        body.insert(
            "completed".to_string(),
            json!(completed.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        );
    }
    Ok(JsonValue::Object(body))
}

#[derive(Debug, Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

/// In-process job queue: an unbounded channel drained by one worker task.
/// Delivery is at-least-once from the caller's perspective; the worker skips
/// jobs whose run is already terminal.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn start(worker: Arc<RunWorker>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                worker.process(job).await;
            }
        });
        (Self { tx }, handle)
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<Uuid, QueueClosed> {
        let job = Job {
            id: Uuid::new_v4(),
            request,
        };
        let id = job.id;
        info!(job_id = %id, snapshot = %job.request.snapshot(), "job enqueued");
        self.tx.send(job).map_err(|_| QueueClosed)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_core::TaskStatus;
    use porter_storage::MemoryStore;
    use std::sync::Mutex;

    struct MockCredentials(Option<String>);

    #[async_trait]
    impl CredentialStore for MockCredentials {
        async fn access_token(&self, _user: &str) -> Result<Option<String>, FetchError> {
            Ok(self.0.clone())
        }
    }

    struct NoBlobs;

    #[async_trait]
    impl BlobFetch for NoBlobs {
        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 599,
                url: url.to_string(),
            })
        }
    }

    struct MockRemote {
        tasklists: JsonValue,
        tasks: JsonValue,
        list_calls: Mutex<usize>,
        inserted_lists: Mutex<Vec<JsonValue>>,
        inserted_tasks: Mutex<Vec<(Option<String>, JsonValue)>>,
    }

    impl MockRemote {
        fn new(tasklists: JsonValue, tasks: JsonValue) -> Self {
            Self {
                tasklists,
                tasks,
                list_calls: Mutex::new(0),
                inserted_lists: Mutex::new(Vec::new()),
                inserted_tasks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteTasks for MockRemote {
        async fn list_tasklists(&self, _token: &str, _args: &PageArgs) -> Result<JsonValue, FetchError> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.tasklists.clone())
        }

        async fn list_tasks(
            &self,
            _token: &str,
            _tasklist_id: &str,
            _args: &PageArgs,
        ) -> Result<JsonValue, FetchError> {
            Ok(self.tasks.clone())
        }

        async fn insert_tasklist(&self, _token: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
            self.inserted_lists.lock().unwrap().push(body.clone());
            Ok(json!({"id": "remote-list-1"}))
        }

        async fn insert_task(
            &self,
            _token: &str,
            _tasklist_id: &str,
            body: &JsonValue,
            previous: Option<&str>,
        ) -> Result<JsonValue, FetchError> {
            let mut inserted = self.inserted_tasks.lock().unwrap();
            inserted.push((previous.map(str::to_string), body.clone()));
            Ok(json!({"id": format!("r{}", inserted.len())}))
        }
    }

    fn config() -> PorterConfig {
        PorterConfig {
            api_base_url: "https://example.invalid/tasks/v1".to_string(),
            user_agent: "porter-test".to_string(),
            http_timeout_secs: 5,
            date_encoding: "friendly".to_string(),
        }
    }

    fn worker_with(remote: Arc<MockRemote>, credentials: MockCredentials) -> (Arc<MemoryStore>, RunWorker) {
        let store = Arc::new(MemoryStore::new());
        let worker = RunWorker::new(
            store.clone(),
            remote,
            Arc::new(credentials),
            Arc::new(NoBlobs),
            &config(),
        );
        (store, worker)
    }

    fn export_job(snapshot: &Snapshot) -> Job {
        Job {
            id: Uuid::new_v4(),
            request: JobRequest::Export {
                snapshot: snapshot.key.clone(),
            },
        }
    }

    #[tokio::test]
    async fn export_run_stores_lists_and_tasks_and_completes() {
        let remote = Arc::new(MockRemote::new(
            json!({"items": [{"id": "l1", "title": "Groceries"}]}),
            json!({"items": [
                {"id": "t1", "title": "milk", "status": "needsAction"},
                {"id": "t2", "title": "eggs", "status": "completed", "due": "2012-03-04T00:00:00.000Z"},
            ]}),
        ));
        let (store, worker) = worker_with(remote, MockCredentials(Some("tok".to_string())));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        worker.process(export_job(&snapshot)).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
        assert!(reloaded.error_message.is_none());

        let lists = store.children_of(&snapshot.key, Kind::TaskList).unwrap();
        assert_eq!(lists.len(), 1);
        let tasks = store.children_of(&snapshot.key, Kind::Task).unwrap();
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert_eq!(task.parent_ref.as_ref(), Some(&lists[0].key));
        }
    }

    #[tokio::test]
    async fn export_without_credentials_fails_with_sign_in_message() {
        let remote = Arc::new(MockRemote::new(json!({"items": []}), json!({"items": []})));
        let (store, worker) = worker_with(remote, MockCredentials(None));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        worker.process(export_job(&snapshot)).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Error);
        assert_eq!(
            reloaded.error_message.as_deref(),
            Some("Must be logged in to create snapshot.")
        );
    }

    #[tokio::test]
    async fn bad_date_encoding_fails_the_run_as_configuration() {
        let remote = Arc::new(MockRemote::new(json!({"items": []}), json!({"items": []})));
        let store = Arc::new(MemoryStore::new());
        let mut bad_config = config();
        bad_config.date_encoding = "iso8601".to_string();
        let worker = RunWorker::new(
            store.clone(),
            remote,
            Arc::new(MockCredentials(Some("tok".to_string()))),
            Arc::new(NoBlobs),
            &bad_config,
        );
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        worker.process(export_job(&snapshot)).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Error);
        assert_eq!(
            reloaded.error_message.as_deref(),
            Some("Snapshot creation process failed unexpectedly.")
        );
    }

    #[tokio::test]
    async fn unsupported_property_kind_aborts_the_run() {
        let remote = Arc::new(MockRemote::new(
            json!({"items": [{"id": "l1", "title": "Groceries", "rating": 5}]}),
            json!({"items": []}),
        ));
        let store = Arc::new(MemoryStore::new());
        let worker = RunWorker::new(
            store.clone(),
            remote,
            Arc::new(MockCredentials(Some("tok".to_string()))),
            Arc::new(NoBlobs),
            &config(),
        )
        .with_schema(
            SchemaRegistry::tasks().with_property(
                Kind::TaskList,
                "rating",
                porter_core::PropertyKind::Custom("rating"),
            ),
        );
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        worker.process(export_job(&snapshot)).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Error);
        assert_eq!(
            reloaded.error_message.as_deref(),
            Some("Snapshot creation process failed unexpectedly.")
        );
    }

    #[tokio::test]
    async fn import_run_parses_and_uploads_with_sibling_threading() {
        let remote = Arc::new(MockRemote::new(JsonValue::Null, JsonValue::Null));
        let (store, worker) =
            worker_with(remote.clone(), MockCredentials(Some("tok".to_string())));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Import).unwrap();

        let job = Job {
            id: Uuid::new_v4(),
            request: JobRequest::Import {
                snapshot: snapshot.key.clone(),
                name: "Imported".to_string(),
                format: ImportFormat::Csv,
                payload: "Subject,Notes,Due Date,Date Completed,Status\n\
                          Buy milk,,03/04/2012,,Complete\n\
                          Buy eggs,,,,\n"
                    .to_string(),
            },
        };
        worker.process(job).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);

        let lists = store.children_of(&snapshot.key, Kind::TaskList).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].text("title"), Some("Imported"));

        let stored_tasks = store.children_of(&snapshot.key, Kind::Task).unwrap();
        assert_eq!(stored_tasks.len(), 2);
        let statuses: Vec<_> = stored_tasks
            .iter()
            .map(|t| Task::from_entity(t).unwrap().status)
            .collect();
        assert!(statuses.contains(&Some(TaskStatus::Completed)));

        let inserted = remote.inserted_tasks.lock().unwrap();
        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].0, None);
        assert_eq!(inserted[1].0, Some("r1".to_string()));
        assert_eq!(remote.inserted_lists.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_csv_import_reports_the_format_specific_message() {
        let remote = Arc::new(MockRemote::new(JsonValue::Null, JsonValue::Null));
        let (store, worker) =
            worker_with(remote.clone(), MockCredentials(Some("tok".to_string())));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Import).unwrap();

        let job = Job {
            id: Uuid::new_v4(),
            request: JobRequest::Import {
                snapshot: snapshot.key.clone(),
                name: "Broken".to_string(),
                format: ImportFormat::Csv,
                payload: "Subject,Notes,Due Date,Date Completed,Status\nBuy milk,,not-a-date,,\n"
                    .to_string(),
            },
        };
        worker.process(job).await;

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Error);
        assert_eq!(
            reloaded.error_message.as_deref(),
            Some("The CSV file was malformed.")
        );
        // Nothing was uploaded.
        assert!(remote.inserted_lists.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_jobs_for_finished_runs_are_skipped() {
        let remote = Arc::new(MockRemote::new(
            json!({"items": []}),
            json!({"items": []}),
        ));
        let (store, worker) =
            worker_with(remote.clone(), MockCredentials(Some("tok".to_string())));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        worker.process(export_job(&snapshot)).await;
        worker.process(export_job(&snapshot)).await;

        assert_eq!(*remote.list_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_drains_jobs_through_the_worker() {
        let remote = Arc::new(MockRemote::new(json!({"items": []}), json!({"items": []})));
        let (store, worker) = worker_with(remote, MockCredentials(Some("tok".to_string())));
        let snapshot = create_snapshot(store.as_ref(), "user@example.com", RunKind::Export).unwrap();

        let (queue, handle) = JobQueue::start(Arc::new(worker));
        queue
            .enqueue(JobRequest::Export {
                snapshot: snapshot.key.clone(),
            })
            .unwrap();
        drop(queue);
        handle.await.unwrap();

        let reloaded =
            Snapshot::from_entity(&store.get(&snapshot.key).unwrap().unwrap()).unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
    }

    #[test]
    fn failure_messages_are_classified_by_error_family() {
        assert_eq!(
            failure_message(&RunError::NotAuthorized),
            "Must be logged in to create snapshot."
        );
        assert_eq!(
            failure_message(&RunError::Import(ImportError::Csv("x".to_string()))),
            "The CSV file was malformed."
        );
        assert_eq!(
            failure_message(&RunError::Import(ImportError::Calendar("x".to_string()))),
            "The iCalendar file was malformed."
        );
        assert_eq!(
            failure_message(&RunError::Upload("x".to_string())),
            "Snapshot creation process failed unexpectedly."
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use porter_adapters::{collect_document, render_csv, render_ical, render_text, ImportFormat};
use porter_core::{RunKind, RunStatus, Snapshot};
use porter_storage::{EntityStore, HttpClientConfig, HttpFetcher, MemoryStore};
use porter_sync::{
    create_snapshot, EnvCredentialStore, HttpTasksService, Job, JobRequest, PorterConfig, RunWorker,
};

#[derive(Debug, Parser)]
#[command(name = "porter-cli")]
#[command(about = "Task snapshot porter command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the web surface and job-queue worker.
    Serve,
    /// Run one export snapshot against the remote API and write it out.
    Export {
        /// Output format: csv, ics, or txt.
        #[arg(long, default_value = "csv")]
        format: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Import a CSV or iCalendar file and push it to the remote API.
    Import {
        /// Path to the file to import.
        #[arg(long)]
        file: PathBuf,
        /// Title of the destination task list.
        #[arg(long)]
        name: String,
        /// Input format: csv or ics.
        #[arg(long)]
        format: String,
        #[arg(long, default_value = "local")]
        user: String,
    },
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_worker(config: &PorterConfig, store: Arc<dyn EntityStore>) -> Result<RunWorker> {
    let remote = Arc::new(HttpTasksService::new(config)?);
    let blobs = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
    Ok(RunWorker::new(
        store,
        remote,
        Arc::new(EnvCredentialStore),
        blobs,
        config,
    ))
}

fn reload(store: &dyn EntityStore, snapshot: &Snapshot) -> Result<Snapshot> {
    let entity = store
        .get(&snapshot.key)?
        .context("snapshot vanished from the store")?;
    Ok(Snapshot::from_entity(&entity)?)
}

async fn run_export(format: String, out: Option<PathBuf>, user: String) -> Result<()> {
    let config = PorterConfig::from_env();
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    let worker = build_worker(&config, store.clone())?;

    let snapshot = create_snapshot(store.as_ref(), &user, RunKind::Export)?;
    worker
        .process(Job::new(JobRequest::Export {
            snapshot: snapshot.key.clone(),
        }))
        .await;

    let finished = reload(store.as_ref(), &snapshot)?;
    if finished.status != RunStatus::Completed {
        bail!(
            "export failed: {}",
            finished.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let document = collect_document(store.as_ref(), &finished)?;
    let rendered = match format.as_str() {
        "csv" => render_csv(&document)?,
        "ics" => render_ical(&document),
        "txt" => render_text(&document),
        other => bail!("unknown export format: {other}"),
    };
    match out {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            println!(
                "export complete: {} list(s) written to {}",
                document.lists.len(),
                path.display()
            );
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

async fn run_import(file: PathBuf, name: String, format: String, user: String) -> Result<()> {
    let payload = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let format: ImportFormat = format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let config = PorterConfig::from_env();
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    let worker = build_worker(&config, store.clone())?;

    let snapshot = create_snapshot(store.as_ref(), &user, RunKind::Import)?;
    worker
        .process(Job::new(JobRequest::Import {
            snapshot: snapshot.key.clone(),
            name,
            format,
            payload,
        }))
        .await;

    let finished = reload(store.as_ref(), &snapshot)?;
    match finished.status {
        RunStatus::Completed => {
            println!("import complete: snapshot {}", finished.key);
            Ok(())
        }
        _ => bail!(
            "import failed: {}",
            finished.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => porter_web::serve_from_env().await?,
        Commands::Export { format, out, user } => run_export(format, out, user).await?,
        Commands::Import {
            file,
            name,
            format,
            user,
        } => run_import(file, name, format, user).await?,
    }

    Ok(())
}

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use csv_ingest::config::{IngestConfig, RedeliveryPolicy};
use csv_ingest::db::{self, DestinationStore, MemoryDestination, PgCheckpointStore, PgDestination};
use csv_ingest::ingestion::upload::prepare_message;
use csv_ingest::ingestion::{
    consume_lines, BatchWriter, CheckpointStore, ConsumeOutcome, CsvRowFetcher,
    FileCheckpointStore, IngestMessage, IngestOrchestrator, MemoryCheckpointStore, RunKey,
    SchemaCatalog,
};
use csv_ingest::observability::init_tracing;

#[derive(Parser)]
#[command(name = "csv-ingest")]
#[command(about = "Queue-driven CSV ingestion into PostgreSQL")]
struct Args {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Settings {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Keep checkpoints as JSON files here instead of in the database
    #[arg(long, env = "CHECKPOINT_DIR", global = true)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 1000, global = true)]
    batch_size: usize,

    #[arg(long, env = "SUB_BATCH_SIZE", default_value_t = 100, global = true)]
    sub_batch_size: usize,

    #[arg(long, env = "MAX_CONCURRENT_WRITES", default_value_t = 4, global = true)]
    max_concurrent_writes: usize,

    #[arg(long, env = "WRITE_MAX_ATTEMPTS", default_value_t = 3, global = true)]
    write_max_attempts: usize,

    #[arg(long, env = "RETRY_INITIAL_DELAY_MS", default_value_t = 200, global = true)]
    retry_initial_delay_ms: u64,

    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value_t = 30, global = true)]
    store_timeout_secs: u64,

    #[arg(long, env = "MAX_DB_CONNECTIONS", default_value_t = 10, global = true)]
    max_db_connections: u32,

    /// Header columns that form the primary key of a new table
    #[arg(
        long,
        env = "PRIMARY_KEY_COLUMNS",
        value_delimiter = ',',
        default_value = "playerid",
        global = true
    )]
    primary_key_columns: Vec<String>,

    #[arg(
        long,
        env = "REDELIVERY_POLICY",
        value_enum,
        default_value_t = RedeliveryPolicy::Reingest,
        global = true
    )]
    redelivery: RedeliveryPolicy,

    /// Write to an in-memory destination instead of PostgreSQL
    #[arg(long, global = true)]
    dry_run: bool,
}

impl Settings {
    fn config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            max_concurrent_writes: self.max_concurrent_writes,
            max_attempts: self.write_max_attempts,
            retry_initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            max_db_connections: self.max_db_connections,
            primary_key_columns: self.primary_key_columns.clone(),
            redelivery: self.redelivery,
            ..IngestConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the file announced by one message (`-` reads stdin)
    Ingest {
        message: PathBuf,
    },
    /// Ingest newline-delimited messages until the input ends (`-` reads stdin)
    Consume {
        input: PathBuf,

        #[arg(long, env = "MAX_CONCURRENT_FILES", default_value_t = 4)]
        max_concurrent_files: usize,
    },
    /// Print the message announcing a local CSV file
    Prepare {
        csv_file: PathBuf,

        #[arg(short, long)]
        description: Option<String>,

        /// URL the ingester fetches the file from (default: file:// path)
        #[arg(long)]
        file_url: Option<String>,
    },
    /// Show checkpointed progress of one run, or of every run
    Status {
        /// Run key, `<table_name>/<file_name>`
        run_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    init_tracing();

    let args = Args::parse();

    match args.command {
        Commands::Ingest { message } => run_ingest(&args.settings, &message).await,
        Commands::Consume {
            input,
            max_concurrent_files,
        } => run_consume(&args.settings, &input, max_concurrent_files).await,
        Commands::Prepare {
            csv_file,
            description,
            file_url,
        } => run_prepare(&csv_file, description, file_url),
        Commands::Status { run_key } => run_status(&args.settings, run_key).await,
    }
}

async fn connect(settings: &Settings, config: &IngestConfig) -> Result<Option<db::DbPool>> {
    if settings.dry_run {
        return Ok(None);
    }
    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL is required unless --dry-run is set")?;
    let pool = db::init_pool(url, config.max_db_connections, config.store_timeout)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL");
    Ok(Some(pool))
}

async fn open_checkpoints(
    settings: &Settings,
    config: &IngestConfig,
    pool: Option<&db::DbPool>,
) -> Result<Arc<dyn CheckpointStore>> {
    if let Some(dir) = &settings.checkpoint_dir {
        let store = FileCheckpointStore::open(dir)
            .await
            .with_context(|| format!("Failed to open checkpoint directory {:?}", dir))?;
        return Ok(Arc::new(store));
    }
    match pool {
        Some(pool) => {
            let store = PgCheckpointStore::new(pool.clone(), config.store_timeout);
            store
                .ensure_schema()
                .await
                .context("Failed to create the ingest_progress table")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryCheckpointStore::new())),
    }
}

async fn build_orchestrator(settings: &Settings) -> Result<Arc<IngestOrchestrator>> {
    let config = settings.config();
    let options = config.ingest_options().context("Invalid configuration")?;

    let pool = connect(settings, &config).await?;
    let checkpoints = open_checkpoints(settings, &config, pool.as_ref()).await?;
    let store: Arc<dyn DestinationStore> = match pool {
        Some(pool) => Arc::new(PgDestination::new(pool)),
        None => {
            warn!("Dry run: rows are written to an in-memory destination");
            Arc::new(MemoryDestination::new())
        }
    };

    let catalog = SchemaCatalog::new(store.clone(), config.store_timeout)
        .with_primary_key_columns(&config.primary_key_columns);
    let writer = BatchWriter::new(store, config.store_timeout);
    let fetcher = CsvRowFetcher::new(config.store_timeout).context("Failed to build HTTP client")?;

    Ok(Arc::new(IngestOrchestrator::new(
        catalog,
        writer,
        Arc::new(fetcher),
        checkpoints,
        options,
    )))
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight writes");
            trigger.cancel();
        }
    });
    token
}

async fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut body = String::new();
        tokio::io::stdin()
            .read_to_string(&mut body)
            .await
            .context("Failed to read stdin")?;
        return Ok(body);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}

async fn run_ingest(settings: &Settings, message: &Path) -> Result<()> {
    let body = read_input(message).await?;
    let event = IngestMessage::parse(&body).context("Invalid ingest message")?;
    let orchestrator = build_orchestrator(settings).await?;

    let handle = orchestrator.spawn(event, shutdown_token());
    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            debug!(status = %status, "Status changed");
        }
    });

    let report = handle.wait().await.context("Ingestion task failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.status.is_completed() {
        bail!("Ingestion ended with status {}", report.status);
    }
    Ok(())
}

async fn run_consume(settings: &Settings, input: &Path, max_concurrent_files: usize) -> Result<()> {
    let max_files =
        NonZeroUsize::new(max_concurrent_files).context("max_concurrent_files must be greater than zero")?;
    let orchestrator = build_orchestrator(settings).await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Failed to open {:?}", input))?;
        Box::new(BufReader::new(file))
    };

    let outcomes = consume_lines(reader, orchestrator, max_files, shutdown_token())
        .await
        .context("Failed to read messages")?;

    let mut unsuccessful = 0;
    for outcome in &outcomes {
        let ok = matches!(outcome, ConsumeOutcome::Finished { report, .. } if report.status.is_completed());
        if !ok {
            unsuccessful += 1;
        }
        println!("{}", serde_json::to_string(outcome)?);
    }
    info!(
        messages = outcomes.len(),
        unsuccessful, "Consumer finished"
    );
    Ok(())
}

fn run_prepare(csv_file: &Path, description: Option<String>, file_url: Option<String>) -> Result<()> {
    let message = prepare_message(csv_file, description, file_url)
        .with_context(|| format!("Failed to prepare message for {:?}", csv_file))?;
    println!("{}", serde_json::to_string(&message)?);
    Ok(())
}

async fn run_status(settings: &Settings, run_key: Option<String>) -> Result<()> {
    let config = settings.config();
    let pool = match settings.checkpoint_dir {
        Some(_) => None,
        None => connect(settings, &config).await?,
    };
    let checkpoints = open_checkpoints(settings, &config, pool.as_ref()).await?;

    match run_key {
        Some(key) => match checkpoints.load(&RunKey::from(key.as_str())).await? {
            Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
            None => bail!("No checkpoint for run {}", key),
        },
        None => {
            for progress in checkpoints.list().await? {
                println!(
                    "{}\t{}\t{}/{}",
                    progress.run_key,
                    progress.status,
                    progress.last_committed.map_or(0, |i| i + 1),
                    progress
                        .total_batches
                        .map_or_else(|| "?".to_string(), |n| n.to_string())
                );
            }
        }
    }
    Ok(())
}

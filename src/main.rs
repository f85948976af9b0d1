use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taskmill::config::{EngineConfig, RetryPolicy, ServerConfig};
use taskmill::coordinator::{JobStatusView, SubmitRequest};
use taskmill::dashboard::serve_dashboard;
use taskmill::engine::Engine;
use taskmill::handlers;
use taskmill::job::Job;
use taskmill::notify::{LogNotifier, Notifier, WebhookNotifier};
use taskmill::shutdown::install_shutdown_handler;
use taskmill::store::{FileJobStore, JobStore, MemoryJobStore};

#[derive(Parser, Debug)]
#[command(name = "taskmill")]
#[command(version)]
#[command(about = "An async job-processing engine with retries, progress and recurring jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the engine and its HTTP API
    Serve(ServeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address the HTTP API binds to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "8002")]
    port: u16,

    /// Run without the HTTP API
    #[arg(long)]
    no_api: bool,

    /// JSON file to persist jobs in (in-memory when omitted)
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// URL receiving a POST for every finished job
    #[arg(long)]
    notify_url: Option<String>,

    /// Number of concurrent workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Maximum number of queued jobs
    #[arg(long, default_value = "10000")]
    queue_capacity: usize,

    /// Milliseconds before an unacknowledged claim is re-queued
    #[arg(long, default_value = "30000")]
    visibility_timeout_ms: u64,

    /// Attempts per job unless the submission asks otherwise
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Initial retry backoff in milliseconds
    #[arg(long, default_value = "500")]
    retry_base_ms: u64,

    /// Milliseconds a cancelled job gets to stop on its own
    #[arg(long, default_value = "5000")]
    cancel_grace_ms: u64,

    /// Seconds finished jobs are kept before cleanup removes them
    #[arg(long, default_value = "86400")]
    retention_secs: u64,

    /// Do not schedule the hourly cleanup job
    #[arg(long)]
    no_cleanup: bool,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        let engine = EngineConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            visibility_timeout_ms: self.visibility_timeout_ms,
            heartbeat_interval_ms: (self.visibility_timeout_ms / 3).max(1),
            default_max_attempts: self.max_attempts,
            retry: RetryPolicy {
                base_delay_ms: self.retry_base_ms,
                ..RetryPolicy::default()
            },
            cancel_grace_ms: self.cancel_grace_ms,
            retention_secs: self.retention_secs,
            ..EngineConfig::default()
        };

        ServerConfig {
            api_addr: (!self.no_api).then(|| SocketAddr::new(self.host, self.port)),
            data_path: self.data_file,
            notify_url: self.notify_url,
            engine,
        }
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8002")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Registered job type (e.g. "echo", "process", "send_email")
        job_type: String,

        /// JSON payload
        #[arg(long, short = 'p', default_value = "{}")]
        payload: String,

        /// Owner the job is recorded under
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Attempts before the job fails for good
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List jobs of an owner, newest first
    List {
        #[arg(long, default_value = "cli")]
        owner: String,
    },
    /// Cancel a queued or running job
    Cancel {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize, serde::Deserialize)]
struct JobSubmitOutput {
    job_id: Uuid,
}

#[derive(serde::Deserialize)]
struct ErrorOutput {
    error: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let schedule_cleanup = !args.no_cleanup;
    let config = args.into_config();

    let store: Arc<dyn JobStore> = match &config.data_path {
        Some(path) => Arc::new(FileJobStore::open(path).await?),
        None => Arc::new(MemoryJobStore::new()),
    };
    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };
    let registry = handlers::builtin_registry(Arc::clone(&store), config.engine.retention());

    tracing::info!(
        api_addr = ?config.api_addr,
        data_path = ?config.data_path,
        workers = config.engine.workers,
        job_types = ?registry.job_types(),
        "Starting taskmill"
    );

    let engine = Engine::new(config.engine.clone(), store, registry, notifier);
    if schedule_cleanup {
        engine.scheduler().add(handlers::cleanup_schedule());
    }

    let shutdown = install_shutdown_handler()?;

    // Bound up front so a taken port stops startup instead of running headless.
    let api = match config.api_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API");
                e
            })?;
            let state = engine.api_state();
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = serve_dashboard(listener, state, token.clone()).await {
                    tracing::error!(error = %e, "HTTP API server failed, shutting down");
                    token.cancel();
                }
            }))
        }
        None => None,
    };

    engine.run(shutdown).await?;

    if let Some(api) = api {
        if let Err(e) = api.await {
            tracing::error!(error = %e, "HTTP API task failed");
        }
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.json::<ErrorOutput>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(format!("{} ({})", message, status).into())
}

async fn handle_job_submit(
    client: &reqwest::Client,
    args: &ClientArgs,
    request: SubmitRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/jobs", args.addr))
        .json(&request)
        .send()
        .await?;
    let output: JobSubmitOutput = read_json(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", output.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/jobs/{}", args.addr, job_id))
        .send()
        .await?;
    let view: JobStatusView = read_json(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Table => {
            let job = &view.job;
            println!("Job ID:    {}", job.id);
            println!("Type:      {}", job.job_type);
            println!("Owner:     {}", job.owner_id);
            println!("State:     {}", job.state);
            println!("Attempts:  {}/{}", job.attempts, job.max_attempts);
            println!("Created:   {}", job.created_at.to_rfc3339());
            println!("Updated:   {}", job.updated_at.to_rfc3339());
            if let Some(progress) = &view.progress {
                match progress.total {
                    Some(total) => println!(
                        "Progress:  {}/{} {}",
                        progress.current, total, progress.message
                    ),
                    None => println!("Progress:  {} {}", progress.current, progress.message),
                }
            }
            if let Some(result) = &job.result {
                println!("Result:    {}", result);
            }
            if let Some(failure) = &job.failure {
                println!("Error:     {}", failure);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &reqwest::Client,
    args: &ClientArgs,
    owner: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/owners/{}/jobs", args.addr, owner))
        .send()
        .await?;
    let jobs: Vec<Job> = read_json(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<12} {:<10} {:<9} CREATED",
                "JOB ID", "TYPE", "STATE", "ATTEMPTS"
            );
            println!("{}", "-".repeat(96));
            for job in &jobs {
                println!(
                    "{:<38} {:<12} {:<10} {:<9} {}",
                    job.id,
                    job.job_type,
                    job.state.to_string(),
                    format!("{}/{}", job.attempts, job.max_attempts),
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/jobs/{}/cancel", args.addr, job_id))
        .send()
        .await?;
    let output: serde_json::Value = read_json(response).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => println!("Cancellation requested for job {}", job_id),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            let result = match command {
                JobCommands::Submit {
                    job_type,
                    payload,
                    owner,
                    max_attempts,
                } => {
                    let payload: serde_json::Value = serde_json::from_str(&payload)
                        .map_err(|e| format!("payload is not valid JSON: {}", e))?;
                    let mut request = SubmitRequest::new(owner, job_type, payload);
                    request.max_attempts = max_attempts;
                    handle_job_submit(&http, &client, request).await
                }
                JobCommands::Status { job_id } => handle_job_status(&http, &client, job_id).await,
                JobCommands::List { owner } => handle_job_list(&http, &client, owner).await,
                JobCommands::Cancel { job_id } => handle_job_cancel(&http, &client, job_id).await,
            };

            if let Err(e) = result {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

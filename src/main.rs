use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use taskhub::job::{JobParams, ModelCredentials, ModelTarget};
use taskhub::{Coordinator, CoordinatorConfig};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace, warn};

/// Run and observe generation jobs
#[derive(Parser)]
#[command(name = "taskhub")]
#[command(about = "Task execution coordinator for generation workers", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one job and stream its events as NDJSON until it finishes
    Run(RunArgs),
    /// Print the progress report of a job
    Progress {
        /// Job identifier
        job_id: String,
    },
    /// Print the number of admission slots in use for a model
    Slots {
        /// Model identifier
        model: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Owner of the job
    #[arg(long, default_value = "local")]
    owner: String,

    /// Input file identifier handed to the worker
    #[arg(long)]
    file_id: String,

    /// Model identifier (names the admission counter)
    #[arg(long)]
    model: String,

    /// Model path handed to the worker instead of the identifier
    #[arg(long)]
    model_path: Option<String>,

    /// Model endpoint; repeat for several
    #[arg(long = "service")]
    services: Vec<String>,

    /// Explicit job id
    #[arg(long)]
    job_id: Option<String>,

    /// Job name, used to derive the id when none is given
    #[arg(long, default_value = "")]
    name: String,

    /// Slots for this model, overriding the configured default
    #[arg(long)]
    max_concurrency: Option<u32>,

    /// API key forwarded to the worker
    #[arg(long)]
    api_key: Option<String>,

    /// Endpoints are vLLM servers
    #[arg(long)]
    vllm: bool,

    #[arg(long, default_value = "16")]
    batch_size: u32,

    #[arg(long, default_value = "10")]
    data_rounds: u32,

    #[arg(long, default_value = "general")]
    task_type: String,
}

impl RunArgs {
    fn into_params(self) -> JobParams {
        let mut target = ModelTarget::new(self.model).with_services(self.services);
        target.path = self.model_path;
        target.is_vllm = self.vllm;
        target.max_concurrency = self.max_concurrency;
        if let Some(api_key) = self.api_key {
            target = target.with_credentials(ModelCredentials {
                api_key,
                ..ModelCredentials::default()
            });
        }

        let mut params = JobParams::new(self.owner, self.file_id, target).with_name(self.name);
        params.job_id = self.job_id;
        params.batch_size = self.batch_size;
        params.data_rounds = self.data_rounds;
        params.task_type = self.task_type;
        params
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,redis=debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("taskhub started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(result);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::from_env()?,
    };
    let coordinator = Coordinator::connect(config).await?;

    match cli.command {
        Commands::Run(args) => run_job(&coordinator, args).await,
        Commands::Progress { job_id } => {
            let report = coordinator.progress(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Commands::Slots { model } => {
            println!("{}", coordinator.slots(&model).await?);
            Ok(0)
        }
    }
}

async fn run_job(coordinator: &Coordinator, args: RunArgs) -> Result<i32> {
    let owner = args.owner.clone();
    let submitted = coordinator.submit(args.into_params()).await?;
    let job_id = submitted.job_id().to_string();
    info!(job_id = %job_id, "Streaming job events");

    let mut lines = coordinator.subscribe(&job_id)?.into_ndjson();
    let mut stdout = tokio::io::stdout();
    let mut stopping = false;

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                match coordinator.stop(&job_id, &owner).await {
                    Ok(_) => info!(job_id = %job_id, "Stop requested"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "Stop failed"),
                }
            }
        }
    }

    let snapshot = coordinator.status(&job_id)?;
    Ok(match snapshot.return_code {
        Some(0) => 0,
        Some(code) if code > 0 => code,
        _ => 1,
    })
}

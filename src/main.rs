//! SCANLAB: scanner source analysis and sandboxed execution engine
//!
//! Entry point. Loads configuration, initialises structured logging and
//! dispatches one of three commands: the HTTP service, a one-off scan run,
//! or a dry analysis of a source file.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use scanlab::api::{self, routes::AnalyzeResponse, ApiState};
use scanlab::config::AppConfig;
use scanlab::data::{self, BarCache, SyntheticProvider};
use scanlab::engine::{JobController, JobRequest, ProgressObserver};
use scanlab::runtime::sandbox::ExecutionSandbox;
use scanlab::storage;
use scanlab::types::{JobMode, JobStatus, ScannerSource};

const BANNER: &str = r#"
 ____   ____    _    _   _ _        _    ____
/ ___| / ___|  / \  | \ | | |      / \  | __ )
\___ \| |     / _ \ |  \| | |     / _ \ |  _ \
 ___) | |___ / ___ \| |\  | |___ / ___ \| |_) |
|____/ \____/_/   \_\_| \_|_____/_/   \_\____/

  Scanner analysis, decomposition and sandboxed execution
  v0.1.0
"#;

/// Scanner analysis and execution engine
#[derive(Parser)]
#[command(name = "scanlab", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "config.toml", env = "SCANLAB_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP job service
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute a scanner source over a date range and wait for the result
    Run {
        /// Scanner source file
        file: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// auto, single, analyze or pattern:<name>
        #[arg(long, default_value = "auto")]
        mode: String,
        /// Write the full job report as JSON
        #[arg(long)]
        output: Option<String>,
    },
    /// Classify a source and list its parameters and units without running it
    Analyze {
        /// Scanner source file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load_or_default(&cli.config)?;

    init_logging();

    match cli.command {
        Command::Serve { port } => {
            println!("{BANNER}");
            serve(cfg, port).await
        }
        Command::Run { file, start, end, mode, output } => run(cfg, &file, start, end, &mode, output.as_deref()).await,
        Command::Analyze { file } => analyze(cfg, &file),
    }
}

async fn serve(cfg: AppConfig, port: Option<u16>) -> Result<()> {
    let provider = data::build_provider(&cfg)?;
    info!(
        service = %cfg.service.name,
        provider = provider.name(),
        max_concurrent = cfg.jobs.max_concurrent,
        timeout_secs = cfg.sandbox.timeout_secs,
        "SCANLAB starting up"
    );

    let controller = JobController::new(&cfg, provider);
    let state = Arc::new(ApiState::new(controller.clone(), cfg.service.name.clone()));

    let addr: SocketAddr = format!("{}:{}", cfg.service.bind, port.unwrap_or(cfg.service.port))
        .parse()
        .context("Invalid bind address")?;

    // Periodic registry cleanup
    let retention = Duration::from_secs(cfg.jobs.retention_secs.max(1));
    let mut interval = tokio::time::interval(retention.min(Duration::from_secs(300)));
    let cleanup = tokio::spawn(async move {
        loop {
            interval.tick().await;
            controller.cleanup(Utc::now());
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = &result {
                error!(error = %e, "API server stopped");
            }
            result?;
        }
        _ = &mut shutdown => {
            info!("Shutdown signal received.");
        }
    }

    cleanup.abort();
    info!("SCANLAB shut down cleanly.");
    Ok(())
}

async fn run(
    cfg: AppConfig,
    file: &str,
    start: NaiveDate,
    end: NaiveDate,
    mode: &str,
    output: Option<&str>,
) -> Result<()> {
    let source_text = std::fs::read_to_string(file).with_context(|| format!("Failed to read scanner source {file}"))?;
    let mode: JobMode = mode.parse()?;

    let provider = data::build_provider(&cfg)?;
    let cache = Arc::new(BarCache::new(provider, cfg.market_data.scope.clone()));
    let sandbox = ExecutionSandbox::new(cfg.sandbox.clone(), cache);
    let observer: ProgressObserver = Arc::new(|job_id: uuid::Uuid, percent: u8, message: &str| {
        eprintln!("[{job_id}] {percent:>3}% {message}");
    });
    let controller = JobController::with_sandbox(&cfg, sandbox, Some(observer));

    let request = JobRequest { source_text, start_date: start, end_date: end, mode };
    let job_id = controller.submit(request)?;
    let view = controller.wait(job_id, Duration::from_millis(100)).await?;
    let report = controller.snapshot(job_id)?;

    for warning in &report.warnings {
        warn!(job_id = %job_id, warning, "Job warning");
    }
    if let Some(path) = output {
        storage::save_report(&report, Some(path))?;
        info!(path, "Report written");
    }

    println!("{}", serde_json::to_string_pretty(&view).context("Failed to serialise job status")?);

    match view.status {
        JobStatus::Completed => {
            info!(job_id = %job_id, results = report.results.len(), "Run complete");
            Ok(())
        }
        status => anyhow::bail!(
            "job {job_id} ended {status}: {}",
            view.error.as_deref().unwrap_or("no error reported")
        ),
    }
}

fn analyze(cfg: AppConfig, file: &str) -> Result<()> {
    let source_text = std::fs::read_to_string(file).with_context(|| format!("Failed to read scanner source {file}"))?;
    let source = ScannerSource::new(source_text);

    // Analysis never touches market data.
    let provider = Arc::new(SyntheticProvider::new(cfg.market_data.synthetic_universe));
    let controller = JobController::new(&cfg, provider);
    let analysed = controller.analyze(&source);

    let response = AnalyzeResponse {
        content_hash: source.content_hash().to_string(),
        analysis: analysed.analysis,
        warnings: analysed.warnings,
    };
    println!("{}", serde_json::to_string_pretty(&response).context("Failed to serialise analysis")?);
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scanlab=info"));

    let json_logging = std::env::var("SCANLAB_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).with_writer(std::io::stderr).init();
    }
}

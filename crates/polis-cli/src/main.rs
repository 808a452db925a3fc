//! polis command-line entry point.
//!
//! Accepts a policy question plus a jurisdictional profile, runs the
//! evolution engine, prints the ranking, and optionally writes the full
//! report hand-off as JSON. Exit code 0 on success, 1 on unrecoverable
//! failure.

use clap::Parser;
use polis_engine::Orchestrator;
use polis_gateway::{
    HttpSearchProvider, HttpWorkerBackend, LexicalJudgeWorker, SearchGateway, SearchProvider,
    WorkerBackend, WorkerGateway, WorkerGatewayConfig,
};
use polis_trace::{FileTraceSink, PgTraceSink, TraceSink, TraceStore};
use polis_types::{EngineConfig, JurisdictionContext, PolicyQuery, PolicyType};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polis", about = "Policy analysis engine for local governments")]
#[command(version)]
struct Cli {
    /// The policy question to analyze, e.g. "ban on single-use plastic bags"
    query: String,

    /// Analysis pipeline: research, analysis, evolution, or integrated
    #[arg(long, default_value = "evolution")]
    policy_type: PolicyType,

    /// Path to a TOML configuration file
    #[arg(long, default_value = "polis.toml")]
    config: PathBuf,

    /// Jurisdiction name, e.g. "Elgin, Illinois"
    #[arg(long)]
    jurisdiction: Option<String>,

    /// Approximate population of the jurisdiction
    #[arg(long)]
    population: Option<String>,

    /// Free-text notes about the local context
    #[arg(long)]
    notes: Option<String>,

    /// Answer to "do you want per-stakeholder detail?" (yes/no)
    #[arg(long)]
    stakeholder_detail: Option<String>,

    /// Run with deterministic stub backends instead of live services
    #[arg(long)]
    offline: bool,

    /// Write the full report hand-off as JSON to this path
    #[arg(long)]
    output: Option<PathBuf>,

    /// API key for the worker endpoint
    #[arg(long, env = "POLIS_WORKER_API_KEY", hide_env_values = true)]
    worker_api_key: Option<String>,

    /// API key for the search endpoint
    #[arg(long, env = "POLIS_SEARCH_API_KEY", hide_env_values = true)]
    search_api_key: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] polis_types::ConfigError),

    #[error("worker backend error: {0}")]
    Worker(String),

    #[error("search backend error: {0}")]
    Search(String),

    #[error("trace error: {0}")]
    Trace(#[from] polis_trace::TraceError),

    #[error(transparent)]
    Engine(#[from] polis_engine::EngineError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("polis: {}", err);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = EngineConfig::load(&cli.config)?;
    let jurisdiction = build_jurisdiction(&cli);
    let trace = build_trace_store(&config).await?;
    let worker = build_worker(&cli, &config)?;
    let search = build_search(&cli, &config)?;

    let orchestrator = Orchestrator::new(config, worker, search, trace);
    let handoff = orchestrator
        .run(
            PolicyQuery::new(cli.query.clone()),
            jurisdiction,
            cli.policy_type,
        )
        .await?;

    println!("Policy Evolution Results");
    println!("Query: {}", cli.query);
    if handoff.converged {
        println!("(converged early)");
    }
    for entry in &handoff.rankings {
        println!(
            "{:>3}. {} (elo {:.1}, generation {}{})",
            entry.rank,
            entry.title,
            entry.elo,
            entry.generation,
            if entry.superseded { ", superseded" } else { "" },
        );
    }
    println!("{} comparison(s) recorded", handoff.comparison_records.len());
    if let Some(summary) = &handoff.executive_summary {
        println!("\n{}", summary);
    }
    if let Some(directive) = &handoff.localization_directive {
        println!("note: {}", directive);
    }

    if let Some(path) = &cli.output {
        let json = serde_json::to_string_pretty(&handoff)
            .map_err(|e| CliError::Output(std::io::Error::other(e)))?;
        std::fs::write(path, json)?;
        println!("report hand-off written to {}", path.display());
    }

    if let Some(reason) = &handoff.failure {
        eprintln!("polis: run terminated early: {}", reason);
        std::process::exit(1);
    }
    Ok(())
}

fn build_jurisdiction(cli: &Cli) -> JurisdictionContext {
    let mut ctx = JurisdictionContext::default();
    ctx.jurisdiction = cli.jurisdiction.clone();
    ctx.population = cli.population.clone();
    if let Some(notes) = &cli.notes {
        ctx.absorb("notes", notes);
    }
    if let Some(raw) = &cli.stakeholder_detail {
        // Anything that does not parse as yes/no lands in the notes.
        ctx.set_stakeholder_detail(raw);
    }
    ctx
}

async fn build_trace_store(config: &EngineConfig) -> Result<Arc<TraceStore>, CliError> {
    if config.disable_tracing {
        return Ok(Arc::new(TraceStore::disabled()));
    }

    let mut sinks: Vec<Arc<dyn TraceSink>> =
        vec![Arc::new(FileTraceSink::new(config.trace_dir.clone()).await?)];

    if let Some(dsn) = config.db_dsn.as_deref() {
        match PgTraceSink::connect(dsn).await {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(err) => {
                // The relational sink is best-effort from the start.
                warn!(error = %err, "relational trace sink unavailable, continuing with file only");
            }
        }
    }
    Ok(Arc::new(TraceStore::with_sinks(sinks)))
}

fn build_worker(cli: &Cli, config: &EngineConfig) -> Result<Arc<WorkerGateway>, CliError> {
    let backend: Arc<dyn WorkerBackend> = if cli.offline {
        Arc::new(LexicalJudgeWorker::new())
    } else {
        Arc::new(
            HttpWorkerBackend::new(
                config.worker_endpoint.as_deref(),
                config.worker_model.clone(),
                cli.worker_api_key.clone(),
            )
            .map_err(|e| CliError::Worker(e.to_string()))?,
        )
    };

    let gateway_config = WorkerGatewayConfig {
        max_inflight: config.max_inflight,
        soft_timeout: Duration::from_secs(config.soft_timeout_secs),
        hard_timeout: Duration::from_secs(config.hard_timeout_secs),
    };
    Ok(Arc::new(WorkerGateway::new(backend, gateway_config)))
}

fn build_search(cli: &Cli, config: &EngineConfig) -> Result<Arc<SearchGateway>, CliError> {
    if cli.offline {
        return Ok(Arc::new(SearchGateway::offline()));
    }

    let provider = |endpoint: &str, name: &str| -> Result<Arc<dyn SearchProvider>, CliError> {
        Ok(Arc::new(
            HttpSearchProvider::new(endpoint, cli.search_api_key.clone(), name)
                .map_err(|e| CliError::Search(e.to_string()))?,
        ))
    };

    let primary = config
        .search_endpoint
        .as_deref()
        .map(|endpoint| provider(endpoint, "primary"))
        .transpose()?;
    let secondary = config
        .search_fallback_endpoint
        .as_deref()
        .map(|endpoint| provider(endpoint, "fallback"))
        .transpose()?;
    Ok(Arc::new(SearchGateway::new(primary, secondary)))
}

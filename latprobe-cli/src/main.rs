use clap::{Parser, Subcommand};
use latprobe_cli::compare::{compare, load_analytics, render_comparison, save_analytics};
use latprobe_cli::endpoints::build_parameters;
use latprobe_cli::report::render_report;
use latprobe_cli::target::{remote_wait_deadline, resolve_target, Target};
use latprobe_cli::verdict::{describe, evaluate, Thresholds, EXIT_PASS, EXIT_SETUP};
use latprobe_client::{Client, ClientConfig};
use latprobe_common::{HttpMethod, LatprobeError, RunAnalytics, RunParameters, RunStatus};
use latprobe_server::analytics::compute_run_analytics;
use latprobe_server::config::ProbeConfig;
use latprobe_server::probe::ProbeExecutor;
use latprobe_server::runner::RunController;
use latprobe_server::store::{MemoryStore, RunStore};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "latprobe", about = "Measure HTTP endpoint latency")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe one or more endpoints and report latency percentiles
    Run(RunArgs),
    /// Percentage change in p50/p95/p99 between two saved results
    Compare {
        baseline: PathBuf,
        current: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Endpoint URL; repeat for several endpoints
    #[arg(long = "url", required = true)]
    urls: Vec<String>,

    /// HTTP method: GET | POST | PUT | PATCH | DELETE
    #[arg(long, default_value = "GET")]
    method: HttpMethod,

    /// Request header as NAME:VALUE; repeatable
    #[arg(long = "header")]
    headers: Vec<String>,

    /// JSON request body for POST, PUT and PATCH
    #[arg(long)]
    body: Option<String>,

    /// Requests per endpoint
    #[arg(long, default_value_t = 10)]
    count: u32,

    /// Per-request timeout in milliseconds for local runs [default: 30000]
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Submit the run to a latprobe server instead of probing locally
    #[arg(long, env = "LATPROBE_SERVER")]
    server: Option<String>,

    /// Print the analytics as JSON instead of the table report
    #[arg(long)]
    json: bool,

    /// Fail with exit code 2 if any endpoint's p95 exceeds this many ms
    #[arg(long)]
    max_p95_ms: Option<f64>,

    /// Fail with exit code 1 if any endpoint's error rate exceeds this percentage
    #[arg(long)]
    max_error_rate: Option<f64>,

    /// Write the analytics JSON to this file for later comparison
    #[arg(long)]
    save: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Compare { baseline, current } => compare_files(&baseline, &current),
    };
    process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    let parameters = match build_parameters(
        &args.urls,
        args.method,
        &args.headers,
        args.body.as_deref(),
        args.count,
    ) {
        Ok(p) => p,
        Err(e) => return setup_failure(e),
    };
    let target = match resolve_target(args.server.as_deref(), args.timeout_ms) {
        Ok(target) => target,
        Err(e) => return setup_failure(e),
    };

    let total = (parameters.endpoints.len() as u64).saturating_mul(parameters.request_count as u64);
    eprint!("Probing {} endpoint(s) x {} requests ", parameters.endpoints.len(), parameters.request_count);
    std::io::stderr().flush().ok();

    let outcome = match target {
        Target::Remote { server } => run_remote(&server, parameters, total).await,
        Target::Local { timeout } => run_local(parameters, timeout).await,
    };
    eprintln!();

    let analytics = match outcome {
        Ok(analytics) => analytics,
        Err(message) => return setup_failure(message),
    };
    tracing::debug!(samples = analytics.sample_count, expected = total, "run finished");

    if let Some(path) = &args.save {
        if let Err(e) = save_analytics(path, &analytics) {
            return setup_failure(e);
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&analytics) {
            Ok(json) => println!("{json}"),
            Err(e) => return setup_failure(e),
        }
    } else {
        print!("{}", render_report(&analytics));
    }

    let thresholds = Thresholds { max_p95_ms: args.max_p95_ms, max_error_rate: args.max_error_rate };
    let verdict = evaluate(&analytics.summary, &thresholds);
    if !args.json {
        println!();
        println!("{}", describe(&verdict));
    }
    verdict.exit_code()
}

/// Probe in this process with a throwaway in-memory store.
async fn run_local(parameters: RunParameters, timeout: Duration) -> Result<RunAnalytics, String> {
    let store = Arc::new(MemoryStore::new());
    let executor = ProbeExecutor::new(&ProbeConfig { timeout, follow_redirects: false })
        .map_err(|e| e.to_string())?;
    let controller = RunController::new(store.clone(), executor);

    let mut events = controller.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    eprint!("{}", if event.status_code == 0 || event.status_code >= 400 { "x" } else { "." });
                    std::io::stderr().flush().ok();
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let run = controller.start_run(parameters).map_err(|e| e.to_string())?;
    let finished = controller.wait(run.id).await.map_err(|e| e.to_string())?;
    progress.abort();

    let finished = finished.ok_or_else(|| format!("Run {} disappeared", run.slug))?;
    if finished.status == RunStatus::Failed {
        return Err(LatprobeError::RunFailed(finished.slug).to_string());
    }
    let samples = store.list_samples(finished.id, None).map_err(|e| e.to_string())?;
    Ok(compute_run_analytics(&finished, &samples))
}

/// Submit to a server, poll until the run finishes, then fetch its analytics.
async fn run_remote(addr: &str, parameters: RunParameters, probes: u64) -> Result<RunAnalytics, String> {
    let client = Client::new(ClientConfig { server_addr: addr.to_string() });
    let created = client.create_run(&parameters).await.map_err(|e| match e {
        LatprobeError::RateLimited { retry_after_secs } => {
            format!("Rate limited by {addr}; try again in {retry_after_secs} seconds")
        }
        other => other.to_string(),
    })?;
    eprint!("[run {}] ", created.slug);

    let dots = tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            eprint!(".");
            std::io::stderr().flush().ok();
        }
    });

    let deadline = remote_wait_deadline(probes);
    let waited = client.wait_for_completion(created.id, POLL_INTERVAL, deadline).await;
    dots.abort();
    waited.map_err(|e| e.to_string())?;

    client.get_analytics(created.id, None).await.map_err(|e| e.to_string())
}

fn compare_files(baseline: &std::path::Path, current: &std::path::Path) -> i32 {
    let loaded = load_analytics(baseline).and_then(|b| load_analytics(current).map(|c| (b, c)));
    match loaded {
        Ok((baseline, current)) => {
            print!("{}", render_comparison(&compare(&baseline, &current)));
            EXIT_PASS
        }
        Err(e) => setup_failure(e),
    }
}

fn setup_failure(err: impl std::fmt::Display) -> i32 {
    eprintln!("error: {err}");
    EXIT_SETUP
}

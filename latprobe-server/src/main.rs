use clap::Parser;
use latprobe_server::config::{
    AdmissionConfig, ProbeConfig, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS, DEFAULT_TIMEOUT_MS,
};
use latprobe_server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "latprobe-server", about = "HTTP endpoint latency runs over a small JSON API")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "LATPROBE_ADDR", default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// SQLite database file. Runs are kept in memory when omitted.
    #[arg(long, env = "LATPROBE_DB")]
    db: Option<std::path::PathBuf>,

    /// Run creations allowed per caller per window.
    #[arg(long, env = "LATPROBE_RATE_LIMIT", default_value_t = DEFAULT_RATE_LIMIT)]
    rate_limit: u32,

    /// Admission window length in seconds.
    #[arg(long, env = "LATPROBE_RATE_WINDOW_SECS", default_value_t = DEFAULT_RATE_WINDOW_SECS)]
    rate_window_secs: u64,

    /// Per-probe timeout in milliseconds.
    #[arg(long, env = "LATPROBE_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Key the admission gate on the first X-Forwarded-For hop. Only enable
    /// behind a reverse proxy that sets the header itself.
    #[arg(long, env = "LATPROBE_TRUST_PROXY")]
    trust_forwarded_for: bool,

    /// Follow redirects instead of recording the 3xx response.
    #[arg(long)]
    follow_redirects: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        address: args.addr,
        probe: ProbeConfig {
            timeout: Duration::from_millis(args.timeout_ms),
            follow_redirects: args.follow_redirects,
        },
        admission: AdmissionConfig {
            limit: args.rate_limit,
            window: Duration::from_secs(args.rate_window_secs),
            trust_forwarded_for: args.trust_forwarded_for,
        },
        database: args.db,
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    // Print "Listening on <addr>" once the server signals it is bound.
    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            println!("Listening on {}", addr);
        }
    });

    Server::new(config).run(ready_tx).await?;
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use divvy::backend::redis::RedisBackend;
use divvy::{config, Backend, ConfigError, FailurePolicy, HitHandler, LogSink, MemoryBackend, Server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8321")]
    listen: SocketAddr,

    /// Path to the INI rules file.
    #[arg(long)]
    config: PathBuf,

    /// Credit store: `memory` or a `redis://` URL.
    #[arg(long, default_value = "memory")]
    backend: String,

    /// Deny operations when the backend is unavailable (default is to allow).
    #[arg(long)]
    fail_closed: bool,
}

/// Startup failures, each with its documented exit code.
#[derive(thiserror::Error, Debug)]
enum FatalError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("backend init: {0}")]
    BackendInit(divvy::BoxError),
    #[error("server: {0}")]
    Serve(std::io::Error),
}

impl FatalError {
    fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 1,
            FatalError::Bind { .. } | FatalError::Serve(_) => 2,
            FatalError::BackendInit(_) => 3,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn select_backend(spec: &str) -> Result<Arc<dyn Backend>, FatalError> {
    if spec == "memory" {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if spec.starts_with("redis://") || spec.starts_with("rediss://") {
        let backend = RedisBackend::new(spec).map_err(|e| FatalError::BackendInit(e.into()))?;
        return Ok(Arc::new(backend));
    }
    Err(FatalError::Config(ConfigError::Parse(format!(
        "unknown backend \"{}\" (expected \"memory\" or a redis:// URL)",
        spec
    ))))
}

async fn run(cli: Cli) -> Result<(), FatalError> {
    let table = config::load_rules(&cli.config)?;
    info!(rules = table.len(), config = %cli.config.display(), "rules loaded");

    let backend = select_backend(&cli.backend)?;
    backend.initialize().await.map_err(FatalError::BackendInit)?;
    info!(backend = %cli.backend, "backend ready");

    let listener = TcpListener::bind(cli.listen)
        .await
        .map_err(|source| FatalError::Bind { addr: cli.listen, source })?;

    let policy = if cli.fail_closed { FailurePolicy::Closed } else { FailurePolicy::Open };
    let handler =
        HitHandler::new(Arc::new(table), backend, LogSink).with_failure_policy(policy);
    let server = Server::new(listener, handler, LogSink);

    server.run_until_ctrl_c().await.map_err(FatalError::Serve)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}

//! Remote storage adapter server.
//!
//! Loads the adapter configuration, initializes the selected storage backend
//! and serves the Prometheus remote read/write endpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use promdex::{AdapterConfig, BackendKind, Storage};
use tracing_subscriber::EnvFilter;

mod server;

/// promdex: Prometheus remote storage adapter for Elasticsearch.
#[derive(Parser)]
#[command(name = "promdex-server", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PROMDEX_LISTEN_PORT", default_value = "8090")]
    listen_port: u16,

    /// Path to the adapter configuration file.
    #[arg(long, env = "PROMDEX_CONFIG", default_value = "adapter.yaml")]
    config: PathBuf,

    /// Storage backend.
    #[arg(long, env = "PROMDEX_BACKEND", default_value = "elasticsearch")]
    backend: Backend,

    /// Maximum samples returned per read query; overrides the configuration
    /// when positive.
    #[arg(
        long,
        env = "PROMDEX_QUERY_MAX_SIZE",
        default_value = "-1",
        allow_hyphen_values = true
    )]
    query_max_size: i64,
}

/// Storage backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Elasticsearch cluster from the configuration file.
    Elasticsearch,
    /// In-process memory; data is lost on exit.
    Memory,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Elasticsearch => BackendKind::Elasticsearch,
            Backend::Memory => BackendKind::Memory,
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!("promdex-server failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load(&cli.config)?;
    if cli.query_max_size > 0 {
        config.max_results = cli.query_max_size;
    }

    let kind = BackendKind::from(cli.backend);
    tracing::info!(backend = %kind, config = %cli.config.display(), "initializing storage");

    // The blocking HTTP client must be created and dropped outside the
    // async runtime.
    let storage = Arc::new(Storage::init(kind, &config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(server::serve(cli.listen_port, storage.clone()));
    drop(runtime);
    drop(storage);

    served?;
    tracing::info!("promdex-server exited cleanly");
    Ok(())
}

/// Loads the configuration file, or the defaults if it does not exist.
fn load(path: &Path) -> Result<AdapterConfig, promdex::error::ConfigError> {
    if path.exists() {
        promdex::load_config(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        let config = AdapterConfig::default();
        config.validate()?;
        Ok(config)
    }
}

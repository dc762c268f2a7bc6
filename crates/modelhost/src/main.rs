use clap::Parser;
use modelhost::{config::Config, run_server};
use std::path::PathBuf;

/// Serve model artifacts over a KServe v2 style REST API.
#[derive(Debug, Parser)]
#[command(name = "modelhost", version, about)]
struct Args {
    /// Model repository root (overrides MODEL_REPOSITORY)
    #[arg(long, short = 'r')]
    repository: Option<PathBuf>,

    /// Listen host (overrides MODELHOST_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides MODELHOST_PORT)
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Skip loading the repository at startup
    #[arg(long)]
    no_load: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env()?;

    if let Some(repository) = args.repository {
        cfg.model_repository = repository;
    }
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if args.no_load {
        cfg.load_models_at_startup = false;
    }

    run_server(cfg).await
}


mod access_log;
mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod llm;
mod server;
mod session;
mod usage;
mod workspace;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "c00d", about = "Browser-based IDE backend")]
pub struct Args {
    #[arg(long, env = "C00D_CONFIG", default_value = "config.yaml", help = "Config file path")]
    pub config: PathBuf,

    #[arg(short, long, help = "Port to listen on (overrides config)")]
    pub port: Option<u16>,

    #[arg(long, help = "Workspace directory to serve (overrides config)")]
    pub path: Option<PathBuf>,

    #[arg(long, help = "Debug logging")]
    pub debug: bool,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = config::Config::load(&args.config)?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(path) = args.path {
        cfg.base_path = path;
    }
    cfg.apply_defaults()?;

    if let Err(errors) = cfg.validate() {
        for error in &errors {
            tracing::error!("config error {}", error);
        }
        bail!("invalid configuration ({} errors)", errors.len());
    }

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;
    let db = db::Database::open(cfg.data_dir.join("c00d.db"))?;

    let llm = llm::client_for(&cfg.ai);
    let state = server::AppState::new(cfg, db, llm)?;
    session::spawn_sweeper(state.sessions.clone(), session::SWEEP_INTERVAL);

    let config = state.config.clone();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    tracing::info!("c00d listening on http://localhost:{}", config.port);
    tracing::info!("workspace: {}", state.workspace.root().display());
    tracing::info!(
        "password protection: {}",
        if config.password_required() { "on" } else { "off" }
    );
    tracing::info!(
        "IP logging: {}",
        if config.should_log_ips() { "on" } else { "off" }
    );
    tracing::info!(
        "AI provider: {}{}",
        config.ai.provider.as_str(),
        if config.ai.is_metered() {
            format!(" (free tier, {} requests/day)", config.ai.free_daily_limit)
        } else {
            String::new()
        }
    );

    let app = server::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

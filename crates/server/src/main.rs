use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use testforge_server::config::ServerConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "testforged", version, about = "TestForge orchestration server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "TESTFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, env = "TESTFORGE_LISTEN")]
    listen: Option<String>,

    /// State database path, overrides the config file
    #[arg(long, env = "TESTFORGE_DB")]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let addr: SocketAddr = config.listen_addr.parse()?;
    let state = testforge_server::build_state(&config)?;
    state.dispatcher.start()?;

    let app = testforge_server::routes::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("TestForge API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

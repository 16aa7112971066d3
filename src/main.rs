//! profiledb server
//!
//! Opens the sled store, reloads index definitions and stream modules, and
//! serves the REST API.
//!
//! Usage:
//!   cargo run --bin profiledb                      # serve on 0.0.0.0:3000
//!   cargo run --bin profiledb -- --port 3100 --data-dir /tmp/pdb
//!   cargo run --bin authenticate                   # run the demo against it

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

use profiledb::config::Config;
use profiledb::engine::Engine;
use profiledb::logging;
use profiledb::rest::create_router;

#[derive(Parser)]
#[command(name = "profiledb")]
#[command(about = "profiledb record server", long_about = None)]
struct Args {
    /// Port to listen on (overrides PROFILEDB_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Sled data directory (overrides PROFILEDB_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Directory for JSON log files (overrides PROFILEDB_LOG_DIR)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = Some(dir);
    }
    let _log_guard = logging::init_server(config.log_dir.as_deref());

    let engine = Engine::open(&config.data_dir)?;
    let app = create_router(engine.clone());

    let sweeper = engine.clone();
    let max_idle = config.cursor_idle_timeout;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(max_idle / 4);
        loop {
            ticks.tick().await;
            sweeper.close_idle_cursors(max_idle);
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, data_dir = %config.data_dir.display(), "profiledb listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.flush()?;
    info!("shut down");
    Ok(())
}

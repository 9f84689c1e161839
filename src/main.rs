use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use ringmark::config;
use ringmark::db;
use ringmark::engine::{Command, Engine, EngineConfig, Response, SETTING_HOMESERVER};
use ringmark::gateway::HttpGateway;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/ringmark.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    // A homeserver set at runtime wins over the config file.
    let origin = db::get_setting(&pool, SETTING_HOMESERVER)
        .await?
        .unwrap_or_else(|| cfg.homeserver.origin.clone());
    let gateway = Arc::new(HttpGateway::new(&origin)?);

    let engine = Engine::new(pool, gateway, EngineConfig::from_config(&cfg));
    engine.restore_session().await;

    // Queue-drain alarm, independent of any UI being open.
    let drain_engine = Arc::clone(&engine);
    let drain_period = Duration::from_secs(cfg.app.drain_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(drain_period).await;
            if let Err(err) = drain_engine.drain_queue().await {
                error!(?err, "queue drain failed");
            }
        }
    });

    // Periodic feed refresh for cached URLs.
    let feed_engine = Arc::clone(&engine);
    let feed_period = Duration::from_secs(cfg.app.feed_refresh_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(feed_period).await;
            feed_engine.refresh_cached_feeds().await;
        }
    });

    // Push events to stdout as JSON lines.
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(?err, "failed to serialize event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("engine ready; reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(cmd) => engine.dispatch(cmd).await,
            Err(err) => Response::Error {
                message: format!("invalid command: {err}"),
            },
        };
        match serde_json::to_string(&response) {
            Ok(out) => println!("{out}"),
            Err(err) => error!(?err, "failed to serialize response"),
        }
    }

    info!("stdin closed; shutting down");
    Ok(())
}

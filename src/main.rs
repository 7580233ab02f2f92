mod config;
mod console;
mod game;
mod market;
mod scheduling;
mod types;
mod venue;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::settings::Settings;
use crate::game::game::{Game, GameContext, KEEPALIVE_INTERVAL};
use crate::market::market_state::MarketState;
use crate::scheduling::{RecurringScheduler, TaskQueue};
use crate::venue::client::VenueClient;
use crate::venue::stream::{Keepalive, WebSocketStream};
use crate::venue::transport::HttpTransport;

const IO_THREADS: usize = 2;

#[derive(Debug, Clone, Parser)]
#[command(about = "Trading client for the Stockfighter simulation")]
struct Args {
    /// Settings file: .json, .yml or .yaml
    pub settings: PathBuf,

    /// Level to play instead of the one in the settings.
    #[arg(long)]
    pub level: Option<String>,

    /// Worker thread count instead of the one in the settings.
    #[arg(long)]
    pub workers: Option<usize>,
}

fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::load(&args.settings)?;
    if let Some(level) = args.level {
        settings.level = level;
    }
    if let Some(workers) = args.workers {
        settings.worker_threads = workers;
    }
    settings.validate()?;
    let settings = Arc::new(settings);

    init_tracing(&settings)?;
    info!(?settings, "settings loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(IO_THREADS)
        .thread_name("io")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let queue = Arc::new(TaskQueue::new(settings.worker_threads)?);
    let scheduler = RecurringScheduler::new(queue.clone());

    let transport = Arc::new(HttpTransport::new(runtime.handle().clone())?);
    let client = VenueClient::new(
        transport,
        settings.endpoints.clone(),
        settings.api_key.clone(),
    );
    let engine = Arc::new(MarketState::new(client));

    let game = Game::new(GameContext {
        settings: settings.clone(),
        scheduler: scheduler.clone(),
        queue: queue.clone(),
        engine,
        ticker_stream: Arc::new(WebSocketStream::new(
            runtime.handle().clone(),
            Keepalive::default(),
        )),
        execution_stream: Arc::new(WebSocketStream::new(
            runtime.handle().clone(),
            Keepalive::default(),
        )),
    })?;

    console::console::spawn(game.clone(), scheduler.clone(), queue.clone())?;

    let keepalive = Arc::downgrade(&game);
    scheduler.insert(KEEPALIVE_INTERVAL, move || match keepalive.upgrade() {
        Some(game) => game.keepalive(),
        None => Ok(()),
    });

    let starter = game.launch()?;

    scheduler.run();

    info!("shutting down");
    game.shutdown();
    if starter.join().is_err() {
        error!("game start thread panicked");
    }
    queue.shutdown();
    queue.join();
    runtime.shutdown_timeout(Duration::from_secs(1));

    info!("bye");

    Ok(())
}

/// Console on stderr plus a plain-text copy appended to `<stem>.log`.
fn init_tracing(settings: &Settings) -> Result<()> {
    let log_path = settings.derivative_file(".log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log {}", log_path.display()))?;

    let filter = EnvFilter::from_default_env().add_directive("stockfighter=debug".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::sync::Mutex::new(log_file))
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(true),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

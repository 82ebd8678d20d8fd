//! # ekklesia
//!
//! Console chat client for Ekklesia.
//!
//! Wires the SQLite store, an in-process event bus and the sync engine
//! together. A local backend commits every send and echoes it over the bus,
//! so the whole optimistic-send and reconciliation cycle runs on one machine.

mod backend;
mod config;
mod console;

use std::ops::ControlFlow;
use std::sync::Arc;

use ekklesia_bus::LocalEventBus;
use ekklesia_store::Database;
use ekklesia_sync::{spawn_engine, EngineConfig, EngineNotification};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::Backend;
use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ekklesia_sync=debug,ekklesia_bus=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Ekklesia chat v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    let engine_config = EngineConfig::from_env();
    info!(?config, ?engine_config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store and the local backend
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::open_default()?,
    };
    if config.seed_demo {
        backend::seed_demo(&db, &config.user_id)?;
    }

    let bus = LocalEventBus::new();
    let backend = Backend::new(db, bus.clone());

    // -----------------------------------------------------------------------
    // 4. Spawn the sync engine and the notification printer
    // -----------------------------------------------------------------------
    let (engine, mut notifications) = spawn_engine(
        engine_config,
        config.user_id.clone(),
        Arc::new(bus),
        backend.collaborators(),
    );

    let printer_engine = engine.clone();
    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            if let Some(text) = console::render_notification(&notification, &printer_engine).await {
                println!("{text}");
            }
            if notification == EngineNotification::Closed {
                break;
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Read commands until /quit or EOF
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match console::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match console::execute(command, &config.user_id, &engine, &backend).await {
            Ok(ControlFlow::Break(())) => break,
            Ok(ControlFlow::Continue(())) => {}
            Err(e) => {
                warn!(error = %e, "Command failed");
                println!("! {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // 6. Graceful shutdown
    // -----------------------------------------------------------------------
    info!("Shutting down...");
    engine.shutdown().await?;
    printer.await?;

    Ok(())
}

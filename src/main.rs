use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use warroom_core::clock::SystemClock;
use warroom_engine::{BroadcastHub, CoordinatorConfig, DurationTicker, HubConfig, SessionCoordinator};
use warroom_server::{HandlerState, ServerConfig};
use warroom_store::users::UserRepo;
use warroom_store::{Database, SqliteGateway};
use warroom_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "warroom", version, about = "Incident war-room session coordinator")]
struct Cli {
    /// Settings file (defaults to ~/.warroom/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => warroom_server::load_settings_from_path(path),
        None => warroom_server::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    warroom_telemetry::init_telemetry(
        &TelemetryConfig {
            json: settings.logging.json,
            ..TelemetryConfig::default()
        }
        .with_level_name(&settings.logging.level),
    );
    tracing::info!("starting war-room server");

    let db_path = PathBuf::from(&settings.database.path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let seeded = UserRepo::new(db.clone())
        .seed_admins(&settings.initial_admins)
        .context("failed to seed administrators")?;
    tracing::info!(seeded, configured = settings.initial_admins.len(), "administrators seeded");

    let hub = BroadcastHub::new(HubConfig {
        queue_capacity: settings.server.max_send_queue,
        send_timeout: settings.server.send_timeout(),
    });
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::new(SqliteGateway::new(db.clone())),
        Arc::clone(&hub),
        Arc::new(SystemClock),
        CoordinatorConfig {
            max_code_attempts: settings.max_code_attempts.max(1),
        },
    ));

    let shutdown = CancellationToken::new();
    let ticker = DurationTicker::new(Arc::clone(&coordinator), settings.ticker.period())
        .start(shutdown.child_token());

    let handler_state = Arc::new(HandlerState::new(db, coordinator));
    let server = warroom_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        handler_state,
        shutdown.child_token(),
    )
    .await
    .context("failed to start server")?;
    tracing::info!(port = server.port, "war-room server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    shutdown.cancel();
    hub.close_all();
    server.join().await;
    if let Err(e) = ticker.await {
        tracing::warn!(error = %e, "ticker task ended abnormally");
    }
    Ok(())
}

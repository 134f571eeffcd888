mod api;
mod bootstrap;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pulse_core::events::DecoderRegistry;
use pulse_core::settings::{ForwardMode, Settings};
use pulse_core::time_utils::TimestampParser;
use pulse_runtime::bridge::{BridgeConfig, BridgeEngine};
use pulse_runtime::forwarder::HttpForwarder;
use pulse_runtime::relay::RelayConfig;
use pulse_runtime::{EventRouter, Forwarder, MonitoringControlRelay};
use pulse_store::{ArtifactStore, Database, EventDeliveryQueue, EventIngestionService, SessionRegistry};

/// Bridge executable used when none is configured.
const DEFAULT_ENGINE_COMMAND: &str = "pulse-bridge";
const LEASE_VISIBILITY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    bootstrap::ensure_directories(&settings)?;
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_deref())?;

    tracing::info!("OS-Pulse v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Data: {}, modes: {:?}, forward: {:?}",
        settings.data_dir().display(),
        settings.enabled_modes().modes(),
        settings.forward
    );

    let db = Database::open(settings.database_path())
        .with_context(|| format!("opening {}", settings.database_path().display()))?;
    let registry = SessionRegistry::new(db.clone());
    let timestamps = TimestampParser::new(&settings.default_timezone);
    let ingest = EventIngestionService::new(db.clone(), timestamps);
    let queue = EventDeliveryQueue::new(db);
    let artifacts = ArtifactStore::new(settings.artifact_dir())?;

    let forwarder = match settings.forward {
        ForwardMode::Local => Forwarder::Local(ingest.clone()),
        ForwardMode::Http => {
            let endpoint = settings
                .ingest_endpoint
                .as_deref()
                .context("--forward http requires --ingest-endpoint")?;
            Forwarder::Http(HttpForwarder::new(endpoint, settings.forward_timeout())?)
        }
        ForwardMode::Off => Forwarder::Disabled,
    };
    let router = EventRouter::new(DecoderRegistry::default(), forwarder, settings.source_tag.clone());

    let engine = Arc::new(BridgeEngine::new(BridgeConfig {
        command: settings
            .engine_command
            .clone()
            .unwrap_or_else(|| DEFAULT_ENGINE_COMMAND.to_string()),
        args: settings.engine_args.clone(),
        agent_script: settings.agent_script.clone(),
        request_timeout: settings.attach_timeout(),
    }));

    let relay = Arc::new(MonitoringControlRelay::new(
        engine,
        registry.clone(),
        artifacts.clone(),
        router,
        RelayConfig {
            enabled_modes: settings.enabled_modes(),
            directive_timeout: settings.attach_timeout(),
            terminate: settings.terminate_on_stop,
            ..RelayConfig::default()
        },
    ));

    let app = api::router(api::AppState {
        relay: Arc::clone(&relay),
        registry,
        ingest,
        queue,
        artifacts,
        lease_visibility: LEASE_VISIBILITY,
    });

    let address = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!("Control plane listening on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            // Listener errors mean no signal will ever arrive; keep serving.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl+C received; shutting down");
        })
        .await?;

    relay.stop_all().await;
    tracing::info!("OS-Pulse stopped");
    Ok(())
}

use std::env;
use std::time::Duration;

use anyhow::Context as _;
use broker::config::Config;
use broker::log::BrokerLog;
use broker::state::AppState;
use broker::api;
use broker_log::LogDeleterTask;
use broker_task::{spawn_task, ShutdownHandle};
use camino::Utf8PathBuf;
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args().nth(1).unwrap_or_else(|| "broker.json".to_owned());
    let config_path = Utf8PathBuf::from(config_path);

    let config = Config::load_from_path(&config_path).context("failed to load configuration")?;

    let _logger_guard = broker_log::init::<BrokerLog>(&config.log_file, &config.log_filter, env::var("BROKER_LOG").ok().as_deref())
        .context("failed to initialize logging")?;

    info!("Starting the broker");

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let log_deleter = spawn_task(LogDeleterTask::<BrokerLog>::new(config.log_file.clone()), shutdown_signal);

    let state = AppState::load(&config).await.context("failed to initialize application state")?;

    let app = api::make_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_address))?;

    info!(address = %config.listen_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_ctrl_c(shutdown_handle))
        .await
        .context("server error")?;

    log_deleter.abort();

    info!("Broker stopped");

    Ok(())
}

async fn shutdown_on_ctrl_c(shutdown_handle: ShutdownHandle) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Failed to install Ctrl-C handler");
    }

    info!("Ctrl-C received, shutting down");
    shutdown_handle.signal();
}

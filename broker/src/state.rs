//! Application state: the router over configured backends, the
//! backend-independent message/claim controllers built on top of it, and
//! the validation limits. Built once at startup and cloned (cheaply, via
//! `Arc`) into every request.

use std::collections::HashMap;
use std::sync::Arc;

use queue_core::backoff::BackoffConfig;
use queue_core::clock::{Clock, SystemClock};
use queue_core::controllers::{ClaimController, MessageController};
use queue_core::error::{BrokerError, BrokerResult};
use queue_core::model::PoolEntry;
use queue_core::traits::Backend;
use queue_core::validation::Limits;
use queue_router::Router;
use queue_storage_libsql::LibsqlBackend;
use queue_storage_postgres::PostgresBackend;

use crate::config::{BackendConfig, Config};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub messages: Arc<MessageController>,
    pub claims: Arc<ClaimController>,
    pub limits: Arc<Limits>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub async fn load(config: &Config) -> Result<Self, AppStateError> {
        Self::load_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Same as [`AppState::load`], but with the clock supplied by the
    /// caller instead of always wiring up [`SystemClock`]. Production
    /// startup never needs this; tests use it to advance time past a
    /// claim's expiry deterministically.
    pub async fn load_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, AppStateError> {
        let control: Arc<dyn Backend> = open_backend(&config.control_backend).await?;

        let mut shards: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        shards.insert("default".to_owned(), control.clone());

        register_pool_if_absent(
            control.as_ref(),
            PoolEntry {
                id: "default".to_owned(),
                uri: backend_uri(&config.control_backend),
                weight: config.default_pool_weight,
                group: None,
            },
        )
        .await?;

        for pool in &config.pools {
            let backend = open_backend(&pool.backend).await?;
            shards.insert(pool.id.clone(), backend);

            register_pool_if_absent(
                control.as_ref(),
                PoolEntry {
                    id: pool.id.clone(),
                    uri: backend_uri(&pool.backend),
                    weight: pool.weight,
                    group: pool.group.clone(),
                },
            )
            .await?;
        }

        let router: Arc<Router> = Arc::new(Router::new(control, shards, clock.clone()));
        let backoff: BackoffConfig = config.backoff.clone().into();
        backoff.validate().map_err(AppStateError::InvalidBackoffConfig)?;

        Ok(Self {
            messages: Arc::new(MessageController::new(router.clone(), clock.clone(), backoff)),
            claims: Arc::new(ClaimController::new(router.clone(), clock.clone())),
            router,
            limits: Arc::new(config.limits.clone().into()),
            clock,
        })
    }
}

/// Registers a pool entry the first time a given `pool_id` is seen, so
/// restarting the broker with the same config is idempotent.
async fn register_pool_if_absent(control: &(dyn Backend), entry: PoolEntry) -> BrokerResult<()> {
    match control.pools_get(&entry.id).await {
        Ok(_) => Ok(()),
        Err(BrokerError::PoolDoesNotExist { .. }) => control.pools_register(entry).await,
        Err(other) => Err(other),
    }
}

async fn open_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, AppStateError> {
    match config {
        BackendConfig::Libsql { path } => {
            let backend = LibsqlBackend::open(path).await.map_err(AppStateError::Backend)?;
            Ok(Arc::new(backend))
        }
        BackendConfig::Postgres { dsn } => {
            let pg_config: tokio_postgres::Config = dsn.parse().map_err(|error| AppStateError::InvalidDsn(format!("{error}")))?;
            let backend = PostgresBackend::connect(pg_config).await.map_err(AppStateError::Backend)?;
            Ok(Arc::new(backend))
        }
    }
}

fn backend_uri(config: &BackendConfig) -> String {
    match config {
        BackendConfig::Libsql { path } => format!("libsql://{path}"),
        BackendConfig::Postgres { dsn } => dsn.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppStateError {
    #[error("failed to initialize a storage backend: {0}")]
    Backend(#[from] BrokerError),
    #[error("invalid Postgres connection string: {0}")]
    InvalidDsn(String),
    #[error("invalid backoff configuration: {0}")]
    InvalidBackoffConfig(BrokerError),
}

//! Worker hosting the session sagas.
//!
//! Wires the collaborators, the event catalog and the dispatch table, and
//! exposes a small HTTP surface: booking, lifecycle signals, catalog
//! inspection, health and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use domain::{MeetingProvider, register_event_catalog};
use event_bus::{
    CatalogError, DeliveryReceiver, EventCatalog, EventDispatcher, EventPublisher,
    InMemoryEventBus,
};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    ConferencingProviders, ContractService, InMemoryBillingService, InMemoryCalendarService,
    InMemoryClassMembership, InMemoryConferencingClient, InMemoryContractService,
    InMemoryIdentityService, InMemorySessionRepository, InMemoryTransactionManager,
    PgTransactionManager, PostgresContractService, SagaDependencies, Sagas, SessionRepository,
    TransactionManager,
};
use tower_http::trace::TraceLayer;

use config::WorkerConfig;
use error::WorkerError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub sagas: Sagas,
    pub sessions: Arc<dyn SessionRepository>,
    pub catalog: Arc<EventCatalog>,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Everything `main` needs to run: HTTP state plus the consumer side of the
/// transport.
pub struct Worker {
    pub state: Arc<AppState>,
    pub dispatcher: Arc<EventDispatcher>,
    pub receiver: DeliveryReceiver,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/catalog", get(routes::catalog::get))
        .route("/sessions", post(routes::sessions::book))
        .route("/sessions/{id}", get(routes::sessions::get))
        .route("/sessions/{id}/cancel", post(routes::sessions::cancel))
        .route("/sessions/{id}/reschedule", post(routes::sessions::reschedule))
        .route("/meetings/completed", post(routes::sessions::meeting_completed))
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Builds the saga collaborators.
///
/// The ledger and transactions use PostgreSQL when `DATABASE_URL` is set;
/// every other collaborator is the in-memory stand-in.
pub async fn build_dependencies(
    config: &WorkerConfig,
    bus: InMemoryEventBus,
) -> Result<SagaDependencies, WorkerError> {
    let (contracts, transactions): (Arc<dyn ContractService>, Arc<dyn TransactionManager>) =
        match &config.database_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await?;
                let contracts = PostgresContractService::new(pool.clone());
                contracts.run_migrations().await?;
                tracing::info!("using PostgreSQL ledger");
                (
                    Arc::new(contracts),
                    Arc::new(PgTransactionManager::new(pool)),
                )
            }
            None => {
                tracing::info!("DATABASE_URL not set, using in-memory ledger");
                (
                    Arc::new(InMemoryContractService::new()),
                    Arc::new(InMemoryTransactionManager::new()),
                )
            }
        };

    let conferencing = ConferencingProviders::new()
        .with_client(Arc::new(InMemoryConferencingClient::new(
            MeetingProvider::Feishu,
        )))
        .with_client(Arc::new(InMemoryConferencingClient::new(MeetingProvider::Zoom)));

    Ok(SagaDependencies {
        sessions: Arc::new(InMemorySessionRepository::new()),
        conferencing,
        calendar: Arc::new(InMemoryCalendarService::new()),
        contracts,
        billing: Arc::new(InMemoryBillingService::new()),
        identity: Arc::new(InMemoryIdentityService::new()),
        membership: Arc::new(InMemoryClassMembership::new()),
        transactions,
        publisher: Arc::new(bus),
    })
}

/// Declares every event type and subscribes the sagas.
pub fn build_dispatcher(
    sagas: &Sagas,
    catalog: Arc<EventCatalog>,
) -> Result<EventDispatcher, CatalogError> {
    register_event_catalog(&catalog)?;
    let mut dispatcher = EventDispatcher::new(catalog);
    sagas.subscribe(&mut dispatcher)?;
    Ok(dispatcher)
}

/// Builds the worker from its configuration.
pub async fn bootstrap(config: &WorkerConfig) -> Result<Worker, WorkerError> {
    let (bus, receiver) = InMemoryEventBus::channel();
    let deps = build_dependencies(config, bus.clone()).await?;
    let sessions = deps.sessions.clone();
    let sagas = Sagas::new(deps, config.saga_config());

    let catalog = Arc::new(EventCatalog::new());
    let dispatcher = build_dispatcher(&sagas, catalog.clone())?;

    let orphans = catalog.orphans();
    if !orphans.is_empty() {
        tracing::warn!(?orphans, "event types without consumers in this process");
    }
    let deprecated = catalog.deprecated_in_use();
    if !deprecated.is_empty() {
        tracing::warn!(?deprecated, "deprecated event types still consumed");
    }

    Ok(Worker {
        state: Arc::new(AppState {
            sagas,
            sessions,
            catalog,
            publisher: Arc::new(bus),
        }),
        dispatcher: Arc::new(dispatcher),
        receiver,
    })
}

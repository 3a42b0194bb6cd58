// DealFlow backend - business rules and workflow outcome engine for the sales CRM

use axum::{
    Router,
    http::Method,
    routing::get,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod outcomes;
pub mod rules;
pub mod store;

pub use error::{ApiError, ApiResult, AppError};


use outcomes::WfmOutcomeExecutor;
use rules::{EngineConfig, RuleEngine};
use store::{InMemoryStore, PgStore, Stores};

pub struct AppState {
    pub stores: Stores,
    pub engine: Arc<RuleEngine>,
    pub executor: Arc<WfmOutcomeExecutor>,
    /// Present when running against PostgreSQL.
    pub db_pool: Option<PgPool>,
}

impl AppState {
    pub fn new(stores: Stores, engine_config: EngineConfig, db_pool: Option<PgPool>) -> Self {
        let engine = Arc::new(RuleEngine::new(stores.clone(), engine_config));
        let executor =
            Arc::new(WfmOutcomeExecutor::new(stores.clone()).with_rule_engine(engine.clone()));

        Self {
            stores,
            engine,
            executor,
            db_pool,
        }
    }

    pub fn postgres(pool: PgPool, engine_config: EngineConfig) -> Self {
        let stores = Stores::from_backend(Arc::new(PgStore::new(pool.clone())));
        Self::new(stores, engine_config, Some(pool))
    }

    pub fn in_memory(store: Arc<InMemoryStore>, engine_config: EngineConfig) -> Self {
        Self::new(Stores::from_backend(store), engine_config, None)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "DealFlow Rules Engine API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/rules", handlers::rule_routes())
        .nest("/api/v1/outcomes", handlers::outcome_routes())
        .nest("/api/v1/notifications", handlers::notification_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

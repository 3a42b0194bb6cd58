use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dealflow_backend::{AppState, build_router, config, database, jobs::JobScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("dealflow_backend=info,tower_http=info,sqlx=warn")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let app_state = Arc::new(AppState::postgres(db_pool, config.rules.engine_config()));

    let mut scheduler =
        JobScheduler::new(app_state.engine.clone(), &app_state.stores, config.jobs.clone()).await?;
    scheduler.start().await?;

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    scheduler.shutdown().await?;

    Ok(())
}

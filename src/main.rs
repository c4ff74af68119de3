use std::net::SocketAddr;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use wellness_backend::billing::spawn_billing_scheduler;
use wellness_backend::config::{self, StorageBackend};
use wellness_backend::moderation::spawn_moderation_scheduler;
use wellness_backend::{app, Platform};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let platform = match *config::STORAGE_BACKEND {
        StorageBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(config::DATABASE_URL.as_str())
                .await?;

            if let Err(error) = sqlx::migrate!("./migrations").run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(Box::new(error) as Box<dyn std::error::Error>);
                }
            }
            Platform::postgres(pool)
        }
        StorageBackend::Memory => {
            tracing::warn!("running with in-memory storage; state is lost on restart");
            Platform::local()
        }
    };

    spawn_billing_scheduler(platform.billing_jobs());
    spawn_moderation_scheduler(platform.moderation.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let router = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(app(platform))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, storage = config::STORAGE_BACKEND.as_str(), "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod courses;
mod db;
mod enrollments;
mod error;
mod models;
mod progress;
mod routes;
mod service;
mod sessions;
mod store;

use crate::{
    config::Config,
    routes::AppState,
    service::Service,
    sessions::PgSessions,
    store::postgres::PgStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "coursehub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let pool = db::connect(&config).await?;
    db::prepare_schema(&pool).await?;

    let state = AppState {
        service: Service::new(Arc::new(PgStore::new(pool.clone())), config.store_timeout),
        sessions: Arc::new(PgSessions::new(pool)),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(store_timeout = ?config.store_timeout, "listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use chatrooms::{broker, config::Config, directory::Directory, routes, store::SqliteStore, AppState};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::trace::TraceLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let store = SqliteStore::new(db_pool);
    store.migrate().await.context("preparing schema")?;

    // Nothing is served without a working broker.
    let broker = broker::connect(&config).await.context("connecting broker")?;

    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(config.session_inactivity));

    let app_state = AppState {
        directory: Arc::new(Directory::new(Arc::new(store))),
        broker,
        settings: config.connection,
    };

    let app = Router::new()
        .merge(routes::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, broker = ?config.broker, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use backchannel::config::Config;
use backchannel::registry::RoomRegistry;
use backchannel::store::{self, MessageStore};
use backchannel::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let pool = store::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    let store = MessageStore::new(pool);
    store.migrate().await.context("failed to run migrations")?;

    let port = config.port;
    let state = AppState {
        store,
        registry: Arc::new(RoomRegistry::default()),
        config: Arc::new(config),
    };
    let app = backchannel::app(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!("relay listening on http://0.0.0.0:{port}");
    axum::serve(listener, app).await.context("server exited")?;

    Ok(())
}

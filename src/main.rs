use anyhow::Context;
use log::info;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use zapdesk::api;
use zapdesk::config::AppConfig;
use zapdesk::evolution::EvolutionClient;
use zapdesk::state::AppState;
use zapdesk::store::{
    create_pool, run_migrations, ConversationStore, InstanceStore, PgStore, ProductStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::load()?;
    info!(
        "Starting zapdesk on {}:{}",
        config.server.host, config.server.port
    );

    let pool = create_pool(&config.database.url, config.database.max_connections)
        .context("failed to build database pool")?;
    {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || run_migrations(&pool))
            .await
            .context("migration task failed")?
            .context("failed to apply database schema")?;
    }
    let store = Arc::new(PgStore::new(pool));
    let provider = Arc::new(
        EvolutionClient::new(&config.evolution).context("failed to build provider client")?,
    );

    let state = Arc::new(AppState::new(
        config.clone(),
        store.clone() as Arc<dyn InstanceStore>,
        store.clone() as Arc<dyn ConversationStore>,
        store as Arc<dyn ProductStore>,
        provider,
    ));

    let app = api::configure()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

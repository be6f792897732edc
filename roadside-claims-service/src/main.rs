use std::sync::Arc;

use anyhow::Context;
use claim_flow::{
    ClaimStore, InMemoryClaimStore, InMemoryDirectory, PolicyDirectory, PostgresClaimStore,
    PostgresDirectory, RigChatModel, postgres,
};
use roadside_claims_service::{AppState, BUNDLED_DIRECTORY, ServiceConfig, build_router};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing; `pretty` for development, structured JSON otherwise.
fn init_tracing(log_format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "roadside_claims_service=debug,claim_flow=debug,tower_http=debug".into()
    });

    match log_format {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

async fn create_backends(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<dyn ClaimStore>, Arc<dyn PolicyDirectory>)> {
    if let Some(database_url) = &config.database_url {
        info!("Using PostgreSQL claim store and directory");
        let pool = postgres::connect(database_url)
            .await
            .context("failed to connect to PostgreSQL")?;
        let store = PostgresClaimStore::new(pool.clone());
        store.migrate().await.context("failed to prepare claim tables")?;
        return Ok((Arc::new(store), Arc::new(PostgresDirectory::new(pool))));
    }

    let directory = match &config.directory_seed {
        Some(path) => {
            info!(path = %path.display(), "Using in-memory storage with directory seed");
            InMemoryDirectory::from_yaml_file(path)?
        }
        None => {
            info!(
                "Using in-memory storage with the bundled directory (set DATABASE_URL to use PostgreSQL)"
            );
            InMemoryDirectory::from_yaml_str(BUNDLED_DIRECTORY)?
        }
    };
    Ok((Arc::new(InMemoryClaimStore::new()), Arc::new(directory)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_format);

    let (store, directory) = create_backends(&config).await?;
    let model = Arc::new(RigChatModel::openrouter(
        &config.openrouter_api_key,
        &config.model,
    ));
    info!(
        model = %model.name(),
        strategy = ?config.conversation.strategy,
        max_tool_rounds = config.conversation.max_tool_rounds,
        "Language model configured"
    );

    let app = build_router(AppState::new(
        store,
        directory,
        model,
        config.conversation.clone(),
    ));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    let addr = listener.local_addr()?;
    info!("Roadside claims service running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

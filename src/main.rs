//! overseer - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the orchestration engine.

use std::sync::Arc;

use overseer::classifier::LlmClassifier;
use overseer::engine::Engine;
use overseer::llm::OpenRouterClient;
use overseer::notify::LogSink;
use overseer::task::SqliteTaskRepository;
use overseer::tools::ToolRegistry;
use overseer::{api, Config};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: light={}, heavy={}, workspace={}",
        config.model_light,
        config.model_heavy,
        config.workspace_path.display()
    );

    let repo = Arc::new(SqliteTaskRepository::open(config.db_path.clone()).await?);
    let llm = Arc::new(OpenRouterClient::new(config.api_key.clone()));
    let classifier = Arc::new(LlmClassifier::new(
        llm.clone(),
        config.model_light.clone(),
        config.model_heavy.clone(),
    ));

    let engine = Arc::new(Engine::new(
        config.clone(),
        repo,
        llm,
        classifier,
        Arc::new(ToolRegistry::new()),
        Arc::new(LogSink),
    ));

    // Crash recovery before accepting work: no node may stay "in progress"
    // from a previous run.
    let recovered = engine.recover_interrupted().await?;
    if recovered.is_empty() {
        info!("No stranded tasks found");
    } else {
        warn!("Recovered {} stranded task(s) after restart", recovered.len());
    }

    // Start HTTP server
    api::serve(&config, engine).await
}

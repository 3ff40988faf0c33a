use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use teloxide::Bot;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use blindchat_server::config::{Config, StorageBackend};
use blindchat_server::telegram::{self, TelegramTransport};
use blindchat_server::{InMemoryRepository, SessionController, SqliteRepository, UserRepository};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "blindchat"
    })))
}

async fn serve_health(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind health port {}", port))?;
    info!("Health endpoint listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting anonymous chat bot");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let repo: Arc<dyn UserRepository> = match config.storage_backend {
        StorageBackend::Sqlite => {
            let db_path = config.db_path();
            info!("Using state database: {}", db_path.display());
            Arc::new(
                SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
            )
        }
        StorageBackend::Memory => {
            info!("Using in-memory state, sessions will not survive a restart");
            Arc::new(InMemoryRepository::new())
        }
    };

    if config.admin_id.is_none() {
        info!("ADMIN_ID not set, /stats is disabled");
    }

    let bot = Bot::new(config.telegram_bot_token.clone());
    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let controller = Arc::new(SessionController::new(repo, transport, config.admin_id));

    // Sessions cannot outlive the transport context they were created in.
    controller
        .recover()
        .await
        .context("Failed to reset sessions on startup")?;

    if let Some(port) = config.health_port {
        tokio::spawn(async move {
            if let Err(e) = serve_health(port).await {
                error!("Health endpoint stopped: {:#}", e);
            }
        });
    }

    telegram::run(bot, controller).await
}

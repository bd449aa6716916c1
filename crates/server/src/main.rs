mod app;
mod config;
mod error;
mod ingest;
mod objects;
mod routes;
mod storage;
mod tutor;

use std::sync::Arc;
use std::time::Duration;

use studyhall_tutor::{GeminiClient, GenerativeModel};

pub use app::AppState;
pub use config::AppConfig;
use objects::ObjectStore;
use tutor::TutorState;

/// How often idle chat sessions and expired refresh tokens are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn build_model(config: &AppConfig) -> Option<Arc<dyn GenerativeModel>> {
    let key = config.gemini_api_key.as_deref()?;
    match GeminiClient::new(key, &config.model, &config.gemini_base_url) {
        Ok(client) => {
            tracing::info!("AI tutor enabled (model: {})", config.model);
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!("AI tutor disabled: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studyhall_server=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("data directory: {}", config.data_dir.display());

    let db = storage::init_db(&config.data_dir)?;
    tracing::info!("database initialized");

    if !config.auth_enabled() {
        tracing::warn!("JWT_SECRET not set; login and registration are disabled");
    }
    let model = build_model(&config);
    if model.is_none() {
        tracing::warn!("GEMINI_API_KEY not set; chat, quizzes and flashcard generation are disabled");
    }

    let store = ObjectStore::new(
        config.data_dir.join("objects"),
        &config.storage_secret,
        &config.base_url,
        config.signed_url_ttl_secs,
    );
    let tutor = TutorState::new(model, config.chat_cache_capacity, config.chat_cache_ttl);

    let (sweep_tutor, sweep_db) = (tutor.clone(), db.clone());
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let purged = sweep_tutor.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = sweep_tutor.cached_sessions(), "expired chat sessions");
            }
            match storage::purge_expired_refresh_tokens(&sweep_db, chrono::Utc::now()) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired refresh tokens"),
                Err(e) => tracing::warn!("purge refresh tokens: {e}"),
            }
        }
    });

    let base_url = config.base_url.clone();
    let port = config.port;
    let app = app::build_router(AppState {
        db,
        store,
        config,
        tutor,
    });

    tracing::info!("starting server at {base_url}");
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

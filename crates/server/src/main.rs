use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use services::services::{
    api_client::{FormbricksApiClient, FormbricksApiError},
    cache::{AnalyticsCache, CacheConfig},
    config::FormbricksConfig,
    frequency::{FrequencyCaps, FrequencyTracker},
    manager::FormbricksManager,
    sdk::HttpVendorSdk,
    targeting::SurveyTargetingEngine,
};
use utils::{
    clock::{Clock, SystemClock},
    storage::{FileStorage, KvStorage, MemoryStorage},
};

mod error;
mod routes;
mod state;

use state::AppState;

const DEFAULT_PORT: u16 = 3100;

fn open_storage() -> Arc<dyn KvStorage> {
    let file_storage = FileStorage::default_path("lawnquote-feedback")
        .and_then(FileStorage::open);
    match file_storage {
        Ok(storage) => Arc::new(storage),
        Err(err) => {
            warn!(error = %err, "file storage unavailable, falling back to in-memory");
            Arc::new(MemoryStorage::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    utils::log::init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = open_storage();

    let cache = Arc::new(AnalyticsCache::with_storage(
        CacheConfig::default(),
        clock.clone(),
        storage.clone(),
    ));
    let _sweeper = cache.spawn_sweeper();

    let frequency = Arc::new(FrequencyTracker::new(
        storage,
        clock,
        FrequencyCaps::default(),
    ));
    let targeting = Arc::new(SurveyTargetingEngine::with_default_triggers(frequency));

    // A missing or invalid Formbricks environment disables the integration
    // rather than failing startup; the host app must keep working without it.
    let (manager, api) = match FormbricksConfig::from_env() {
        Ok(config) => {
            let api = Arc::new(FormbricksApiClient::new(&config)?);
            let key_check = Arc::clone(&api);
            tokio::spawn(async move {
                match key_check.me().await {
                    Ok(identity) => info!(id = %identity.id, "Formbricks API key verified"),
                    Err(FormbricksApiError::MissingApiKey) => {
                        info!("no Formbricks API key configured, analytics reads disabled")
                    }
                    Err(err) => warn!(error = %err, "Formbricks API key check failed"),
                }
            });
            let sdk = HttpVendorSdk::new(&config)
                .context("failed to construct Formbricks SDK client")?;
            let manager = Arc::new(FormbricksManager::new(config, sdk)?);
            let init_handle = manager.clone();
            tokio::spawn(async move {
                if let Err(err) = init_handle.initialize().await {
                    error!(error = %err, "Formbricks initialization failed");
                }
            });
            (Some(manager), Some(api))
        }
        Err(err) => {
            warn!(error = %err, "Formbricks not configured, tracking disabled");
            (None, None)
        }
    };

    let state = AppState {
        manager,
        api,
        cache,
        targeting,
    };

    let app = routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "feedback service listening");
    axum::serve(listener, app).await?;
    Ok(())
}

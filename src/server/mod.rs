//! Gateway: HTTP server, carrier WebSocket route, admin endpoints

pub mod admin;
pub mod media_ws;
pub mod outbound;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::LlmClient;
use crate::config::Settings;
use crate::knowledge::KnowledgeStore;
use crate::pipeline::PipelineDeps;
use crate::session::SessionRegistry;
use crate::voice::{SttClient, TtsClient};

/// Maximum knowledge document upload size.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// How often idle sessions are swept.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub deps: PipelineDeps,
    pub http: reqwest::Client,
}

/// Start the gateway and serve until the process is stopped.
pub async fn start(settings: Settings) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_with(listener, settings).await
}

/// Serve on an already-bound listener. Lets tests bind port 0 and learn
/// the address before the gateway starts.
pub async fn serve_with(listener: tokio::net::TcpListener, settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let store = Arc::new(KnowledgeStore::open(&settings.database_path).await?);

    let stt = SttClient::new(&settings.stt).map(Arc::new);
    let tts = TtsClient::new(&settings.tts).map(Arc::new);
    let llm = LlmClient::new(&settings.llm).map(Arc::new);
    if stt.is_none() {
        warn!("STT not configured (STT_API_KEY / STT_URL); caller speech will be dropped");
    }
    if tts.is_none() {
        warn!("TTS not configured (TTS_API_KEY / TTS_URL); no audio will be produced");
    }
    if llm.is_none() {
        warn!("LLM not configured (LLM_API_KEY / LLM_STREAM_URL); turns will be dropped");
    }

    let deps = PipelineDeps { settings: settings.clone(), store, stt, tts, llm };
    let state = AppState {
        registry: SessionRegistry::new(),
        deps,
        http: reqwest::Client::new(),
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let admin = Router::new()
        .route("/admin/persona", get(admin::get_persona).put(admin::update_persona))
        .route("/admin/documents", get(admin::list_documents).post(admin::upload_document))
        .route(
            "/admin/documents/{id}",
            get(admin::get_document).delete(admin::delete_document),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    let app = Router::new()
        .route(&settings.ws_path, get(media_ws::ws_handler))
        .route("/calls", post(outbound::trigger_call))
        .route("/health", get(health))
        .merge(admin)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Idle-session reaper. Sessions with no inbound media past the
    // deadline are deactivated and dropped from the registry.
    let reaper_registry = state.registry.clone();
    let idle_timeout = Duration::from_secs(settings.idle_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let reaped = reaper_registry.reap_idle(idle_timeout).await;
            if reaped > 0 {
                info!("Reaped {} idle session(s)", reaped);
            }
        }
    });

    info!(
        "Gateway listening on {} (media path {})",
        listener.local_addr()?,
        settings.ws_path
    );

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

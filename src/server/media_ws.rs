//! Carrier media-stream WebSocket handler
//!
//! One owner task per call. Incoming frames mutate the session; turn
//! pipelines and the TTS writer run as spawned tasks and reach the
//! socket only through the outbound frame channel, so the owner loop
//! stays responsive while a turn is in flight.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::carrier::{self, CarrierEvent};
use crate::pipeline;
use crate::session::Session;
use crate::types::Role;

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<MediaQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state, query))
}

async fn handle_media_stream(socket: WebSocket, state: AppState, query: MediaQuery) {
    let sample_rate = match query.sample_rate {
        Some(rate @ (8000 | 16000)) => rate,
        Some(other) => {
            warn!("Unsupported sample rate {} requested, using 8000", other);
            8000
        }
        None => 8000,
    };
    let call_id = query
        .call_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let direction = query.direction.unwrap_or_else(|| "inbound".to_string());

    info!(call_id = %call_id, sample_rate, "Media stream connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Single writer to the socket; frames arrive here already ordered.
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(call_id.clone(), sample_rate);
    state.registry.insert(session.clone()).await;

    let mut status = "disconnected";

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match carrier::parse_event(&text) {
                Ok(event) => {
                    if let Some(sid) = event.stream_sid() {
                        session.set_stream_sid(sid);
                    }
                    if let Some(params) = event.custom_parameters() {
                        session.merge_custom_parameters(params);
                    }

                    match event {
                        CarrierEvent::Connected { .. } => {
                            debug!(call_id = %call_id, "Carrier connected");
                            pipeline::maybe_start_greeting(&session, &state.deps, &tx);
                        }
                        CarrierEvent::Start { .. } => {
                            info!(
                                call_id = %call_id,
                                stream_sid = session.stream_sid().unwrap_or("?"),
                                "Call started"
                            );
                            pipeline::maybe_start_greeting(&session, &state.deps, &tx);
                        }
                        CarrierEvent::Media { media, .. } => {
                            if !media.is_inbound() {
                                // Echo of our own audio; never buffered.
                                continue;
                            }
                            match media.decode() {
                                Ok(pcm) => {
                                    session.append_inbound(&pcm);
                                    pipeline::maybe_start_greeting(&session, &state.deps, &tx);
                                    pipeline::maybe_trigger_turn(&session, &state.deps, &tx);
                                }
                                Err(e) => warn!(call_id = %call_id, "Bad media payload: {}", e),
                            }
                        }
                        CarrierEvent::Clear {} => {
                            info!(call_id = %call_id, "Barge-in: clearing queued output");
                            session.set_barge_in();
                        }
                        CarrierEvent::Mark { mark } => {
                            debug!(
                                call_id = %call_id,
                                "Mark ack: {}",
                                mark.and_then(|m| m.name).unwrap_or_default()
                            );
                        }
                        CarrierEvent::Stop { stop } => {
                            info!(
                                call_id = %call_id,
                                "Call stopping ({})",
                                stop.and_then(|s| s.reason).unwrap_or_else(|| "no reason".into())
                            );
                            pipeline::flush_residual_turn(&session, &state.deps, &tx).await;
                            status = "completed";
                            break;
                        }
                    }
                }
                // Protocol violations are logged and skipped; the call
                // continues.
                Err(e) => warn!(call_id = %call_id, "Dropping frame: {}", e),
            },
            Message::Close(_) => {
                info!(call_id = %call_id, "Socket closed by carrier");
                break;
            }
            _ => {}
        }
    }

    teardown(&state, &session, &direction, status).await;
    sender_task.abort();
}

/// Cancel in-flight work, drop the session from the registry, and
/// persist the transcript when the call held a real exchange.
async fn teardown(state: &AppState, session: &Arc<Session>, direction: &str, status: &str) {
    session.deactivate();
    state.registry.remove(&session.call_id).await;

    let history = session.history_snapshot().await;
    let exchanges = history.iter().filter(|m| m.role != Role::System).count();
    if exchanges > 0 {
        if let Err(e) = state
            .deps
            .store
            .save_transcript(&session.call_id, direction, &history, session.duration_secs(), status)
            .await
        {
            warn!(call_id = %session.call_id, "Transcript save failed: {}", e);
        }
    }

    info!(
        call_id = %session.call_id,
        "Session closed after {:.1}s ({} messages, {})",
        session.duration_secs(),
        exchanges,
        status
    );
}

//! Health and status endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use stagecast_sfu::ProducerId;

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub peers: usize,
    pub producers: usize,
    pub consumers: usize,
    /// Peers with at least one audio producer
    pub audio_peers: usize,
    /// Peers with at least one video producer
    pub video_peers: usize,
    /// `null` when the bridge is disabled
    pub transcode: Option<TranscodeStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeStatus {
    pub state: String,
    pub producer_id: Option<ProducerId>,
    pub generation: u64,
}

/// Registry counts and bridge state
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let coordinator = &state.coordinator;
    let registry = coordinator.registry();
    let (audio_peers, video_peers) = registry.kind_counts();

    Json(StatusResponse {
        peers: registry.peer_count(),
        producers: registry.producer_count(),
        consumers: registry.consumer_count(),
        audio_peers,
        video_peers,
        transcode: coordinator.bridge().map(|bridge| {
            let status = bridge.status();
            TranscodeStatus {
                state: status.state.to_string(),
                producer_id: status.producer_id,
                generation: status.generation,
            }
        }),
    })
}

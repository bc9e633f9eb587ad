use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use specter_embeddings::{Embedder, Embedding, Query};
use tracing::{debug, error};

/// Application state shared across handlers.
pub struct AppState {
    pub embedder: Arc<dyn Embedder>,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Body of every `/embed` response. Errors share the endpoint's shape so
/// clients only ever look for `embedding` or `error`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum EmbedResponse {
    Embedding { embedding: Embedding, dim: usize },
    Error { error: String },
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Embed one query.
///
/// Blank queries get a `200` with an `error` body and never reach the model.
pub async fn embed(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, (StatusCode, Json<EmbedResponse>)> {
    let query = match Query::parse(&request.query) {
        Ok(query) => query,
        Err(e) => {
            debug!("Rejected query: {}", e);
            return Ok(Json(EmbedResponse::Error {
                error: e.to_string(),
            }));
        }
    };

    debug!("Embedding query of {} chars", query.as_str().len());

    let embedder = Arc::clone(&state.embedder);
    let result = tokio::task::spawn_blocking(move || embedder.embed_one(query.as_str()))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|result| result);

    match result {
        Ok(embedding) => Ok(Json(EmbedResponse::Embedding {
            dim: embedding.len(),
            embedding,
        })),
        Err(e) => {
            error!("Embedding failed: {:#}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(EmbedResponse::Error {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

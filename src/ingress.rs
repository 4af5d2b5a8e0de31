// 🌐 Ingress Endpoint - listing producer → ingestion queue
//
// Validates the producer's payload and hands it to the queue. The response
// goes out before any matching or mail sending happens.

use crate::entities::ListingEvent;
use crate::queue::IngestQueue;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

pub const NEW_LISTING_PATH: &str = "/listing-consumer/v1/new-listing";

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    pub queue: IngestQueue,
}

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    fn err(data: T, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.into()),
        }
    }
}

/// Listing as posted by the producer. `make` and `year` are accepted as
/// aliases, which is what the producer actually sends.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ListingPayload {
    #[serde(alias = "make")]
    #[validate(length(min = 1))]
    pub manufacturer: String,

    #[validate(length(min = 1))]
    pub model: String,

    #[serde(alias = "year")]
    #[validate(length(min = 1))]
    pub model_year: String,

    #[validate(length(min = 1))]
    pub date_listed: String,

    #[validate(length(min = 1))]
    pub row_id: String,

    #[validate(length(min = 1))]
    pub branch: String,

    #[validate(url)]
    pub listing_url: String,

    pub client_id: Uuid,
}

impl From<ListingPayload> for ListingEvent {
    fn from(payload: ListingPayload) -> Self {
        ListingEvent {
            manufacturer: payload.manufacturer,
            model: payload.model,
            model_year: payload.model_year,
            branch: payload.branch,
            listing_url: payload.listing_url,
            correlation_id: payload.client_id,
            date_listed: payload.date_listed,
            row_id: payload.row_id,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /listing-consumer/v1/new-listing - Queue a listing for ingestion
async fn consume_listing(
    State(state): State<AppState>,
    payload: Result<Json<ListingPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let reason = rejection.body_text();
            tracing::warn!(%reason, "rejecting malformed listing");
            return (StatusCode::BAD_REQUEST, Json(ApiResponse::err((), reason))).into_response();
        }
    };

    if let Err(errors) = payload.validate() {
        tracing::warn!(%errors, client_id = %payload.client_id, "rejecting invalid listing");
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::err(errors, "invalid listing")),
        )
            .into_response();
    }

    let listing = ListingEvent::from(payload);
    let correlation_id = listing.correlation_id;

    match state.queue.submit(listing) {
        Ok(()) => {
            tracing::debug!(%correlation_id, "queued listing for ingestion");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => {
            tracing::warn!(%correlation_id, %error, "could not queue listing");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::err((), error.to_string())),
            )
                .into_response()
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .route(NEW_LISTING_PATH, post(consume_listing))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

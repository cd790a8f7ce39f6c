//! JSON boundary for the viewer and the notifier. Rendering is somebody
//! else's job; everything here speaks listings in and out of the store.

use std::sync::Arc;

use adwatch_core::Listing;
use adwatch_store::{ListingQuery, ListingStore, SortOrder, StoreError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

pub const CRATE_NAME: &str = "adwatch-web";

struct AppState {
    store: ListingStore,
}

pub fn router(store: ListingStore) -> Router {
    Router::new()
        .route("/api/listings", get(list_listings))
        .route("/api/listings/{id}", get(get_listing))
        .route("/api/listings/{id}/favorite", post(toggle_favorite))
        .route("/api/notifier/unsent", get(unsent))
        .route("/api/notifier/{id}/sent", post(mark_sent))
        .with_state(Arc::new(AppState { store }))
}

/// Store failures map to 500; the body never leaks SQL detail.
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed against the store");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "storage failure"})),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListingsParams {
    min_price: Option<i64>,
    max_price: Option<i64>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    q: Option<String>,
    favorites: Option<bool>,
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl ListingsParams {
    fn into_query(self) -> ListingQuery {
        let defaults = ListingQuery::default();
        ListingQuery {
            min_price_uah: self.min_price,
            max_price_uah: self.max_price,
            created_from: self.from,
            created_to: self.to,
            text: self.q,
            favorites_only: self.favorites.unwrap_or(false),
            sort: match self.sort.as_deref() {
                Some("price_asc") => SortOrder::PriceAsc,
                Some("price_desc") => SortOrder::PriceDesc,
                _ => SortOrder::Newest,
            },
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(0),
        }
    }
}

async fn list_listings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListingsParams>,
) -> Result<Json<Vec<Listing>>, ApiError> {
    let listings = state.store.query(&params.into_query()).await?;
    Ok(Json(listings))
}

async fn get_listing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.get(&id).await? {
        Some(listing) => Ok(Json(listing).into_response()),
        None => Ok(not_found(&id)),
    }
}

async fn toggle_favorite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.toggle_favorite(&id).await? {
        Some(is_favorite) => Ok(Json(json!({"id": id, "is_favorite": is_favorite})).into_response()),
        None => Ok(not_found(&id)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UnsentParams {
    limit: i64,
}

impl Default for UnsentParams {
    fn default() -> Self {
        Self { limit: 5 }
    }
}

async fn unsent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UnsentParams>,
) -> Result<Json<Vec<Listing>>, ApiError> {
    let listings = state.store.unsent(params.limit.max(0)).await?;
    Ok(Json(listings))
}

/// Marking an already-deleted listing sent is fine; the notifier only needs
/// the row to stop appearing in its queue.
async fn mark_sent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.mark_sent(&id).await?;
    Ok(StatusCode::OK)
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "listing not found", "id": id})),
    )
        .into_response()
}

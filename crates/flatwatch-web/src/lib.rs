//! Read-only JSON surface over stored segment snapshots.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use flatwatch_core::{Listing, SortMode};
use flatwatch_storage::{SnapshotStore, StorageError};
use flatwatch_sync::{listing_info, load_registry, recent_listings, SegmentCatalog, WatchConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "flatwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SnapshotStore,
    pub catalog: Arc<SegmentCatalog>,
}

impl AppState {
    pub fn new(store: SnapshotStore, catalog: Arc<SegmentCatalog>) -> Self {
        Self { store, catalog }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    sort: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListingsBody {
    segment: String,
    count: usize,
    listings: Vec<Listing>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/segments/{slug}/listings", get(listings_handler))
        .route("/segments/{slug}/listings/{id}", get(listing_info_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WatchConfig::from_env()?;
    let (catalog, _) = load_registry(&config.registry_path, config.env)?;
    let store = SnapshotStore::new(&config.storage_dir, config.env.as_str());
    serve(AppState::new(store, Arc::new(catalog)), config.web_port, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    if state.catalog.get(&slug).is_none() {
        return unknown_segment(&slug);
    }
    let mode = match query.sort.as_deref() {
        None | Some("price") => SortMode::Price,
        Some("avg") => SortMode::BelowAverage,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown sort {other:?}, expected price or avg") })),
            )
                .into_response()
        }
    };
    match recent_listings(&state.store, &slug, mode, Utc::now()).await {
        Ok(listings) => Json(ListingsBody {
            segment: slug,
            count: listings.len(),
            listings,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn listing_info_handler(
    State(state): State<Arc<AppState>>,
    Path((slug, id)): Path<(String, i64)>,
) -> Response {
    if state.catalog.get(&slug).is_none() {
        return unknown_segment(&slug);
    }
    match listing_info(&state.store, &slug, id, Utc::now()).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("listing {id} not found in {slug}") })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn unknown_segment(slug: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown segment {slug:?}") })),
    )
        .into_response()
}

fn server_error(err: StorageError) -> Response {
    warn!("web request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

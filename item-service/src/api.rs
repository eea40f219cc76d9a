use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::item::{Item, ItemError, ItemService};
use crate::metrics::track_metrics;
use crate::metrics_consts::{ITEMS_CREATED, ITEM_REQUESTS_REJECTED};

pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error(transparent)]
    Item(#[from] ItemError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::RequestDecodingError(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::RequestDecodingError(rejection.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RequestDecodingError(_)
            | ApiError::Item(ItemError::InvalidId(_))
            | ApiError::Item(ItemError::InvalidLimit(_)) => StatusCode::BAD_REQUEST,

            ApiError::Item(ItemError::Duplicate(_)) => StatusCode::CONFLICT,

            ApiError::Item(ItemError::Store(e)) => {
                error!("item store failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        metrics::counter!(ITEM_REQUESTS_REJECTED, "status" => status.as_u16().to_string())
            .increment(1);

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

async fn create_item(
    State(items): State<ItemService>,
    payload: Result<Json<Item>, JsonRejection>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    let Json(item) = payload?;
    let created = items.create(item).await?;

    info!(id = created.id, "created item");
    metrics::counter!(ITEMS_CREATED, "source" => "http").increment(1);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_items(
    State(items): State<ItemService>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<Item>>, ApiError> {
    let Query(params) = params?;
    let listed = items
        .list(params.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;

    Ok(Json(listed))
}

/// Item routes. The access log is only attached when `access_log` is set.
pub fn router(items: ItemService, access_log: bool) -> Router {
    let router = Router::new()
        .route("/items", get(list_items).post(create_item))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(items);

    if access_log {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

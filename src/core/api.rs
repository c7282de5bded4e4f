use crate::core::ent::*;
use crate::core::error::StoreError;
use crate::core::monitor::{Monitor, TickOutcome};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(StoreError::InvalidInput(_) | StoreError::NoUnits) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::BAD_GATEWAY,
        };
        tracing::debug!(status = %status, error = %self, "request failed");
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub struct AppState {
    pub monitor: Arc<Monitor>,
}

// The query parameters for devices index
#[derive(Debug, Deserialize, Default)]
pub struct Pagination {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn devices_index(
    pagination: Option<Query<Pagination>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Query(pagination) = pagination.unwrap_or_default();

    let devices = state
        .monitor
        .devices()
        .await
        .into_iter()
        .skip(pagination.offset.unwrap_or(0))
        .take(pagination.limit.unwrap_or(usize::MAX))
        .collect::<Vec<_>>();

    Json(devices)
}

pub async fn device_create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let input = input
        .normalize()
        .ok_or_else(|| ApiError::InvalidInput("ip_address is required".to_string()))?;
    let device = state.monitor.create_device(input).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

pub async fn devices_stats(State(state): State<Arc<AppState>>) -> Json<NetworkStats> {
    Json(state.monitor.stats().await)
}

/// Runs a monitoring tick right away.
///
/// The tick runs on its own task, so it completes even if the request is
/// dropped by the timeout layer or the client.
pub async fn devices_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceUpdate>>, ApiError> {
    let monitor = state.monitor.clone();
    let outcome = tokio::spawn(async move { monitor.run_tick().await })
        .await
        .map_err(|e| ApiError::Internal(format!("monitoring tick aborted: {e}")))?;
    match outcome {
        TickOutcome::Completed(updates) => Ok(Json(updates)),
        TickOutcome::Skipped => Err(ApiError::Conflict(
            "a monitoring tick is already running".to_string(),
        )),
        TickOutcome::Failed(e) => Err(e.into()),
    }
}

/// Reloads the device list from the store without probing.
pub async fn devices_refresh(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state.monitor.refresh().await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn units_index(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Unit>>, ApiError> {
    Ok(Json(state.monitor.store().list_units().await?))
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monitor::tests::{monitor, Reply, ScriptedProber};
    use crate::core::store::MemoryStore;
    use std::time::Duration;
    use tokio::time;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn dropped_check_request_still_finishes_the_tick() {
        let fast = Device::new(Uuid::new_v4(), "192.168.1.1").with_uptime(50.0);
        let slow = Device::new(Uuid::new_v4(), "10.0.0.5").with_uptime(50.0);
        let store = Arc::new(MemoryStore::new(vec![fast.clone(), slow.clone()], Vec::new()));
        let prober = Arc::new(ScriptedProber::new(vec![
            ("192.168.1.1", Reply::Up(Duration::from_millis(3))),
            ("10.0.0.5", Reply::Slow(Duration::from_millis(1000))),
        ]));
        let state = Arc::new(AppState {
            monitor: Arc::new(monitor(prober, store.clone())),
        });

        let request = devices_check(State(state.clone()));
        assert!(time::timeout(Duration::from_millis(100), request).await.is_err());
        time::sleep(Duration::from_secs(2)).await;

        let view = state.monitor.devices().await;
        for device in [&fast, &slow] {
            let stored = store.get(device.id).await.unwrap();
            let shown = view.iter().find(|d| d.id == device.id).unwrap();
            assert_eq!(stored.status, DeviceStatus::Online);
            assert_eq!(shown.status, stored.status);
            assert_eq!(shown.uptime_percentage, stored.uptime_percentage);
        }
        assert!(matches!(state.monitor.run_tick().await, TickOutcome::Completed(_)));
    }
}

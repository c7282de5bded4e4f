use crate::core::api::*;

use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::time;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/devices", get(devices_index).post(device_create))
        .route("/devices/stats", get(devices_stats))
        .route("/devices/check", post(devices_check))
        .route("/devices/refresh", post(devices_refresh))
        .route("/units", get(units_index))
        .route("/health", get(health))
        // Add middleware to all routes
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|error: BoxError| async move {
                    if error.is::<tower::timeout::error::Elapsed>() {
                        Ok(StatusCode::REQUEST_TIMEOUT)
                    } else {
                        Err((
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Unhandled internal error: {}", error),
                        ))
                    }
                }))
                .timeout(time::Duration::from_secs(10))
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn listen<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let app = router(state);
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    tracing::info!("listening on {}", server.local_addr());
    server.with_graceful_shutdown(shutdown).await
}

use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::IntoResponse;

use crate::AppState;
use crate::interceptor::SERVICE_WORKER_SCRIPT;

/// `GET {base}/webvpn-sw.js`
pub async fn service_worker(State(state): State<AppState>) -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "application/javascript".to_string()),
            (CACHE_CONTROL, "no-cache".to_string()),
            (
                axum::http::HeaderName::from_static("service-worker-allowed"),
                format!("{}/", state.config.base_path),
            ),
        ],
        SERVICE_WORKER_SCRIPT,
    )
}

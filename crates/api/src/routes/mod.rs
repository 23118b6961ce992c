pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /jobs                    submit (POST), list (GET)
/// /jobs/{id}               status
/// /jobs/{id}/result        committed transcript
/// /jobs/{id}/cancel        cancel (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/jobs", jobs::router())
}

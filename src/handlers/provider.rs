use axum::{Json, extract::State};

use crate::AppState;
use crate::models::provider::{ProviderRequestParams, ProviderResult};

/// The gateway entry point. Errors travel inside the result envelope with
/// their stable wire codes; the HTTP status stays 200 for callers that got a
/// well-formed answer either way.
pub async fn provider_request(
    State(state): State<AppState>,
    Json(params): Json<ProviderRequestParams>,
) -> Json<ProviderResult> {
    Json(state.gateway.provider_request(params).await)
}

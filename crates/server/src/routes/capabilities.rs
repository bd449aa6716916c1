use axum::{Json, extract::State};
use studyhall_api::CapabilitiesResponse;

use crate::AppConfig;
use crate::tutor::TutorState;

/// GET /api/capabilities: runtime feature availability.
pub async fn capabilities(
    State(config): State<AppConfig>,
    State(tutor): State<TutorState>,
) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        auth_enabled: config.auth_enabled(),
        ai_enabled: tutor.is_enabled(),
        max_upload_bytes: config.max_upload_bytes,
    })
}

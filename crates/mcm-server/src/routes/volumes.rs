use axum::Json;
use axum::extract::State;
use mcm_provider::volumes;

use crate::dto::{GetVolumeIdsRequest, GetVolumeIdsResponse};
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

/// Volume lookups are not tied to one provider spec, so every configured
/// backend gets a chance to claim each volume.
pub async fn get_volume_ids(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<GetVolumeIdsRequest>,
) -> Result<Json<GetVolumeIdsResponse>, ApiError> {
    let raw = body.into_blob()?;
    let volume_ids = volumes::extract_volume_ids(&state.providers.backends(), &raw).await?;
    Ok(Json(GetVolumeIdsResponse { volume_ids }))
}

use axum::extract::{Path, State};
use axum::response::Json;

use crate::entitlement::EntitlementRecord;
use crate::error::Error;
use crate::gateway_util::AppState;

/// Handler for `GET /v1/entitlement/{user_id}`.
///
/// Never 404s: a user with no stored record is indistinguishable from a
/// free-tier user who has consumed nothing, and the response says exactly
/// that.
pub async fn get_entitlement_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<EntitlementRecord>, Error> {
    let record = app_state
        .entitlement_store
        .get(&user_id)
        .await?
        .unwrap_or_else(|| EntitlementRecord::default_for(&user_id));

    Ok(Json(record))
}

use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::{ApiResult, AppState};
use crate::storage::{DatasetRecord, UserRecord};

pub async fn get_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> ApiResult<Json<DatasetRecord>> {
    Ok(Json(state.store.get_dataset(&dataset_id)?))
}

/// Registered researcher by wallet address (any hex case)
pub async fn get_user(State(state): State<AppState>, Path(address): Path<String>) -> ApiResult<Json<UserRecord>> {
    Ok(Json(state.store.get_user(&address)?))
}

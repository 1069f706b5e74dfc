use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, ApiResult, AppState};
use crate::storage::{CitationRecord, CitationTarget, ResearchRecord, ReviewRecord};

/// Query parameters for paginated lists
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageParams {
    /// Requested limit clamped to `1..=max`
    pub fn limit(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max.max(1))
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub count: usize,
    pub list: Vec<ResearchRecord>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct ByAuthorResponse {
    pub count: usize,
    pub list: Vec<ResearchRecord>,
    pub author: String,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub list: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(list: Vec<T>) -> Self {
        Self {
            count: list.len(),
            list,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "rawContent")]
    pub raw_content: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    #[serde(rename = "match")]
    pub matched: bool,
}

pub async fn get_research(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> ApiResult<Json<ResearchRecord>> {
    Ok(Json(state.store.get_research(&token_id)?))
}

/// Newest research first
pub async fn get_latest_research(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<LatestResponse>> {
    let limit = params.limit(state.api.default_page_size, state.api.max_page_size);
    let offset = params.offset();
    let list = state.store.latest_research(offset, limit)?;

    Ok(Json(LatestResponse {
        count: list.len(),
        list,
        limit,
        offset,
    }))
}

pub async fn get_research_by_author(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<ByAuthorResponse>> {
    let limit = params.limit(state.api.default_page_size, state.api.max_page_size);
    let offset = params.offset();
    let author = address.to_ascii_lowercase();
    let list = state.store.research_by_author(&author, offset, limit)?;

    Ok(Json(ByAuthorResponse {
        count: list.len(),
        list,
        author,
        limit,
        offset,
    }))
}

/// Compare submitted raw content with the minted content hash
pub async fn verify_research(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiResult<Json<VerifyResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::validation_error("rawContent", &e.body_text()))?;
    let result = state.verifier.verify(&state.store, &token_id, &request.raw_content)?;
    Ok(Json(VerifyResponse {
        matched: result.matched,
    }))
}

pub async fn get_research_reviews(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> ApiResult<Json<ListResponse<ReviewRecord>>> {
    state.store.get_research(&token_id)?;
    Ok(Json(state.store.reviews_for(&token_id)?.into()))
}

pub async fn get_research_citations(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> ApiResult<Json<ListResponse<CitationRecord>>> {
    state.store.get_research(&token_id)?;
    Ok(Json(
        state
            .store
            .citations_for(CitationTarget::Research, &token_id)?
            .into(),
    ))
}

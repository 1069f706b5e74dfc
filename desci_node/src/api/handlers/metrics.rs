use axum::{
    http::header,
    response::{IntoResponse, Response},
};

use crate::api::ApiResult;
use crate::metrics;

/// Prometheus text exposition
pub async fn get_metrics() -> ApiResult<Response> {
    let body = metrics::gather_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

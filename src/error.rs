use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Error taxonomy for the ad-watch core (see design spec §7).
///
/// Database contention ("database is locked") never surfaces as this type:
/// [`crate::store::Store::with_tx`] intercepts it and retries the whole
/// transaction internally. What reaches here is a caller mistake
/// (`DataArgument`), a missing row (`NotFound`), or an unexpected failure.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    DataArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

/// Wire envelope mandated by the HTTP surface (core spec §6):
/// `{"data": ...}` on success, `{"error": "<message>"}` on failure, status
/// 200 in both cases.
#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!("database error: {:?}", e),
            AppError::Internal(e) => tracing::error!("internal error: {:?}", e),
            AppError::DataArgument(msg) => tracing::debug!("rejected argument: {}", msg),
            AppError::NotFound(msg) => tracing::debug!("not found: {}", msg),
        }

        (
            StatusCode::OK,
            Json(ErrorEnvelope {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Wraps a successful value in the `{"data": ...}` envelope.
#[derive(Serialize)]
pub struct DataEnvelope<T: Serialize> {
    data: T,
}

impl<T: Serialize> DataEnvelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for DataEnvelope<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

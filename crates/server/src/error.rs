use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use services::services::{api_client::FormbricksApiError, manager::ManagerError};
use utils::{response::ApiResponse, storage::StorageError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Upstream(#[from] FormbricksApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    BadRequest(String),
    #[error("feedback integration is disabled")]
    FeatureDisabled,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Manager(ManagerError::Disabled) | ApiError::FeatureDisabled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body: ApiResponse<()> = ApiResponse::error(self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_maps_to_service_unavailable() {
        assert_eq!(
            ApiError::FeatureDisabled.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Manager(ManagerError::Disabled).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn bad_request_maps_to_400() {
        assert_eq!(
            ApiError::BadRequest("missing field".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}

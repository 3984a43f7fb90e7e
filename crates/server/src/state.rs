use std::sync::Arc;

use services::services::{
    api_client::FormbricksApiClient, cache::AnalyticsCache, manager::FormbricksManager,
    targeting::SurveyTargetingEngine,
};

use crate::error::ApiError;

/// Shared handles for the route handlers. `manager` and `api` are `None` when
/// the Formbricks environment is not configured; tracking endpoints then
/// no-op and analytics endpoints answer 503.
#[derive(Clone)]
pub struct AppState {
    pub manager: Option<Arc<FormbricksManager>>,
    pub api: Option<Arc<FormbricksApiClient>>,
    pub cache: Arc<AnalyticsCache>,
    pub targeting: Arc<SurveyTargetingEngine>,
}

impl AppState {
    pub fn api(&self) -> Result<&Arc<FormbricksApiClient>, ApiError> {
        self.api.as_ref().ok_or(ApiError::FeatureDisabled)
    }
}

//! Analytics routes: the aggregated dashboard plus cache administration.

use axum::{
    Router,
    extract::{Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;

use services::models::{Survey, SurveyResponse, WorkflowSession};
use services::services::{
    analytics::{
        self, DashboardMetrics, QuestionAnalytics, TimeInterval, TimeSeriesBucket,
        WorkflowInsights,
    },
    cache::{CacheClass, CacheStats, cache_key},
};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    #[serde(default)]
    pub interval: Option<TimeInterval>,
    /// Restrict to responses created in the trailing N days.
    #[serde(default)]
    pub range: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SurveyQuestionAnalytics {
    pub survey_id: String,
    pub questions: Vec<QuestionAnalytics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsDashboard {
    pub metrics: DashboardMetrics,
    pub time_series: Vec<TimeSeriesBucket>,
    pub question_analytics: Vec<SurveyQuestionAnalytics>,
}

async fn cached_surveys(state: &AppState) -> Result<Vec<Survey>, ApiError> {
    let key = cache_key(CacheClass::Surveys, "all", &serde_json::Value::Null);
    if let Some(surveys) = state.cache.get::<Vec<Survey>>(&key).await {
        return Ok(surveys);
    }
    let surveys = state.api()?.fetch_surveys().await?;
    state
        .cache
        .set(&key, &surveys, Some(CacheClass::Surveys.default_ttl()))
        .await;
    Ok(surveys)
}

async fn cached_responses(state: &AppState) -> Result<Vec<SurveyResponse>, ApiError> {
    let key = cache_key(CacheClass::Responses, "all", &serde_json::Value::Null);
    if let Some(responses) = state.cache.get::<Vec<SurveyResponse>>(&key).await {
        return Ok(responses);
    }
    let responses = state.api()?.fetch_responses(None).await?;
    state
        .cache
        .set(&key, &responses, Some(CacheClass::Responses.default_ttl()))
        .await;
    Ok(responses)
}

/// The aggregated dashboard: metrics, a response time series and per-survey
/// question analytics. The assembled payload is cached under a key derived
/// from the query so different intervals never collide.
pub async fn get_dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<ResponseJson<ApiResponse<AnalyticsDashboard>>, ApiError> {
    let interval = query.interval.unwrap_or(TimeInterval::Day);
    let filters = serde_json::json!({ "interval": interval, "range": query.range });
    let key = cache_key(CacheClass::Analytics, "dashboard", &filters);

    if let Some(dashboard) = state.cache.get::<AnalyticsDashboard>(&key).await {
        return Ok(ResponseJson(ApiResponse::success(dashboard)));
    }

    let surveys = cached_surveys(&state).await?;
    let mut responses = cached_responses(&state).await?;
    if let Some(days) = query.range {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days.max(0));
        responses.retain(|r| r.created_at >= cutoff);
    }

    let dashboard = AnalyticsDashboard {
        metrics: analytics::compute_metrics(&surveys, &responses),
        time_series: analytics::time_series(&responses, interval),
        question_analytics: surveys
            .iter()
            .map(|survey| SurveyQuestionAnalytics {
                survey_id: survey.id.clone(),
                questions: analytics::question_analytics(survey, &responses),
            })
            .collect(),
    };

    state
        .cache
        .set(&key, &dashboard, Some(CacheClass::Analytics.default_ttl()))
        .await;
    Ok(ResponseJson(ApiResponse::success(dashboard)))
}

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInsightsRequest {
    pub sessions: Vec<WorkflowSession>,
}

/// Conversion and per-step drop-off analysis over workflow sessions the
/// application recorded, correlated with the fetched survey responses.
pub async fn get_workflow_insights(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<WorkflowInsightsRequest>,
) -> Result<ResponseJson<ApiResponse<WorkflowInsights>>, ApiError> {
    let responses = cached_responses(&state).await?;
    let insights = analytics::workflow_insights(&responses, &request.sessions);
    Ok(ResponseJson(ApiResponse::success(insights)))
}

pub async fn get_cache_stats(
    State(state): State<AppState>,
) -> ResponseJson<ApiResponse<CacheStats>> {
    ResponseJson(ApiResponse::success(state.cache.stats().await))
}

#[derive(Debug, Deserialize, TS)]
pub struct InvalidateRequest {
    /// Glob pattern over cache keys, e.g. `surveys:*`.
    pub pattern: String,
}

#[derive(Debug, Serialize, TS)]
pub struct InvalidateResponse {
    pub invalidated: usize,
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<InvalidateRequest>,
) -> Result<ResponseJson<ApiResponse<InvalidateResponse>>, ApiError> {
    if request.pattern.trim().is_empty() {
        return Err(ApiError::BadRequest("pattern must not be empty".into()));
    }
    let invalidated = state.cache.invalidate(&request.pattern).await;
    Ok(ResponseJson(ApiResponse::success(InvalidateResponse {
        invalidated,
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/analytics",
        Router::new()
            .route("/dashboard", get(get_dashboard))
            .route("/workflow-insights", post(get_workflow_insights))
            .route("/cache/stats", get(get_cache_stats))
            .route("/cache/invalidate", post(invalidate_cache)),
    )
}

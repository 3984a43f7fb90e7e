//! Survey targeting routes: which surveys fit the current context, whether a
//! specific one may show, and recording actual displays.

use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::Deserialize;
use utils::response::ApiResponse;

use services::services::targeting::{
    PageContext, ShowDecision, SurveyTarget, UserActivity, UserSegment,
};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingQuery {
    pub segment: UserSegment,
    pub path: String,
    #[serde(default)]
    pub seconds_on_page: u64,
    #[serde(default)]
    pub quotes_created: u64,
    #[serde(default)]
    pub average_quote_value: f64,
}

impl TargetingQuery {
    fn split(self) -> (UserSegment, PageContext, UserActivity) {
        (
            self.segment,
            PageContext {
                path: self.path,
                seconds_on_page: self.seconds_on_page,
            },
            UserActivity {
                quotes_created: self.quotes_created,
                average_quote_value: self.average_quote_value,
            },
        )
    }
}

/// Surveys eligible for this context, best match first.
pub async fn get_survey_targets(
    State(state): State<AppState>,
    Query(query): Query<TargetingQuery>,
) -> ResponseJson<ApiResponse<Vec<SurveyTarget>>> {
    let (segment, page, activity) = query.split();
    let targets = state.targeting.survey_targets(segment, &page, &activity);
    ResponseJson(ApiResponse::success(targets))
}

/// Whether one specific survey may show right now, with alternatives when it
/// is suppressed by a frequency cap.
pub async fn should_show_survey(
    State(state): State<AppState>,
    Path(survey_id): Path<String>,
    Query(query): Query<TargetingQuery>,
) -> ResponseJson<ApiResponse<ShowDecision>> {
    let (segment, page, activity) = query.split();
    let decision = state
        .targeting
        .should_show_survey(&survey_id, segment, &page, &activity);
    ResponseJson(ApiResponse::success(decision))
}

#[derive(Debug, Deserialize)]
pub struct DisplayRequest {
    pub segment: UserSegment,
}

/// Record that a survey was displayed; this is what feeds the frequency
/// caps. Also mirrored as a tracked event when the integration is up.
pub async fn record_survey_display(
    State(state): State<AppState>,
    Path(survey_id): Path<String>,
    axum::Json(request): axum::Json<DisplayRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .targeting
        .track_survey_display(&survey_id, request.segment);

    if let Some(manager) = &state.manager {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "surveyId".to_string(),
            serde_json::Value::String(survey_id.clone()),
        );
        properties.insert(
            "segment".to_string(),
            serde_json::Value::String(request.segment.to_string()),
        );
        manager.track("survey_displayed", Some(properties)).await;
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/surveys",
        Router::new()
            .route("/targets", get(get_survey_targets))
            .route("/{survey_id}/should-show", get(should_show_survey))
            .route("/{survey_id}/display", post(record_survey_display)),
    )
}

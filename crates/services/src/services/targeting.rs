//! Survey targeting: match the configured triggers against the user's
//! segment, current page and activity, score each eligible survey, and gate
//! the final decision through the frequency caps.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};
use ts_rs::TS;

use crate::services::frequency::FrequencyTracker;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserSegment {
    NewUser,
    ActiveUser,
    PowerUser,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub path: String,
    #[serde(default)]
    pub seconds_on_page: u64,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub quotes_created: u64,
    pub average_quote_value: f64,
}

/// One row of the targeting table: which survey may show, to whom, where.
#[derive(Debug, Clone)]
pub struct SurveyTrigger {
    pub survey_id: String,
    pub segment: UserSegment,
    pub priority: u32,
    /// Path prefixes this survey is tied to; empty means any page.
    pub page_paths: Vec<String>,
    pub min_seconds_on_page: u64,
    pub min_quotes_created: u64,
    pub min_average_quote_value: f64,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SurveyTarget {
    pub survey_id: String,
    pub segment: UserSegment,
    pub priority: u32,
    pub eligibility_score: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ShowDecision {
    pub should_show: bool,
    pub reason: String,
    /// Up to three other eligible surveys that still pass their caps.
    pub alternatives: Vec<String>,
}

pub struct SurveyTargetingEngine {
    triggers: Vec<SurveyTrigger>,
    frequency: Arc<FrequencyTracker>,
}

impl SurveyTargetingEngine {
    pub fn new(triggers: Vec<SurveyTrigger>, frequency: Arc<FrequencyTracker>) -> Self {
        Self {
            triggers,
            frequency,
        }
    }

    /// The built-in LawnQuote targeting table.
    pub fn with_default_triggers(frequency: Arc<FrequencyTracker>) -> Self {
        let trigger = |survey_id: &str,
                       segment: UserSegment,
                       priority: u32,
                       page_paths: &[&str],
                       min_seconds_on_page: u64,
                       min_quotes_created: u64,
                       min_average_quote_value: f64| SurveyTrigger {
            survey_id: survey_id.to_string(),
            segment,
            priority,
            page_paths: page_paths.iter().map(|p| p.to_string()).collect(),
            min_seconds_on_page,
            min_quotes_created,
            min_average_quote_value,
        };
        Self::new(
            vec![
                trigger("onboarding_feedback", UserSegment::NewUser, 10, &["/dashboard"], 30, 0, 0.0),
                trigger("first_quote_feedback", UserSegment::NewUser, 20, &["/quotes"], 0, 1, 0.0),
                trigger("quote_creation_feedback", UserSegment::ActiveUser, 15, &["/quotes"], 20, 3, 0.0),
                trigger("pricing_feedback", UserSegment::ActiveUser, 10, &["/pricing", "/settings/pricing"], 15, 0, 0.0),
                trigger("power_user_interview", UserSegment::PowerUser, 30, &[], 60, 25, 500.0),
                trigger("feature_request", UserSegment::PowerUser, 10, &[], 0, 10, 0.0),
            ],
            frequency,
        )
    }

    /// Score one trigger against the current context. `None` means excluded:
    /// wrong segment, a page-bound survey on the wrong page, or an unmet
    /// quote-count threshold.
    fn score(
        trigger: &SurveyTrigger,
        segment: UserSegment,
        page: &PageContext,
        activity: &UserActivity,
    ) -> Option<SurveyTarget> {
        if trigger.segment != segment {
            return None;
        }

        let mut score = 0u32;
        let mut reasons: Vec<&str> = Vec::new();

        if trigger.page_paths.is_empty() {
            score += 20;
            reasons.push("applies to any page");
        } else if trigger
            .page_paths
            .iter()
            .any(|p| page.path.starts_with(p.as_str()))
        {
            score += 40;
            reasons.push("page matches");
        } else {
            return None;
        }

        if trigger.min_seconds_on_page == 0 {
            score += 10;
        } else if page.seconds_on_page >= trigger.min_seconds_on_page {
            score += 30;
            reasons.push("dwell time met");
        } else if page.seconds_on_page * 2 >= trigger.min_seconds_on_page {
            score += 15;
        }

        if activity.quotes_created >= trigger.min_quotes_created {
            score += 20;
            if trigger.min_quotes_created > 0 {
                reasons.push("quote activity met");
            }
        } else if trigger.min_quotes_created > 0 {
            return None;
        }

        if activity.average_quote_value >= trigger.min_average_quote_value {
            score += 10;
            if trigger.min_average_quote_value > 0.0 {
                reasons.push("quote value met");
            }
        }

        Some(SurveyTarget {
            survey_id: trigger.survey_id.clone(),
            segment: trigger.segment,
            priority: trigger.priority,
            eligibility_score: score,
            reason: reasons.join(", "),
        })
    }

    /// Eligible surveys for this context, best first (score, then priority).
    pub fn survey_targets(
        &self,
        segment: UserSegment,
        page: &PageContext,
        activity: &UserActivity,
    ) -> Vec<SurveyTarget> {
        let mut targets: Vec<SurveyTarget> = self
            .triggers
            .iter()
            .filter_map(|t| Self::score(t, segment, page, activity))
            .collect();
        targets.sort_by(|a, b| {
            b.eligibility_score
                .cmp(&a.eligibility_score)
                .then(b.priority.cmp(&a.priority))
        });
        debug!(
            segment = %segment,
            path = %page.path,
            matched = targets.len(),
            "evaluated survey targets"
        );
        targets
    }

    /// Decide whether `survey_id` may show right now. A cap-suppressed survey
    /// comes back with the cap's reason and up to three alternatives that are
    /// both eligible and within their own caps.
    pub fn should_show_survey(
        &self,
        survey_id: &str,
        segment: UserSegment,
        page: &PageContext,
        activity: &UserActivity,
    ) -> ShowDecision {
        let targets = self.survey_targets(segment, page, activity);
        let Some(target) = targets.iter().find(|t| t.survey_id == survey_id) else {
            return ShowDecision {
                should_show: false,
                reason: "survey is not eligible for this context".to_string(),
                alternatives: Vec::new(),
            };
        };

        let segment_key = segment.to_string();
        let verdict = self.frequency.can_show(survey_id, &segment_key);
        if let Some(reason) = verdict.reason() {
            let alternatives = targets
                .iter()
                .filter(|t| t.survey_id != survey_id)
                .filter(|t| {
                    self.frequency
                        .can_show(&t.survey_id, &segment_key)
                        .is_allowed()
                })
                .take(3)
                .map(|t| t.survey_id.clone())
                .collect();
            return ShowDecision {
                should_show: false,
                reason: reason.to_string(),
                alternatives,
            };
        }

        ShowDecision {
            should_show: true,
            reason: target.reason.clone(),
            alternatives: Vec::new(),
        }
    }

    /// Record that a survey was actually displayed.
    pub fn track_survey_display(&self, survey_id: &str, segment: UserSegment) {
        if let Err(err) = self
            .frequency
            .record_display(survey_id, &segment.to_string())
        {
            warn!(survey_id = %survey_id, error = %err, "failed to persist survey display");
        }
    }
}

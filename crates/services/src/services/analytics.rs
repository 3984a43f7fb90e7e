//! Pure aggregation over surveys, responses and workflow sessions. Nothing
//! here performs I/O or mutates its inputs; percentages are rounded to two
//! decimals and every rate guards division by zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use ts_rs::TS;

use crate::models::{
    QuestionType, StepStatus, Survey, SurveyResponse, SurveyStatus, WorkflowSession,
};

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentage of `num` over `den`, 0 when the denominator is 0.
pub fn rate_pct(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        round2(num as f64 / den as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SurveyCompletionRate {
    pub survey_id: String,
    pub name: String,
    pub response_count: usize,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    pub total_surveys: usize,
    pub active_surveys: usize,
    pub total_responses: usize,
    /// Mean of per-survey completion rates, not a global finished ratio;
    /// a huge survey must not drown out a small one.
    pub completion_rate: f64,
    /// Responses per survey.
    pub response_rate: f64,
    pub completion_rates: Vec<SurveyCompletionRate>,
}

pub fn compute_metrics(surveys: &[Survey], responses: &[SurveyResponse]) -> DashboardMetrics {
    let mut by_survey: HashMap<&str, (usize, usize)> = HashMap::new();
    for response in responses {
        let entry = by_survey.entry(response.survey_id.as_str()).or_default();
        entry.0 += 1;
        if response.finished {
            entry.1 += 1;
        }
    }

    let mut completion_rates = Vec::new();
    for survey in surveys {
        if let Some((total, finished)) = by_survey.get(survey.id.as_str()) {
            completion_rates.push(SurveyCompletionRate {
                survey_id: survey.id.clone(),
                name: survey.name.clone(),
                response_count: *total,
                completion_rate: rate_pct(*finished, *total),
            });
        }
    }

    let completion_rate = if completion_rates.is_empty() {
        0.0
    } else {
        round2(
            completion_rates.iter().map(|r| r.completion_rate).sum::<f64>()
                / completion_rates.len() as f64,
        )
    };

    let response_rate = if surveys.is_empty() {
        0.0
    } else {
        round2(responses.len() as f64 / surveys.len() as f64)
    };

    DashboardMetrics {
        total_surveys: surveys.len(),
        active_surveys: surveys
            .iter()
            .filter(|s| s.status == SurveyStatus::InProgress)
            .count(),
        total_responses: responses.len(),
        completion_rate,
        response_rate,
        completion_rates,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeInterval {
    Day,
    Week,
    Month,
}

impl TimeInterval {
    fn bucket_key(&self, at: &chrono::DateTime<chrono::Utc>) -> String {
        match self {
            Self::Day => at.format("%Y-%m-%d").to_string(),
            Self::Week => at.format("%G-W%V").to_string(),
            Self::Month => at.format("%Y-%m").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesBucket {
    pub period: String,
    pub count: usize,
    /// Change versus the immediately preceding bucket; 0 for the first.
    pub delta: i64,
    pub percent_change: f64,
}

pub fn time_series(responses: &[SurveyResponse], interval: TimeInterval) -> Vec<TimeSeriesBucket> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for response in responses {
        *counts
            .entry(interval.bucket_key(&response.created_at))
            .or_default() += 1;
    }

    let mut periods: Vec<String> = counts.keys().cloned().collect();
    periods.sort();

    let mut buckets = Vec::with_capacity(periods.len());
    let mut previous: Option<usize> = None;
    for period in periods {
        let count = counts[&period];
        let (delta, percent_change) = match previous {
            None => (0, 0.0),
            Some(prev) => {
                let delta = count as i64 - prev as i64;
                let pct = if prev == 0 {
                    0.0
                } else {
                    round2(delta as f64 / prev as f64 * 100.0)
                };
                (delta, pct)
            }
        };
        buckets.push(TimeSeriesBucket {
            period,
            count,
            delta,
            percent_change,
        });
        previous = Some(count);
    }
    buckets
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SentimentSplit {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnalytics {
    pub question_id: String,
    pub headline: String,
    pub question_type: QuestionType,
    pub responses: usize,
    pub skipped: usize,
    pub distribution: Vec<ValueCount>,
    /// Mean numeric answer, rating/NPS questions only.
    pub average_score: Option<f64>,
    /// Keyword-based split, open-text questions only.
    pub sentiment: Option<SentimentSplit>,
}

pub fn question_analytics(survey: &Survey, responses: &[SurveyResponse]) -> Vec<QuestionAnalytics> {
    let survey_responses: Vec<&SurveyResponse> = responses
        .iter()
        .filter(|r| r.survey_id == survey.id)
        .collect();

    survey
        .questions
        .iter()
        .map(|question| {
            let answers: Vec<&Value> = survey_responses
                .iter()
                .filter_map(|r| r.data.get(&question.id))
                .collect();
            let answered = answers.len();

            let mut counts: HashMap<String, usize> = HashMap::new();
            let mut order: Vec<String> = Vec::new();
            let mut tally = |value: String| {
                if !counts.contains_key(&value) {
                    order.push(value.clone());
                }
                *counts.entry(value).or_default() += 1;
            };
            for answer in &answers {
                match answer {
                    Value::Array(items) => {
                        for item in items {
                            tally(display_value(item));
                        }
                    }
                    other => tally(display_value(other)),
                }
            }
            let distribution = order
                .into_iter()
                .map(|value| {
                    let count = counts[&value];
                    ValueCount {
                        value,
                        count,
                        percentage: rate_pct(count, answered),
                    }
                })
                .collect();

            let average_score = if question.question_type.is_scored() {
                let scores: Vec<f64> = answers.iter().filter_map(|v| numeric_value(v)).collect();
                if scores.is_empty() {
                    Some(0.0)
                } else {
                    Some(round2(scores.iter().sum::<f64>() / scores.len() as f64))
                }
            } else {
                None
            };

            let sentiment = if question.question_type == QuestionType::OpenText {
                let mut split = SentimentSplit::default();
                for answer in &answers {
                    if let Value::String(text) = answer {
                        match sentiment_of(text) {
                            Sentiment::Positive => split.positive += 1,
                            Sentiment::Neutral => split.neutral += 1,
                            Sentiment::Negative => split.negative += 1,
                        }
                    }
                }
                Some(split)
            } else {
                None
            };

            QuestionAnalytics {
                question_id: question.id.clone(),
                headline: question.headline.clone(),
                question_type: question.question_type,
                responses: answered,
                skipped: survey_responses.len().saturating_sub(answered),
                distribution,
                average_score,
                sentiment,
            }
        })
        .collect()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

const POSITIVE_KEYWORDS: &[&str] = &[
    "great", "good", "love", "easy", "helpful", "excellent", "fast", "simple", "perfect",
];
const NEGATIVE_KEYWORDS: &[&str] = &[
    "bad", "hard", "confusing", "slow", "hate", "difficult", "broken", "frustrating", "bug",
];

/// Deterministic keyword matching, not a model: count positive and negative
/// keyword occurrences and take the majority.
fn sentiment_of(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    let positive = POSITIVE_KEYWORDS
        .iter()
        .filter(|k| lower.contains(**k))
        .count();
    let negative = NEGATIVE_KEYWORDS
        .iter()
        .filter(|k| lower.contains(**k))
        .count();
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

/// Step abandonment above this flags an improvement area.
const ABANDONMENT_THRESHOLD_PCT: f64 = 20.0;
/// Overall conversion below this flags an improvement area.
const CONVERSION_THRESHOLD_PCT: f64 = 70.0;

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct StepStats {
    pub step: String,
    pub entered: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub errored: usize,
    pub completion_rate: f64,
    pub abandonment_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementArea {
    pub area: String,
    pub reason: String,
    pub impact_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInsights {
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub conversion_rate: f64,
    /// Mean numeric answer across the correlated survey responses.
    pub average_satisfaction: Option<f64>,
    pub steps: Vec<StepStats>,
    /// Ranked by impact score, descending.
    pub improvement_areas: Vec<ImprovementArea>,
}

pub fn workflow_insights(
    responses: &[SurveyResponse],
    sessions: &[WorkflowSession],
) -> WorkflowInsights {
    let total_sessions = sessions.len();
    let completed_sessions = sessions.iter().filter(|s| s.completed).count();
    let conversion_rate = rate_pct(completed_sessions, total_sessions);

    // Steps in first-seen order across sessions.
    let mut step_order: Vec<String> = Vec::new();
    let mut per_step: HashMap<String, StepStats> = HashMap::new();
    for session in sessions {
        for event in &session.steps {
            if !per_step.contains_key(&event.step) {
                step_order.push(event.step.clone());
                per_step.insert(
                    event.step.clone(),
                    StepStats {
                        step: event.step.clone(),
                        entered: 0,
                        completed: 0,
                        abandoned: 0,
                        errored: 0,
                        completion_rate: 0.0,
                        abandonment_rate: 0.0,
                        error_rate: 0.0,
                    },
                );
            }
            if let Some(stats) = per_step.get_mut(&event.step) {
                stats.entered += 1;
                match event.status {
                    StepStatus::Completed => stats.completed += 1,
                    StepStatus::Abandoned => stats.abandoned += 1,
                    StepStatus::Error => stats.errored += 1,
                }
            }
        }
    }

    let mut steps: Vec<StepStats> = step_order
        .iter()
        .filter_map(|name| per_step.remove(name))
        .collect();
    for stats in &mut steps {
        stats.completion_rate = rate_pct(stats.completed, stats.entered);
        stats.abandonment_rate = rate_pct(stats.abandoned, stats.entered);
        stats.error_rate = rate_pct(stats.errored, stats.entered);
    }

    let scores: Vec<f64> = responses
        .iter()
        .flat_map(|r| r.data.values())
        .filter_map(numeric_value)
        .collect();
    let average_satisfaction = if scores.is_empty() {
        None
    } else {
        Some(round2(scores.iter().sum::<f64>() / scores.len() as f64))
    };

    let mut improvement_areas: Vec<ImprovementArea> = Vec::new();
    for stats in &steps {
        if stats.abandonment_rate > ABANDONMENT_THRESHOLD_PCT {
            improvement_areas.push(ImprovementArea {
                area: format!("step:{}", stats.step),
                reason: format!(
                    "{}% of users abandon at this step",
                    stats.abandonment_rate
                ),
                impact_score: round2(
                    stats.abandonment_rate * stats.entered as f64
                        / total_sessions.max(1) as f64,
                ),
            });
        }
    }
    if total_sessions > 0 && conversion_rate < CONVERSION_THRESHOLD_PCT {
        improvement_areas.push(ImprovementArea {
            area: "conversion".to_string(),
            reason: format!(
                "overall conversion is {conversion_rate}%, below the {CONVERSION_THRESHOLD_PCT}% target"
            ),
            impact_score: round2(CONVERSION_THRESHOLD_PCT - conversion_rate),
        });
    }
    improvement_areas.sort_by(|a, b| {
        b.impact_score
            .partial_cmp(&a.impact_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    WorkflowInsights {
        total_sessions,
        completed_sessions,
        conversion_rate,
        average_satisfaction,
        steps,
        improvement_areas,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::{SurveyQuestion, WorkflowStepEvent};

    fn survey(id: &str, status: SurveyStatus) -> Survey {
        Survey {
            id: id.to_string(),
            name: format!("Survey {id}"),
            status,
            questions: vec![],
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn response(survey_id: &str, finished: bool, day: u32) -> SurveyResponse {
        SurveyResponse {
            id: uuid::Uuid::new_v4().to_string(),
            survey_id: survey_id.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap(),
            updated_at: None,
            finished,
            data: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    #[test]
    fn metrics_for_single_survey_scenario() {
        let surveys = vec![survey("s1", SurveyStatus::InProgress)];
        let responses = vec![response("s1", true, 1), response("s1", false, 2)];

        let metrics = compute_metrics(&surveys, &responses);
        assert_eq!(metrics.active_surveys, 1);
        assert_eq!(metrics.total_responses, 2);
        assert_eq!(metrics.completion_rates.len(), 1);
        assert_eq!(metrics.completion_rates[0].survey_id, "s1");
        assert_eq!(metrics.completion_rates[0].completion_rate, 50.0);
    }

    #[test]
    fn completion_rate_is_mean_of_per_survey_rates() {
        // s1: 6/10 finished = 60%. s2: 1/1 = 100%. Mean = 80%, while the
        // global finished ratio would be 7/11 ≈ 63.6%.
        let surveys = vec![
            survey("s1", SurveyStatus::InProgress),
            survey("s2", SurveyStatus::InProgress),
        ];
        let mut responses: Vec<SurveyResponse> = (0..10)
            .map(|i| response("s1", i < 6, 1 + (i % 20) as u32))
            .collect();
        responses.push(response("s2", true, 3));

        let metrics = compute_metrics(&surveys, &responses);
        assert_eq!(metrics.completion_rates[0].completion_rate, 60.0);
        assert_eq!(metrics.completion_rate, 80.0);
    }

    #[test]
    fn empty_inputs_yield_zero_rates_not_nan() {
        let metrics = compute_metrics(&[], &[]);
        assert_eq!(metrics.completion_rate, 0.0);
        assert_eq!(metrics.response_rate, 0.0);
        assert!(metrics.completion_rates.is_empty());
    }

    #[test]
    fn time_series_deltas_against_previous_bucket() {
        let responses = vec![
            response("s1", true, 1),
            response("s1", true, 1),
            response("s1", true, 2),
            response("s1", true, 3),
            response("s1", true, 3),
            response("s1", true, 3),
        ];
        let buckets = time_series(&responses, TimeInterval::Day);

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].period, "2026-01-01");
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].delta, 0);
        assert_eq!(buckets[1].delta, -1);
        assert_eq!(buckets[1].percent_change, -50.0);
        assert_eq!(buckets[2].delta, 2);
        assert_eq!(buckets[2].percent_change, 200.0);
    }

    #[test]
    fn monthly_buckets_group_by_month() {
        let mut responses = vec![response("s1", true, 5), response("s1", true, 20)];
        responses[1].created_at = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap();
        let buckets = time_series(&responses, TimeInterval::Month);
        assert_eq!(buckets[0].period, "2026-01");
        assert_eq!(buckets[1].period, "2026-02");
    }

    #[test]
    fn question_analytics_counts_skips_and_scores() {
        let mut s = survey("s1", SurveyStatus::InProgress);
        s.questions = vec![
            SurveyQuestion {
                id: "q_rating".into(),
                question_type: QuestionType::Rating,
                headline: "How satisfied are you?".into(),
                required: true,
            },
            SurveyQuestion {
                id: "q_text".into(),
                question_type: QuestionType::OpenText,
                headline: "Anything else?".into(),
                required: false,
            },
        ];

        let mut r1 = response("s1", true, 1);
        r1.data.insert("q_rating".into(), serde_json::json!(4));
        r1.data
            .insert("q_text".into(), serde_json::json!("love it, really easy"));
        let mut r2 = response("s1", true, 2);
        r2.data.insert("q_rating".into(), serde_json::json!(2));
        r2.data
            .insert("q_text".into(), serde_json::json!("the pricing page is confusing"));
        let r3 = response("s1", false, 3); // skipped everything

        let analytics = question_analytics(&s, &[r1, r2, r3]);
        let rating = &analytics[0];
        assert_eq!(rating.responses, 2);
        assert_eq!(rating.skipped, 1);
        assert_eq!(rating.average_score, Some(3.0));
        assert!(rating.sentiment.is_none());

        let text = &analytics[1];
        assert_eq!(
            text.sentiment,
            Some(SentimentSplit {
                positive: 1,
                neutral: 0,
                negative: 1,
            })
        );
        assert!(text.average_score.is_none());
    }

    #[test]
    fn distribution_percentages_sum_per_answer() {
        let mut s = survey("s1", SurveyStatus::InProgress);
        s.questions = vec![SurveyQuestion {
            id: "q1".into(),
            question_type: QuestionType::MultipleChoiceSingle,
            headline: "Favorite feature?".into(),
            required: false,
        }];
        let mut responses = Vec::new();
        for (i, answer) in ["pdf", "pdf", "pdf", "pricing"].iter().enumerate() {
            let mut r = response("s1", true, 1 + i as u32);
            r.data.insert("q1".into(), serde_json::json!(answer));
            responses.push(r);
        }

        let analytics = question_analytics(&s, &responses);
        let dist = &analytics[0].distribution;
        assert_eq!(dist[0].value, "pdf");
        assert_eq!(dist[0].count, 3);
        assert_eq!(dist[0].percentage, 75.0);
        assert_eq!(dist[1].percentage, 25.0);
    }

    fn session(id: &str, completed: bool, steps: &[(&str, StepStatus)]) -> WorkflowSession {
        WorkflowSession {
            id: id.to_string(),
            completed,
            steps: steps
                .iter()
                .map(|(step, status)| WorkflowStepEvent {
                    step: step.to_string(),
                    status: *status,
                })
                .collect(),
        }
    }

    #[test]
    fn workflow_insights_flags_high_abandonment_and_low_conversion() {
        let sessions = vec![
            session(
                "w1",
                true,
                &[
                    ("services", StepStatus::Completed),
                    ("pricing", StepStatus::Completed),
                ],
            ),
            session(
                "w2",
                false,
                &[
                    ("services", StepStatus::Completed),
                    ("pricing", StepStatus::Abandoned),
                ],
            ),
            session("w3", false, &[("services", StepStatus::Abandoned)]),
        ];

        let insights = workflow_insights(&[], &sessions);
        assert_eq!(insights.total_sessions, 3);
        assert_eq!(insights.conversion_rate, 33.33);

        let pricing = insights.steps.iter().find(|s| s.step == "pricing").unwrap();
        assert_eq!(pricing.entered, 2);
        assert_eq!(pricing.abandonment_rate, 50.0);

        assert!(
            insights
                .improvement_areas
                .iter()
                .any(|a| a.area == "step:pricing")
        );
        assert!(insights.improvement_areas.iter().any(|a| a.area == "conversion"));
        // Ranked descending by impact.
        let scores: Vec<f64> = insights
            .improvement_areas
            .iter()
            .map(|a| a.impact_score)
            .collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(scores, sorted);
    }

    #[test]
    fn workflow_insights_with_no_sessions_is_all_zero() {
        let insights = workflow_insights(&[], &[]);
        assert_eq!(insights.conversion_rate, 0.0);
        assert!(insights.improvement_areas.is_empty());
        assert!(insights.steps.is_empty());
    }
}

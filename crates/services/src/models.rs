//! Domain types for the Formbricks integration: surveys and responses as the
//! management API returns them, tracking events, and workflow session data
//! used by the aggregation engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use ts_rs::TS;

/// Survey lifecycle status as reported by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SurveyStatus {
    Draft,
    InProgress,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum QuestionType {
    OpenText,
    MultipleChoiceSingle,
    MultipleChoiceMulti,
    Rating,
    Nps,
    Cta,
    Consent,
}

impl QuestionType {
    /// Whether answers to this question are numeric scores.
    pub fn is_scored(&self) -> bool {
        matches!(self, Self::Rating | Self::Nps)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SurveyQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub headline: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct Survey {
    pub id: String,
    pub name: String,
    pub status: SurveyStatus,
    #[serde(default)]
    pub questions: Vec<SurveyQuestion>,
    pub created_at: DateTime<Utc>,
}

/// A single survey response. Immutable once fetched; the aggregation engine
/// never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SurveyResponse {
    pub id: String,
    pub survey_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub finished: bool,
    /// Answers keyed by question id.
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

/// Property name the vendor rejects when the hidden-fields feature is
/// disabled for a survey.
pub const HIDDEN_FIELDS_KEY: &str = "hiddenFields";

/// An application event bound for the vendor SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, Value>>,
}

impl TrackingEvent {
    pub fn new(event_name: impl Into<String>, properties: Option<serde_json::Map<String, Value>>) -> Self {
        Self {
            event_name: event_name.into(),
            properties,
        }
    }

    /// Drop the optional `hiddenFields` property. Returns true if it was
    /// present.
    pub fn strip_hidden_fields(&mut self) -> bool {
        match self.properties.as_mut() {
            Some(props) => props.remove(HIDDEN_FIELDS_KEY).is_some(),
            None => false,
        }
    }
}

/// Outcome of a single step in a quote-creation workflow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Abandoned,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepEvent {
    pub step: String,
    pub status: StepStatus,
}

/// One user's pass through the quote-creation workflow, as recorded by the
/// application. Correlated with survey responses by the aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSession {
    pub id: String,
    pub completed: bool,
    #[serde(default)]
    pub steps: Vec<WorkflowStepEvent>,
}

//! Formbricks management API client for analytics reads and environment
//! validation.

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

use super::config::FormbricksConfig;
use crate::models::{Survey, SurveyResponse};

#[derive(Debug, Clone, Error)]
pub enum FormbricksApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited")]
    RateLimited,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("json error: {0}")]
    Serde(String),
    #[error("missing api key: FORMBRICKS_API_KEY environment variable not set")]
    MissingApiKey,
}

impl FormbricksApiError {
    /// Returns true if the error is transient and should be retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Result of validating an environment id against the vendor API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentCheck {
    Valid,
    NotFound,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Identity returned by `GET /api/v1/management/me`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIdentity {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FormbricksApiClient {
    http: Client,
    api_host: Url,
    environment_id: String,
    api_key: Option<secrecy::SecretString>,
}

impl FormbricksApiClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    const RETRY_DELAY: Duration = Duration::from_secs(1);
    const MAX_RETRIES: usize = 3;

    pub fn new(config: &FormbricksConfig) -> Result<Self, FormbricksApiError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("lawnquote-feedback/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FormbricksApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_host: config.api_host.clone(),
            environment_id: config.environment_id.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn retry_policy() -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Self::RETRY_DELAY)
            .with_max_times(Self::MAX_RETRIES)
    }

    fn url(&self, path: &str) -> Result<Url, FormbricksApiError> {
        self.api_host
            .join(path)
            .map_err(|e| FormbricksApiError::Transport(e.to_string()))
    }

    fn api_key(&self) -> Result<&str, FormbricksApiError> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret())
            .ok_or(FormbricksApiError::MissingApiKey)
    }

    /// Check that the configured environment id exists. Requires no API key;
    /// the endpoint is public. Transport failures bubble up so the caller
    /// can decide to proceed optimistically.
    pub async fn validate_environment(&self) -> Result<EnvironmentCheck, FormbricksApiError> {
        let url = self.url(&format!("api/v1/environments/{}", self.environment_id))?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match res.status() {
            s if s.is_success() => Ok(EnvironmentCheck::Valid),
            StatusCode::NOT_FOUND => Ok(EnvironmentCheck::NotFound),
            s => {
                let status = s.as_u16();
                let body = res.text().await.unwrap_or_default();
                Err(FormbricksApiError::Http { status, body })
            }
        }
    }

    /// All surveys for the environment.
    pub async fn fetch_surveys(&self) -> Result<Vec<Survey>, FormbricksApiError> {
        let url = self.url("api/v1/management/surveys")?;
        (|| async { self.get_json::<Vec<Survey>>(url.clone()).await })
            .retry(&Self::retry_policy())
            .when(|e: &FormbricksApiError| e.should_retry())
            .notify(|e, dur| {
                warn!(
                    "survey fetch failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    e
                )
            })
            .await
    }

    /// Responses, optionally filtered to one survey.
    pub async fn fetch_responses(
        &self,
        survey_id: Option<&str>,
    ) -> Result<Vec<SurveyResponse>, FormbricksApiError> {
        let mut url = self.url("api/v1/management/responses")?;
        if let Some(id) = survey_id {
            url.query_pairs_mut().append_pair("surveyId", id);
        }
        (|| async { self.get_json::<Vec<SurveyResponse>>(url.clone()).await })
            .retry(&Self::retry_policy())
            .when(|e: &FormbricksApiError| e.should_retry())
            .notify(|e, dur| {
                warn!(
                    "response fetch failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    e
                )
            })
            .await
    }

    /// Identity check for the configured API key.
    pub async fn me(&self) -> Result<ApiIdentity, FormbricksApiError> {
        let url = self.url("api/v1/management/me")?;
        self.get_json::<ApiIdentity>(url).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
    ) -> Result<T, FormbricksApiError> {
        let res = self
            .http
            .get(url)
            .header("x-api-key", self.api_key()?)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match res.status() {
            s if s.is_success() => {
                let envelope = res
                    .json::<DataEnvelope<T>>()
                    .await
                    .map_err(|e| FormbricksApiError::Serde(e.to_string()))?;
                Ok(envelope.data)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FormbricksApiError::InvalidApiKey)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(FormbricksApiError::RateLimited),
            s => {
                let status = s.as_u16();
                let body = res.text().await.unwrap_or_default();
                Err(FormbricksApiError::Http { status, body })
            }
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FormbricksApiError {
    if e.is_timeout() {
        FormbricksApiError::Timeout
    } else {
        FormbricksApiError::Transport(e.to_string())
    }
}
